//! Request/reply framing over a single stream session.
//!
//! A session carries exactly one message in each direction. The writer
//! marks the end of its message by shutting down its write side, so the
//! reader simply accumulates until EOF; no length prefix is needed because
//! both ends of the tunnel are this crate. See [`crate::protocol`] for the
//! status byte that leads every reply.
//!
//! Reads are bounded: a peer that keeps writing past
//! [`MAX_DATAGRAM_SIZE`](crate::MAX_DATAGRAM_SIZE) gets
//! [`FrameError::Oversized`] instead of growing our buffer.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_DATAGRAM_SIZE;
use crate::protocol::{Reply, ReplyStatus};

/// Errors reading or writing a framed message.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("message exceeds {limit} bytes")]
    Oversized { limit: usize },

    #[error("peer closed the session without replying")]
    Empty,

    #[error("unknown reply status byte: {0:#04x}")]
    UnknownStatus(u8),

    #[error("reply with status {0} is missing its body")]
    Truncated(ReplyStatus),
}

/// Write one request payload and half-close the stream.
pub async fn write_request<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_DATAGRAM_SIZE {
        return Err(FrameError::Oversized {
            limit: MAX_DATAGRAM_SIZE,
        });
    }

    writer.write_all(payload).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Read one request payload, up to the peer's write-side shutdown.
///
/// An empty request is valid: UDP allows zero-length datagrams.
pub async fn read_request<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    read_bounded(reader, MAX_DATAGRAM_SIZE).await
}

/// Write one reply and shut the stream down.
pub async fn write_reply<W>(writer: &mut W, reply: &Reply) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(1 + MAX_DATAGRAM_SIZE);
    frame.push(reply.status().as_byte());

    match reply {
        Reply::Datagram(payload) => {
            if payload.len() > MAX_DATAGRAM_SIZE {
                return Err(FrameError::Oversized {
                    limit: MAX_DATAGRAM_SIZE,
                });
            }
            frame.extend_from_slice(payload);
        }
        Reply::Timeout { attempts } => frame.push(*attempts),
        Reply::Unreachable => {}
    }

    writer.write_all(&frame).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Read one reply, up to the peer closing the stream.
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply, FrameError>
where
    R: AsyncRead + Unpin,
{
    let frame = read_bounded(reader, 1 + MAX_DATAGRAM_SIZE).await?;
    decode_reply(frame)
}

fn decode_reply(mut frame: Vec<u8>) -> Result<Reply, FrameError> {
    let Some(&first) = frame.first() else {
        return Err(FrameError::Empty);
    };
    let status = ReplyStatus::from_byte(first).ok_or(FrameError::UnknownStatus(first))?;

    match status {
        ReplyStatus::Ok => {
            frame.remove(0);
            Ok(Reply::Datagram(frame))
        }
        ReplyStatus::Timeout => match frame.get(1) {
            Some(&attempts) => Ok(Reply::Timeout { attempts }),
            None => Err(FrameError::Truncated(status)),
        },
        ReplyStatus::Unreachable => Ok(Reply::Unreachable),
    }
}

async fn read_bounded<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    // One extra byte tells "exactly at the limit" apart from "over it".
    reader.take(limit as u64 + 1).read_to_end(&mut buf).await?;

    if buf.len() > limit {
        return Err(FrameError::Oversized { limit });
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_request_is_delimited_by_half_close() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        assert_ok!(write_request(&mut client, b"\x01\x02\x03").await);
        let request = assert_ok!(read_request(&mut server).await);

        assert_eq!(request, b"\x01\x02\x03");
    }

    #[tokio::test]
    async fn test_max_size_request_is_not_truncated() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let payload: Vec<u8> = (0..MAX_DATAGRAM_SIZE).map(|i| (i % 251) as u8).collect();

        write_request(&mut client, &payload).await.unwrap();
        let request = read_request(&mut server).await.unwrap();

        assert_eq!(request.len(), MAX_DATAGRAM_SIZE);
        assert_eq!(request, payload);
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected_by_reader() {
        let (mut client, mut server) = tokio::io::duplex(8192);

        // Bypass write_request, which refuses to send it.
        client.write_all(&[0u8; MAX_DATAGRAM_SIZE + 1]).await.unwrap();
        client.shutdown().await.unwrap();

        let result = read_request(&mut server).await;
        assert!(matches!(result, Err(FrameError::Oversized { limit: MAX_DATAGRAM_SIZE })));
    }

    #[tokio::test]
    async fn test_oversized_request_is_rejected_by_writer() {
        let (mut client, _server) = tokio::io::duplex(8192);

        let err = assert_err!(write_request(&mut client, &[0u8; MAX_DATAGRAM_SIZE + 1]).await);
        assert!(matches!(err, FrameError::Oversized { .. }));
    }

    #[tokio::test]
    async fn test_datagram_reply() {
        let (mut server, mut client) = tokio::io::duplex(4096);

        write_reply(&mut server, &Reply::Datagram(b"\xAA\xBB".to_vec()))
            .await
            .unwrap();

        assert_eq!(
            read_reply(&mut client).await.unwrap(),
            Reply::Datagram(b"\xAA\xBB".to_vec())
        );
    }

    #[tokio::test]
    async fn test_max_size_reply_is_not_truncated() {
        let (mut server, mut client) = tokio::io::duplex(4096);
        let payload = vec![0x5a; MAX_DATAGRAM_SIZE];

        write_reply(&mut server, &Reply::Datagram(payload.clone()))
            .await
            .unwrap();

        assert_eq!(read_reply(&mut client).await.unwrap(), Reply::Datagram(payload));
    }

    #[tokio::test]
    async fn test_empty_datagram_reply_is_not_an_error() {
        let (mut server, mut client) = tokio::io::duplex(64);

        write_reply(&mut server, &Reply::Datagram(Vec::new())).await.unwrap();

        assert_eq!(read_reply(&mut client).await.unwrap(), Reply::Datagram(Vec::new()));
    }

    #[tokio::test]
    async fn test_timeout_reply_carries_attempts() {
        let (mut server, mut client) = tokio::io::duplex(64);

        write_reply(&mut server, &Reply::Timeout { attempts: 5 }).await.unwrap();

        assert_eq!(read_reply(&mut client).await.unwrap(), Reply::Timeout { attempts: 5 });
    }

    #[tokio::test]
    async fn test_closed_without_reply() {
        let (server, mut client) = tokio::io::duplex(64);
        drop(server);

        let err = assert_err!(read_reply(&mut client).await);
        assert!(matches!(err, FrameError::Empty));
    }

    #[tokio::test]
    async fn test_unknown_status() {
        let (mut server, mut client) = tokio::io::duplex(64);
        server.write_all(&[0x7f, 1, 2]).await.unwrap();
        drop(server);

        assert!(matches!(
            read_reply(&mut client).await,
            Err(FrameError::UnknownStatus(0x7f))
        ));
    }

    #[tokio::test]
    async fn test_timeout_without_attempts_is_truncated() {
        let (mut server, mut client) = tokio::io::duplex(64);
        server.write_all(&[ReplyStatus::Timeout.as_byte()]).await.unwrap();
        drop(server);

        assert!(matches!(
            read_reply(&mut client).await,
            Err(FrameError::Truncated(ReplyStatus::Timeout))
        ));
    }
}
