//! Reply status codes for stream sessions.
//!
//! The request direction of a session is the bare datagram payload followed
//! by a write-side shutdown. The reply direction needs one more piece of
//! information: whether the destination answered at all. Without it a
//! remote relay that gave up would be indistinguishable from one that got
//! an empty datagram back, so every reply starts with a single status byte:
//!
//! ```text
//! ┌────────┬──────────────────────────────┐
//! │ 0x00   │ reply payload (0..=1500)     │  Ok
//! ├────────┼──────────────────────────────┤
//! │ 0x01   │ attempts (1 byte)            │  Timeout
//! ├────────┼──────────────────────────────┤
//! │ 0x02   │                              │  Unreachable
//! └────────┴──────────────────────────────┘
//! ```
//!
//! The end of the reply is the end of the stream.

/// First byte of every reply on a stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    /// The destination answered; the payload follows.
    Ok = 0x00,
    /// The destination never answered within the retry budget.
    Timeout = 0x01,
    /// The destination could not be resolved or sent to.
    Unreachable = 0x02,
}

impl ReplyStatus {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ReplyStatus::Ok),
            0x01 => Some(ReplyStatus::Timeout),
            0x02 => Some(ReplyStatus::Unreachable),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyStatus::Ok => write!(f, "Ok"),
            ReplyStatus::Timeout => write!(f, "Timeout"),
            ReplyStatus::Unreachable => write!(f, "Unreachable"),
        }
    }
}

/// Outcome of one stream session, as seen by the local relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Reply datagram from the destination, byte for byte.
    Datagram(Vec<u8>),
    /// The remote relay sent `attempts` copies of the request and heard
    /// nothing back.
    Timeout { attempts: u8 },
    /// The remote relay could not reach the destination at all.
    Unreachable,
}

impl Reply {
    pub fn status(&self) -> ReplyStatus {
        match self {
            Reply::Datagram(_) => ReplyStatus::Ok,
            Reply::Timeout { .. } => ReplyStatus::Timeout,
            Reply::Unreachable => ReplyStatus::Unreachable,
        }
    }
}
