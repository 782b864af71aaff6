//! Both relays wired back to back over loopback, with a plain TCP port in
//! place of the ssh forward and a UDP socket standing in for the KDC.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use udp_tunnel::{LocalConfig, LocalRelay, RemoteConfig, RemoteRelay, RetryPolicy};
use udp_tunnel_net::{Graceful, MAX_DATAGRAM_SIZE};

struct Circuit {
    client_target: SocketAddr,
    graceful: Graceful,
}

async fn circuit(destination: SocketAddr, retry: RetryPolicy) -> Circuit {
    let graceful = Graceful::new();

    let remote = RemoteRelay::bind(RemoteConfig {
        listen_port: 0,
        destination: destination.to_string(),
        retry,
    })
    .await
    .unwrap();
    let remote_port = remote.local_addr().unwrap().port();
    tokio::spawn(remote.run(graceful.clone()));

    let local = LocalRelay::bind(LocalConfig {
        listen_port: 0,
        forward_port: remote_port,
        request_timeout: Duration::from_secs(5),
        max_in_flight: 8,
    })
    .await
    .unwrap();
    let client_target = local.local_addr().unwrap();
    tokio::spawn(local.run(graceful.clone()));

    Circuit {
        client_target,
        graceful,
    }
}

/// A destination that answers every request with `answer(request)`,
/// staying silent when it returns `None`.
async fn destination(answer: fn(&[u8]) -> Option<Vec<u8>>) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            if let Some(reply) = answer(&buf[..len]) {
                socket.send_to(&reply, from).await.unwrap();
            }
        }
    });

    addr
}

async fn receive(client: &UdpSocket, within: Duration) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 4096];
    match tokio::time::timeout(within, client.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
        _ => None,
    }
}

#[tokio::test]
async fn test_kdc_exchange() {
    let kdc = destination(|request| {
        assert_eq!(request, [0x01, 0x02, 0x03]);
        Some(vec![0xAA, 0xBB])
    })
    .await;
    let circuit = circuit(kdc, RetryPolicy::default()).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&[0x01, 0x02, 0x03], circuit.client_target)
        .await
        .unwrap();

    let reply = receive(&client, Duration::from_secs(3)).await;
    assert_eq!(reply, Some(vec![0xAA, 0xBB]));

    circuit.graceful.cancel();
}

#[tokio::test]
async fn test_max_size_payload_unchanged() {
    let echo = destination(|request| Some(request.to_vec())).await;
    let circuit = circuit(echo, RetryPolicy::default()).await;

    let payload: Vec<u8> = (0..MAX_DATAGRAM_SIZE).map(|i| (i % 251) as u8).collect();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&payload, circuit.client_target).await.unwrap();

    let reply = receive(&client, Duration::from_secs(3)).await.unwrap();
    assert_eq!(reply.len(), MAX_DATAGRAM_SIZE);
    assert_eq!(reply, payload);

    circuit.graceful.cancel();
}

#[tokio::test]
async fn test_silent_destination_gets_no_reply() {
    let silent = destination(|_| None).await;
    let retry = RetryPolicy {
        attempt_timeout: Duration::from_millis(100),
        max_attempts: 3,
    };
    let circuit = circuit(silent, retry).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"hello", circuit.client_target).await.unwrap();

    // Well past the remote deadline: the timeout must not turn into an
    // empty datagram.
    let reply = receive(&client, retry.deadline() + Duration::from_millis(700)).await;
    assert_eq!(reply, None);

    circuit.graceful.cancel();
}

#[tokio::test]
async fn test_concurrent_clients_get_their_own_replies() {
    let echo = destination(|request| Some(request.to_vec())).await;
    let circuit = circuit(echo, RetryPolicy::default()).await;

    let mut clients = Vec::new();
    for i in 0..4u8 {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&[i; 16], circuit.client_target).await.unwrap();
        clients.push((i, client));
    }

    for (i, client) in clients {
        let reply = receive(&client, Duration::from_secs(3)).await;
        assert_eq!(reply, Some(vec![i; 16]));
    }

    circuit.graceful.cancel();
}
