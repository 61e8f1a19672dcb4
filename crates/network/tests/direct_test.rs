//! Direct backend tests over loopback TCP.

mod common;

use std::io;
use std::time::Duration;

use common::init_tracing;
use corelib::{KeyPair, NetworkType, PublicKey, SETUP_PORT, TRANSPORT_PORT};
use network::{
    BackendError, BackendStatus, DirectClient, DirectConfig, Network, NetworkConfig, NetworkError,
    NoBackend, EPHEMERAL_PORTS,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

type DirectNetwork = Network<NoBackend, DirectClient>;

async fn node(listening: bool) -> DirectNetwork {
    init_tracing();
    let direct = DirectConfig {
        local_addr: listening.then(|| "127.0.0.1:0".to_string()),
        ..DirectConfig::default()
    };
    let conf = NetworkConfig::new(KeyPair::generate())
        .with_direct(direct)
        .with_transport_networks([NetworkType::Direct]);
    let net = Network::direct_only(conf).unwrap();
    net.init(&CancellationToken::new()).await.unwrap();
    net
}

fn client(net: &DirectNetwork) -> &DirectClient {
    net.direct().unwrap()
}

/// Teaches `from` where `to` is listening.
fn learn(from: &DirectNetwork, to: &DirectNetwork) {
    let addr = client(to).local_addr().unwrap();
    client(from).table().insert(to.local_pk(), addr.to_string());
}

// ============================================================================
// End-to-End Tests
// ============================================================================

#[tokio::test]
async fn test_loopback_connection() {
    let alice = node(true).await;
    let bob = node(true).await;
    learn(&alice, &bob);

    let listener = bob.listen(NetworkType::Direct, TRANSPORT_PORT).await.unwrap();
    let cancel = CancellationToken::new();
    let mut out = alice
        .dial(&cancel, NetworkType::Direct, bob.local_pk(), TRANSPORT_PORT)
        .await
        .unwrap();
    let mut inc = listener.accept_conn().await.unwrap();

    assert_eq!(out.local_pk(), alice.local_pk());
    assert_eq!(out.remote_pk(), bob.local_pk());
    assert_eq!(out.remote_port(), TRANSPORT_PORT);
    assert!(EPHEMERAL_PORTS.contains(&out.local_port()));
    assert_eq!(inc.local_addr(), out.remote_addr());
    assert_eq!(inc.remote_addr(), out.local_addr());

    out.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    inc.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    inc.write_all(b"pong").await.unwrap();
    out.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    assert_eq!(client(&alice).open_conns(), 1);
    drop(out);
    assert_eq!(client(&alice).open_conns(), 0);

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_outbound_only_node_dials() {
    let alice = node(false).await;
    let bob = node(true).await;
    learn(&alice, &bob);

    assert_eq!(client(&alice).local_addr(), None);
    assert_eq!(
        alice.health().status(NetworkType::Direct),
        BackendStatus::OutboundOnly
    );

    let listener = bob.listen(NetworkType::Direct, SETUP_PORT).await.unwrap();
    let conn = alice
        .dial(&CancellationToken::new(), NetworkType::Direct, bob.local_pk(), SETUP_PORT)
        .await
        .unwrap();
    let inc = listener.accept_conn().await.unwrap();
    assert_eq!(inc.remote_pk(), alice.local_pk());
    assert_eq!(inc.remote_port(), conn.local_port());

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

// ============================================================================
// Failure Tests
// ============================================================================

#[tokio::test]
async fn test_missing_table_entry() {
    let alice = node(true).await;
    let stranger: PublicKey = KeyPair::generate().public_key();

    let err = alice
        .dial(&CancellationToken::new(), NetworkType::Direct, stranger, TRANSPORT_PORT)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        NetworkError::Dial {
            network: NetworkType::Direct,
            source: BackendError::NoAddress(pk),
        } if pk == stranger
    ));
    alice.close().await.unwrap();
}

#[tokio::test]
async fn test_dial_to_unbound_port_rejected() {
    let alice = node(true).await;
    let bob = node(true).await;
    learn(&alice, &bob);

    let err = alice
        .dial(&CancellationToken::new(), NetworkType::Direct, bob.local_pk(), 99)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        NetworkError::Dial {
            source: BackendError::Unreachable { port: 99, .. },
            ..
        }
    ));
    assert_eq!(client(&alice).open_conns(), 0);

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_peer_with_other_key_rejected() {
    let alice = node(true).await;
    let bob = node(true).await;
    let impostor = KeyPair::generate().public_key();
    // The table claims bob's socket belongs to someone else.
    let addr = client(&bob).local_addr().unwrap();
    client(&alice).table().insert(impostor, addr.to_string());

    let _listener = bob.listen(NetworkType::Direct, TRANSPORT_PORT).await.unwrap();
    let res = alice
        .dial(&CancellationToken::new(), NetworkType::Direct, impostor, TRANSPORT_PORT)
        .await;
    assert!(matches!(
        res,
        Err(NetworkError::Dial {
            network: NetworkType::Direct,
            ..
        })
    ));
    assert_eq!(client(&bob).open_conns(), 0);

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_port_in_use() {
    let bob = node(true).await;

    let first = bob.listen(NetworkType::Direct, SETUP_PORT).await.unwrap();
    let err = bob.listen(NetworkType::Direct, SETUP_PORT).await.unwrap_err();
    assert!(matches!(
        err,
        NetworkError::Listen {
            network: NetworkType::Direct,
            source: BackendError::PortInUse(SETUP_PORT),
        }
    ));

    first.close().await.unwrap();
    assert!(bob.listen(NetworkType::Direct, SETUP_PORT).await.is_ok());
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_closed_backend_refuses_dial() {
    let alice = node(true).await;
    let bob = node(true).await;
    learn(&alice, &bob);
    alice.close().await.unwrap();

    // The facade rejects first; the backend itself refuses too.
    let res = network::Backend::dial(
        client(&alice),
        &CancellationToken::new(),
        bob.local_pk(),
        TRANSPORT_PORT,
    )
    .await;
    assert!(matches!(res, Err(BackendError::Closed)));
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_cancel_during_handshake_releases_everything() {
    let alice = node(false).await;
    let stranger = KeyPair::generate().public_key();

    // A peer that accepts the socket and never says a word.
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    client(&alice)
        .table()
        .insert(stranger, silent.local_addr().unwrap().to_string());
    let peer = tokio::spawn(async move {
        let (mut socket, _) = silent.accept().await.unwrap();
        let mut buf = [0u8; 256];
        socket.read(&mut buf).await
    });

    let cancel = CancellationToken::new();
    let dial = alice.dial(&cancel, NetworkType::Direct, stranger, TRANSPORT_PORT);
    let cancel_midway = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Still waiting on the handshake with its port reserved.
        assert_eq!(client(&alice).ports_in_use(), 1);
        cancel.cancel();
    };
    let (res, ()) = tokio::join!(dial, cancel_midway);

    assert!(matches!(res, Err(NetworkError::Cancelled)));
    assert_eq!(client(&alice).open_conns(), 0);
    assert_eq!(client(&alice).ports_in_use(), 0);

    // The half-open socket was dropped: the peer reads end of stream.
    let read = tokio::time::timeout(Duration::from_secs(2), peer)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(read, Ok(0)) || read.is_err());

    alice.close().await.unwrap();
}

#[tokio::test]
async fn test_close_ends_established_connections() {
    let alice = node(true).await;
    let bob = node(true).await;
    learn(&alice, &bob);

    let listener = bob.listen(NetworkType::Direct, TRANSPORT_PORT).await.unwrap();
    let mut out = alice
        .dial(&CancellationToken::new(), NetworkType::Direct, bob.local_pk(), TRANSPORT_PORT)
        .await
        .unwrap();
    let mut inc = listener.accept_conn().await.unwrap();

    // A read already waiting on bob's side is woken by bob closing.
    let waiting = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        inc.read(&mut buf).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    bob.close().await.unwrap();
    let err = waiting.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);

    alice.close().await.unwrap();
    let err = out.write_all(b"after").await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    let mut buf = [0u8; 5];
    assert!(out.read_exact(&mut buf).await.is_err());
}
