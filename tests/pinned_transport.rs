//! Loopback TLS tests for the pinned client and the chain observer,
//! against a real handshake with a generated certificate.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use rustls::{Certificate, PrivateKey, ServerConfig};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;

use crossbear::error::{CrossbearError, TransportError};
use crossbear::messaging::{CurrentServerTime, Message, MessageCodec};
use crossbear::transport::{ChainFetcher, ChainObserver, PinnedClient, PinnedResolver};

fn server_identity() -> (Vec<u8>, PrivateKey) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    (
        cert.serialize_der().unwrap(),
        PrivateKey(cert.serialize_private_key_der()),
    )
}

fn acceptor(cert_der: Vec<u8>, key: PrivateKey) -> TlsAcceptor {
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![Certificate(cert_der)], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Accept one connection, answer every message with the server time,
/// then close.
async fn serve_once(listener: TcpListener, acceptor: TlsAcceptor) {
    let (tcp, _) = listener.accept().await.unwrap();
    let tls = match acceptor.accept(tcp).await {
        Ok(tls) => tls,
        // a pin-mismatch handshake dies on the client side first
        Err(_) => return,
    };
    let mut framed = Framed::new(tls, MessageCodec);
    let mut received = 0u32;
    while let Some(Ok(_)) = framed.next().await {
        received += 1;
        framed
            .send(Message::CurrentServerTime(CurrentServerTime {
                unix_secs: 1_700_000_000 + received,
            }))
            .await
            .unwrap();
    }
    let _ = framed.close().await;
}

#[tokio::test]
async fn pinned_client_exchanges_messages() {
    let (cert_der, key) = server_identity();
    let pin: [u8; 32] = Sha256::digest(&cert_der).into();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_once(listener, acceptor(cert_der, key)));

    let client = PinnedClient::new("localhost", pin)
        .with_resolver(Arc::new(PinnedResolver::new("localhost", addr)));
    let request = vec![
        Message::CurrentServerTime(CurrentServerTime { unix_secs: 1 }),
        Message::CurrentServerTime(CurrentServerTime { unix_secs: 2 }),
    ];
    let answers = client.exchange(addr.port(), &request).await.unwrap();
    assert_eq!(answers.len(), 2);
    assert!(matches!(
        answers[0],
        Message::CurrentServerTime(CurrentServerTime {
            unix_secs: 1_700_000_001
        })
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn wrong_pin_aborts_the_handshake() {
    let (cert_der, key) = server_identity();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_once(listener, acceptor(cert_der, key)));

    let client = PinnedClient::new("localhost", [0xEE; 32])
        .with_resolver(Arc::new(PinnedResolver::new("localhost", addr)));
    let err = client
        .exchange(addr.port(), &[])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CrossbearError::Transport(TransportError::PinMismatch)
    ));
    server.await.unwrap();
}

#[test]
fn chain_observer_captures_the_served_certificate() {
    let (cert_der, key) = server_identity();
    let expected = cert_der.clone();

    // the observer runs its own runtime, so serve from a separate one
    let (addr_tx, addr_rx) = std::sync::mpsc::channel::<SocketAddr>();
    let server = std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();
            serve_once(listener, acceptor(cert_der, key)).await;
        });
    });
    let addr = addr_rx.recv().unwrap();

    let observer = ChainObserver::new().unwrap();
    let ip: IpAddr = addr.ip();
    let chain = observer.fetch_chain("localhost", &ip, addr.port()).unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].der(), expected.as_slice());
    server.join().unwrap();
}
