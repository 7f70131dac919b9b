//! # Transport boundary
//!
//! The network edge of a hunter: a certificate-pinned TLS client for
//! talking to the Crossbear server, and a chain observer that records
//! whatever certificate chain a TLS target presents without trusting it.
//!
//! ## Responsibilities
//! - Pin the Crossbear server by the SHA-256 of its certificate DER
//! - Capture target chains for hunting and verification
//! - Resolve hostnames, with an overridable table so a hunter can pin a
//!   hostname to the exact address a task names

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use futures::{SinkExt, StreamExt};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ServerName};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::cert::CertificateDer;
use crate::error::{CrossbearError, TransportError};
use crate::messaging::{Message, MessageCodec};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Turns a hostname into the address to connect to. Hunters override the
/// system resolver so a task's hostname connects to the task's target IP.
pub trait Resolver: Send + Sync {
    fn resolve(&self, hostname: &str, port: u16) -> Result<SocketAddr, TransportError>;
}

/// The operating system's resolver.
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, hostname: &str, port: u16) -> Result<SocketAddr, TransportError> {
        (hostname, port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Unreachable(format!("resolving {hostname}: {e}")))?
            .next()
            .ok_or_else(|| TransportError::Unreachable(format!("no address for {hostname}")))
    }
}

/// A fixed hostname-to-address pin.
pub struct PinnedResolver {
    hostname: String,
    addr: SocketAddr,
}

impl PinnedResolver {
    pub fn new(hostname: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            hostname: hostname.into(),
            addr,
        }
    }
}

impl Resolver for PinnedResolver {
    fn resolve(&self, hostname: &str, _port: u16) -> Result<SocketAddr, TransportError> {
        if hostname == self.hostname {
            Ok(self.addr)
        } else {
            Err(TransportError::Unreachable(format!(
                "no pin for {hostname}"
            )))
        }
    }
}

/// Fetches the certificate chain a TLS endpoint presents, leaf first.
/// Implementations perform the handshake; tests substitute canned chains.
pub trait ChainFetcher: Send + Sync {
    fn fetch_chain(
        &self,
        hostname: &str,
        ip: &IpAddr,
        port: u16,
    ) -> Result<Vec<CertificateDer>, TransportError>;
}

const PIN_MISMATCH_MSG: &str = "pinned certificate mismatch";

/// Accepts exactly one server certificate, identified by the SHA-256 of
/// its DER encoding. Chain building and validity are irrelevant here: the
/// pin either matches or the handshake dies.
struct PinnedCertVerifier {
    pinned_sha256: [u8; 32],
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let digest: [u8; 32] = Sha256::digest(&end_entity.0).into();
        if digest == self.pinned_sha256 {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(PIN_MISMATCH_MSG.into()))
        }
    }
}

/// Accepts any server certificate and records the presented chain. The
/// point of hunting is to observe what a possibly hostile endpoint
/// serves, so nothing here implies trust.
struct CapturingVerifier {
    captured: Mutex<Vec<Vec<u8>>>,
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let mut chain = vec![end_entity.0.clone()];
        chain.extend(intermediates.iter().map(|c| c.0.clone()));
        let mut slot = self
            .captured
            .lock()
            .map_err(|_| rustls::Error::General("capture slot poisoned".into()))?;
        *slot = chain;
        Ok(ServerCertVerified::assertion())
    }
}

fn tls_error(err: std::io::Error) -> TransportError {
    let text = err.to_string();
    if text.contains(PIN_MISMATCH_MSG) {
        TransportError::PinMismatch
    } else {
        TransportError::Tls(text)
    }
}

fn server_name_for(hostname: &str, ip: &IpAddr) -> ServerName {
    ServerName::try_from(hostname).unwrap_or(ServerName::IpAddress(*ip))
}

/// A TLS client that talks the Crossbear message protocol to the server
/// and accepts no certificate but the pinned one.
pub struct PinnedClient {
    server_name: String,
    pinned_sha256: [u8; 32],
    resolver: Arc<dyn Resolver>,
    connect_timeout: Duration,
}

impl PinnedClient {
    pub fn new(server_name: impl Into<String>, pinned_sha256: [u8; 32]) -> Self {
        Self {
            server_name: server_name.into(),
            pinned_sha256,
            resolver: Arc::new(SystemResolver),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    fn client_config(&self) -> Arc<ClientConfig> {
        Arc::new(
            ClientConfig::builder()
                .with_safe_defaults()
                .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier {
                    pinned_sha256: self.pinned_sha256,
                }))
                .with_no_client_auth(),
        )
    }

    /// Send `messages` to the server on port `port` and collect every
    /// message it answers with until it closes the connection.
    pub async fn exchange(
        &self,
        port: u16,
        messages: &[Message],
    ) -> Result<Vec<Message>, CrossbearError> {
        let addr = self.resolver.resolve(&self.server_name, port)?;
        let tcp = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Unreachable(format!("{addr}: {e}")))?;

        let connector = TlsConnector::from(self.client_config());
        let name = server_name_for(&self.server_name, &addr.ip());
        let tls = timeout(self.connect_timeout, connector.connect(name, tcp))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(tls_error)?;
        debug!(server = %self.server_name, %addr, "pinned connection established");

        let mut framed = Framed::new(tls, MessageCodec);
        for message in messages {
            framed.feed(message.clone()).await?;
        }
        framed.flush().await?;
        // half-close: the close_notify tells the server the request is
        // complete; the read side stays open for the answer
        framed.close().await?;

        let mut answers = Vec::new();
        while let Some(next) = framed.next().await {
            answers.push(next?);
        }
        Ok(answers)
    }
}

/// [`ChainFetcher`] backed by a real TLS handshake. Runs the async
/// connect on its own current-thread runtime so the synchronous hunting
/// and verification pipelines can call it directly.
pub struct ChainObserver {
    runtime: tokio::runtime::Runtime,
    connect_timeout: Duration,
}

impl ChainObserver {
    pub fn new() -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    async fn observe(
        &self,
        hostname: &str,
        ip: &IpAddr,
        port: u16,
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        let verifier = Arc::new(CapturingVerifier {
            captured: Mutex::new(Vec::new()),
        });
        let config = Arc::new(
            ClientConfig::builder()
                .with_safe_defaults()
                .with_custom_certificate_verifier(verifier.clone())
                .with_no_client_auth(),
        );

        let addr = SocketAddr::new(*ip, port);
        let tcp = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Unreachable(format!("{addr}: {e}")))?;

        let connector = TlsConnector::from(config);
        let name = server_name_for(hostname, ip);
        // the handshake itself delivers the chain; no application data
        timeout(self.connect_timeout, connector.connect(name, tcp))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(tls_error)?;

        let captured = verifier
            .captured
            .lock()
            .map_err(|_| TransportError::Tls("capture slot poisoned".into()))?;
        Ok(captured.clone())
    }
}

impl ChainFetcher for ChainObserver {
    fn fetch_chain(
        &self,
        hostname: &str,
        ip: &IpAddr,
        port: u16,
    ) -> Result<Vec<CertificateDer>, TransportError> {
        let raw = self.runtime.block_on(self.observe(hostname, ip, port))?;
        if raw.is_empty() {
            return Err(TransportError::Tls("no certificate presented".into()));
        }
        debug!(host = hostname, %ip, port, certs = raw.len(), "chain observed");
        Ok(raw.into_iter().map(CertificateDer::new).collect())
    }
}
