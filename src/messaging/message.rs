//! # Messages
//!
//! The message model of the Crossbear protocol. Every exchange between
//! server, hunters and verification clients is a sequence of typed,
//! length-prefixed messages; this module defines the decoded forms and
//! their semantic validation rules.
//!
//! ## Responsibilities
//! - Define one struct per message type and the [`Message`] sum type
//! - Validate hostnames, ports and payload shapes on construction
//! - Derive the idempotency hash of a verification request
//!
//! Byte-level encoding and decoding live in [`super::wire`].

use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::cert::CertificateDer;
use crate::config;
use crate::error::{DecodeError, ValidationError};
use crate::utils::time;

/// Wire values of the message types. Fixed by the deployed protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    PublicIpNotifV4 = 0,
    PublicIpNotifV6 = 1,
    PublicIpNotifRequest = 2,
    CurrentServerTime = 5,
    HuntingTaskV4 = 10,
    HuntingTaskV6 = 11,
    TaskReplyNewCertChain = 20,
    TaskReplyKnownCertChain = 21,
    FpVerifyRequest = 50,
    FpVerifyResult = 60,
    CertVerifyRequest = 100,
    CertVerifyResult = 110,
}

impl MessageType {
    pub fn from_wire(b: u8) -> Result<Self, DecodeError> {
        use MessageType::*;
        Ok(match b {
            0 => PublicIpNotifV4,
            1 => PublicIpNotifV6,
            2 => PublicIpNotifRequest,
            5 => CurrentServerTime,
            10 => HuntingTaskV4,
            11 => HuntingTaskV6,
            20 => TaskReplyNewCertChain,
            21 => TaskReplyKnownCertChain,
            50 => FpVerifyRequest,
            60 => FpVerifyResult,
            100 => CertVerifyRequest,
            110 => CertVerifyResult,
            other => return Err(DecodeError::UnknownType(other)),
        })
    }
}

/// Tells a hunter its public IP, authenticated so it can later prove to
/// the server that a trace really starts at that address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIpNotification {
    /// HMAC-SHA256 over the address bytes of `public_ip` under one of
    /// the server's rotating keys.
    pub hmac: [u8; 32],
    pub public_ip: IpAddr,
}

/// Asks the server for a [`PublicIpNotification`]; carries an
/// RSA-encrypted AES key so the answer can travel confidentially over a
/// plain-HTTP side channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIpNotifRequest {
    /// Exactly 256 bytes: the AES key encrypted under the server's RSA key.
    pub encrypted_key: Vec<u8>,
}

impl PublicIpNotifRequest {
    pub fn new(encrypted_key: Vec<u8>) -> Result<Self, DecodeError> {
        if encrypted_key.len() != config::PIP_REQUEST_KEY_LEN {
            return Err(DecodeError::Malformed(format!(
                "encrypted key must be {} bytes, got {}",
                config::PIP_REQUEST_KEY_LEN,
                encrypted_key.len()
            )));
        }
        Ok(Self { encrypted_key })
    }
}

/// The server's clock, in unix seconds. Hunters use it to timestamp task
/// replies in server time regardless of their local clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentServerTime {
    pub unix_secs: u32,
}

/// Client-side clock correction derived from a [`CurrentServerTime`].
#[derive(Debug, Clone, Copy)]
pub struct ClockOffset {
    offset_millis: i128,
}

impl ClockOffset {
    /// Records `server - local` at the moment the message is seen.
    pub fn from_server_time(cst: &CurrentServerTime) -> Self {
        let server_millis = i128::from(cst.unix_secs) * 1000;
        Self {
            offset_millis: server_millis - time::now_millis() as i128,
        }
    }

    /// The server's current clock, extrapolated from the local one.
    pub fn current_server_secs(&self) -> u32 {
        let millis = time::now_millis() as i128 + self.offset_millis;
        (millis / 1000).clamp(0, i128::from(u32::MAX)) as u32
    }
}

/// An instruction to hunters: observe the certificate chain of
/// `hostname`:`port` at `target_ip` and trace the route to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HuntingTask {
    pub task_id: u32,
    /// Chain identities the server already knows for this target, newest
    /// first, at most three.
    pub known_chain_hashes: Vec<[u8; 32]>,
    pub target_ip: IpAddr,
    pub port: u16,
    pub hostname: String,
}

impl HuntingTask {
    pub fn new(
        task_id: u32,
        known_chain_hashes: Vec<[u8; 32]>,
        target_ip: IpAddr,
        port: u16,
        hostname: String,
    ) -> Result<Self, ValidationError> {
        validate_hostname(&hostname)?;
        validate_port(port)?;
        Ok(Self {
            task_id,
            known_chain_hashes,
            target_ip,
            port,
            hostname,
        })
    }
}

/// A hunter's answer to a [`HuntingTask`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HuntingTaskReply {
    /// The observed chain is not among the task's known hashes, so the
    /// full chain rides along.
    NewCertChain {
        task_id: u32,
        /// Unix seconds, in server time.
        executed_at: u32,
        /// HMAC from the [`PublicIpNotification`] the hunter observed under.
        pub_ip_hmac: [u8; 32],
        chain: Vec<CertificateDer>,
        trace: String,
    },
    /// The observed chain matches a known hash; only the hash is sent.
    KnownCertChain {
        task_id: u32,
        executed_at: u32,
        pub_ip_hmac: [u8; 32],
        chain_hash: [u8; 32],
        trace: String,
    },
}

impl HuntingTaskReply {
    pub fn task_id(&self) -> u32 {
        match self {
            Self::NewCertChain { task_id, .. } | Self::KnownCertChain { task_id, .. } => *task_id,
        }
    }

    pub fn executed_at(&self) -> u32 {
        match self {
            Self::NewCertChain { executed_at, .. }
            | Self::KnownCertChain { executed_at, .. } => *executed_at,
        }
    }

    pub fn pub_ip_hmac(&self) -> &[u8; 32] {
        match self {
            Self::NewCertChain { pub_ip_hmac, .. }
            | Self::KnownCertChain { pub_ip_hmac, .. } => pub_ip_hmac,
        }
    }

    pub fn trace(&self) -> &str {
        match self {
            Self::NewCertChain { trace, .. } | Self::KnownCertChain { trace, .. } => trace,
        }
    }
}

/// SSH host key types, in their fixed wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SshKeyType {
    Rsa1 = 0,
    Rsa = 1,
    Dsa = 2,
    Ecdsa = 3,
    RsaCert = 4,
    DsaCert = 5,
    EcdsaCert = 6,
    RsaCertV00 = 7,
    DsaCertV00 = 8,
    Unspecified = 9,
}

impl SshKeyType {
    pub fn from_wire(b: u8) -> Result<Self, DecodeError> {
        use SshKeyType::*;
        Ok(match b {
            0 => Rsa1,
            1 => Rsa,
            2 => Dsa,
            3 => Ecdsa,
            4 => RsaCert,
            5 => DsaCert,
            6 => EcdsaCert,
            7 => RsaCertV00,
            8 => DsaCertV00,
            9 => Unspecified,
            other => {
                return Err(DecodeError::Malformed(format!(
                    "unknown SSH key type {other}"
                )))
            }
        })
    }
}

/// Asks whether an SSH host key fingerprint is the one on record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FpVerifyRequest {
    pub format_version: u8,
    pub host_ip: std::net::Ipv4Addr,
    pub port: u16,
    pub key_type: SshKeyType,
    /// ECDSA curve NID; zero for non-ECDSA keys.
    pub ecdsa_nid: u16,
    pub fingerprint: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FpVerifyOutcome {
    Match = 0,
    NoMatch = 1,
    NoEntry = 2,
}

impl FpVerifyOutcome {
    pub fn from_wire(b: u8) -> Result<Self, DecodeError> {
        Ok(match b {
            0 => Self::Match,
            1 => Self::NoMatch,
            2 => Self::NoEntry,
            other => {
                return Err(DecodeError::Malformed(format!(
                    "unknown fingerprint verdict {other}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpVerifyResult {
    pub format_version: u8,
    pub outcome: FpVerifyOutcome,
}

/// Bit 0 of the CertVerifyRequest options byte: the client states it sits
/// behind a TLS-terminating proxy.
pub const OPTION_BEHIND_PROXY: u8 = 0x01;

/// A client-observed certificate chain submitted for judgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertVerifyRequest {
    pub options: u8,
    /// Chain exactly as the client received it, leaf first.
    pub chain: Vec<CertificateDer>,
    pub hostname: String,
    pub host_ip: IpAddr,
    pub port: u16,
}

impl CertVerifyRequest {
    pub fn new(
        options: u8,
        chain: Vec<CertificateDer>,
        hostname: String,
        host_ip: IpAddr,
        port: u16,
    ) -> Result<Self, ValidationError> {
        validate_hostname(&hostname)?;
        validate_port(port)?;
        Ok(Self {
            options,
            chain,
            hostname,
            host_ip,
            port,
        })
    }

    pub fn behind_proxy(&self) -> bool {
        self.options & OPTION_BEHIND_PROXY != 0
    }

    /// The leaf as the client saw it; requests with an empty chain never
    /// decode, so the chain is non-empty here.
    pub fn leaf(&self) -> Option<&CertificateDer> {
        self.chain.first()
    }

    /// Key of the verify-result cache: SHA-256 over the encoded request
    /// plus the addresses of both ends of the connection it arrived on.
    /// Two identical requests from different clients judge differently
    /// (observations are recorded per requester), so the requester is part
    /// of the key.
    pub fn idempotency_hash(&self, requester_ip: &IpAddr, local_ip: &IpAddr) -> [u8; 32] {
        let msg = Message::CertVerifyRequest(self.clone());
        let mut hasher = Sha256::new();
        hasher.update([msg.message_type() as u8]);
        hasher.update(super::wire::encode_payload(&msg));
        hash_ip(&mut hasher, requester_ip);
        hash_ip(&mut hasher, local_ip);
        hasher.finalize().into()
    }
}

fn hash_ip(hasher: &mut Sha256, ip: &IpAddr) {
    match ip {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
}

/// The server's judgment: a rating in 0..=255 and a human-readable report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertVerifyResult {
    pub rating: u8,
    pub report: String,
}

/// Any protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    PublicIpNotification(PublicIpNotification),
    PublicIpNotifRequest(PublicIpNotifRequest),
    CurrentServerTime(CurrentServerTime),
    HuntingTask(HuntingTask),
    HuntingTaskReply(HuntingTaskReply),
    FpVerifyRequest(FpVerifyRequest),
    FpVerifyResult(FpVerifyResult),
    CertVerifyRequest(CertVerifyRequest),
    CertVerifyResult(CertVerifyResult),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::PublicIpNotification(n) => match n.public_ip {
                IpAddr::V4(_) => MessageType::PublicIpNotifV4,
                IpAddr::V6(_) => MessageType::PublicIpNotifV6,
            },
            Message::PublicIpNotifRequest(_) => MessageType::PublicIpNotifRequest,
            Message::CurrentServerTime(_) => MessageType::CurrentServerTime,
            Message::HuntingTask(t) => match t.target_ip {
                IpAddr::V4(_) => MessageType::HuntingTaskV4,
                IpAddr::V6(_) => MessageType::HuntingTaskV6,
            },
            Message::HuntingTaskReply(HuntingTaskReply::NewCertChain { .. }) => {
                MessageType::TaskReplyNewCertChain
            }
            Message::HuntingTaskReply(HuntingTaskReply::KnownCertChain { .. }) => {
                MessageType::TaskReplyKnownCertChain
            }
            Message::FpVerifyRequest(_) => MessageType::FpVerifyRequest,
            Message::FpVerifyResult(_) => MessageType::FpVerifyResult,
            Message::CertVerifyRequest(_) => MessageType::CertVerifyRequest,
            Message::CertVerifyResult(_) => MessageType::CertVerifyResult,
        }
    }
}

// RFC-952/1123 labels, with underscore tolerated since real-world hosts
// use it.
static HOSTNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9_\-]*[a-zA-Z0-9])\.)*([A-Za-z]|[A-Za-z][A-Za-z0-9_\-]*[A-Za-z0-9])$",
    )
    .unwrap()
});

/// A hostname is accepted when its length lies strictly between 3 and
/// 2042 and it matches the host-name grammar.
pub fn validate_hostname(hostname: &str) -> Result<(), ValidationError> {
    let len = hostname.len();
    if len <= config::HOSTNAME_MIN_LEN || len >= config::HOSTNAME_MAX_LEN {
        return Err(ValidationError::BadHostname(hostname.to_string()));
    }
    if !HOSTNAME_RE.is_match(hostname) {
        return Err(ValidationError::BadHostname(hostname.to_string()));
    }
    Ok(())
}

pub fn validate_port(port: u16) -> Result<(), ValidationError> {
    if port == 0 {
        return Err(ValidationError::BadPort("0".to_string()));
    }
    Ok(())
}
