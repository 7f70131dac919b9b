//! # Hunting
//!
//! The distributed observation side of Crossbear. The server issues
//! hunting tasks for suspicious hosts; hunters all over the network
//! observe the certificate chain those hosts serve, trace the route to
//! them and report back under an HMAC-authenticated public IP.

pub mod client;
pub mod keys;
pub mod server;
pub mod trace;

pub use client::{CachedPublicIp, Hunter, IpVersion, PublicIpSource};
pub use keys::{hmac_ip, HmacKey, RotatingKeys};
pub use server::{HuntServer, ReplyDisposition};
pub use trace::{ParsedTrace, ProbeResult, Prober, TraceConfig};
