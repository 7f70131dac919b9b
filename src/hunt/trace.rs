//! # Traces
//!
//! The route to the hunting target, as both sides see it. A trace is
//! textual: one line per hop, multiple responders of one hop joined with
//! `|`, the first line the observer's authenticated public IP, the last
//! line the target. The hunter assembles and sanitizes it; the server
//! parses and checks it.

use std::net::IpAddr;

use crate::error::{TransportError, ValidationError};
use crate::utils::ip;

/// Outcome of one TTL-bound probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The probe reached the target itself.
    Target,
    /// An intermediate router answered.
    Hop(IpAddr),
    NoReply,
}

/// One TTL-bound probe towards a target. Implementations send the actual
/// packets; tests script the topology.
pub trait Prober {
    fn probe(&self, target: &IpAddr, ttl: u8, attempt: u8) -> Result<ProbeResult, TransportError>;
}

#[derive(Debug, Clone, Copy)]
pub struct TraceConfig {
    pub max_hops: u8,
    pub probes_per_hop: u8,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_hops: 30,
            probes_per_hop: 3,
        }
    }
}

/// Probe hop by hop until the target answers or the hop budget runs out.
/// Responders are deduplicated per hop.
pub fn run_trace(
    prober: &dyn Prober,
    target: &IpAddr,
    cfg: &TraceConfig,
) -> Result<Vec<Vec<IpAddr>>, TransportError> {
    let mut hops = Vec::new();
    for ttl in 1..=cfg.max_hops {
        let mut responders: Vec<IpAddr> = Vec::new();
        let mut reached = false;
        for attempt in 0..cfg.probes_per_hop {
            match prober.probe(target, ttl, attempt)? {
                ProbeResult::Target => reached = true,
                ProbeResult::Hop(addr) => {
                    if !responders.contains(&addr) {
                        responders.push(addr);
                    }
                }
                ProbeResult::NoReply => {}
            }
        }
        if !responders.is_empty() {
            hops.push(responders);
        }
        if reached {
            break;
        }
    }
    Ok(hops)
}

/// Build the trace string the server expects: the authenticated public
/// IP first, then the sanitized hops, then the target. Private and
/// link-local responders never leave the local machine; the target is
/// dropped from intermediate lines so it only appears last.
pub fn assemble_trace(public_ip: &IpAddr, hops: &[Vec<IpAddr>], target: &IpAddr) -> String {
    let mut lines = vec![public_ip.to_string()];
    for hop in hops {
        let kept: Vec<String> = hop
            .iter()
            .filter(|addr| !ip::is_private_for_trace(addr) && *addr != target)
            .map(ToString::to_string)
            .collect();
        if !kept.is_empty() {
            lines.push(kept.join("|"));
        }
    }
    lines.push(target.to_string());
    lines.join("\n")
}

/// A server-side parsed trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTrace {
    /// The claimed observer address, authenticated separately via HMAC.
    pub observer: IpAddr,
    pub hops: Vec<Vec<IpAddr>>,
    pub target: IpAddr,
}

/// Parse and structurally validate a trace: every token an IP literal,
/// a single observer on the first line, a single target on the last.
pub fn parse_trace(trace: &str) -> Result<ParsedTrace, ValidationError> {
    let lines: Vec<&str> = trace.split('\n').collect();
    if lines.len() < 2 {
        return Err(ValidationError::BadTrace(
            "trace needs at least an observer and a target".into(),
        ));
    }

    let mut parsed: Vec<Vec<IpAddr>> = Vec::with_capacity(lines.len());
    for line in &lines {
        let mut hop = Vec::new();
        for token in line.split('|') {
            let addr = ip::parse_hop(token)
                .ok_or_else(|| ValidationError::BadTrace(format!("not an IP: {token:?}")))?;
            hop.push(addr);
        }
        parsed.push(hop);
    }

    let first = &parsed[0];
    let last = &parsed[parsed.len() - 1];
    if first.len() != 1 {
        return Err(ValidationError::BadTrace(
            "first line must be the single observer address".into(),
        ));
    }
    if last.len() != 1 {
        return Err(ValidationError::BadTrace(
            "last line must be the single target address".into(),
        ));
    }

    Ok(ParsedTrace {
        observer: first[0],
        target: last[0],
        hops: parsed[1..parsed.len() - 1].to_vec(),
    })
}
