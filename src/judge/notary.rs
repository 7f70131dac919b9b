//! # Notary corroboration
//!
//! Convergence-style network notaries observe certificates from their
//! own vantage points. Their answer is a JSON list of SHA-1 fingerprints
//! with observation timespans; a certificate the notaries have watched
//! for a long time is unlikely to be a targeted forgery.
//!
//! Notary answers are cached in the store and refreshed on an interval;
//! an unreachable notary degrades to a neutral "no reply" instead of
//! failing the verification.

use serde::Deserialize;
use sha1::{Digest, Sha1};
use tracing::warn;

use crate::cert::CertificateDer;
use crate::config;
use crate::error::{StoreError, TransportError};
use crate::store::Store;
use crate::utils::time;

/// Fetches the raw notary answer for a host:port. Implementations talk
/// HTTP to a Convergence notary; tests substitute canned answers.
pub trait NotaryClient: Send + Sync {
    fn fetch_observations(&self, hostname: &str, port: u16) -> Result<String, TransportError>;
}

#[derive(Debug, Deserialize)]
pub struct NotaryAnswer {
    #[serde(rename = "fingerprintList", default)]
    pub fingerprint_list: Vec<NotaryFingerprint>,
}

#[derive(Debug, Deserialize)]
pub struct NotaryFingerprint {
    /// Colon-separated uppercase SHA-1 of the certificate DER.
    pub fingerprint: String,
    pub timestamp: NotaryTimespan,
}

/// Unix milliseconds.
#[derive(Debug, Deserialize)]
pub struct NotaryTimespan {
    pub start: u64,
    pub finish: u64,
}

/// What the notaries know about one certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotaryOutcome {
    /// No notary could be reached.
    NoReply,
    /// Reached, but this certificate has never been seen.
    Unknown,
    /// Seen; observation period in unix seconds.
    Seen { first_seen: u64, last_seen: u64 },
}

pub fn parse_answer(json: &str) -> Result<NotaryAnswer, serde_json::Error> {
    serde_json::from_str(json)
}

/// The Convergence fingerprint of a certificate.
pub fn convergence_fingerprint(cert: &CertificateDer) -> String {
    let digest = Sha1::digest(cert.der());
    digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Match `cert` against a parsed answer. All timespans carrying the
/// certificate's fingerprint are merged into one observation period.
pub fn outcome_for(answer: &NotaryAnswer, cert: &CertificateDer) -> NotaryOutcome {
    let fp = convergence_fingerprint(cert);
    let mut period: Option<(u64, u64)> = None;
    for entry in answer
        .fingerprint_list
        .iter()
        .filter(|e| e.fingerprint.eq_ignore_ascii_case(&fp))
    {
        let start = entry.timestamp.start / 1000;
        let finish = entry.timestamp.finish / 1000;
        let p = period.get_or_insert((start, finish));
        p.0 = p.0.min(start);
        p.1 = p.1.max(finish);
    }
    match period {
        Some((first_seen, last_seen)) => NotaryOutcome::Seen {
            first_seen,
            last_seen,
        },
        None => NotaryOutcome::Unknown,
    }
}

/// Store-cached notary lookups.
pub struct CachedNotary<'a> {
    client: &'a dyn NotaryClient,
    store: &'a dyn Store,
    refresh_secs: u64,
}

impl<'a> CachedNotary<'a> {
    pub fn new(client: &'a dyn NotaryClient, store: &'a dyn Store) -> Self {
        Self {
            client,
            store,
            refresh_secs: config::NOTARY_REFRESH_SECS,
        }
    }

    pub fn with_refresh(mut self, refresh_secs: u64) -> Self {
        self.refresh_secs = refresh_secs;
        self
    }

    /// What the notaries say about `cert` at `hostname:port`.
    pub fn check(
        &self,
        hostname: &str,
        port: u16,
        cert: &CertificateDer,
    ) -> Result<NotaryOutcome, StoreError> {
        let now = time::now_secs();
        let cached = self.store.notary_cache_get(hostname, port)?;
        let answer_json = match cached {
            Some((json, fetched_at)) if !time::expired(fetched_at, self.refresh_secs) => json,
            stale => match self.client.fetch_observations(hostname, port) {
                Ok(json) => {
                    self.store.notary_cache_put(hostname, port, &json, now)?;
                    json
                }
                Err(err) => {
                    warn!(host = hostname, port, %err, "notary unreachable");
                    // a stale answer beats no answer
                    match stale {
                        Some((json, _)) => json,
                        None => return Ok(NotaryOutcome::NoReply),
                    }
                }
            },
        };
        match parse_answer(&answer_json) {
            Ok(answer) => Ok(outcome_for(&answer, cert)),
            Err(err) => {
                warn!(host = hostname, port, %err, "unparseable notary answer");
                Ok(NotaryOutcome::NoReply)
            }
        }
    }
}
