//! # Judgment
//!
//! The heart of the verification service: a set of independent judgments
//! over a client-observed certificate, each contributing a weighted
//! rating and a report line. The summed rating, clamped to 0..=255, is
//! what the client receives; the report explains it.
//!
//! Two report lines double as machine-readable flags: the equality
//! judgment's `CERTCOMPARE: DIFFERENT` and the notary judgment's
//! `CONVERGENCE: UNKNOWN` together make a certificate suspicious enough
//! to hunt.

pub mod notary;

use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use crate::cert::{names, CertificateDer};
use crate::config::weights;
use crate::messaging::CertVerifyResult;
use crate::store::ObservationStats;
use crate::utils::ip;

use notary::NotaryOutcome;

/// One weighted finding about a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertJudgment {
    pub text: String,
    pub rating: i32,
}

impl CertJudgment {
    pub fn new(text: impl Into<String>, rating: i32) -> Self {
        Self {
            text: text.into(),
            rating,
        }
    }
}

/// The collected judgments for one verification.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Verdict {
    judgments: Vec<CertJudgment>,
}

impl Verdict {
    pub fn push(&mut self, judgment: CertJudgment) {
        self.judgments.push(judgment);
    }

    /// Sum of all ratings, clamped into the one-byte range the wire
    /// format carries.
    pub fn rating(&self) -> u8 {
        let sum: i32 = self.judgments.iter().map(|j| j.rating).sum();
        sum.clamp(0, 255) as u8
    }

    pub fn report(&self) -> String {
        self.judgments
            .iter()
            .map(|j| j.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.judgments.iter().any(|j| j.text.contains(needle))
    }

    pub fn to_message(&self) -> CertVerifyResult {
        CertVerifyResult {
            rating: self.rating(),
            report: self.report(),
        }
    }
}

/// Everything a judgment run needs to see.
pub struct JudgeInputs<'a> {
    /// The leaf as the requesting client observed it.
    pub client_leaf: &'a CertificateDer,
    /// The leaf as this server observed it, when the target was reachable.
    pub server_leaf: Option<&'a CertificateDer>,
    pub hostname: &'a str,
    /// History of the client's leaf at this host:port.
    pub stats: Option<ObservationStats>,
    pub notary: NotaryOutcome,
    pub now: u64,
}

pub fn judge(inputs: &JudgeInputs<'_>) -> Verdict {
    let mut verdict = Verdict::default();
    verdict.push(judge_equality(inputs.client_leaf, inputs.server_leaf));
    verdict.push(judge_domain(inputs.client_leaf, inputs.hostname));
    judge_x509(inputs.client_leaf, inputs.now, &mut verdict);
    judge_observations(inputs.stats, inputs.now, &mut verdict);
    verdict.push(judge_notary(inputs.notary, inputs.now));
    verdict
}

/// Does the client see the same certificate this server sees?
fn judge_equality(client: &CertificateDer, server: Option<&CertificateDer>) -> CertJudgment {
    match server {
        None => CertJudgment::new(
            "CERTCOMPARE: SERVER CERT UNAVAILABLE",
            weights::EQUALITY_NO_CERT,
        ),
        Some(s) if s.sha256() == client.sha256() => {
            CertJudgment::new("CERTCOMPARE: EQUAL", weights::EQUALITY_SAME)
        }
        Some(_) => CertJudgment::new("CERTCOMPARE: DIFFERENT", weights::EQUALITY_DIFFERENT),
    }
}

fn judge_domain(leaf: &CertificateDer, hostname: &str) -> CertJudgment {
    match names::check_host(leaf.der(), hostname) {
        names::HostMatch::InvalidName => {
            CertJudgment::new("DOMAIN: NAME ENCODING INVALID", weights::DOMAIN_INVALID_CN)
        }
        names::HostMatch::NoNames => {
            CertJudgment::new("DOMAIN: NO CN OR DNS NAME FOUND", weights::DOMAIN_CN_NOT_FOUND)
        }
        names::HostMatch::NoMatch => CertJudgment::new(
            format!("DOMAIN: NO MATCH FOR {hostname}"),
            weights::DOMAIN_NO_MATCH,
        ),
        names::HostMatch::Match => CertJudgment::new(
            format!("DOMAIN: MATCHES {hostname}"),
            weights::DOMAIN_MATCH,
        ),
    }
}

/// Validity window, key length and signature algorithm, all from the
/// parsed leaf.
fn judge_x509(leaf: &CertificateDer, now: u64, verdict: &mut Verdict) {
    let Ok((_, x509)) = X509Certificate::from_der(leaf.der()) else {
        // keep the report shape of the parseable path
        verdict.push(CertJudgment::new(
            "VALIDITY: UNPARSEABLE CERTIFICATE",
            weights::VALIDITY_NOT_NOW,
        ));
        verdict.push(CertJudgment::new(
            "KEYLENGTH: NOT RATED (UNPARSEABLE CERTIFICATE)",
            0,
        ));
        verdict.push(CertJudgment::new("ALGORITHM: UNKNOWN", 0));
        return;
    };

    let now = now as i64;
    let valid = x509.validity().not_before.timestamp() <= now
        && now <= x509.validity().not_after.timestamp();
    verdict.push(if valid {
        CertJudgment::new("VALIDITY: CURRENTLY VALID", weights::VALIDITY_NOW)
    } else {
        CertJudgment::new("VALIDITY: NOT CURRENTLY VALID", weights::VALIDITY_NOT_NOW)
    });

    verdict.push(match x509.public_key().parsed() {
        Ok(PublicKey::RSA(rsa)) => {
            let bits = modulus_bits(rsa.modulus);
            CertJudgment::new(format!("KEYLENGTH: {bits} BIT RSA"), rsa_keylen_rating(bits))
        }
        _ => CertJudgment::new("KEYLENGTH: NOT RATED (NON-RSA KEY)", 0),
    });

    let alg = signature_algorithm_name(&x509.signature_algorithm.algorithm.to_id_string());
    verdict.push(if MD_ALGORITHM_RE.is_match(&alg) {
        CertJudgment::new(
            format!("ALGORITHM: {alg} IS OBSOLETE"),
            weights::ALGORITHM_DEPRECATED,
        )
    } else {
        CertJudgment::new(format!("ALGORITHM: {alg}"), 0)
    });
}

fn judge_observations(stats: Option<ObservationStats>, now: u64, verdict: &mut Verdict) {
    match stats {
        None => verdict.push(CertJudgment::new("OBSERVATION PERIOD: FIRST OBSERVATION", 0)),
        Some(stats) => {
            let days = (stats.last_seen.saturating_sub(stats.first_seen)) / 86_400;
            let ongoing = now.saturating_sub(stats.last_seen) <= weights::STILL_OBSERVED_SLACK_SECS;
            let per_bucket = days / weights::OBSERVATION_BUCKET_DAYS;
            let rating = if ongoing { per_bucket * 2 } else { per_bucket } as i32;
            let text = if ongoing {
                format!("OBSERVATION PERIOD: {days} DAYS, ONGOING")
            } else {
                format!("OBSERVATION PERIOD: {days} DAYS")
            };
            verdict.push(CertJudgment::new(text, rating));

            let count_text = if stats.count >= 1000 {
                format!("{}k", stats.count / 1000)
            } else {
                stats.count.to_string()
            };
            verdict.push(CertJudgment::new(
                format!("OBSERVATIONS: {count_text}"),
                (stats.count / weights::OBSERVATION_COUNT_DIVISOR) as i32,
            ));
        }
    }
}

fn judge_notary(outcome: NotaryOutcome, now: u64) -> CertJudgment {
    match outcome {
        NotaryOutcome::NoReply => CertJudgment::new("CONVERGENCE: NO REPLY", 0),
        NotaryOutcome::Unknown => {
            CertJudgment::new("CONVERGENCE: UNKNOWN", weights::NOTARY_UNKNOWN)
        }
        NotaryOutcome::Seen {
            first_seen,
            last_seen,
        } => {
            let days = last_seen.saturating_sub(first_seen) / 86_400;
            let recent = now.saturating_sub(last_seen) <= weights::NOTARY_RECENT_SLACK_SECS;
            let per_bucket = days / weights::OBSERVATION_BUCKET_DAYS;
            let rating = if recent { per_bucket * 2 } else { per_bucket } as i32;
            CertJudgment::new(format!("CONVERGENCE: SEEN FOR {days} DAYS"), rating)
        }
    }
}

pub(crate) fn rsa_keylen_rating(bits: i64) -> i32 {
    let rating = if bits >= weights::KEYLEN_BASELINE {
        (bits - weights::KEYLEN_BASELINE) / weights::KEYLEN_BONUS_DIVISOR
    } else {
        let short = weights::KEYLEN_BASELINE - bits;
        -((short * short) / weights::KEYLEN_PENALTY_DIVISOR)
    };
    rating as i32
}

fn modulus_bits(modulus: &[u8]) -> i64 {
    let stripped: &[u8] = match modulus.iter().position(|&b| b != 0) {
        Some(i) => &modulus[i..],
        None => return 0,
    };
    let first = stripped[0];
    ((stripped.len() as i64) - 1) * 8 + (8 - first.leading_zeros() as i64)
}

fn signature_algorithm_name(oid: &str) -> String {
    match oid {
        "1.2.840.113549.1.1.2" => "md2WithRSAEncryption".into(),
        "1.2.840.113549.1.1.3" => "md4WithRSAEncryption".into(),
        "1.2.840.113549.1.1.4" => "md5WithRSAEncryption".into(),
        "1.2.840.113549.1.1.5" => "sha1WithRSAEncryption".into(),
        "1.2.840.113549.1.1.11" => "sha256WithRSAEncryption".into(),
        "1.2.840.113549.1.1.12" => "sha384WithRSAEncryption".into(),
        "1.2.840.113549.1.1.13" => "sha512WithRSAEncryption".into(),
        "1.2.840.10045.4.3.2" => "ecdsa-with-SHA256".into(),
        "1.2.840.10045.4.3.3" => "ecdsa-with-SHA384".into(),
        "1.2.840.10045.4.3.4" => "ecdsa-with-SHA512".into(),
        other => other.to_string(),
    }
}

static MD_ALGORITHM_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"md\d")
        .case_insensitive(true)
        .build()
        .unwrap()
});

/// A hunting task is warranted when the client and this server disagree,
/// the notaries cannot corroborate either view, the client is not behind
/// a TLS-terminating proxy, and the target address is one the rest of
/// the network can actually reach.
pub fn hunting_task_warranted(
    verdict: &Verdict,
    behind_proxy: bool,
    target_ip: &IpAddr,
) -> bool {
    verdict.contains("CERTCOMPARE: DIFFERENT")
        && verdict.contains("CONVERGENCE: UNKNOWN")
        && !behind_proxy
        && ip::is_public_unicast(target_ip)
}
