//! # Chain validation
//!
//! Certificate chains arrive from many observers in whatever order (and
//! completeness) the peer happened to send. Before a chain identity can
//! be computed the chain must be brought into a validated form: leaf
//! first, each certificate signed by its successor, ending in a resolved
//! anchor.
//!
//! `make_valid` keeps the leaf pinned and tries reorderings of the rest
//! under a fixed permutation budget. Validation time is pinned to the
//! leaf's notAfter, so an old observation of a since-expired chain still
//! validates; revocation is not consulted.

use std::collections::HashMap;

use x509_parser::prelude::*;

use crate::cert::CertificateDer;
use crate::error::ChainError;

/// Trusted root certificates, indexed by raw subject.
pub struct TrustStore {
    certs_by_subject: HashMap<Vec<u8>, Vec<CertificateDer>>,
    count: usize,
}

impl TrustStore {
    pub fn new() -> Self {
        Self {
            certs_by_subject: HashMap::new(),
            count: 0,
        }
    }

    /// Load every certificate of a PEM bundle.
    pub fn from_pem(pem: &[u8]) -> Result<Self, ChainError> {
        let mut store = Self::new();
        let mut reader = std::io::BufReader::new(pem);
        let ders = rustls_pemfile::certs(&mut reader)
            .map_err(|e| ChainError::Parse(format!("bad PEM bundle: {e}")))?;
        for der in ders {
            store.add_der(&der)?;
        }
        Ok(store)
    }

    pub fn add_der(&mut self, der: &[u8]) -> Result<(), ChainError> {
        let (_, x509) = X509Certificate::from_der(der)
            .map_err(|e| ChainError::Parse(e.to_string()))?;
        let subject = x509.subject().as_raw().to_vec();
        self.certs_by_subject
            .entry(subject)
            .or_default()
            .push(CertificateDer::new(der.to_vec()));
        self.count += 1;
        Ok(())
    }

    fn find_by_subject(&self, subject_raw: &[u8]) -> &[CertificateDer] {
        self.certs_by_subject
            .get(subject_raw)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for TrustStore {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ChainValidator {
    trust: TrustStore,
}

impl ChainValidator {
    pub fn new(trust: TrustStore) -> Self {
        Self { trust }
    }

    pub fn trust_store(&self) -> &TrustStore {
        &self.trust
    }

    /// Bring `chain` into validated form.
    ///
    /// The first element is taken as the leaf and stays first; the rest is
    /// reordered, identity order tried first, then permutations in
    /// lexicographic order until one validates or `max_permutations`
    /// candidates have been tried.
    ///
    /// When `require_self_signed_end` is set and a candidate does not end
    /// in a self-signed certificate, the anchor is searched in the trust
    /// store; otherwise the candidate's last element is popped and used as
    /// the sole anchor. The returned chain always ends in the resolved
    /// anchor.
    ///
    /// `Ok(None)` when no ordering validates within the budget.
    pub fn make_valid(
        &self,
        chain: &[CertificateDer],
        max_permutations: u32,
        require_self_signed_end: bool,
    ) -> Result<Option<Vec<CertificateDer>>, ChainError> {
        let (leaf, tail) = chain.split_first().ok_or(ChainError::EmptyChain)?;

        // parse failures fail the whole operation, not just one ordering
        for cert in chain {
            X509Certificate::from_der(cert.der())
                .map_err(|e| ChainError::Parse(e.to_string()))?;
        }

        let mut order: Vec<usize> = (0..tail.len()).collect();
        for _ in 0..max_permutations {
            let candidate: Vec<&CertificateDer> = std::iter::once(leaf)
                .chain(order.iter().map(|&i| &tail[i]))
                .collect();
            if let Some(valid) = self.validate_once(&candidate, require_self_signed_end) {
                return Ok(Some(valid));
            }
            if !next_permutation(&mut order) {
                break;
            }
        }
        Ok(None)
    }

    /// Validate one candidate ordering. `None` means this ordering does
    /// not form a valid chain.
    fn validate_once(
        &self,
        candidate: &[&CertificateDer],
        require_self_signed_end: bool,
    ) -> Option<Vec<CertificateDer>> {
        let parsed: Vec<X509Certificate<'_>> = candidate
            .iter()
            .map(|c| X509Certificate::from_der(c.der()).map(|(_, x)| x))
            .collect::<Result<_, _>>()
            .ok()?;

        let last = parsed.last()?;
        let last_self_signed = is_self_signed(last);

        // (path certs, anchor DER outside the path if any)
        let use_trust_store = require_self_signed_end && !last_self_signed;
        let path_len = if use_trust_store || candidate.len() == 1 {
            candidate.len()
        } else {
            candidate.len() - 1
        };
        let path = &parsed[..path_len];

        let at = parsed[0].validity().not_after.timestamp();
        for cert in &parsed {
            if !within_validity(cert, at) {
                return None;
            }
        }

        for pair in path.windows(2) {
            if pair[0]
                .verify_signature(Some(pair[1].public_key()))
                .is_err()
            {
                return None;
            }
        }

        let path_end = path.last()?;
        let mut result: Vec<CertificateDer> =
            candidate[..path_len].iter().map(|c| (*c).clone()).collect();

        if use_trust_store {
            let anchor = self
                .trust
                .find_by_subject(path_end.issuer().as_raw())
                .iter()
                .find(|root| {
                    X509Certificate::from_der(root.der())
                        .ok()
                        .map(|(_, r)| {
                            within_validity(&r, at)
                                && path_end.verify_signature(Some(r.public_key())).is_ok()
                        })
                        .unwrap_or(false)
                })?;
            result.push(anchor.clone());
        } else if path_len < candidate.len() {
            // popped anchor: the path end must chain to it
            let anchor = &parsed[path_len];
            if path_end.verify_signature(Some(anchor.public_key())).is_err() {
                return None;
            }
            result.push(candidate[path_len].clone());
        } else {
            // single certificate: only valid when it anchors itself
            if !last_self_signed {
                return None;
            }
        }

        Some(result)
    }
}

fn is_self_signed(cert: &X509Certificate<'_>) -> bool {
    cert.subject().as_raw() == cert.issuer().as_raw() && cert.verify_signature(None).is_ok()
}

fn within_validity(cert: &X509Certificate<'_>, at: i64) -> bool {
    cert.validity().not_before.timestamp() <= at && at <= cert.validity().not_after.timestamp()
}

/// Advance `a` to its lexicographic successor; false when `a` is already
/// the last permutation.
fn next_permutation(a: &mut [usize]) -> bool {
    if a.len() < 2 {
        return false;
    }
    let mut i = a.len() - 1;
    while i > 0 && a[i - 1] >= a[i] {
        i -= 1;
    }
    if i == 0 {
        return false;
    }
    let mut j = a.len() - 1;
    while a[j] <= a[i - 1] {
        j -= 1;
    }
    a.swap(i - 1, j);
    a[i..].reverse();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{
        BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyUsagePurpose,
    };

    fn ca_params(cn: &str) -> CertificateParams {
        let mut params = CertificateParams::new(Vec::new());
        params.distinguished_name.push(DnType::CommonName, cn);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2035, 1, 1);
        params
    }

    fn leaf_params(cn: &str) -> CertificateParams {
        let mut params = CertificateParams::new(vec![cn.to_string()]);
        params.distinguished_name.push(DnType::CommonName, cn);
        params.not_before = rcgen::date_time_ymd(2020, 1, 1);
        params.not_after = rcgen::date_time_ymd(2030, 1, 1);
        params
    }

    struct TestPki {
        root_der: Vec<u8>,
        mid_der: Vec<u8>,
        leaf_der: Vec<u8>,
    }

    fn build_pki() -> TestPki {
        let root = Certificate::from_params(ca_params("Test Root CA")).unwrap();
        let mid = Certificate::from_params(ca_params("Test Intermediate CA")).unwrap();
        let leaf = Certificate::from_params(leaf_params("www.example.com")).unwrap();
        TestPki {
            root_der: root.serialize_der().unwrap(),
            mid_der: mid.serialize_der_with_signer(&root).unwrap(),
            leaf_der: leaf.serialize_der_with_signer(&mid).unwrap(),
        }
    }

    fn cert(der: &[u8]) -> CertificateDer {
        CertificateDer::new(der.to_vec())
    }

    #[test]
    fn identity_order_validates() {
        let pki = build_pki();
        let validator = ChainValidator::new(TrustStore::new());
        let chain = [cert(&pki.leaf_der), cert(&pki.mid_der), cert(&pki.root_der)];
        let valid = validator.make_valid(&chain, 50, true).unwrap().unwrap();
        assert_eq!(valid.len(), 3);
        assert_eq!(valid[0].der(), pki.leaf_der.as_slice());
        assert_eq!(valid[2].der(), pki.root_der.as_slice());
    }

    #[test]
    fn shuffled_tail_is_reordered() {
        let pki = build_pki();
        let validator = ChainValidator::new(TrustStore::new());
        let chain = [cert(&pki.leaf_der), cert(&pki.root_der), cert(&pki.mid_der)];
        let valid = validator.make_valid(&chain, 50, true).unwrap().unwrap();
        assert_eq!(valid[1].der(), pki.mid_der.as_slice());
        assert_eq!(valid[2].der(), pki.root_der.as_slice());
    }

    #[test]
    fn incomplete_chain_is_completed_from_the_trust_store() {
        let pki = build_pki();
        let mut trust = TrustStore::new();
        trust.add_der(&pki.root_der).unwrap();
        let validator = ChainValidator::new(trust);

        let chain = [cert(&pki.leaf_der), cert(&pki.mid_der)];
        let valid = validator.make_valid(&chain, 50, true).unwrap().unwrap();
        assert_eq!(valid.len(), 3);
        assert_eq!(valid[2].der(), pki.root_der.as_slice());
    }

    #[test]
    fn without_terminator_requirement_the_last_cert_anchors() {
        let pki = build_pki();
        let validator = ChainValidator::new(TrustStore::new());
        let chain = [cert(&pki.leaf_der), cert(&pki.mid_der)];
        let valid = validator.make_valid(&chain, 50, false).unwrap().unwrap();
        assert_eq!(valid.len(), 2);
        assert_eq!(valid[1].der(), pki.mid_der.as_slice());
    }

    #[test]
    fn unrelated_certificates_never_validate() {
        let pki = build_pki();
        let other = Certificate::from_params(ca_params("Unrelated CA")).unwrap();
        let validator = ChainValidator::new(TrustStore::new());
        let chain = [cert(&pki.leaf_der), cert(&other.serialize_der().unwrap())];
        assert!(validator.make_valid(&chain, 50, true).unwrap().is_none());
    }

    #[test]
    fn empty_chain_is_an_error() {
        let validator = ChainValidator::new(TrustStore::new());
        assert!(matches!(
            validator.make_valid(&[], 50, true),
            Err(ChainError::EmptyChain)
        ));
    }

    #[test]
    fn garbage_certificate_is_a_parse_error() {
        let validator = ChainValidator::new(TrustStore::new());
        let chain = [cert(&[0x30, 0x03, 1, 2, 3])];
        assert!(matches!(
            validator.make_valid(&chain, 50, true),
            Err(ChainError::Parse(_))
        ));
    }

    #[test]
    fn self_signed_single_certificate_validates_alone() {
        let root = Certificate::from_params(ca_params("Lone Root")).unwrap();
        let validator = ChainValidator::new(TrustStore::new());
        let chain = [cert(&root.serialize_der().unwrap())];
        let valid = validator.make_valid(&chain, 50, true).unwrap().unwrap();
        assert_eq!(valid.len(), 1);
    }

    #[test]
    fn permutations_are_lexicographic() {
        let mut order = vec![0usize, 1, 2];
        assert!(next_permutation(&mut order));
        assert_eq!(order, [0, 2, 1]);
        assert!(next_permutation(&mut order));
        assert_eq!(order, [1, 0, 2]);
        let mut last = vec![2usize, 1, 0];
        assert!(!next_permutation(&mut last));
    }
}
