//! # Certificates
//!
//! DER certificate handling: identity hashing, PEM rendering and the
//! chain-identity construction shared by the server and the hunters.
//!
//! ## Responsibilities
//! - Wrap raw DER with a cached SHA-256 identity
//! - Render PEM the way the chain identity is defined over
//! - Compute the chain identity of a validated chain
//!
//! Chain validation lives in [`chain`], raw ASN.1 name extraction in
//! [`names`].

pub mod chain;
pub mod names;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

/// A single certificate in raw DER form, with its SHA-256 computed once.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateDer {
    der: Vec<u8>,
    sha256: [u8; 32],
}

impl CertificateDer {
    pub fn new(der: Vec<u8>) -> Self {
        let sha256 = Sha256::digest(&der).into();
        Self { der, sha256 }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// SHA-256 of the DER encoding; the certificate's identity everywhere
    /// in this crate.
    pub fn sha256(&self) -> &[u8; 32] {
        &self.sha256
    }

    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256)
    }

    /// PEM rendering with 64-column base64 lines. The chain identity is
    /// defined over exactly this rendering, so the line width is fixed.
    pub fn to_pem(&self) -> String {
        let b64 = STANDARD.encode(&self.der);
        let mut pem = String::with_capacity(b64.len() + b64.len() / 64 + 64);
        pem.push_str("-----BEGIN CERTIFICATE-----\n");
        for line in b64.as_bytes().chunks(64) {
            // chunks of an ASCII string are valid UTF-8
            pem.push_str(std::str::from_utf8(line).unwrap_or_default());
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
        pem
    }

    /// MD5 of the PEM rendering; the per-certificate component of the
    /// chain identity.
    pub fn pem_md5(&self) -> [u8; 16] {
        md5::compute(self.to_pem().as_bytes()).0
    }
}

impl std::fmt::Debug for CertificateDer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CertificateDer({}..)", &self.sha256_hex()[..16])
    }
}

/// Identity of a validated chain, leaf first:
/// `SHA256(sha256(leaf DER) ++ md5(pem(c1)) ++ md5(pem(c2)) ++ ...)`
/// over the chain with the leaf removed.
///
/// Two chains that differ only in the order the peer happened to send the
/// intermediates in hash identically, because the input is the validated
/// ordering.
pub fn chain_identity(validated: &[CertificateDer]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    if let Some((leaf, rest)) = validated.split_first() {
        hasher.update(leaf.sha256());
        for cert in rest {
            hasher.update(cert.pem_md5());
        }
    }
    hasher.finalize().into()
}

pub fn chain_identity_hex(validated: &[CertificateDer]) -> String {
    hex::encode(chain_identity(validated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(b: &[u8]) -> CertificateDer {
        CertificateDer::new(b.to_vec())
    }

    #[test]
    fn pem_wraps_at_64_columns() {
        let c = cert(&[0xABu8; 100]);
        let pem = c.to_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
        for line in pem.lines().filter(|l| !l.starts_with("-----")) {
            assert!(line.len() <= 64);
        }
    }

    #[test]
    fn chain_identity_ignores_leaf_pem_but_not_leaf_der() {
        let leaf = cert(b"leaf");
        let mid = cert(b"intermediate");
        let root = cert(b"root");
        let a = chain_identity(&[leaf.clone(), mid.clone(), root.clone()]);
        let b = chain_identity(&[leaf.clone(), root, mid]);
        assert_ne!(a, b, "intermediate order is part of the identity");
        let c = chain_identity(&[cert(b"other-leaf")]);
        assert_ne!(chain_identity(&[leaf]), c);
    }

    #[test]
    fn identity_is_stable() {
        let chain = [cert(b"leaf"), cert(b"ca")];
        assert_eq!(chain_identity(&chain), chain_identity(&chain));
        assert_eq!(chain_identity_hex(&chain).len(), 64);
    }
}
