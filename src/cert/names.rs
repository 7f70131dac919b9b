//! # Names
//!
//! Extraction of the host names a certificate claims, done over the raw
//! DER rather than through a decoded subject. High-level accessors decode
//! strings permissively and hide embedded NUL bytes; judging a
//! certificate's domain match requires seeing the name exactly as it is
//! encoded, so a `CN=www.bank.example\0.attacker.example` forgery is
//! detected instead of silently shortened.
//!
//! The walk collects every `SET { SEQUENCE { OID 2.5.4.3, value } }`
//! common name in the certificate and the dNSName entries of the
//! subjectAltName extension (OID 2.5.29.17, inside the `[3]` extensions
//! block). A single malformed name invalidates the whole extraction.

use regex::RegexBuilder;

/// id-at-commonName, 2.5.4.3
const OID_COMMON_NAME: &[u8] = &[0x06, 0x03, 0x55, 0x04, 0x03];
/// id-ce-subjectAltName, 2.5.29.17
const OID_SUBJECT_ALT_NAME: &[u8] = &[0x06, 0x03, 0x55, 0x1D, 0x11];

/// Outcome of matching a certificate's names against a hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMatch {
    /// At least one name is not encoded the way it claims to be.
    InvalidName,
    /// The certificate carries no CN and no dNSName at all.
    NoNames,
    NoMatch,
    Match,
}

/// All host names the certificate claims, or `None` when any claimed
/// name fails the self-consistency check.
pub fn names_in_cert(der: &[u8]) -> Option<Vec<String>> {
    let mut raw = Vec::new();
    scan(der, &mut raw);
    let mut names = Vec::with_capacity(raw.len());
    for candidate in raw {
        names.push(decode_name(candidate)?);
    }
    Some(names)
}

/// Match the certificate's names against `hostname`.
pub fn check_host(der: &[u8], hostname: &str) -> HostMatch {
    match names_in_cert(der) {
        None => HostMatch::InvalidName,
        Some(names) if names.is_empty() => HostMatch::NoNames,
        Some(names) => {
            if names.iter().any(|n| glob_matches(n, hostname)) {
                HostMatch::Match
            } else {
                HostMatch::NoMatch
            }
        }
    }
}

/// Certificate name globbing: `*` stands for one label fragment
/// (letters, digits, `_`, `-`), every other character is literal, the
/// whole pattern must cover the whole hostname, case-insensitively.
pub fn glob_matches(pattern: &str, hostname: &str) -> bool {
    let mut re = String::with_capacity(pattern.len() * 2 + 8);
    re.push_str("^(?:");
    for ch in pattern.chars() {
        if ch == '*' {
            re.push_str("[A-Za-z0-9_-]*");
        } else {
            let mut buf = [0u8; 4];
            re.push_str(&regex::escape(ch.encode_utf8(&mut buf)));
        }
    }
    re.push_str(")$");
    match RegexBuilder::new(&re).case_insensitive(true).build() {
        Ok(re) => re.is_match(hostname),
        Err(_) => false,
    }
}

/// A name candidate is the raw TLV of the value. It is valid only when
/// its length byte accounts for every byte of the TLV (rules out
/// long-form tricks and embedded structure) and the content is printable.
fn decode_name(raw: &[u8]) -> Option<String> {
    if raw.len() < 2 {
        return None;
    }
    let declared = raw[1] as usize;
    if raw[1] >= 0x80 || raw.len() != declared + 2 {
        return None;
    }
    let content = &raw[2..];
    if content.iter().any(|&b| b < 0x20) {
        return None;
    }
    String::from_utf8(content.to_vec()).ok()
}

fn tlv(buf: &[u8]) -> Option<(u8, usize, usize)> {
    if buf.len() < 2 {
        return None;
    }
    let tag = buf[0];
    let first = buf[1] as usize;
    let (header, content) = if first < 0x80 {
        (2, first)
    } else {
        let n = first & 0x7f;
        if n == 0 || n > 4 || buf.len() < 2 + n {
            return None;
        }
        let mut len = 0usize;
        for &b in &buf[2..2 + n] {
            len = (len << 8) | b as usize;
        }
        (2 + n, len)
    };
    if header + content > buf.len() {
        return None;
    }
    Some((tag, header, content))
}

/// Recursive walk over constructed elements, collecting the raw TLVs of
/// CN values and SAN dNSName entries.
fn scan<'a>(buf: &'a [u8], out: &mut Vec<&'a [u8]>) {
    let mut pos = 0;
    while pos < buf.len() {
        let Some((tag, header, len)) = tlv(&buf[pos..]) else {
            return;
        };
        let content = &buf[pos + header..pos + header + len];
        match tag {
            0x30 => {
                if content.starts_with(OID_SUBJECT_ALT_NAME) {
                    scan_san_extension(&content[OID_SUBJECT_ALT_NAME.len()..], out);
                } else {
                    scan(content, out);
                }
            }
            // a relative distinguished name
            0x31 => scan_rdn_set(content, out),
            // [3] wraps the TBS extensions block
            0xA3 => scan(content, out),
            _ => {}
        }
        pos += header + len;
    }
}

/// `SET { SEQUENCE { OID, value } }`; only the commonName OID yields a
/// candidate.
fn scan_rdn_set<'a>(set_content: &'a [u8], out: &mut Vec<&'a [u8]>) {
    let Some((tag, header, len)) = tlv(set_content) else {
        return;
    };
    if tag != 0x30 {
        return;
    }
    let seq = &set_content[header..header + len];
    if !seq.starts_with(OID_COMMON_NAME) {
        return;
    }
    let value = &seq[OID_COMMON_NAME.len()..];
    if !value.is_empty() {
        out.push(value);
    }
}

/// After the SAN OID: an optional criticality BOOLEAN, then an OCTET
/// STRING holding `GeneralNames ::= SEQUENCE OF GeneralName`; dNSName is
/// context tag 2.
fn scan_san_extension<'a>(mut rest: &'a [u8], out: &mut Vec<&'a [u8]>) {
    if let Some((0x01, header, len)) = tlv(rest) {
        rest = &rest[header + len..];
    }
    let Some((0x04, header, len)) = tlv(rest) else {
        return;
    };
    let octets = &rest[header..header + len];
    let Some((0x30, gheader, glen)) = tlv(octets) else {
        return;
    };
    let mut names = &octets[gheader..gheader + glen];
    while !names.is_empty() {
        let Some((tag, header, len)) = tlv(names) else {
            return;
        };
        if tag == 0x82 {
            out.push(&names[..header + len]);
        }
        names = &names[header + len..];
    }
}
