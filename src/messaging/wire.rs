//! # Wire format
//!
//! Byte-level encoding and decoding of every message type. Each message
//! travels as `[type: u8][length: u16 BE][payload]` where the length
//! covers the three header bytes. This module turns payloads into
//! [`Message`] values and back; framing lives in [`super::codec`].
//!
//! Certificates inside a payload are raw DER, each delimited by its own
//! outer SEQUENCE header. Trailing strings consume the remainder of the
//! payload.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::cert::CertificateDer;
use crate::config;
use crate::error::DecodeError;

use super::message::{
    CertVerifyRequest, CertVerifyResult, CurrentServerTime, FpVerifyOutcome, FpVerifyRequest,
    FpVerifyResult, HuntingTask, HuntingTaskReply, Message, MessageType, PublicIpNotifRequest,
    PublicIpNotification, SshKeyType,
};

/// Encode a message including its three-byte header.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, DecodeError> {
    check_counts(msg)?;
    let payload = encode_payload(msg);
    let total = config::WIRE_HEADER_LEN + payload.len();
    if total > config::MAX_MESSAGE_LEN {
        return Err(DecodeError::MessageTooLarge(total));
    }
    let mut out = Vec::with_capacity(total);
    out.push(msg.message_type() as u8);
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Hash lists and certificate chains travel behind a one-byte count; a
/// longer list would wrap the count byte and encode undecodably.
fn check_counts(msg: &Message) -> Result<(), DecodeError> {
    let (what, n) = match msg {
        Message::HuntingTask(t) => ("known chain hashes", t.known_chain_hashes.len()),
        Message::HuntingTaskReply(HuntingTaskReply::NewCertChain { chain, .. }) => {
            ("certificates", chain.len())
        }
        Message::CertVerifyRequest(r) => ("certificates", r.chain.len()),
        _ => return Ok(()),
    };
    if n > config::MAX_CHAIN_CERTS {
        return Err(DecodeError::Malformed(format!(
            "{n} {what} exceed the count byte"
        )));
    }
    Ok(())
}

/// Encode only the payload of a message.
pub fn encode_payload(msg: &Message) -> Vec<u8> {
    let mut out = Vec::new();
    match msg {
        Message::PublicIpNotification(n) => {
            out.extend_from_slice(&n.hmac);
            put_ip(&mut out, &n.public_ip);
        }
        Message::PublicIpNotifRequest(r) => {
            out.extend_from_slice(&r.encrypted_key);
        }
        Message::CurrentServerTime(t) => {
            out.extend_from_slice(&t.unix_secs.to_be_bytes());
        }
        Message::HuntingTask(t) => {
            out.extend_from_slice(&t.task_id.to_be_bytes());
            out.push(t.known_chain_hashes.len() as u8);
            for hash in &t.known_chain_hashes {
                out.extend_from_slice(hash);
            }
            put_ip(&mut out, &t.target_ip);
            out.extend_from_slice(&t.port.to_be_bytes());
            out.extend_from_slice(t.hostname.as_bytes());
        }
        Message::HuntingTaskReply(HuntingTaskReply::NewCertChain {
            task_id,
            executed_at,
            pub_ip_hmac,
            chain,
            trace,
        }) => {
            out.extend_from_slice(&task_id.to_be_bytes());
            out.extend_from_slice(&executed_at.to_be_bytes());
            out.extend_from_slice(pub_ip_hmac);
            out.push(chain.len() as u8);
            for cert in chain {
                out.extend_from_slice(cert.der());
            }
            out.extend_from_slice(trace.as_bytes());
        }
        Message::HuntingTaskReply(HuntingTaskReply::KnownCertChain {
            task_id,
            executed_at,
            pub_ip_hmac,
            chain_hash,
            trace,
        }) => {
            out.extend_from_slice(&task_id.to_be_bytes());
            out.extend_from_slice(&executed_at.to_be_bytes());
            out.extend_from_slice(pub_ip_hmac);
            out.extend_from_slice(chain_hash);
            out.extend_from_slice(trace.as_bytes());
        }
        Message::FpVerifyRequest(r) => {
            out.push(r.format_version);
            out.extend_from_slice(&r.host_ip.octets());
            out.extend_from_slice(&r.port.to_be_bytes());
            out.push(r.key_type as u8);
            out.extend_from_slice(&r.ecdsa_nid.to_be_bytes());
            out.extend_from_slice(&r.fingerprint);
        }
        Message::FpVerifyResult(r) => {
            out.push(r.format_version);
            out.push(r.outcome as u8);
        }
        Message::CertVerifyRequest(r) => {
            out.push(r.options);
            out.push(r.chain.len() as u8);
            for cert in &r.chain {
                out.extend_from_slice(cert.der());
            }
            out.extend_from_slice(
                format!("{}|{}|{}", r.hostname, r.host_ip, r.port).as_bytes(),
            );
        }
        Message::CertVerifyResult(r) => {
            out.push(r.rating);
            out.extend_from_slice(r.report.as_bytes());
        }
    }
    out
}

/// Decode a payload whose type byte has already been consumed.
pub fn decode_payload(ty: MessageType, payload: &[u8]) -> Result<Message, DecodeError> {
    let mut rd = Reader::new(payload);
    let msg = match ty {
        MessageType::PublicIpNotifV4 => {
            let hmac = rd.array::<32>()?;
            let ip = IpAddr::V4(Ipv4Addr::from(rd.array::<4>()?));
            rd.finish()?;
            Message::PublicIpNotification(PublicIpNotification { hmac, public_ip: ip })
        }
        MessageType::PublicIpNotifV6 => {
            let hmac = rd.array::<32>()?;
            let ip = IpAddr::V6(Ipv6Addr::from(rd.array::<16>()?));
            rd.finish()?;
            Message::PublicIpNotification(PublicIpNotification { hmac, public_ip: ip })
        }
        MessageType::PublicIpNotifRequest => {
            let key = rd.rest().to_vec();
            Message::PublicIpNotifRequest(PublicIpNotifRequest::new(key)?)
        }
        MessageType::CurrentServerTime => {
            let unix_secs = rd.u32_be()?;
            rd.finish()?;
            Message::CurrentServerTime(CurrentServerTime { unix_secs })
        }
        MessageType::HuntingTaskV4 => decode_hunting_task(&mut rd, false)?,
        MessageType::HuntingTaskV6 => decode_hunting_task(&mut rd, true)?,
        MessageType::TaskReplyNewCertChain => {
            let task_id = rd.u32_be()?;
            let executed_at = rd.u32_be()?;
            let pub_ip_hmac = rd.array::<32>()?;
            let count = rd.u8()? as usize;
            if count == 0 {
                return Err(DecodeError::Malformed(
                    "task reply with empty certificate chain".into(),
                ));
            }
            let mut chain = Vec::with_capacity(count);
            for _ in 0..count {
                chain.push(rd.der_certificate()?);
            }
            let trace = rd.rest_utf8()?;
            Message::HuntingTaskReply(HuntingTaskReply::NewCertChain {
                task_id,
                executed_at,
                pub_ip_hmac,
                chain,
                trace,
            })
        }
        MessageType::TaskReplyKnownCertChain => {
            let task_id = rd.u32_be()?;
            let executed_at = rd.u32_be()?;
            let pub_ip_hmac = rd.array::<32>()?;
            let chain_hash = rd.array::<32>()?;
            let trace = rd.rest_utf8()?;
            Message::HuntingTaskReply(HuntingTaskReply::KnownCertChain {
                task_id,
                executed_at,
                pub_ip_hmac,
                chain_hash,
                trace,
            })
        }
        MessageType::FpVerifyRequest => {
            let format_version = rd.u8()?;
            let host_ip = Ipv4Addr::from(rd.array::<4>()?);
            let port = rd.u16_be()?;
            let key_type = SshKeyType::from_wire(rd.u8()?)?;
            let ecdsa_nid = rd.u16_be()?;
            let fingerprint = rd.rest().to_vec();
            Message::FpVerifyRequest(FpVerifyRequest {
                format_version,
                host_ip,
                port,
                key_type,
                ecdsa_nid,
                fingerprint,
            })
        }
        MessageType::FpVerifyResult => {
            let format_version = rd.u8()?;
            let outcome = FpVerifyOutcome::from_wire(rd.u8()?)?;
            rd.finish()?;
            Message::FpVerifyResult(FpVerifyResult {
                format_version,
                outcome,
            })
        }
        MessageType::CertVerifyRequest => {
            let options = rd.u8()?;
            let count = rd.u8()? as usize;
            if count == 0 {
                return Err(DecodeError::Malformed(
                    "verification request with empty certificate chain".into(),
                ));
            }
            let mut chain = Vec::with_capacity(count);
            for _ in 0..count {
                chain.push(rd.der_certificate()?);
            }
            let target = rd.rest_utf8()?;
            let (hostname, host_ip, port) = parse_target(&target)?;
            Message::CertVerifyRequest(
                CertVerifyRequest::new(options, chain, hostname, host_ip, port)
                    .map_err(|e| DecodeError::Malformed(e.to_string()))?,
            )
        }
        MessageType::CertVerifyResult => {
            let rating = rd.u8()?;
            let report = rd.rest_utf8()?;
            Message::CertVerifyResult(CertVerifyResult { rating, report })
        }
    };
    Ok(msg)
}

fn decode_hunting_task(rd: &mut Reader<'_>, v6: bool) -> Result<Message, DecodeError> {
    let task_id = rd.u32_be()?;
    let count = rd.u8()? as usize;
    let mut known_chain_hashes = Vec::with_capacity(count);
    for _ in 0..count {
        known_chain_hashes.push(rd.array::<32>()?);
    }
    let target_ip = if v6 {
        IpAddr::V6(Ipv6Addr::from(rd.array::<16>()?))
    } else {
        IpAddr::V4(Ipv4Addr::from(rd.array::<4>()?))
    };
    let port = rd.u16_be()?;
    let hostname = rd.rest_utf8()?;
    Ok(Message::HuntingTask(
        HuntingTask::new(task_id, known_chain_hashes, target_ip, port, hostname)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?,
    ))
}

/// The trailing `host|ip|port` target descriptor of a CertVerifyRequest.
fn parse_target(s: &str) -> Result<(String, IpAddr, u16), DecodeError> {
    let mut parts = s.splitn(3, '|');
    let host = parts.next().unwrap_or_default();
    let ip = parts
        .next()
        .ok_or_else(|| DecodeError::Malformed(format!("target lacks an IP: {s}")))?;
    let port = parts
        .next()
        .ok_or_else(|| DecodeError::Malformed(format!("target lacks a port: {s}")))?;
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| DecodeError::Malformed(format!("bad target IP: {ip}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| DecodeError::Malformed(format!("bad target port: {port}")))?;
    Ok((host.to_string(), ip, port))
}

fn put_ip(out: &mut Vec<u8>, ip: &IpAddr) {
    match ip {
        IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
    }
}

/// Cursor over a payload. Any shortage inside a payload is a malformed
/// message, not a truncated stream; stream-level truncation is detected
/// by the framer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(DecodeError::Malformed(format!(
                "payload too short: wanted {n} more bytes, {} left",
                self.buf.len() - self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16_be(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32_be(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    fn rest_utf8(&mut self) -> Result<String, DecodeError> {
        String::from_utf8(self.rest().to_vec())
            .map_err(|_| DecodeError::Malformed("trailing string is not UTF-8".into()))
    }

    /// A certificate is delimited by its own DER header: read the outer
    /// SEQUENCE tag and length, then slice exactly that many bytes.
    fn der_certificate(&mut self) -> Result<CertificateDer, DecodeError> {
        let remaining = &self.buf[self.pos..];
        let total = der_tlv_len(remaining)?;
        Ok(CertificateDer::new(self.take(total)?.to_vec()))
    }

    /// Errors when bytes remain after a fixed-size payload.
    fn finish(&self) -> Result<(), DecodeError> {
        if self.pos != self.buf.len() {
            return Err(DecodeError::Malformed(format!(
                "{} unconsumed payload bytes",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

/// Total length (header + content) of the DER TLV starting at `buf[0]`.
/// Certificates start with a constructed SEQUENCE (0x30).
fn der_tlv_len(buf: &[u8]) -> Result<usize, DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::Malformed("truncated DER header".into()));
    }
    if buf[0] != 0x30 {
        return Err(DecodeError::Malformed(format!(
            "certificate does not start with a SEQUENCE: 0x{:02x}",
            buf[0]
        )));
    }
    let first = buf[1] as usize;
    let (header, content) = if first < 0x80 {
        (2, first)
    } else {
        let num_len_bytes = first & 0x7f;
        if num_len_bytes == 0 || num_len_bytes > 4 {
            return Err(DecodeError::Malformed(format!(
                "unsupported DER length-of-length {num_len_bytes}"
            )));
        }
        if buf.len() < 2 + num_len_bytes {
            return Err(DecodeError::Malformed("truncated DER length".into()));
        }
        let mut len = 0usize;
        for &b in &buf[2..2 + num_len_bytes] {
            len = (len << 8) | b as usize;
        }
        (2 + num_len_bytes, len)
    };
    let total = header + content;
    if total > buf.len() {
        return Err(DecodeError::Malformed(format!(
            "certificate length {total} exceeds payload ({} bytes left)",
            buf.len()
        )));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::super::message::*;
    use super::*;

    /// Minimal DER SEQUENCE wrapping `content`.
    fn fake_der(content: &[u8]) -> Vec<u8> {
        let mut out = vec![0x30];
        if content.len() < 0x80 {
            out.push(content.len() as u8);
        } else {
            out.push(0x82);
            out.extend_from_slice(&(content.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(content);
        out
    }

    fn round_trip(msg: Message) -> Message {
        let bytes = encode_message(&msg).unwrap();
        let ty = MessageType::from_wire(bytes[0]).unwrap();
        let declared = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
        assert_eq!(declared, bytes.len());
        decode_payload(ty, &bytes[3..]).unwrap()
    }

    #[test]
    fn public_ip_notification_v4_and_v6() {
        let v4 = Message::PublicIpNotification(PublicIpNotification {
            hmac: [7u8; 32],
            public_ip: "203.0.113.9".parse().unwrap(),
        });
        assert_eq!(round_trip(v4.clone()), v4);
        assert_eq!(encode_message(&v4).unwrap()[0], 0);

        let v6 = Message::PublicIpNotification(PublicIpNotification {
            hmac: [0u8; 32],
            public_ip: "2001:db8::9".parse().unwrap(),
        });
        assert_eq!(round_trip(v6.clone()), v6);
        assert_eq!(encode_message(&v6).unwrap()[0], 1);
    }

    #[test]
    fn current_server_time_is_u32_seconds() {
        let msg = Message::CurrentServerTime(CurrentServerTime { unix_secs: 1_700_000_000 });
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(bytes.len(), 7);
        assert_eq!(bytes[0], 5);
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn hunting_task_with_known_hashes() {
        let msg = Message::HuntingTask(
            HuntingTask::new(
                42,
                vec![[0u8; 32], [255u8; 32]],
                "203.0.113.80".parse().unwrap(),
                443,
                "www.example.com".into(),
            )
            .unwrap(),
        );
        assert_eq!(encode_message(&msg).unwrap()[0], 10);
        assert_eq!(round_trip(msg.clone()), msg);

        let v6 = Message::HuntingTask(
            HuntingTask::new(
                43,
                vec![],
                "2001:db8::80".parse().unwrap(),
                8443,
                "v6.example.com".into(),
            )
            .unwrap(),
        );
        assert_eq!(encode_message(&v6).unwrap()[0], 11);
        assert_eq!(round_trip(v6.clone()), v6);
    }

    #[test]
    fn known_hash_list_fills_the_count_byte() {
        let msg = Message::HuntingTask(
            HuntingTask::new(
                9,
                vec![[0xAA; 32]; 255],
                "203.0.113.80".parse().unwrap(),
                443,
                "www.example.com".into(),
            )
            .unwrap(),
        );
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn lists_past_the_count_byte_never_encode() {
        let task = Message::HuntingTask(
            HuntingTask::new(
                9,
                vec![[0xAA; 32]; 256],
                "203.0.113.80".parse().unwrap(),
                443,
                "www.example.com".into(),
            )
            .unwrap(),
        );
        assert!(matches!(
            encode_message(&task),
            Err(DecodeError::Malformed(_))
        ));

        let reply = Message::HuntingTaskReply(HuntingTaskReply::NewCertChain {
            task_id: 9,
            executed_at: 1_600_000_000,
            pub_ip_hmac: [0u8; 32],
            chain: vec![crate::cert::CertificateDer::new(fake_der(b"c")); 256],
            trace: "203.0.113.9\n203.0.113.80".into(),
        });
        assert!(matches!(
            encode_message(&reply),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn task_replies_round_trip() {
        let new_chain = Message::HuntingTaskReply(HuntingTaskReply::NewCertChain {
            task_id: 7,
            executed_at: 1_600_000_000,
            pub_ip_hmac: [9u8; 32],
            chain: vec![
                crate::cert::CertificateDer::new(fake_der(b"leaf-cert")),
                crate::cert::CertificateDer::new(fake_der(&[0x55u8; 200])),
            ],
            trace: "203.0.113.9\n198.51.100.1|198.51.100.2\n203.0.113.80".into(),
        });
        assert_eq!(encode_message(&new_chain).unwrap()[0], 20);
        assert_eq!(round_trip(new_chain.clone()), new_chain);

        let known = Message::HuntingTaskReply(HuntingTaskReply::KnownCertChain {
            task_id: 7,
            executed_at: 1_600_000_000,
            pub_ip_hmac: [9u8; 32],
            chain_hash: [0xAB; 32],
            trace: "203.0.113.9\n203.0.113.80".into(),
        });
        assert_eq!(encode_message(&known).unwrap()[0], 21);
        assert_eq!(round_trip(known.clone()), known);
    }

    #[test]
    fn cert_verify_round_trip() {
        let req = Message::CertVerifyRequest(
            CertVerifyRequest::new(
                OPTION_BEHIND_PROXY,
                vec![crate::cert::CertificateDer::new(fake_der(b"leaf"))],
                "www.example.com".into(),
                "203.0.113.80".parse().unwrap(),
                443,
            )
            .unwrap(),
        );
        assert_eq!(encode_message(&req).unwrap()[0], 100);
        assert_eq!(round_trip(req.clone()), req);

        let res = Message::CertVerifyResult(CertVerifyResult {
            rating: 211,
            report: "the server's certificate is well known\nvalidity: ok".into(),
        });
        assert_eq!(encode_message(&res).unwrap()[0], 110);
        assert_eq!(round_trip(res.clone()), res);
    }

    #[test]
    fn fp_verify_round_trip() {
        let req = Message::FpVerifyRequest(FpVerifyRequest {
            format_version: 1,
            host_ip: "192.0.2.22".parse().unwrap(),
            port: 22,
            key_type: SshKeyType::Ecdsa,
            ecdsa_nid: 415,
            fingerprint: vec![1, 2, 3, 4],
        });
        assert_eq!(encode_message(&req).unwrap()[0], 50);
        assert_eq!(round_trip(req.clone()), req);

        let res = Message::FpVerifyResult(FpVerifyResult {
            format_version: 1,
            outcome: FpVerifyOutcome::NoEntry,
        });
        assert_eq!(encode_message(&res).unwrap()[0], 60);
        assert_eq!(round_trip(res.clone()), res);
    }

    #[test]
    fn empty_chain_is_rejected() {
        // options, count=0, target
        let mut payload = vec![0u8, 0u8];
        payload.extend_from_slice(b"www.example.com|203.0.113.80|443");
        assert!(decode_payload(MessageType::CertVerifyRequest, &payload).is_err());
    }

    #[test]
    fn cert_length_beyond_payload_is_malformed() {
        let mut payload = vec![0u8, 1u8]; // options, one cert
        payload.extend_from_slice(&[0x30, 0x7f]); // claims 127 content bytes
        payload.extend_from_slice(&[0u8; 10]);
        let err = decode_payload(MessageType::CertVerifyRequest, &payload).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn short_fixed_payload_is_malformed() {
        assert!(decode_payload(MessageType::CurrentServerTime, &[0, 0]).is_err());
        assert!(decode_payload(MessageType::PublicIpNotifV4, &[0u8; 35]).is_err());
    }

    #[test]
    fn trailing_garbage_on_fixed_payload_is_malformed() {
        assert!(decode_payload(MessageType::CurrentServerTime, &[0, 0, 0, 0, 9]).is_err());
    }

    #[test]
    fn long_form_der_length_is_honoured() {
        let content = vec![0x41u8; 300];
        let der = fake_der(&content);
        assert_eq!(der_tlv_len(&der).unwrap(), der.len());
    }

    #[test]
    fn pip_request_key_must_be_exactly_256_bytes() {
        assert!(decode_payload(MessageType::PublicIpNotifRequest, &[0u8; 256]).is_ok());
        assert!(decode_payload(MessageType::PublicIpNotifRequest, &[0u8; 255]).is_err());
        assert!(decode_payload(MessageType::PublicIpNotifRequest, &[0u8; 257]).is_err());
    }
}
