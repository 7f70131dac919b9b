//! # Codec
//!
//! Framing for the message stream. `MessageCodec` implements the
//! [`tokio_util::codec`] `Decoder`/`Encoder` pair so a TLS stream can be
//! driven through `Framed`; `decode_all` handles the HTTP-carried case
//! where a whole message list arrives as one byte blob.
//!
//! A message list is plain concatenation of encoded messages; there is no
//! outer framing beyond each message's own header.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config;
use crate::error::DecodeError;

use super::message::{Message, MessageType};
use super::wire;

pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = DecodeError;

    /// Decodes one message from the byte stream.
    ///
    /// Returns `None` while the buffer holds less than a full frame.
    ///
    /// # Errors
    /// A declared length smaller than the header, an unknown type byte or
    /// a malformed payload poison the stream; callers must drop the
    /// connection.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, DecodeError> {
        if src.len() < config::WIRE_HEADER_LEN {
            return Ok(None);
        }

        let declared = u16::from_be_bytes([src[1], src[2]]) as usize;
        if declared < config::WIRE_HEADER_LEN {
            return Err(DecodeError::Malformed(format!(
                "declared length {declared} smaller than the header"
            )));
        }

        if src.len() < declared {
            return Ok(None); // Wait for full frame
        }

        let frame = src.split_to(declared).freeze();
        let ty = MessageType::from_wire(frame[0])?;
        wire::decode_payload(ty, &frame[config::WIRE_HEADER_LEN..]).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = DecodeError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), DecodeError> {
        let bytes = wire::encode_message(&msg)?;
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}

/// Decode one message from the front of `buf`.
///
/// `Ok(None)` on an empty buffer; [`DecodeError::TruncatedStream`] when
/// bytes remain but not a whole frame. On success returns the message and
/// the number of bytes consumed.
pub fn decode_one(buf: &[u8]) -> Result<Option<(Message, usize)>, DecodeError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.len() < config::WIRE_HEADER_LEN {
        return Err(DecodeError::TruncatedStream);
    }
    let declared = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    if declared < config::WIRE_HEADER_LEN {
        return Err(DecodeError::Malformed(format!(
            "declared length {declared} smaller than the header"
        )));
    }
    if buf.len() < declared {
        return Err(DecodeError::TruncatedStream);
    }
    let ty = MessageType::from_wire(buf[0])?;
    let msg = wire::decode_payload(ty, &buf[config::WIRE_HEADER_LEN..declared])?;
    Ok(Some((msg, declared)))
}

/// Decode a complete message list. Any trailing or malformed bytes fail
/// the whole list.
pub fn decode_all(mut buf: &[u8]) -> Result<Vec<Message>, DecodeError> {
    let mut out = Vec::new();
    while let Some((msg, consumed)) = decode_one(buf)? {
        out.push(msg);
        buf = &buf[consumed..];
    }
    Ok(out)
}

/// Encode a message list: the concatenation of each message's encoding.
pub fn encode_list(msgs: &[Message]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    for msg in msgs {
        out.extend_from_slice(&wire::encode_message(msg)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::super::message::*;
    use super::*;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::CurrentServerTime(CurrentServerTime { unix_secs: 1_700_000_000 }),
            Message::PublicIpNotification(PublicIpNotification {
                hmac: [3u8; 32],
                public_ip: "203.0.113.9".parse().unwrap(),
            }),
            Message::HuntingTask(
                HuntingTask::new(
                    99,
                    vec![[1u8; 32]],
                    "203.0.113.80".parse().unwrap(),
                    443,
                    "www.example.com".into(),
                )
                .unwrap(),
            ),
        ]
    }

    #[test]
    fn list_round_trip() {
        let msgs = sample_messages();
        let bytes = encode_list(&msgs).unwrap();
        assert_eq!(decode_all(&bytes).unwrap(), msgs);
    }

    #[test]
    fn empty_buffer_is_a_clean_end() {
        assert!(decode_all(&[]).unwrap().is_empty());
        assert!(decode_one(&[]).unwrap().is_none());
    }

    #[test]
    fn truncated_tail_fails_the_list() {
        let bytes = encode_list(&sample_messages()).unwrap();
        let err = decode_all(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, DecodeError::TruncatedStream));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let bytes = vec![0xEE, 0x00, 0x03];
        assert!(matches!(
            decode_one(&bytes).unwrap_err(),
            DecodeError::UnknownType(0xEE)
        ));
    }

    #[test]
    fn zero_declared_length_poisons_the_stream() {
        let bytes = vec![5u8, 0x00, 0x00, 1, 2, 3, 4];
        assert!(matches!(
            decode_one(&bytes).unwrap_err(),
            DecodeError::Malformed(_)
        ));
    }

    #[test]
    fn streaming_decoder_waits_for_full_frames() {
        let msgs = sample_messages();
        let bytes = encode_list(&msgs).unwrap();

        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for chunk in bytes.chunks(5) {
            buf.extend_from_slice(chunk);
            while let Some(msg) = codec.decode(&mut buf).unwrap() {
                decoded.push(msg);
            }
        }
        assert_eq!(decoded, msgs);
        assert!(buf.is_empty());
    }

    #[test]
    fn encoder_matches_wire_encoding() {
        let msg = Message::CurrentServerTime(CurrentServerTime { unix_secs: 7 });
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(&buf[..], &wire::encode_message(&msg).unwrap()[..]);
    }
}
