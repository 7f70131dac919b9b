//! # Messaging
//!
//! The Crossbear wire protocol: message model, byte-level format and
//! stream framing.

pub mod codec;
pub mod message;
pub mod wire;

pub use codec::{decode_all, decode_one, encode_list, MessageCodec};
pub use message::{
    CertVerifyRequest, CertVerifyResult, ClockOffset, CurrentServerTime, FpVerifyOutcome,
    FpVerifyRequest, FpVerifyResult, HuntingTask, HuntingTaskReply, Message, MessageType,
    PublicIpNotifRequest, PublicIpNotification, SshKeyType, OPTION_BEHIND_PROXY,
};
