//! Error types used throughout the crate.
//!
//! Each subsystem owns a small closed error enum; `CrossbearError` is the
//! crate-level umbrella used where several subsystems meet (request
//! processing, reply validation). A `Result<T>` alias keeps signatures
//! short across the stack.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrossbearError>;

/// Wire-level decode failures. Any length inconsistency is fatal for the
/// whole stream, not just the current message.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unexpected end of stream")]
    TruncatedStream,

    #[error("unknown message type: {0}")]
    UnknownType(u8),

    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Semantic rule violations. Always reject the single request or reply,
/// never persist partially.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("reply timestamp is too old")]
    StaleTimestamp,

    #[error("reply timestamp lies in the future")]
    FutureTimestamp,

    #[error("invalid hostname: {0}")]
    BadHostname(String),

    #[error("invalid port: {0}")]
    BadPort(String),

    #[error("trace does not strictly consist of IP addresses: {0}")]
    BadTrace(String),

    #[error("trace does not lead to the scan target")]
    TraceTargetMismatch,

    #[error("public-IP HMAC does not match the trace origin")]
    HmacMismatch,

    #[error("chain hash is not on record for this host")]
    UnknownChainHash,

    #[error("no valid ordering exists for the certificate chain")]
    ChainUnvalidatable,

    #[error("unknown hunting task: {0}")]
    UnknownTask(u32),
}

/// Certificate parsing and path-building failures.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("certificate parse error: {0}")]
    Parse(String),

    #[error("empty certificate chain")]
    EmptyChain,
}

/// Store failures. `Conflict` is the signal for the bounded
/// insert-or-update retry; two conflicts in a row become `RaceExhausted`.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("commit conflict")]
    Conflict,

    #[error("insert-or-update race lost twice")]
    RaceExhausted,

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Failures talking to targets, notaries or the Crossbear server.
/// Recoverable: callers downgrade to a neutral judgment or skip the task.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("server certificate does not match the pinned hash")]
    PinMismatch,

    #[error("timeout")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CrossbearError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
