//! Protocol constants and policy weights.

/// Size of the message header: type (1 byte) + length (2 bytes).
pub const WIRE_HEADER_LEN: usize = 3;

/// Max encoded message size; the length field is two bytes.
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

/// Max certificates per chain on the wire (one count byte).
pub const MAX_CHAIN_CERTS: usize = 255;

/// How many already-known chain hashes a hunting task carries.
pub const MAX_KNOWN_CHAIN_HASHES: usize = 3;

/// Permutation budget for chain reordering.
pub const MAX_CHAIN_PERMUTATIONS: u32 = 50;

/// Hostname length bounds (exclusive), tolerating underscores.
pub const HOSTNAME_MIN_LEN: usize = 3;
pub const HOSTNAME_MAX_LEN: usize = 2042;

/// A hunting-task reply is rejected when its execution timestamp is more
/// than 30 minutes in the past or more than 10 seconds in the future.
pub const REPLY_MAX_AGE_SECS: u64 = 30 * 60;
pub const REPLY_MAX_FUTURE_SECS: u64 = 10;

/// Rotating public-IP HMAC keys: 64 random bytes, 15 minutes of issuance
/// validity, accepted for 30 minutes so the previous key still verifies.
pub const HMAC_KEY_LEN: usize = 64;
pub const HMAC_KEY_VALIDITY_SECS: u64 = 15 * 60;
pub const HMAC_KEY_ACCEPT_WINDOW_SECS: u64 = 30 * 60;

/// How long a fetched public-IP notification stays fresh on the hunter.
pub const PUBLIC_IP_FRESHNESS_SECS: u64 = 60;

/// Hunters batch this many replies per submission.
pub const REPLY_BATCH_SIZE: usize = 5;

/// Default cache validities (seconds).
pub const CERT_CACHE_VALIDITY_SECS: u64 = 5 * 60;
pub const RESULT_CACHE_VALIDITY_SECS: u64 = 5 * 60;
pub const TASK_LIST_CACHE_VALIDITY_SECS: u64 = 30;

/// How long a cached notary observation is used before re-contacting the
/// notary.
pub const NOTARY_REFRESH_SECS: u64 = 6 * 60 * 60;

/// The RSA-encrypted AES key carried by a PublicIpNotifRequest.
pub const PIP_REQUEST_KEY_LEN: usize = 2048 / 8;

/// Judgment weights. Policy constants copied from the original deployment,
/// not load-bearing security invariants.
pub mod weights {
    pub const EQUALITY_NO_CERT: i32 = -100;
    pub const EQUALITY_SAME: i32 = 80;
    pub const EQUALITY_DIFFERENT: i32 = 0;

    pub const DOMAIN_INVALID_CN: i32 = -200;
    pub const DOMAIN_CN_NOT_FOUND: i32 = 0;
    pub const DOMAIN_NO_MATCH: i32 = -70;
    pub const DOMAIN_MATCH: i32 = 50;

    pub const VALIDITY_NOW: i32 = 20;
    pub const VALIDITY_NOT_NOW: i32 = -20;

    pub const ALGORITHM_DEPRECATED: i32 = -60;

    pub const NOTARY_UNKNOWN: i32 = -20;

    /// Observation periods are scored in 3-day buckets; an open-ended
    /// ("still observing") period earns double per bucket.
    pub const OBSERVATION_BUCKET_DAYS: u64 = 3;
    pub const OBSERVATION_COUNT_DIVISOR: u64 = 30;

    /// The server-side observation period counts as open-ended when the
    /// last observation is within 5 minutes of now; the notary period when
    /// within a day.
    pub const STILL_OBSERVED_SLACK_SECS: u64 = 300;
    pub const NOTARY_RECENT_SLACK_SECS: u64 = 24 * 60 * 60;

    pub const KEYLEN_BASELINE: i64 = 2048;
    pub const KEYLEN_BONUS_DIVISOR: i64 = 100;
    pub const KEYLEN_PENALTY_DIVISOR: i64 = 30000;
}
