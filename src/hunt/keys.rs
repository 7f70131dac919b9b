//! # Key rotation
//!
//! The server authenticates the public IP it tells a hunter with an HMAC
//! under a rotating secret. Two key slots live in the store: the front
//! slot is the signing key and is replaced every 15 minutes, the back
//! slot holds its predecessor. Replies are accepted under any key less
//! than 30 minutes old, so a reply computed just before a rotation still
//! verifies.

use std::net::IpAddr;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::config;
use crate::store::{with_insert_or_update, Store};
use crate::error::StoreError;
use crate::utils::time;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HmacKey {
    pub key: Vec<u8>,
    pub created_at: u64,
}

impl HmacKey {
    pub fn generate(now: u64) -> Self {
        let mut key = vec![0u8; config::HMAC_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self {
            key,
            created_at: now,
        }
    }

    /// Still usable for signing new notifications.
    pub fn is_current(&self, now: u64) -> bool {
        now < self.created_at + config::HMAC_KEY_VALIDITY_SECS
    }

    /// Still acceptable when validating a reply.
    pub fn is_accepted(&self, now: u64) -> bool {
        now < self.created_at + config::HMAC_KEY_ACCEPT_WINDOW_SECS
    }
}

/// HMAC-SHA256 over the address bytes of an IP.
pub fn hmac_ip(key: &[u8], ip: &IpAddr) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
    match ip {
        IpAddr::V4(v4) => mac.update(&v4.octets()),
        IpAddr::V6(v6) => mac.update(&v6.octets()),
    }
    mac.finalize().into_bytes().into()
}

/// The store-backed key pair. Rotation happens lazily whenever the
/// current key is requested after its validity lapsed.
pub struct RotatingKeys<'a> {
    store: &'a dyn Store,
}

impl<'a> RotatingKeys<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// The signing key, rotating first if the front slot has lapsed.
    pub fn current_key(&self) -> Result<HmacKey, StoreError> {
        let now = time::now_secs();
        with_insert_or_update(|| {
            let mut slots = self.store.hmac_keys_get()?;
            match slots.first() {
                Some(front) if front.is_current(now) => {}
                Some(_) => {
                    // lapsed front becomes the predecessor slot
                    slots.truncate(1);
                    slots.insert(0, HmacKey::generate(now));
                    slots.truncate(2);
                    self.store.hmac_keys_put(&slots)?;
                }
                None => {
                    slots.push(HmacKey::generate(now));
                    self.store.hmac_keys_put(&slots)?;
                }
            }
            // the front exists after the match above
            slots
                .into_iter()
                .next()
                .ok_or_else(|| StoreError::Backend("key slot vanished".into()))
        })
    }

    /// All keys a reply may currently be authenticated under.
    pub fn accepted_keys(&self) -> Result<Vec<HmacKey>, StoreError> {
        let now = time::now_secs();
        self.current_key()?;
        let slots = self.store.hmac_keys_get()?;
        Ok(slots.into_iter().filter(|k| k.is_accepted(now)).collect())
    }
}
