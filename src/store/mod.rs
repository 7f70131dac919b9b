//! # Store
//!
//! The persistence boundary. Everything the server keeps between
//! requests goes through the [`Store`] trait: observed chains,
//! observations, caches, hunting tasks and the rotating HMAC keys.
//!
//! Concurrent writers race on insert-or-update rows (caches, key slots).
//! [`with_insert_or_update`] bounds that race: one retry after a
//! conflict, then the operation fails with `RaceExhausted` instead of
//! spinning.

pub mod memory;

use std::net::IpAddr;

use crate::cert::CertificateDer;
use crate::error::StoreError;
use crate::hunt::keys::HmacKey;

/// One observation of a certificate at a host:port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub hostname: String,
    pub port: u16,
    /// "CrossbearCVR", "CrossbearServer" or "CrossbearHunter".
    pub observer: String,
    /// Textual observer address; CVR observers are anonymized before this
    /// point.
    pub observer_ip: String,
    /// SHA-256 of the observed leaf.
    pub leaf_sha256: [u8; 32],
    /// Identity of the validated chain, when one could be built.
    pub chain_identity: Option<[u8; 32]>,
    pub observed_at: u64,
}

/// Aggregate history of one certificate at one host:port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationStats {
    pub first_seen: u64,
    pub last_seen: u64,
    pub count: u64,
}

/// A hunting task as the server tracks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTask {
    pub task_id: u32,
    pub hostname: String,
    pub port: u16,
    pub target_ip: IpAddr,
    pub created_at: u64,
    pub active: bool,
}

/// Server-side persistence.
///
/// Implementations provide interior mutability; `&self` methods may be
/// called from several request handlers at once.
pub trait Store: Send + Sync {
    /// Upsert a validated chain, deduplicated by its identity.
    fn store_chain(
        &self,
        identity: [u8; 32],
        validated: &[CertificateDer],
    ) -> Result<(), StoreError>;

    /// Look a stored chain up by its identity.
    fn chain_by_identity(
        &self,
        identity: &[u8; 32],
    ) -> Result<Option<Vec<CertificateDer>>, StoreError>;

    fn record_observation(&self, obs: &Observation) -> Result<(), StoreError>;

    /// History of `leaf_sha256` at `hostname:port`, when any exists.
    fn observation_stats(
        &self,
        hostname: &str,
        port: u16,
        leaf_sha256: &[u8; 32],
    ) -> Result<Option<ObservationStats>, StoreError>;

    /// Distinct chain identities observed at `hostname:port`, newest
    /// first, at most `limit`.
    fn known_chain_identities(
        &self,
        hostname: &str,
        port: u16,
        limit: usize,
    ) -> Result<Vec<[u8; 32]>, StoreError>;

    /// Has `identity` ever been observed at `hostname:port`?
    fn chain_known_for_host(
        &self,
        hostname: &str,
        port: u16,
        identity: &[u8; 32],
    ) -> Result<bool, StoreError>;

    // -- caches ------------------------------------------------------

    fn cert_cache_get(
        &self,
        hostname: &str,
        port: u16,
    ) -> Result<Option<Vec<CertificateDer>>, StoreError>;

    fn cert_cache_put(
        &self,
        hostname: &str,
        port: u16,
        chain: &[CertificateDer],
        valid_for_secs: u64,
    ) -> Result<(), StoreError>;

    fn result_cache_get(&self, key: &[u8; 32]) -> Result<Option<Vec<u8>>, StoreError>;

    fn result_cache_put(
        &self,
        key: &[u8; 32],
        encoded: &[u8],
        valid_for_secs: u64,
    ) -> Result<(), StoreError>;

    // -- hunting tasks ----------------------------------------------

    /// The newest active task for exactly this (hostname, ip, port).
    fn find_active_task(
        &self,
        hostname: &str,
        port: u16,
        target_ip: &IpAddr,
    ) -> Result<Option<StoredTask>, StoreError>;

    /// Insert a new active task and return it with its assigned id.
    fn insert_task(
        &self,
        hostname: &str,
        port: u16,
        target_ip: &IpAddr,
        created_at: u64,
    ) -> Result<StoredTask, StoreError>;

    fn task_by_id(&self, task_id: u32) -> Result<Option<StoredTask>, StoreError>;

    fn deactivate_task(&self, task_id: u32) -> Result<(), StoreError>;

    fn active_tasks(&self) -> Result<Vec<StoredTask>, StoreError>;

    fn task_list_cache_get(&self) -> Result<Option<Vec<u8>>, StoreError>;

    fn task_list_cache_put(&self, encoded: &[u8], valid_for_secs: u64)
        -> Result<(), StoreError>;

    /// Record that `requester` fetched the task list.
    fn log_task_request(&self, requester: &IpAddr, at: u64) -> Result<(), StoreError>;

    /// A validated hunting-task result: who observed what, and the route.
    fn record_hunting_result(
        &self,
        task_id: u32,
        observer_ip: &IpAddr,
        chain_identity: &[u8; 32],
        trace: &str,
        executed_at: u64,
    ) -> Result<(), StoreError>;

    // -- key slots and notary cache ---------------------------------

    /// Key slots, front (current) first.
    fn hmac_keys_get(&self) -> Result<Vec<HmacKey>, StoreError>;

    fn hmac_keys_put(&self, keys: &[HmacKey]) -> Result<(), StoreError>;

    fn notary_cache_get(
        &self,
        hostname: &str,
        port: u16,
    ) -> Result<Option<(String, u64)>, StoreError>;

    fn notary_cache_put(
        &self,
        hostname: &str,
        port: u16,
        answer: &str,
        fetched_at: u64,
    ) -> Result<(), StoreError>;
}

/// Run a read-modify-write against the store, retrying exactly once when
/// the commit loses an insert-or-update race.
pub fn with_insert_or_update<T>(
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    match op() {
        Err(StoreError::Conflict) => match op() {
            Err(StoreError::Conflict) => Err(StoreError::RaceExhausted),
            other => other,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_succeeds_after_one_conflict() {
        let mut attempts = 0;
        let result = with_insert_or_update(|| {
            attempts += 1;
            if attempts == 1 {
                Err(StoreError::Conflict)
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn second_conflict_exhausts_the_race() {
        let mut attempts = 0;
        let result: Result<(), _> = with_insert_or_update(|| {
            attempts += 1;
            Err(StoreError::Conflict)
        });
        assert!(matches!(result, Err(StoreError::RaceExhausted)));
        assert_eq!(attempts, 2);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let mut attempts = 0;
        let result: Result<(), _> = with_insert_or_update(|| {
            attempts += 1;
            Err(StoreError::Backend("down".into()))
        });
        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert_eq!(attempts, 1);
    }
}
