//! # In-memory store
//!
//! Reference [`Store`] implementation backed by a single mutex. Used by
//! the tests and by single-process deployments; a relational backend
//! implements the same trait for production.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use crate::cert::CertificateDer;
use crate::error::StoreError;
use crate::hunt::keys::HmacKey;
use crate::utils::time;

use super::{Observation, ObservationStats, Store, StoredTask};

#[derive(Default)]
struct Inner {
    chains: HashMap<[u8; 32], Vec<CertificateDer>>,
    observations: Vec<Observation>,
    cert_cache: HashMap<(String, u16), (Vec<CertificateDer>, u64)>,
    result_cache: HashMap<[u8; 32], (Vec<u8>, u64)>,
    tasks: Vec<StoredTask>,
    next_task_id: u32,
    task_list_cache: Option<(Vec<u8>, u64)>,
    task_requests: Vec<(IpAddr, u64)>,
    hunting_results: Vec<(u32, IpAddr, [u8; 32], String, u64)>,
    hmac_keys: Vec<HmacKey>,
    notary_cache: HashMap<(String, u16), (String, u64)>,
}

pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_task_id: 1,
                ..Inner::default()
            }),
        }
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".into()))
    }

    /// Number of validated hunting results, for assertions in tests.
    pub fn hunting_result_count(&self) -> usize {
        self.inner.lock().map(|i| i.hunting_results.len()).unwrap_or(0)
    }

    /// Task-list fetches recorded so far.
    pub fn task_request_count(&self) -> usize {
        self.inner.lock().map(|i| i.task_requests.len()).unwrap_or(0)
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemStore {
    fn store_chain(
        &self,
        identity: [u8; 32],
        validated: &[CertificateDer],
    ) -> Result<(), StoreError> {
        self.locked()?
            .chains
            .entry(identity)
            .or_insert_with(|| validated.to_vec());
        Ok(())
    }

    fn chain_by_identity(
        &self,
        identity: &[u8; 32],
    ) -> Result<Option<Vec<CertificateDer>>, StoreError> {
        Ok(self.locked()?.chains.get(identity).cloned())
    }

    fn record_observation(&self, obs: &Observation) -> Result<(), StoreError> {
        self.locked()?.observations.push(obs.clone());
        Ok(())
    }

    fn observation_stats(
        &self,
        hostname: &str,
        port: u16,
        leaf_sha256: &[u8; 32],
    ) -> Result<Option<ObservationStats>, StoreError> {
        let inner = self.locked()?;
        let mut stats: Option<ObservationStats> = None;
        for obs in inner
            .observations
            .iter()
            .filter(|o| o.hostname == hostname && o.port == port && &o.leaf_sha256 == leaf_sha256)
        {
            let s = stats.get_or_insert(ObservationStats {
                first_seen: obs.observed_at,
                last_seen: obs.observed_at,
                count: 0,
            });
            s.first_seen = s.first_seen.min(obs.observed_at);
            s.last_seen = s.last_seen.max(obs.observed_at);
            s.count += 1;
        }
        Ok(stats)
    }

    fn known_chain_identities(
        &self,
        hostname: &str,
        port: u16,
        limit: usize,
    ) -> Result<Vec<[u8; 32]>, StoreError> {
        let inner = self.locked()?;
        let mut by_time: Vec<(&Observation, [u8; 32])> = inner
            .observations
            .iter()
            .filter(|o| o.hostname == hostname && o.port == port)
            .filter_map(|o| o.chain_identity.map(|id| (o, id)))
            .collect();
        by_time.sort_by(|a, b| b.0.observed_at.cmp(&a.0.observed_at));
        let mut out = Vec::new();
        for (_, id) in by_time {
            if !out.contains(&id) {
                out.push(id);
                if out.len() == limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn chain_known_for_host(
        &self,
        hostname: &str,
        port: u16,
        identity: &[u8; 32],
    ) -> Result<bool, StoreError> {
        Ok(self.locked()?.observations.iter().any(|o| {
            o.hostname == hostname && o.port == port && o.chain_identity.as_ref() == Some(identity)
        }))
    }

    fn cert_cache_get(
        &self,
        hostname: &str,
        port: u16,
    ) -> Result<Option<Vec<CertificateDer>>, StoreError> {
        let inner = self.locked()?;
        Ok(inner
            .cert_cache
            .get(&(hostname.to_string(), port))
            .filter(|(_, valid_until)| time::now_secs() < *valid_until)
            .map(|(chain, _)| chain.clone()))
    }

    fn cert_cache_put(
        &self,
        hostname: &str,
        port: u16,
        chain: &[CertificateDer],
        valid_for_secs: u64,
    ) -> Result<(), StoreError> {
        self.locked()?.cert_cache.insert(
            (hostname.to_string(), port),
            (chain.to_vec(), time::now_secs() + valid_for_secs),
        );
        Ok(())
    }

    fn result_cache_get(&self, key: &[u8; 32]) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.locked()?;
        Ok(inner
            .result_cache
            .get(key)
            .filter(|(_, valid_until)| time::now_secs() < *valid_until)
            .map(|(bytes, _)| bytes.clone()))
    }

    fn result_cache_put(
        &self,
        key: &[u8; 32],
        encoded: &[u8],
        valid_for_secs: u64,
    ) -> Result<(), StoreError> {
        self.locked()?.result_cache.insert(
            *key,
            (encoded.to_vec(), time::now_secs() + valid_for_secs),
        );
        Ok(())
    }

    fn find_active_task(
        &self,
        hostname: &str,
        port: u16,
        target_ip: &IpAddr,
    ) -> Result<Option<StoredTask>, StoreError> {
        let inner = self.locked()?;
        Ok(inner
            .tasks
            .iter()
            .filter(|t| {
                t.active && t.hostname == hostname && t.port == port && &t.target_ip == target_ip
            })
            .max_by_key(|t| t.created_at)
            .cloned())
    }

    fn insert_task(
        &self,
        hostname: &str,
        port: u16,
        target_ip: &IpAddr,
        created_at: u64,
    ) -> Result<StoredTask, StoreError> {
        let mut inner = self.locked()?;
        let task = StoredTask {
            task_id: inner.next_task_id,
            hostname: hostname.to_string(),
            port,
            target_ip: *target_ip,
            created_at,
            active: true,
        };
        inner.next_task_id += 1;
        inner.tasks.push(task.clone());
        Ok(task)
    }

    fn task_by_id(&self, task_id: u32) -> Result<Option<StoredTask>, StoreError> {
        Ok(self
            .locked()?
            .tasks
            .iter()
            .find(|t| t.task_id == task_id)
            .cloned())
    }

    fn deactivate_task(&self, task_id: u32) -> Result<(), StoreError> {
        let mut inner = self.locked()?;
        for task in inner.tasks.iter_mut().filter(|t| t.task_id == task_id) {
            task.active = false;
        }
        Ok(())
    }

    fn active_tasks(&self) -> Result<Vec<StoredTask>, StoreError> {
        Ok(self
            .locked()?
            .tasks
            .iter()
            .filter(|t| t.active)
            .cloned()
            .collect())
    }

    fn task_list_cache_get(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.locked()?;
        Ok(inner
            .task_list_cache
            .as_ref()
            .filter(|(_, valid_until)| time::now_secs() < *valid_until)
            .map(|(bytes, _)| bytes.clone()))
    }

    fn task_list_cache_put(
        &self,
        encoded: &[u8],
        valid_for_secs: u64,
    ) -> Result<(), StoreError> {
        self.locked()?.task_list_cache =
            Some((encoded.to_vec(), time::now_secs() + valid_for_secs));
        Ok(())
    }

    fn log_task_request(&self, requester: &IpAddr, at: u64) -> Result<(), StoreError> {
        self.locked()?.task_requests.push((*requester, at));
        Ok(())
    }

    fn record_hunting_result(
        &self,
        task_id: u32,
        observer_ip: &IpAddr,
        chain_identity: &[u8; 32],
        trace: &str,
        executed_at: u64,
    ) -> Result<(), StoreError> {
        self.locked()?.hunting_results.push((
            task_id,
            *observer_ip,
            *chain_identity,
            trace.to_string(),
            executed_at,
        ));
        Ok(())
    }

    fn hmac_keys_get(&self) -> Result<Vec<HmacKey>, StoreError> {
        Ok(self.locked()?.hmac_keys.clone())
    }

    fn hmac_keys_put(&self, keys: &[HmacKey]) -> Result<(), StoreError> {
        self.locked()?.hmac_keys = keys.to_vec();
        Ok(())
    }

    fn notary_cache_get(
        &self,
        hostname: &str,
        port: u16,
    ) -> Result<Option<(String, u64)>, StoreError> {
        Ok(self
            .locked()?
            .notary_cache
            .get(&(hostname.to_string(), port))
            .cloned())
    }

    fn notary_cache_put(
        &self,
        hostname: &str,
        port: u16,
        answer: &str,
        fetched_at: u64,
    ) -> Result<(), StoreError> {
        self.locked()?
            .notary_cache
            .insert((hostname.to_string(), port), (answer.to_string(), fetched_at));
        Ok(())
    }
}
