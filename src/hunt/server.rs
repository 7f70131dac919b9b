//! # Hunting server
//!
//! Task issuance and reply validation. Tasks are deduplicated per
//! (hostname, ip, port) triple; the encoded task list is served from a
//! short-lived cache. A reply passes a strict pipeline before anything
//! is persisted: timestamp window, trace structure, trace-to-target
//! linkage, HMAC authentication of the observer address, then the
//! chain check of its variant. The first failure rejects the reply with
//! nothing stored.

use std::net::IpAddr;

use tracing::{debug, info, warn};

use crate::cert::{chain::ChainValidator, chain_identity};
use crate::config;
use crate::error::{CrossbearError, ValidationError};
use crate::messaging::{
    encode_list, CurrentServerTime, HuntingTask, HuntingTaskReply, Message, PublicIpNotification,
};
use crate::store::{Observation, Store};
use crate::utils::time;

use super::keys::{hmac_ip, RotatingKeys};
use super::trace;

/// What became of a structurally processed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    Stored,
    /// The task was already deactivated; the reply is dropped without
    /// error so lagging hunters do not see failures.
    InactiveDropped,
}

pub struct HuntServer<'a> {
    store: &'a dyn Store,
    validator: &'a ChainValidator,
    list_cache_secs: u64,
}

impl<'a> HuntServer<'a> {
    pub fn new(store: &'a dyn Store, validator: &'a ChainValidator) -> Self {
        Self {
            store,
            validator,
            list_cache_secs: config::TASK_LIST_CACHE_VALIDITY_SECS,
        }
    }

    pub fn with_list_cache_secs(mut self, secs: u64) -> Self {
        self.list_cache_secs = secs;
        self
    }

    /// Issue (or re-use) the hunting task for a flagged target and
    /// attach the chain identities already on record for it.
    pub fn issue_task(
        &self,
        hostname: &str,
        port: u16,
        target_ip: &IpAddr,
    ) -> Result<HuntingTask, CrossbearError> {
        let stored = match self.store.find_active_task(hostname, port, target_ip)? {
            Some(existing) => existing,
            None => {
                let task = self
                    .store
                    .insert_task(hostname, port, target_ip, time::now_secs())?;
                info!(task_id = task.task_id, host = hostname, port, "new hunting task");
                task
            }
        };
        let hashes = self.store.known_chain_identities(
            hostname,
            port,
            config::MAX_KNOWN_CHAIN_HASHES,
        )?;
        Ok(HuntingTask::new(
            stored.task_id,
            hashes,
            *target_ip,
            port,
            hostname.to_string(),
        )?)
    }

    /// The byte response for a task-list fetch: the server time, the
    /// requester's authenticated public IP and the cached encoded task
    /// list.
    pub fn task_list_response(&self, requester: &IpAddr) -> Result<Vec<u8>, CrossbearError> {
        let now = time::now_secs();
        self.store.log_task_request(requester, now)?;

        let task_bytes = match self.store.task_list_cache_get()? {
            Some(bytes) => bytes,
            None => {
                let mut msgs = Vec::new();
                for stored in self.store.active_tasks()? {
                    msgs.push(Message::HuntingTask(self.issue_task(
                        &stored.hostname,
                        stored.port,
                        &stored.target_ip,
                    )?));
                }
                let bytes = encode_list(&msgs)?;
                self.store
                    .task_list_cache_put(&bytes, self.list_cache_secs)?;
                debug!(tasks = msgs.len(), "task list regenerated");
                bytes
            }
        };

        let key = RotatingKeys::new(self.store).current_key()?;
        let mut out = encode_list(&[
            Message::CurrentServerTime(CurrentServerTime {
                unix_secs: now as u32,
            }),
            Message::PublicIpNotification(PublicIpNotification {
                hmac: hmac_ip(&key.key, requester),
                public_ip: *requester,
            }),
        ])?;
        out.extend_from_slice(&task_bytes);
        Ok(out)
    }

    /// Validate one hunting-task reply and persist the observation.
    pub fn process_reply(
        &self,
        reply: &HuntingTaskReply,
    ) -> Result<ReplyDisposition, CrossbearError> {
        let task = self
            .store
            .task_by_id(reply.task_id())?
            .ok_or(ValidationError::UnknownTask(reply.task_id()))?;
        if !task.active {
            debug!(task_id = task.task_id, "reply for inactive task dropped");
            return Ok(ReplyDisposition::InactiveDropped);
        }

        let now = time::now_secs();
        let executed_at = u64::from(reply.executed_at());
        if executed_at + config::REPLY_MAX_AGE_SECS < now {
            return Err(ValidationError::StaleTimestamp.into());
        }
        if executed_at > now + config::REPLY_MAX_FUTURE_SECS {
            return Err(ValidationError::FutureTimestamp.into());
        }

        let parsed = trace::parse_trace(reply.trace())?;
        if parsed.target != task.target_ip {
            return Err(ValidationError::TraceTargetMismatch.into());
        }

        let accepted = RotatingKeys::new(self.store).accepted_keys()?;
        let authenticated = accepted
            .iter()
            .any(|key| &hmac_ip(&key.key, &parsed.observer) == reply.pub_ip_hmac());
        if !authenticated {
            warn!(task_id = task.task_id, "reply with unauthenticated observer address");
            return Err(ValidationError::HmacMismatch.into());
        }

        let (identity, leaf_sha256) = match reply {
            HuntingTaskReply::KnownCertChain { chain_hash, .. } => {
                if !self
                    .store
                    .chain_known_for_host(&task.hostname, task.port, chain_hash)?
                {
                    return Err(ValidationError::UnknownChainHash.into());
                }
                let chain = self
                    .store
                    .chain_by_identity(chain_hash)?
                    .ok_or(ValidationError::UnknownChainHash)?;
                let leaf = chain.first().ok_or(ValidationError::UnknownChainHash)?;
                (*chain_hash, *leaf.sha256())
            }
            HuntingTaskReply::NewCertChain { chain, .. } => {
                let validated = self
                    .validator
                    .make_valid(chain, config::MAX_CHAIN_PERMUTATIONS, false)?
                    .ok_or(ValidationError::ChainUnvalidatable)?;
                let identity = chain_identity(&validated);
                self.store.store_chain(identity, &validated)?;
                let leaf = validated
                    .first()
                    .ok_or(ValidationError::ChainUnvalidatable)?;
                (identity, *leaf.sha256())
            }
        };

        self.store.record_observation(&Observation {
            hostname: task.hostname.clone(),
            port: task.port,
            observer: "CrossbearHunter".into(),
            observer_ip: parsed.observer.to_string(),
            leaf_sha256,
            chain_identity: Some(identity),
            observed_at: executed_at,
        })?;
        self.store.record_hunting_result(
            task.task_id,
            &parsed.observer,
            &identity,
            reply.trace(),
            executed_at,
        )?;
        info!(task_id = task.task_id, observer = %parsed.observer, "hunting reply stored");
        Ok(ReplyDisposition::Stored)
    }
}
