//! # Verification pipeline
//!
//! Processing of a [`CertVerifyRequest`]: look the result up in the
//! idempotency cache, record what the client claims to have seen, look at
//! the target ourselves, judge the difference, and hand back an encoded
//! result. When the views disagree and nobody can corroborate either one,
//! a hunting task rides along with the answer.
//!
//! Errors surface to the caller; the connection handler maps them to an
//! opaque failure response so internals never reach the client.

use std::net::IpAddr;

use tracing::{debug, info, warn};

use crate::cert::{chain::ChainValidator, chain_identity, CertificateDer};
use crate::config;
use crate::error::{ChainError, CrossbearError};
use crate::hunt::keys::{hmac_ip, RotatingKeys};
use crate::hunt::server::HuntServer;
use crate::judge::notary::{CachedNotary, NotaryClient};
use crate::judge::{self, JudgeInputs};
use crate::messaging::{
    encode_list, CertVerifyRequest, CurrentServerTime, Message, PublicIpNotification,
};
use crate::store::{Observation, Store};
use crate::transport::ChainFetcher;
use crate::utils::time;

pub struct VerifyProcessor<'a> {
    store: &'a dyn Store,
    fetcher: &'a dyn ChainFetcher,
    validator: &'a ChainValidator,
    notary: &'a dyn NotaryClient,
}

impl<'a> VerifyProcessor<'a> {
    pub fn new(
        store: &'a dyn Store,
        fetcher: &'a dyn ChainFetcher,
        validator: &'a ChainValidator,
        notary: &'a dyn NotaryClient,
    ) -> Self {
        Self {
            store,
            fetcher,
            validator,
            notary,
        }
    }

    /// Process one verification request and return the encoded message
    /// list to send back.
    pub fn process(
        &self,
        request: &CertVerifyRequest,
        requester_ip: &IpAddr,
        local_ip: &IpAddr,
    ) -> Result<Vec<u8>, CrossbearError> {
        let cache_key = request.idempotency_hash(requester_ip, local_ip);
        if let Some(cached) = self.store.result_cache_get(&cache_key)? {
            debug!(host = request.hostname, "verification answered from cache");
            return Ok(cached);
        }

        let now = time::now_secs();
        let client_leaf = request.leaf().ok_or(ChainError::EmptyChain)?.clone();

        // history before recording, so a first-timer judges as such
        let stats = self
            .store
            .observation_stats(&request.hostname, request.port, client_leaf.sha256())?;

        self.store.record_observation(&Observation {
            hostname: request.hostname.clone(),
            port: request.port,
            observer: "CrossbearCVR".into(),
            observer_ip: if request.behind_proxy() {
                requester_ip.to_string()
            } else {
                anonymized(requester_ip)
            },
            leaf_sha256: *client_leaf.sha256(),
            chain_identity: self.identity_of(&request.chain),
            observed_at: now,
        })?;

        let server_chain = self.server_observed_chain(request, local_ip, now)?;
        let server_leaf = server_chain.first();

        let notary_outcome = CachedNotary::new(self.notary, self.store).check(
            &request.hostname,
            request.port,
            &client_leaf,
        )?;

        let verdict = judge::judge(&JudgeInputs {
            client_leaf: &client_leaf,
            server_leaf,
            hostname: &request.hostname,
            stats,
            notary: notary_outcome,
            now,
        });

        let mut messages = vec![Message::CertVerifyResult(verdict.to_message())];
        if judge::hunting_task_warranted(&verdict, request.behind_proxy(), &request.host_ip) {
            info!(host = request.hostname, ip = %request.host_ip, "hunting task warranted");
            let key = RotatingKeys::new(self.store).current_key()?;
            let task = HuntServer::new(self.store, self.validator).issue_task(
                &request.hostname,
                request.port,
                &request.host_ip,
            )?;
            messages.push(Message::CurrentServerTime(CurrentServerTime {
                unix_secs: now as u32,
            }));
            messages.push(Message::PublicIpNotification(PublicIpNotification {
                hmac: hmac_ip(&key.key, requester_ip),
                public_ip: *requester_ip,
            }));
            messages.push(Message::HuntingTask(task));
        }

        let encoded = encode_list(&messages)?;
        self.store.result_cache_put(
            &cache_key,
            &encoded,
            config::RESULT_CACHE_VALIDITY_SECS,
        )?;
        Ok(encoded)
    }

    /// The chain the target serves from this server's vantage point,
    /// through the cert cache. Empty when the target is unreachable.
    fn server_observed_chain(
        &self,
        request: &CertVerifyRequest,
        local_ip: &IpAddr,
        now: u64,
    ) -> Result<Vec<CertificateDer>, CrossbearError> {
        // a TLS-terminating proxy hides the requested port; the target
        // itself still answers on 443
        let port = if request.behind_proxy() {
            443
        } else {
            request.port
        };
        if let Some(cached) = self.store.cert_cache_get(&request.hostname, port)? {
            return Ok(cached);
        }

        match self
            .fetcher
            .fetch_chain(&request.hostname, &request.host_ip, port)
        {
            Ok(chain) => {
                self.store.cert_cache_put(
                    &request.hostname,
                    port,
                    &chain,
                    config::CERT_CACHE_VALIDITY_SECS,
                )?;
                if let Some(leaf) = chain.first() {
                    self.store.record_observation(&Observation {
                        hostname: request.hostname.clone(),
                        port,
                        observer: "CrossbearServer".into(),
                        observer_ip: local_ip.to_string(),
                        leaf_sha256: *leaf.sha256(),
                        chain_identity: self.identity_of(&chain),
                        observed_at: now,
                    })?;
                }
                Ok(chain)
            }
            Err(err) => {
                warn!(host = request.hostname, ip = %request.host_ip, %err, "target unreachable");
                Ok(Vec::new())
            }
        }
    }

    fn identity_of(&self, chain: &[CertificateDer]) -> Option<[u8; 32]> {
        match self
            .validator
            .make_valid(chain, config::MAX_CHAIN_PERMUTATIONS, true)
        {
            Ok(Some(validated)) => Some(chain_identity(&validated)),
            _ => None,
        }
    }
}

/// Drop the host part of an address before persisting it.
fn anonymized(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.*", o[0], o[1], o[2])
        }
        IpAddr::V6(v6) => {
            let head: Vec<String> = v6.segments()[..4]
                .iter()
                .map(|s| format!("{s:x}"))
                .collect();
            format!("{}:*", head.join(":"))
        }
    }
}
