//! # Hunter
//!
//! Executes hunting tasks: connect to the task's target, record the
//! certificate chain it serves, trace the route to it, and build the
//! reply. The hunter never judges what it sees; it only reports, under a
//! public IP the server authenticated no more than a minute ago.
//!
//! Network collaborators come in as traits ([`ChainFetcher`], [`Prober`],
//! [`PublicIpSource`]) so the execution logic is testable without a
//! network.

use std::net::IpAddr;

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::cert::{chain::ChainValidator, chain_identity};
use crate::config;
use crate::error::{CrossbearError, TransportError};
use crate::messaging::{ClockOffset, HuntingTask, HuntingTaskReply, Message, PublicIpNotification};
use crate::transport::ChainFetcher;
use crate::utils::time;

use super::trace::{self, Prober, TraceConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

/// Supplies the server-authenticated public IP notification for one IP
/// version. Implementations ask the server; tests hand out fixed ones.
pub trait PublicIpSource {
    fn current_notification(
        &self,
        version: IpVersion,
    ) -> Result<PublicIpNotification, TransportError>;
}

/// A notification with the time it was obtained, so staleness is
/// checkable against the freshness window.
#[derive(Debug, Clone)]
pub struct FreshPublicIp {
    pub notification: PublicIpNotification,
    pub obtained_at: u64,
}

impl FreshPublicIp {
    pub fn is_fresh(&self) -> bool {
        !time::expired(self.obtained_at, config::PUBLIC_IP_FRESHNESS_SECS)
    }
}

/// Caches one [`FreshPublicIp`] per IP version in front of an inner
/// source, refreshing whenever the cached one ages out.
pub struct CachedPublicIp<'a> {
    inner: &'a dyn PublicIpSource,
    v4: std::cell::RefCell<Option<FreshPublicIp>>,
    v6: std::cell::RefCell<Option<FreshPublicIp>>,
}

impl<'a> CachedPublicIp<'a> {
    pub fn new(inner: &'a dyn PublicIpSource) -> Self {
        Self {
            inner,
            v4: std::cell::RefCell::new(None),
            v6: std::cell::RefCell::new(None),
        }
    }

    fn slot(&self, version: IpVersion) -> &std::cell::RefCell<Option<FreshPublicIp>> {
        match version {
            IpVersion::V4 => &self.v4,
            IpVersion::V6 => &self.v6,
        }
    }
}

impl PublicIpSource for CachedPublicIp<'_> {
    fn current_notification(
        &self,
        version: IpVersion,
    ) -> Result<PublicIpNotification, TransportError> {
        let now = time::now_secs();
        let slot = self.slot(version);
        if let Some(cached) = slot.borrow().as_ref() {
            if cached.is_fresh() {
                return Ok(cached.notification.clone());
            }
        }
        let notification = self.inner.current_notification(version)?;
        *slot.borrow_mut() = Some(FreshPublicIp {
            notification: notification.clone(),
            obtained_at: now,
        });
        Ok(notification)
    }
}

pub struct Hunter<'a> {
    fetcher: &'a dyn ChainFetcher,
    prober: &'a dyn Prober,
    validator: &'a ChainValidator,
    trace_cfg: TraceConfig,
}

impl<'a> Hunter<'a> {
    pub fn new(
        fetcher: &'a dyn ChainFetcher,
        prober: &'a dyn Prober,
        validator: &'a ChainValidator,
    ) -> Self {
        Self {
            fetcher,
            prober,
            validator,
            trace_cfg: TraceConfig::default(),
        }
    }

    pub fn with_trace_config(mut self, trace_cfg: TraceConfig) -> Self {
        self.trace_cfg = trace_cfg;
        self
    }

    /// Execute one task. The public IP notification must match the
    /// task's IP version; the clock offset stamps the reply in server
    /// time.
    pub fn execute_task(
        &self,
        task: &HuntingTask,
        public_ip: &PublicIpNotification,
        clock: &ClockOffset,
    ) -> Result<HuntingTaskReply, CrossbearError> {
        let fetched = self
            .fetcher
            .fetch_chain(&task.hostname, &task.target_ip, task.port)?;

        // normalize the chain order where possible so equal chains hash
        // equally; an incompletable chain is still worth reporting as
        // fetched
        let chain = match self.validator.make_valid(
            &fetched,
            config::MAX_CHAIN_PERMUTATIONS,
            true,
        ) {
            Ok(Some(validated)) => validated,
            Ok(None) => fetched,
            Err(err) => {
                debug!(task_id = task.task_id, %err, "chain not normalizable, reporting as fetched");
                fetched
            }
        };
        let identity = chain_identity(&chain);

        let hops = trace::run_trace(self.prober, &task.target_ip, &self.trace_cfg)?;
        let trace = trace::assemble_trace(&public_ip.public_ip, &hops, &task.target_ip);
        let executed_at = clock.current_server_secs();

        let reply = if task.known_chain_hashes.contains(&identity) {
            HuntingTaskReply::KnownCertChain {
                task_id: task.task_id,
                executed_at,
                pub_ip_hmac: public_ip.hmac,
                chain_hash: identity,
                trace,
            }
        } else {
            HuntingTaskReply::NewCertChain {
                task_id: task.task_id,
                executed_at,
                pub_ip_hmac: public_ip.hmac,
                chain,
                trace,
            }
        };
        debug!(task_id = task.task_id, known = matches!(reply, HuntingTaskReply::KnownCertChain { .. }), "task executed");
        Ok(reply)
    }

    /// Execute a task list. Tasks run in random order so hunters do not
    /// hammer targets in lockstep; a failing task is logged and skipped.
    pub fn execute_all(
        &self,
        tasks: &[HuntingTask],
        public_ips: &dyn PublicIpSource,
        clock: &ClockOffset,
    ) -> Vec<HuntingTaskReply> {
        let mut order: Vec<&HuntingTask> = tasks.iter().collect();
        order.shuffle(&mut rand::thread_rng());

        let mut replies = Vec::new();
        for task in order {
            let public_ip = match public_ips.current_notification(IpVersion::of(&task.target_ip))
            {
                Ok(notification) => notification,
                Err(err) => {
                    warn!(task_id = task.task_id, %err, "no authenticated public IP, skipping task");
                    continue;
                }
            };
            match self.execute_task(task, &public_ip, clock) {
                Ok(reply) => replies.push(reply),
                Err(err) => warn!(task_id = task.task_id, %err, "task failed"),
            }
        }
        replies
    }
}

/// Split replies into submission batches.
pub fn reply_batches(replies: Vec<HuntingTaskReply>) -> Vec<Vec<Message>> {
    replies
        .chunks(config::REPLY_BATCH_SIZE)
        .map(|chunk| {
            chunk
                .iter()
                .cloned()
                .map(Message::HuntingTaskReply)
                .collect()
        })
        .collect()
}
