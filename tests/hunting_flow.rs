//! End-to-end hunting flow: a verification request with a disputed
//! certificate spawns a hunting task, a hunter executes it against the
//! target and the server validates and stores the reply.

use std::net::IpAddr;

use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa};

use crossbear::cert::chain::{ChainValidator, TrustStore};
use crossbear::cert::{chain_identity, CertificateDer};
use crossbear::error::TransportError;
use crossbear::hunt::keys::hmac_ip;
use crossbear::hunt::trace::{ProbeResult, Prober};
use crossbear::hunt::{HuntServer, Hunter, ReplyDisposition, RotatingKeys};
use crossbear::judge::notary::NotaryClient;
use crossbear::messaging::{
    decode_all, CertVerifyRequest, ClockOffset, HuntingTaskReply, Message,
};
use crossbear::store::memory::MemStore;
use crossbear::store::Store;
use crossbear::transport::ChainFetcher;
use crossbear::VerifyProcessor;

const TARGET_IP: &str = "93.184.216.34";
const REQUESTER_IP: &str = "198.51.100.7";

fn issue_chain(cn: &str) -> (CertificateDer, CertificateDer) {
    let mut ca_params = CertificateParams::new(Vec::new());
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "Flow Test CA");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.not_before = rcgen::date_time_ymd(2020, 1, 1);
    ca_params.not_after = rcgen::date_time_ymd(2035, 1, 1);
    let ca = Certificate::from_params(ca_params).unwrap();

    let mut params = CertificateParams::new(vec![cn.to_string()]);
    params.distinguished_name.push(DnType::CommonName, cn);
    params.not_before = rcgen::date_time_ymd(2020, 1, 1);
    params.not_after = rcgen::date_time_ymd(2030, 1, 1);
    let leaf = Certificate::from_params(params).unwrap();

    (
        CertificateDer::new(leaf.serialize_der_with_signer(&ca).unwrap()),
        CertificateDer::new(ca.serialize_der().unwrap()),
    )
}

struct ServesChain {
    chain: Vec<CertificateDer>,
}

impl ChainFetcher for ServesChain {
    fn fetch_chain(
        &self,
        _hostname: &str,
        _ip: &IpAddr,
        _port: u16,
    ) -> Result<Vec<CertificateDer>, TransportError> {
        Ok(self.chain.clone())
    }
}

struct SilentNotary;

impl NotaryClient for SilentNotary {
    fn fetch_observations(&self, _: &str, _: u16) -> Result<String, TransportError> {
        Ok(r#"{"fingerprintList":[]}"#.to_string())
    }
}

struct DirectRoute;

impl Prober for DirectRoute {
    fn probe(&self, _target: &IpAddr, ttl: u8, _attempt: u8) -> Result<ProbeResult, TransportError> {
        Ok(match ttl {
            1 => ProbeResult::Hop("198.51.100.1".parse().unwrap()),
            _ => ProbeResult::Target,
        })
    }
}

#[test]
fn disputed_certificate_is_hunted_and_the_reply_stored() {
    let store = MemStore::new();
    let validator = ChainValidator::new(TrustStore::new());
    let notary = SilentNotary;

    // the server and the client see different leaves for the same host
    let (server_leaf, server_ca) = issue_chain("www.example.com");
    let (client_leaf, client_ca) = issue_chain("www.example.com");
    let server_chain = vec![server_leaf, server_ca];
    let server_identity = chain_identity(&server_chain);
    let server_view = ServesChain {
        chain: server_chain,
    };

    let client_chain = vec![client_leaf, client_ca];
    let client_identity = chain_identity(&client_chain);
    let request = CertVerifyRequest::new(
        0,
        client_chain,
        "www.example.com".into(),
        TARGET_IP.parse().unwrap(),
        443,
    )
    .unwrap();

    let processor = VerifyProcessor::new(&store, &server_view, &validator, &notary);
    let encoded = processor
        .process(
            &request,
            &REQUESTER_IP.parse().unwrap(),
            &"192.0.2.250".parse().unwrap(),
        )
        .unwrap();

    // the answer carries the verdict plus everything a hunter needs
    let messages = decode_all(&encoded).unwrap();
    assert_eq!(messages.len(), 4);
    let server_time = match &messages[1] {
        Message::CurrentServerTime(t) => *t,
        other => panic!("expected server time, got {other:?}"),
    };
    let public_ip = match &messages[2] {
        Message::PublicIpNotification(n) => n.clone(),
        other => panic!("expected a public IP notification, got {other:?}"),
    };
    let task = match &messages[3] {
        Message::HuntingTask(t) => t.clone(),
        other => panic!("expected a hunting task, got {other:?}"),
    };
    assert_eq!(public_ip.public_ip, REQUESTER_IP.parse::<IpAddr>().unwrap());
    // both recorded views are already known chains for the target
    assert_eq!(task.known_chain_hashes.len(), 2);
    assert!(task.known_chain_hashes.contains(&server_identity));
    assert!(task.known_chain_hashes.contains(&client_identity));

    // a hunter observes what the target actually serves, a third view
    let (observed_leaf, observed_ca) = issue_chain("www.example.com");
    let observed = vec![observed_leaf, observed_ca];
    let hunter_view = ServesChain {
        chain: observed.clone(),
    };
    let hunter = Hunter::new(&hunter_view, &DirectRoute, &validator);
    let clock = ClockOffset::from_server_time(&server_time);
    let reply = hunter.execute_task(&task, &public_ip, &clock).unwrap();
    assert!(matches!(reply, HuntingTaskReply::NewCertChain { .. }));

    // the server accepts the reply and the chain goes on record
    let hunt_server = HuntServer::new(&store, &validator);
    assert_eq!(
        hunt_server.process_reply(&reply).unwrap(),
        ReplyDisposition::Stored
    );
    assert_eq!(store.hunting_result_count(), 1);

    let identities = store
        .known_chain_identities("www.example.com", 443, 3)
        .unwrap();
    assert_eq!(identities.len(), 3);
    assert!(identities.contains(&chain_identity(&observed)));
    assert!(identities.contains(&server_identity));
    assert!(identities.contains(&client_identity));

    // the next issue of the same task names the now-known chains, and a
    // second hunter seeing the same chain answers with just the hash
    let reissued = hunt_server
        .issue_task("www.example.com", 443, &TARGET_IP.parse().unwrap())
        .unwrap();
    assert_eq!(reissued.task_id, task.task_id);
    assert_eq!(reissued.known_chain_hashes, identities);

    let second_reply = hunter.execute_task(&reissued, &public_ip, &clock).unwrap();
    match &second_reply {
        HuntingTaskReply::KnownCertChain { chain_hash, .. } => {
            assert_eq!(*chain_hash, chain_identity(&observed));
        }
        other => panic!("expected a known-chain reply, got {other:?}"),
    }
    assert_eq!(
        hunt_server.process_reply(&second_reply).unwrap(),
        ReplyDisposition::Stored
    );
    assert_eq!(store.hunting_result_count(), 2);
}

#[test]
fn forged_public_ip_hmac_never_reaches_the_store() {
    let store = MemStore::new();
    let validator = ChainValidator::new(TrustStore::new());
    let hunt_server = HuntServer::new(&store, &validator);
    let task = hunt_server
        .issue_task("www.example.com", 443, &TARGET_IP.parse().unwrap())
        .unwrap();

    // prime the key slots, then sign for a different address
    RotatingKeys::new(&store).current_key().unwrap();
    let key = RotatingKeys::new(&store).current_key().unwrap();
    let forged = hmac_ip(&key.key, &"203.0.113.200".parse().unwrap());

    let (leaf, ca) = issue_chain("www.example.com");
    let reply = HuntingTaskReply::NewCertChain {
        task_id: task.task_id,
        executed_at: crossbear::utils::time::now_secs() as u32,
        pub_ip_hmac: forged,
        chain: vec![leaf, ca],
        trace: format!("{REQUESTER_IP}\n198.51.100.1\n{TARGET_IP}"),
    };
    assert!(hunt_server.process_reply(&reply).is_err());
    assert_eq!(store.hunting_result_count(), 0);
}
