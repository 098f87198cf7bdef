//! Peer RPC over real loopback sockets.
//!
//! Servers run in-process on ephemeral ports. The last test drives a full
//! validator round whose fan-out crosses TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use peerscore::messages::{
    output, RegisterRequest, RegisterResponse, ValidateRequest, ValidateResponse, FIELD_FROM,
};
use peerscore::{
    ChainClient, Collaborators, EnvelopeHandler, ErrorKind, Peer, PeerResponse, PeerRpc,
    RegistrationService, RegistrationSigner, RequestEnvelope, RpcServer, TcpRpc, TrustScorer, Uid,
    Validator, ValidatorConfig,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Answers every envelope and remembers who sent what.
struct RecordingHandler {
    uid: Uid,
    delay: Duration,
    status_ok: bool,
    seen: Mutex<Vec<(Uid, RequestEnvelope)>>,
}

impl RecordingHandler {
    fn new(uid: Uid) -> Arc<Self> {
        Arc::new(Self { uid, delay: Duration::ZERO, status_ok: true, seen: Mutex::new(Vec::new()) })
    }
}

#[async_trait]
impl EnvelopeHandler for RecordingHandler {
    async fn handle(&self, sender: Uid, envelope: RequestEnvelope) -> PeerResponse {
        let tag = envelope.request.type_tag().to_string();
        self.seen.lock().await.push((sender, envelope));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.status_ok {
            PeerResponse::ok(output(&tag, true, self.uid))
        } else {
            PeerResponse::rejected(output(&tag, false, self.uid))
        }
    }
}

struct RunningServer {
    addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

async fn start_server(uid: Uid, handler: Arc<dyn EnvelopeHandler>, process_timeout: Option<Duration>) -> RunningServer {
    let mut server = RpcServer::bind("127.0.0.1:0".parse().unwrap(), uid)
        .await
        .expect("bind failed");
    if let Some(timeout) = process_timeout {
        server = server.with_process_timeout(timeout);
    }
    let addr = server.local_addr().expect("no local addr");
    let (stop, rx) = watch::channel(false);
    let task = tokio::spawn(server.serve(handler, rx));
    RunningServer { addr, stop, task }
}

fn peer_at(uid: Uid, addr: SocketAddr) -> Peer {
    Peer {
        uid,
        addr,
        stake: 1.0,
        is_validator: false,
        is_serving: true,
        last_update_block: 0,
        account: format!("acct-{uid}"),
    }
}

#[tokio::test]
async fn request_and_response_cross_the_socket() {
    let handler = RecordingHandler::new(2);
    let server = start_server(2, handler.clone(), None).await;
    let client = TcpRpc::new(1);

    let envelope = RequestEnvelope::task("chat", "payload").with_field(FIELD_FROM, "1");
    let response = tokio::time::timeout(TEST_TIMEOUT, client.call(&peer_at(2, server.addr), &envelope))
        .await
        .expect("call timed out")
        .expect("call failed");

    assert!(response.is_ok());
    assert_eq!(response.output.get("uid").map(String::as_str), Some("2"));
    let seen = handler.seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, 1);
    assert_eq!(seen[0].1, envelope);
}

#[tokio::test]
async fn frame_claiming_receiver_uid_is_rejected() {
    let handler = RecordingHandler::new(2);
    let server = start_server(2, handler.clone(), None).await;

    let response = TcpRpc::new(2)
        .call(&peer_at(2, server.addr), &RequestEnvelope::ping())
        .await
        .expect("call failed");

    assert_eq!(response.status, 400);
    assert_eq!(
        response.output.get("error").map(String::as_str),
        Some("sender uid is the receiving node")
    );
    assert!(handler.seen.lock().await.is_empty());
}

#[tokio::test]
async fn spoofed_from_field_is_rejected() {
    let handler = RecordingHandler::new(2);
    let server = start_server(2, handler.clone(), None).await;

    let envelope = RequestEnvelope::ping().with_field(FIELD_FROM, "7");
    let response = TcpRpc::new(1)
        .call(&peer_at(2, server.addr), &envelope)
        .await
        .expect("call failed");

    assert_eq!(response.status, 400);
    assert!(handler.seen.lock().await.is_empty());
}

#[tokio::test]
async fn slow_handler_hits_process_timeout() {
    let handler = Arc::new(RecordingHandler {
        uid: 2,
        delay: Duration::from_secs(5),
        status_ok: true,
        seen: Mutex::new(Vec::new()),
    });
    let server = start_server(2, handler, Some(Duration::from_millis(100))).await;

    let response = tokio::time::timeout(
        TEST_TIMEOUT,
        TcpRpc::new(1).call(&peer_at(2, server.addr), &RequestEnvelope::ping()),
    )
    .await
    .expect("call timed out")
    .expect("call failed");

    assert_eq!(response.status, 400);
    assert_eq!(
        response.output.get("error").map(String::as_str),
        Some("request processing timeout")
    );
}

#[tokio::test]
async fn closed_port_is_peer_unreachable() {
    let server = start_server(2, RecordingHandler::new(2), None).await;
    let addr = server.addr;
    server.stop.send_replace(true);
    tokio::time::timeout(TEST_TIMEOUT, server.task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();

    let err = TcpRpc::new(1)
        .call(&peer_at(2, addr), &RequestEnvelope::ping())
        .await
        .unwrap_err();
    assert_eq!(ErrorKind::classify(&err), ErrorKind::PeerUnreachable);
}

// ============================================================================
// Full round over TCP
// ============================================================================

struct StaticChain {
    peers: Vec<Peer>,
}

#[async_trait]
impl ChainClient for StaticChain {
    async fn current_block(&self) -> Result<u64> {
        Ok(500)
    }

    async fn tempo(&self, _netuid: u16) -> Result<Option<u64>> {
        Ok(None)
    }

    async fn peer_registry_snapshot(&self) -> Result<Vec<Peer>> {
        Ok(self.peers.clone())
    }

    async fn commit_weights(&self, _uids: &[Uid], _weights: &[f64]) -> Result<()> {
        Ok(())
    }
}

/// Rewards every successful record with 1.
struct SuccessScorer;

#[async_trait]
impl TrustScorer for SuccessScorer {
    async fn validate(&self, _credential: &str, request: &ValidateRequest) -> Result<ValidateResponse> {
        Ok(ValidateResponse {
            values: request
                .responses
                .iter()
                .map(|r| if r.success { 1.0 } else { 0.0 })
                .collect(),
            uids: request.uids.clone(),
            error: None,
        })
    }
}

struct Registrar;

#[async_trait]
impl RegistrationService for Registrar {
    async fn register(&self, _credential: &str, _request: &RegisterRequest) -> Result<RegisterResponse> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        Ok(RegisterResponse { access_token: Some("token".into()), exp: Some(now + 600), success: true })
    }
}

struct Signer;

impl RegistrationSigner for Signer {
    fn account(&self) -> String {
        "acct-9".into()
    }

    fn registration_token(&self, _request: &RegisterRequest, issued_at: u64) -> Result<String> {
        Ok(format!("signed-{issued_at}"))
    }
}

#[tokio::test]
async fn validator_round_fans_out_over_tcp() {
    let healthy = RecordingHandler::new(1);
    let refusing = Arc::new(RecordingHandler {
        uid: 2,
        delay: Duration::ZERO,
        status_ok: false,
        seen: Mutex::new(Vec::new()),
    });
    let server_one = start_server(1, healthy.clone(), None).await;
    let server_two = start_server(2, refusing.clone(), None).await;

    let chain = Arc::new(StaticChain {
        peers: vec![
            peer_at(1, server_one.addr),
            peer_at(2, server_two.addr),
            peer_at(9, "127.0.0.1:9".parse().unwrap()),
        ],
    });
    let config = ValidatorConfig {
        sample_size: 2,
        use_peer_listing: false,
        per_peer_timeout: Duration::from_secs(2),
        round_deadline: Duration::from_secs(3),
        ..ValidatorConfig::default()
    };
    let validator = Validator::startup(
        config,
        Collaborators {
            rpc: Arc::new(TcpRpc::new(9)),
            chain,
            scorer: Arc::new(SuccessScorer),
            registration: Arc::new(Registrar),
            listing: None,
            signer: Arc::new(Signer),
        },
    )
    .await
    .expect("startup failed");

    let outcome = tokio::time::timeout(TEST_TIMEOUT, validator.run_scoring_round())
        .await
        .expect("round timed out")
        .expect("round failed");

    let record = |uid: Uid| {
        let idx = outcome.uids.iter().position(|&u| u == uid).unwrap();
        outcome.records[idx].clone()
    };
    assert!(record(1).success);
    assert!(!record(2).success);
    assert_eq!(record(2).error_kind, Some(ErrorKind::InvalidResponse));
    assert!(record(9).success);

    // One reward each for peer 1 and ourselves, blended with alpha 0.1.
    let scores = validator.scores().await;
    assert!((scores.get(1) - 0.05).abs() < 1e-12);
    assert_eq!(scores.get(2), 0.0);

    let seen = healthy.seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, 9);
    assert_eq!(seen[0].1.from_uid(), Some(9));
    assert_eq!(refusing.seen.lock().await.len(), 1);
}
