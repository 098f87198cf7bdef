//! # Validator composition root
//!
//! [`Validator`] owns every component and drives the round loop:
//!
//! ```text
//! Idle -> Dispatching -> Aggregating -> Scoring -> CommitCheck -> Idle
//!             |
//!             +-- no candidates --> Idle (NoAvailablePeers)
//! ```
//!
//! The loop drives itself by handing a self-addressed `Ping` to its own
//! [`EnvelopeHandler`], the same entry point inbound RPC uses. Rounds are
//! serialized by `round_lock`, whoever starts them.
//!
//! ## Inbound envelopes
//!
//! | Envelope | Answer |
//! |----------|--------|
//! | `Health` | `{method: health, success: true}` |
//! | `Ping` from another node | `{method: ping, success: true}`, no fan-out |
//! | `Ping` from this node | runs a scoring round |
//! | `Task` | relayed to explicit `uids` or a random sample, no scoring |
//! | `Task` already relayed | acknowledged, no fan-out |
//! | unrecognized | `success: false`, no fan-out |

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::aggregator::{AggregatedRound, ResponseAggregator};
use crate::auth::{AuthTokenManager, RegistrationProfile};
use crate::config::ValidatorConfig;
use crate::dispatch::{DispatchSettings, RpcDispatcher};
use crate::epoch::{EpochScheduler, EpochState};
use crate::error::{ErrorKind, ValidatorError};
use crate::messages::{
    output, Fields, PeerResponse, Request, RequestEnvelope, ResponseRecord, ValidateRequest,
    FIELD_FROM, FIELD_SOURCE, FIELD_TIMESTAMP, FIELD_UIDS,
};
use crate::protocols::{
    ChainClient, EnvelopeHandler, PeerListing, PeerRpc, RegistrationService, RegistrationSigner,
    ShutdownHook, TrustScorer,
};
use crate::registry::{PeerRegistry, RegistrySnapshot, Uid};
use crate::scoring::{RewardVector, ScoreStore, ScoreTracker};
use crate::selector::PeerSelector;

/// `source` of envelopes generated by the round loop.
pub const SOURCE_ROUND_LOOP: &str = "round_loop";
/// `source` stamped on relayed tasks. Such tasks are never relayed again.
pub const SOURCE_RELAY: &str = "relay";
/// `source` of probe pings.
pub const SOURCE_PROBE: &str = "probe";

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// External collaborators injected at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub rpc: Arc<dyn PeerRpc>,
    pub chain: Arc<dyn ChainClient>,
    pub scorer: Arc<dyn TrustScorer>,
    pub registration: Arc<dyn RegistrationService>,
    pub listing: Option<Arc<dyn PeerListing>>,
    pub signer: Arc<dyn RegistrationSigner>,
}

/// Result of one dispatched round.
#[derive(Clone, Debug)]
pub struct RoundOutcome {
    pub round_id: u64,
    pub uids: Vec<Uid>,
    pub records: Vec<ResponseRecord>,
    pub succeeded: usize,
    pub failed: usize,
    /// `None` for relay rounds, which are not scored.
    pub rewards: Option<RewardVector>,
    pub committed: bool,
}

impl RoundOutcome {
    fn new(round_id: u64, round: AggregatedRound) -> Self {
        Self {
            round_id,
            uids: round.uids,
            records: round.records,
            succeeded: round.succeeded,
            failed: round.failed,
            rewards: None,
            committed: false,
        }
    }

    /// Output map returned to whoever asked for the round.
    pub fn to_output(&self, method: &str, self_uid: Uid) -> Fields {
        let mut out = output(method, true, self_uid);
        out.insert("round".into(), self.round_id.to_string());
        out.insert("succeeded".into(), self.succeeded.to_string());
        out.insert("failed".into(), self.failed.to_string());
        out.insert(
            "responses".into(),
            serde_json::to_string(&self.records).unwrap_or_default(),
        );
        out
    }
}

pub struct Validator {
    config: ValidatorConfig,
    self_uid: Uid,
    chain: Arc<dyn ChainClient>,
    scorer: Arc<dyn TrustScorer>,
    listing: Option<Arc<dyn PeerListing>>,
    registry: PeerRegistry,
    selector: PeerSelector,
    dispatcher: RpcDispatcher<dyn PeerRpc>,
    settings: DispatchSettings,
    aggregator: ResponseAggregator,
    tracker: Arc<Mutex<ScoreTracker>>,
    auth: Arc<AuthTokenManager>,
    epochs: Mutex<EpochScheduler>,
    round_lock: Mutex<()>,
    rounds: AtomicU64,
    hooks: std::sync::Mutex<Vec<Arc<dyn ShutdownHook>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Validator {
    /// Load state, read the chain, locate this node and log in.
    pub async fn startup(config: ValidatorConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        config.validate().context("invalid configuration")?;
        let Collaborators { rpc, chain, scorer, registration, listing, signer } = collaborators;

        let mut store = match &config.state_path {
            Some(path) => ScoreStore::load_or_default(path),
            None => ScoreStore::default(),
        };

        let block = chain.current_block().await.context("failed to read block height")?;
        let peers = chain
            .peer_registry_snapshot()
            .await
            .context("failed to read peer registry")?;
        let snapshot = RegistrySnapshot::new(peers, block);

        let account = signer.account();
        let self_uid = snapshot
            .uid_of(&account)
            .ok_or_else(|| anyhow!("account {account} is not registered on netuid {}", config.netuid))?;
        let last_update = snapshot.get(self_uid).map(|p| p.last_update_block).unwrap_or(0);
        store.cover(snapshot.uids());

        let mut epochs = EpochScheduler::new(config.epoch_length, config.disable_set_weights);
        match chain.tempo(config.netuid).await {
            Ok(tempo) => epochs.clamp_with_tempo(tempo),
            Err(e) => {
                warn!(error = %e, "tempo query failed");
                epochs.clamp_with_tempo(None);
            }
        }
        epochs.observe_block(block);
        epochs.mark_resynced(block);
        epochs.mark_committed(last_update);

        let auth = Arc::new(AuthTokenManager::new(
            registration,
            signer,
            RegistrationProfile {
                uid: self_uid,
                chain: config.chain.clone(),
                netuid: config.netuid,
                neuron_type: config.neuron_type.clone(),
            },
            config.token_ttl,
            config.refresh_window(),
        ));
        if let Some(path) = &config.credential_path {
            match auth.restore(path).await {
                Ok(restored) => debug!(restored, "credential cache checked"),
                Err(e) => warn!(error = %e, "ignoring credential cache"),
            }
        }
        if let Err(e) = auth.ensure_fresh().await {
            warn!(error = %e, "initial registration failed, continuing without service credential");
        }

        let tracker = Arc::new(Mutex::new(ScoreTracker::new(config.moving_average_alpha, store)));
        let mut hooks: Vec<Arc<dyn ShutdownHook>> = Vec::new();
        if let Some(path) = &config.state_path {
            hooks.push(Arc::new(PersistScores { tracker: tracker.clone(), path: path.clone() }));
        }
        if let Some(path) = &config.credential_path {
            hooks.push(Arc::new(PersistCredential { auth: auth.clone(), path: path.clone() }));
        }

        let settings = DispatchSettings {
            per_peer_timeout: config.per_peer_timeout,
            round_deadline: config.round_deadline,
            max_concurrency: config.max_concurrency,
        };
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            uid = self_uid,
            block,
            peers = snapshot.len(),
            epoch_length = epochs.state().epoch_length,
            "validator started"
        );

        Ok(Arc::new(Self {
            self_uid,
            chain,
            scorer,
            listing: if config.use_peer_listing { listing } else { None },
            registry: PeerRegistry::new(snapshot),
            selector: PeerSelector::new(self_uid),
            dispatcher: RpcDispatcher::new(rpc),
            settings,
            aggregator: ResponseAggregator::new(self_uid),
            tracker,
            auth,
            epochs: Mutex::new(epochs),
            round_lock: Mutex::new(()),
            rounds: AtomicU64::new(0),
            hooks: std::sync::Mutex::new(hooks),
            shutdown_tx,
            config,
        }))
    }

    pub fn self_uid(&self) -> Uid {
        self.self_uid
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn auth(&self) -> &AuthTokenManager {
        &self.auth
    }

    pub async fn scores(&self) -> ScoreStore {
        self.tracker.lock().await.store().clone()
    }

    pub async fn epoch_state(&self) -> EpochState {
        self.epochs.lock().await.state()
    }

    pub async fn registry(&self) -> Arc<RegistrySnapshot> {
        self.registry.snapshot().await
    }

    /// Receiver that flips to `true` once [`shutdown`](Self::shutdown) runs.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn add_shutdown_hook(&self, hook: Arc<dyn ShutdownHook>) {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push(hook);
        }
    }

    fn candidates(
        &self,
        snapshot: &RegistrySnapshot,
        explicit: Option<&[Uid]>,
    ) -> Result<Vec<Uid>, ValidatorError> {
        let mut rng = rand::thread_rng();
        self.selector
            .select(snapshot, explicit, true, self.config.sample_size, &mut rng)
    }

    async fn listed_uids(&self, credential: &str) -> Option<Vec<Uid>> {
        let listing = self.listing.as_ref()?;
        match listing.list_valid(credential).await {
            Ok(listed) => {
                let uids: Vec<Uid> = listed
                    .iter()
                    .filter_map(|p| p.channel.trim().parse().ok())
                    .collect();
                if uids.is_empty() {
                    debug!("peer listing empty, sampling at random");
                    None
                } else {
                    Some(uids)
                }
            }
            Err(e) => {
                warn!(error = %e, "peer listing failed, sampling at random");
                None
            }
        }
    }

    async fn resync(&self, block: u64) {
        let peers = match self.chain.peer_registry_snapshot().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, block, "registry resync failed");
                return;
            }
        };
        let snapshot = RegistrySnapshot::new(peers, block);
        let uids: Vec<Uid> = snapshot.uids().collect();
        let replaced = self.registry.replace(snapshot).await;
        {
            let mut tracker = self.tracker.lock().await;
            let store = tracker.store_mut();
            for &uid in &replaced {
                store.reset(uid);
            }
            store.cover(uids);
        }
        if !replaced.is_empty() {
            info!(block, replaced = ?replaced, "scores reset for re-registered uids");
        }
        self.epochs.lock().await.mark_resynced(block);
    }

    /// One full select, dispatch, aggregate, score, commit cycle.
    pub async fn run_scoring_round(&self) -> Result<RoundOutcome, ValidatorError> {
        let _round = self.round_lock.lock().await;
        let round_id = self.rounds.fetch_add(1, Ordering::SeqCst) + 1;

        let block = match self.chain.current_block().await {
            Ok(block) => Some(block),
            Err(e) => {
                warn!(round = round_id, error = %e, "block height unavailable");
                None
            }
        };
        if let Some(block) = block {
            let due = {
                let mut epochs = self.epochs.lock().await;
                epochs.observe_block(block);
                epochs.should_resync(block)
            };
            if due {
                self.resync(block).await;
            }
        }

        let snapshot = self.registry.snapshot().await;
        let credential = self.auth.ensure_fresh().await;

        let listed = match &credential {
            Ok(c) => self.listed_uids(c).await,
            Err(_) => None,
        };
        let candidates = match listed {
            Some(ids) => match self.candidates(&snapshot, Some(ids.as_slice())) {
                Ok(candidates) => Ok(candidates),
                Err(_) => self.candidates(&snapshot, None),
            },
            None => self.candidates(&snapshot, None),
        };
        let candidates = match candidates {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(round = round_id, registry = snapshot.len(), "no available peers, skipping round");
                return Err(e);
            }
        };

        let envelope = RequestEnvelope::self_ping(self.self_uid, SOURCE_ROUND_LOOP, now_ms());
        let records = self
            .dispatcher
            .dispatch(&snapshot, &candidates, &envelope, &self.settings)
            .await;
        let round = self
            .aggregator
            .aggregate(&candidates, Ok(records), ResponseRecord::self_result(self.self_uid));

        let mut tracker = self.tracker.lock().await;
        let rewards = match &credential {
            Ok(credential) => {
                let request = ValidateRequest {
                    uids: round.uids.clone(),
                    responses: round.records.clone(),
                    chain: self.config.chain.clone(),
                    uid: self.self_uid,
                    netuid: self.config.netuid,
                };
                tracker.score(self.scorer.as_ref(), credential, &request).await
            }
            Err(e) => {
                warn!(round = round_id, error = %e, "no service credential, using stake-only rewards");
                RewardVector::stake_only(round.uids.len(), ErrorKind::AuthExpired)
            }
        };

        if let Err(e) = tracker.apply_rewards(&round.uids, &rewards) {
            error!(round = round_id, error = %e, "score update skipped");
        }
        if let Some(path) = &self.config.state_path
            && let Err(e) = tracker.store().save(path)
        {
            warn!(round = round_id, error = %e, "failed to persist scores");
        }

        let committed = match block {
            Some(block) => self.maybe_commit(&tracker, block).await,
            None => false,
        };
        drop(tracker);
        self.epochs.lock().await.complete_round();

        // Only a credential the scorer actually refused is discarded. When
        // ensure_fresh already failed, its backoff stays in force.
        if credential.is_ok() && rewards.fallback() == Some(ErrorKind::AuthExpired) {
            self.auth.invalidate().await;
            if let Err(e) = self.auth.ensure_fresh().await {
                warn!(round = round_id, error = %e, "credential still unavailable");
            }
        }

        info!(
            round = round_id,
            candidates = candidates.len(),
            succeeded = round.succeeded,
            failed = round.failed,
            reward_mode = %rewards.mode(),
            committed,
            "round complete"
        );

        let mut outcome = RoundOutcome::new(round_id, round);
        outcome.rewards = Some(rewards);
        outcome.committed = committed;
        Ok(outcome)
    }

    async fn maybe_commit(&self, tracker: &ScoreTracker, block: u64) -> bool {
        let mut epochs = self.epochs.lock().await;
        if !epochs.should_commit_weights(block) {
            return false;
        }
        let (uids, weights) = tracker.weights();
        match self.chain.commit_weights(&uids, &weights).await {
            Ok(()) => {
                epochs.mark_committed(block);
                info!(block, peers = uids.len(), "weights committed");
                true
            }
            Err(e) => {
                warn!(block, error = %e, "weight commit failed");
                false
            }
        }
    }

    /// Forward a task to peers and collect their answers. Scores are untouched.
    pub async fn relay_task(&self, envelope: RequestEnvelope) -> Result<RoundOutcome, ValidatorError> {
        let _round = self.round_lock.lock().await;
        let round_id = self.rounds.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = self.registry.snapshot().await;

        let explicit = envelope.explicit_uids();
        let candidates = self.candidates(&snapshot, explicit.as_deref()).inspect_err(|_| {
            warn!(round = round_id, explicit = explicit.is_some(), "no available peers for task");
        })?;

        let mut forwarded = RequestEnvelope::new(envelope.request);
        forwarded.fields = envelope.fields;
        forwarded.fields.remove(FIELD_UIDS);
        let forwarded = forwarded
            .with_field(FIELD_FROM, self.self_uid.to_string())
            .with_field(FIELD_SOURCE, SOURCE_RELAY)
            .with_field(FIELD_TIMESTAMP, now_ms().to_string());

        let records = self
            .dispatcher
            .dispatch(&snapshot, &candidates, &forwarded, &self.settings)
            .await;
        let round = self
            .aggregator
            .aggregate(&candidates, Ok(records), ResponseRecord::self_result(self.self_uid));

        info!(
            round = round_id,
            candidates = candidates.len(),
            succeeded = round.succeeded,
            failed = round.failed,
            kind = forwarded.request.type_tag(),
            "relay round complete"
        );
        Ok(RoundOutcome::new(round_id, round))
    }

    /// Ping `ids` and return those that answered successfully.
    pub async fn probe(&self, ids: &[Uid]) -> Vec<Uid> {
        let _round = self.round_lock.lock().await;
        let snapshot = self.registry.snapshot().await;
        let Ok(candidates) = self.candidates(&snapshot, Some(ids)) else {
            return Vec::new();
        };
        let envelope = RequestEnvelope::self_ping(self.self_uid, SOURCE_PROBE, now_ms());
        self.dispatcher
            .dispatch(&snapshot, &candidates, &envelope, &self.settings)
            .await
            .into_iter()
            .filter(|r| r.success)
            .map(|r| r.peer_id)
            .collect()
    }

    /// Run rounds back to back until [`shutdown`](Self::shutdown).
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut shutdown = self.shutdown_signal();
        info!(uid = self.self_uid, interval_ms = self.config.round_interval.as_millis() as u64, "round loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let envelope = RequestEnvelope::self_ping(self.self_uid, SOURCE_ROUND_LOOP, now_ms());
            tokio::select! {
                response = self.handle(self.self_uid, envelope) => {
                    debug!(status = response.status, success = ?response.output.get("success"), "round loop tick");
                }
                _ = shutdown.changed() => break,
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.round_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("round loop stopped");
        Ok(())
    }

    /// Stop the round loop and run every shutdown hook.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let hooks: Vec<Arc<dyn ShutdownHook>> = match self.hooks.lock() {
            Ok(hooks) => hooks.clone(),
            Err(_) => Vec::new(),
        };
        for hook in hooks {
            if let Err(e) = hook.on_shutdown().await {
                warn!(error = %e, "shutdown hook failed");
            }
        }
        info!("validator shut down");
    }

    fn failed_output(&self, method: &str, error: &str) -> Fields {
        let mut out = output(method, false, self.self_uid);
        out.insert("error".into(), error.into());
        out
    }
}

#[async_trait]
impl EnvelopeHandler for Validator {
    async fn handle(&self, sender: Uid, envelope: RequestEnvelope) -> PeerResponse {
        match &envelope.request {
            Request::Health => PeerResponse::ok(output("health", true, self.self_uid)),
            Request::Ping => {
                let self_initiated =
                    sender == self.self_uid && envelope.from_uid() == Some(self.self_uid);
                if !self_initiated {
                    return PeerResponse::ok(output("ping", true, self.self_uid));
                }
                match self.run_scoring_round().await {
                    Ok(outcome) => PeerResponse::ok(outcome.to_output("ping", self.self_uid)),
                    Err(e) => PeerResponse::ok(self.failed_output("ping", &e.to_string())),
                }
            }
            Request::Task { method, .. } => {
                if envelope.fields.get(FIELD_SOURCE).map(String::as_str) == Some(SOURCE_RELAY) {
                    debug!(sender, method = %method, "relayed task acknowledged without fan-out");
                    return PeerResponse::ok(output(method, true, self.self_uid));
                }
                let method = method.clone();
                match self.relay_task(envelope).await {
                    Ok(outcome) => PeerResponse::ok(outcome.to_output(&method, self.self_uid)),
                    Err(e) => PeerResponse::ok(self.failed_output(&method, &e.to_string())),
                }
            }
            Request::Unknown(tag) => {
                debug!(sender, kind = %tag, "unknown message type");
                PeerResponse::ok(
                    self.failed_output("unknown", &format!("Skip unknown message type: {tag}")),
                )
            }
        }
    }
}

struct PersistScores {
    tracker: Arc<Mutex<ScoreTracker>>,
    path: PathBuf,
}

#[async_trait]
impl ShutdownHook for PersistScores {
    async fn on_shutdown(&self) -> Result<()> {
        let tracker = self.tracker.lock().await;
        tracker.store().save(&self.path)?;
        info!(path = %self.path.display(), peers = tracker.store().len(), "scores saved");
        Ok(())
    }
}

struct PersistCredential {
    auth: Arc<AuthTokenManager>,
    path: PathBuf,
}

#[async_trait]
impl ShutdownHook for PersistCredential {
    async fn on_shutdown(&self) -> Result<()> {
        self.auth.persist(&self.path).await?;
        debug!(path = %self.path.display(), "credential saved");
        Ok(())
    }
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("uid", &self.self_uid)
            .field("rounds", &self.rounds.load(Ordering::SeqCst))
            .finish()
    }
}
