//! Collaborator trait definitions.
//!
//! The dispatch and scoring engine talks to everything outside its own
//! process through these traits. Production implementations live in `rpc`
//! (peer RPC), `service` (scorer, registration, listing), `chain` and
//! `identity`; tests substitute in-memory mocks.
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Peers | [`PeerRpc`] | send one envelope, await one response |
//! | Ledger | [`ChainClient`] | block height, tempo, registry, weight commits |
//! | Trust scorer | [`TrustScorer`] | per-peer values for a round |
//! | Registration | [`RegistrationService`] | token exchange |
//! | Peer listing | [`PeerListing`] | optional override of random selection |
//! | Wallet | [`RegistrationSigner`] | self-signed registration credential |
//! | Inbound | [`EnvelopeHandler`] | answer envelopes sent to this node |
//! | Supervisor | [`ShutdownHook`] | persist state on shutdown |

use anyhow::Result;
use async_trait::async_trait;

use crate::messages::{
    ListedPeer, PeerResponse, RegisterRequest, RegisterResponse, RequestEnvelope, ValidateRequest,
    ValidateResponse,
};
use crate::registry::{Peer, Uid};

/// Point-to-point request/response with another node.
#[async_trait]
pub trait PeerRpc: Send + Sync + 'static {
    /// Send `envelope` to `peer` and wait for its response.
    ///
    /// Implementations must release the connection when the returned future
    /// is dropped, since the dispatcher cancels calls by dropping them.
    async fn call(&self, peer: &Peer, envelope: &RequestEnvelope) -> Result<PeerResponse>;
}

#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    async fn current_block(&self) -> Result<u64>;

    /// Epoch length reported by the chain for `netuid`, if known.
    async fn tempo(&self, netuid: u16) -> Result<Option<u64>>;

    async fn peer_registry_snapshot(&self) -> Result<Vec<Peer>>;

    async fn commit_weights(&self, uids: &[Uid], weights: &[f64]) -> Result<()>;
}

#[async_trait]
pub trait TrustScorer: Send + Sync + 'static {
    /// Submit a round for scoring. `credential` is the current service token.
    async fn validate(&self, credential: &str, request: &ValidateRequest) -> Result<ValidateResponse>;
}

#[async_trait]
pub trait RegistrationService: Send + Sync + 'static {
    async fn register(&self, credential: &str, request: &RegisterRequest) -> Result<RegisterResponse>;
}

#[async_trait]
pub trait PeerListing: Send + Sync + 'static {
    async fn list_valid(&self, credential: &str) -> Result<Vec<ListedPeer>>;
}

/// Holder of the node's signing key.
pub trait RegistrationSigner: Send + Sync + 'static {
    /// Public account identifier bound to this node's uid.
    fn account(&self) -> String;

    /// Short-lived credential proving control of the signing key for a
    /// registration carrying `request` (whose `token` field is ignored).
    fn registration_token(&self, request: &RegisterRequest, issued_at: u64) -> Result<String>;
}

#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    async fn handle(&self, sender: Uid, envelope: RequestEnvelope) -> PeerResponse;
}

#[async_trait]
pub trait ShutdownHook: Send + Sync + 'static {
    async fn on_shutdown(&self) -> Result<()>;
}
