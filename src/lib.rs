//! # Peerscore - Validator Query-Dispatch and Trust-Scoring Engine
//!
//! A validator node in a peer-scored network. Each round it:
//!
//! - **Selects** a candidate set of peers from the registry snapshot
//! - **Dispatches** one envelope to all of them with bounded concurrency,
//!   per-peer timeouts and a round deadline
//! - **Aggregates** the answers into a batch aligned with the candidate ids,
//!   plus a synthetic record for itself
//! - **Scores** the batch through an external trust scorer, normalizing the
//!   returned values or falling back to all-zero (stake-only) rewards
//! - **Tracks** a per-peer exponential moving average and commits it as
//!   weights once per epoch
//!
//! ## Concurrency Model
//!
//! - Rounds run strictly one after another
//! - Fan-out inside a round is a scoped task set; the round deadline aborts
//!   whatever is still pending
//! - The score store has a single writer; the registry snapshot is swapped,
//!   never mutated; credential refreshes are serialized
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `validator` | Composition root, round loop, inbound envelope handling |
//! | `selector` | Candidate selection and validity filtering |
//! | `dispatch` | Bounded concurrent fan-out with deadlines |
//! | `aggregator` | Alignment of dispatch output with candidate ids |
//! | `scoring` | Reward normalization, EMA scores, persistence |
//! | `auth` | Service credential refresh |
//! | `epoch` | Resync and weight-commit gating by block height |
//! | `registry` | Peers and registry snapshots |
//! | `protocols` | Collaborator trait definitions |
//! | `rpc` | Framed TCP peer RPC client and server |
//! | `service` | HTTP client for scorer, registration and listing |
//! | `chain` | File-backed development chain |
//! | `identity` | Ed25519 signing key and registration tokens |
//! | `messages` | Wire and service payload types |
//! | `config` | Runtime tunables |
//! | `error` | Error taxonomy |

pub mod aggregator;
pub mod auth;
pub mod chain;
pub mod config;
pub mod dispatch;
pub mod epoch;
pub mod error;
pub mod identity;
pub mod messages;
pub mod protocols;
pub mod registry;
pub mod rpc;
pub mod scoring;
pub mod selector;
pub mod service;
pub mod validator;

pub use aggregator::{AggregatedRound, ResponseAggregator};
pub use auth::{AuthToken, AuthTokenManager, RegistrationProfile};
pub use chain::LocalChain;
pub use config::ValidatorConfig;
pub use dispatch::{DispatchSettings, RpcDispatcher};
pub use epoch::{EpochScheduler, EpochState};
pub use error::{ErrorKind, ValidatorError};
pub use identity::Keypair;
pub use messages::{PeerResponse, Request, RequestEnvelope, ResponseRecord};
pub use protocols::{
    ChainClient, EnvelopeHandler, PeerListing, PeerRpc, RegistrationService, RegistrationSigner,
    ShutdownHook, TrustScorer,
};
pub use registry::{Peer, PeerRegistry, RegistrySnapshot, Uid};
pub use rpc::{RpcServer, TcpRpc};
pub use scoring::{RewardMode, RewardVector, ScoreStore, ScoreTracker};
pub use selector::PeerSelector;
pub use service::ServiceApiClient;
pub use validator::{Collaborators, RoundOutcome, Validator};
