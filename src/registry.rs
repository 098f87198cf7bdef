//! Point-in-time view of the peer registry.
//!
//! A [`RegistrySnapshot`] is immutable. [`PeerRegistry`] holds the current
//! snapshot behind an `Arc` and swaps it wholesale on refresh, so a reader
//! that grabbed a snapshot keeps a consistent view for the whole round.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

/// Peer identifier: small integer index into the registry.
pub type Uid = u32;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub uid: Uid,
    pub addr: SocketAddr,
    pub stake: f64,
    #[serde(default)]
    pub is_validator: bool,
    #[serde(default)]
    pub is_serving: bool,
    #[serde(default)]
    pub last_update_block: u64,
    /// Account bound to this uid. A change means the slot was re-registered.
    #[serde(default)]
    pub account: String,
}

impl Peer {
    /// False for the null address (`0.0.0.0` / `::`) or port 0.
    pub fn is_reachable(&self) -> bool {
        !self.addr.ip().is_unspecified() && self.addr.port() != 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct RegistrySnapshot {
    peers: BTreeMap<Uid, Peer>,
    block: u64,
}

impl RegistrySnapshot {
    pub fn new(peers: impl IntoIterator<Item = Peer>, block: u64) -> Self {
        let peers = peers.into_iter().map(|p| (p.uid, p)).collect();
        Self { peers, block }
    }

    pub fn get(&self, uid: Uid) -> Option<&Peer> {
        self.peers.get(&uid)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn uids(&self) -> impl Iterator<Item = Uid> + '_ {
        self.peers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Block height at which the snapshot was taken.
    pub fn block(&self) -> u64 {
        self.block
    }

    /// Uid bound to `account`, if any.
    pub fn uid_of(&self, account: &str) -> Option<Uid> {
        self.peers.values().find(|p| p.account == account).map(|p| p.uid)
    }

    /// Uids present in both snapshots whose bound account differs.
    pub fn replaced_accounts(&self, newer: &RegistrySnapshot) -> Vec<Uid> {
        newer
            .peers
            .values()
            .filter(|p| {
                self.peers
                    .get(&p.uid)
                    .is_some_and(|old| old.account != p.account)
            })
            .map(|p| p.uid)
            .collect()
    }
}

/// Shared holder of the current snapshot.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    current: Arc<RwLock<Arc<RegistrySnapshot>>>,
}

impl PeerRegistry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self { current: Arc::new(RwLock::new(Arc::new(snapshot))) }
    }

    pub async fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().await.clone()
    }

    /// Replace the snapshot. Returns uids whose account changed.
    pub async fn replace(&self, snapshot: RegistrySnapshot) -> Vec<Uid> {
        let mut guard = self.current.write().await;
        let replaced = guard.replaced_accounts(&snapshot);
        debug!(
            peers = snapshot.len(),
            block = snapshot.block(),
            replaced = replaced.len(),
            "registry snapshot replaced"
        );
        *guard = Arc::new(snapshot);
        replaced
    }
}
