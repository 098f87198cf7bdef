//! File-backed development chain.
//!
//! Stands in for the real ledger so a node can run locally. The peer list is
//! re-read from a JSON file on every registry snapshot, block height advances
//! with wall-clock time, and weight commits are kept in memory.
//!
//! ```json
//! {
//!   "tempo": 360,
//!   "block_time_secs": 12,
//!   "genesis_unix": 1700000000,
//!   "peers": [
//!     { "uid": 0, "addr": "127.0.0.1:8091", "stake": 10.0, "is_serving": true, "account": "5F..." }
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::auth::unix_now;
use crate::error::ValidatorError;
use crate::protocols::ChainClient;
use crate::registry::{Peer, Uid};

fn default_tempo() -> u64 {
    360
}

fn default_block_time() -> u64 {
    12
}

#[derive(Debug, Deserialize)]
struct ChainFile {
    #[serde(default = "default_tempo")]
    tempo: u64,
    #[serde(default = "default_block_time")]
    block_time_secs: u64,
    #[serde(default)]
    genesis_unix: Option<u64>,
    #[serde(default)]
    netuid: Option<u16>,
    peers: Vec<Peer>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WeightCommit {
    pub block: u64,
    pub uids: Vec<Uid>,
    pub weights: Vec<f64>,
}

pub struct LocalChain {
    path: PathBuf,
    tempo: u64,
    netuid: Option<u16>,
    block_time_secs: u64,
    genesis_unix: u64,
    commits: Mutex<Vec<WeightCommit>>,
}

impl LocalChain {
    pub fn load(path: &Path) -> Result<Self> {
        let file = Self::read(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            tempo: file.tempo,
            netuid: file.netuid,
            block_time_secs: file.block_time_secs.max(1),
            genesis_unix: file.genesis_unix.unwrap_or_else(unix_now),
            commits: Mutex::new(Vec::new()),
        })
    }

    fn read(path: &Path) -> Result<ChainFile> {
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read chain file {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("malformed chain file {}", path.display()))
    }

    fn block_at(&self, unix_secs: u64) -> u64 {
        unix_secs.saturating_sub(self.genesis_unix) / self.block_time_secs
    }

    pub async fn commits(&self) -> Vec<WeightCommit> {
        self.commits.lock().await.clone()
    }
}

#[async_trait]
impl ChainClient for LocalChain {
    async fn current_block(&self) -> Result<u64> {
        Ok(self.block_at(unix_now()))
    }

    async fn tempo(&self, netuid: u16) -> Result<Option<u64>> {
        match self.netuid {
            Some(n) if n != netuid => Ok(None),
            _ => Ok(Some(self.tempo)),
        }
    }

    async fn peer_registry_snapshot(&self) -> Result<Vec<Peer>> {
        Ok(Self::read(&self.path)?.peers)
    }

    async fn commit_weights(&self, uids: &[Uid], weights: &[f64]) -> Result<()> {
        if uids.len() != weights.len() {
            return Err(ValidatorError::ArrayLengthMismatch {
                what: "weights",
                expected: uids.len(),
                actual: weights.len(),
            }
            .into());
        }
        let block = self.current_block().await?;
        info!(block, peers = uids.len(), "weights committed to local chain");
        self.commits.lock().await.push(WeightCommit {
            block,
            uids: uids.to_vec(),
            weights: weights.to_vec(),
        });
        Ok(())
    }
}
