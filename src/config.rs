//! Runtime tunables for the validator.
//!
//! Built once (from CLI flags in the binary, from `Default` in tests) and
//! passed by value into [`Validator`](crate::Validator). Nothing writes to it
//! afterwards.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

#[derive(Clone, Debug)]
pub struct ValidatorConfig {
    /// Subnet identifier on the chain.
    pub netuid: u16,
    /// Chain name reported to the external services.
    pub chain: String,
    /// Neuron type reported at registration.
    pub neuron_type: String,
    /// Number of peers drawn per round (k).
    pub sample_size: usize,
    /// Concurrent in-flight peer calls per round.
    pub max_concurrency: usize,
    /// Deadline for a single peer call.
    pub per_peer_timeout: Duration,
    /// Deadline for the whole dispatch batch.
    pub round_deadline: Duration,
    /// Sleep between rounds.
    pub round_interval: Duration,
    /// EMA weight given to the newest reward.
    pub moving_average_alpha: f64,
    /// Default epoch length in blocks, clamped by chain tempo at startup.
    pub epoch_length: u64,
    /// Never commit weights when set.
    pub disable_set_weights: bool,
    /// Lifetime of a registration token.
    pub token_ttl: Duration,
    /// Upper bound on the refresh window.
    pub refresh_ceiling: Duration,
    /// Ask the listing service for candidates before random sampling.
    pub use_peer_listing: bool,
    /// Score store location. `None` keeps scores in memory only.
    pub state_path: Option<PathBuf>,
    /// Where the service credential is kept across restarts.
    pub credential_path: Option<PathBuf>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            netuid: 2,
            chain: "bittensor".to_string(),
            neuron_type: "validator".to_string(),
            sample_size: 10,
            max_concurrency: 3,
            per_peer_timeout: Duration::from_secs(12),
            round_deadline: Duration::from_secs(15),
            round_interval: Duration::from_secs(1),
            moving_average_alpha: 0.1,
            epoch_length: 100,
            disable_set_weights: false,
            token_ttl: Duration::from_secs(30 * 60),
            refresh_ceiling: Duration::from_secs(300),
            use_peer_listing: true,
            state_path: None,
            credential_path: None,
        }
    }
}

impl ValidatorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.moving_average_alpha > 0.0 && self.moving_average_alpha <= 1.0) {
            bail!("moving_average_alpha must be in (0, 1], got {}", self.moving_average_alpha);
        }
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be at least 1");
        }
        if self.sample_size == 0 {
            bail!("sample_size must be at least 1");
        }
        if self.per_peer_timeout.is_zero() || self.round_deadline.is_zero() {
            bail!("per-peer timeout and round deadline must be non-zero");
        }
        if self.per_peer_timeout > self.round_deadline {
            bail!(
                "per_peer_timeout ({:?}) exceeds round_deadline ({:?})",
                self.per_peer_timeout,
                self.round_deadline
            );
        }
        if self.epoch_length == 0 {
            bail!("epoch_length must be at least 1 block");
        }
        Ok(())
    }

    /// Window before expiry in which a token is refreshed.
    pub fn refresh_window(&self) -> Duration {
        self.token_ttl.min(self.refresh_ceiling)
    }
}
