//! Block-height gating for registry resyncs and weight commits.

use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EpochState {
    pub last_sync_block: u64,
    pub epoch_length: u64,
    pub last_weight_commit_block: u64,
    pub current_block: u64,
}

#[derive(Clone, Debug)]
pub struct EpochScheduler {
    state: EpochState,
    disable_set_weights: bool,
    /// Completed scoring rounds since startup.
    step: u64,
}

impl EpochScheduler {
    pub fn new(epoch_length: u64, disable_set_weights: bool) -> Self {
        Self {
            state: EpochState { epoch_length: epoch_length.max(1), ..Default::default() },
            disable_set_weights,
            step: 0,
        }
    }

    pub fn state(&self) -> EpochState {
        self.state
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    /// Shorten the epoch to the chain tempo when the chain's is shorter.
    pub fn clamp_with_tempo(&mut self, tempo: Option<u64>) {
        match tempo {
            Some(t) if t > 0 && t <= self.state.epoch_length => {
                info!(tempo = t, configured = self.state.epoch_length, "epoch length set from chain tempo");
                self.state.epoch_length = t;
            }
            Some(t) => {
                debug!(tempo = t, configured = self.state.epoch_length, "keeping configured epoch length");
            }
            None => {
                warn!(configured = self.state.epoch_length, "chain tempo unavailable, keeping configured epoch length");
            }
        }
    }

    pub fn observe_block(&mut self, block: u64) {
        self.state.current_block = block;
    }

    pub fn should_resync(&self, block_now: u64) -> bool {
        block_now.saturating_sub(self.state.last_sync_block) > self.state.epoch_length
    }

    pub fn should_commit_weights(&self, block_now: u64) -> bool {
        if self.step == 0 || self.disable_set_weights {
            return false;
        }
        block_now.saturating_sub(self.state.last_weight_commit_block) > self.state.epoch_length
    }

    pub fn mark_resynced(&mut self, block: u64) {
        self.state.last_sync_block = block;
    }

    pub fn mark_committed(&mut self, block: u64) {
        self.state.last_weight_commit_block = block;
    }

    pub fn complete_round(&mut self) {
        self.step += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resync_gate_is_strict() {
        let mut epochs = EpochScheduler::new(50, false);
        epochs.mark_resynced(100);
        assert!(!epochs.should_resync(140));
        assert!(!epochs.should_resync(150));
        assert!(epochs.should_resync(151));
        epochs.mark_resynced(151);
        assert!(!epochs.should_resync(151));
    }

    #[test]
    fn never_commits_on_first_round() {
        let mut epochs = EpochScheduler::new(10, false);
        assert!(!epochs.should_commit_weights(1_000));
        epochs.complete_round();
        assert!(epochs.should_commit_weights(1_000));
        epochs.mark_committed(1_000);
        assert!(!epochs.should_commit_weights(1_005));
        assert!(epochs.should_commit_weights(1_011));
    }

    #[test]
    fn disabled_never_commits() {
        let mut epochs = EpochScheduler::new(10, true);
        epochs.complete_round();
        assert!(!epochs.should_commit_weights(u64::MAX));
    }

    #[test]
    fn tempo_only_shortens() {
        let mut epochs = EpochScheduler::new(100, false);
        epochs.clamp_with_tempo(Some(360));
        assert_eq!(epochs.state().epoch_length, 100);
        epochs.clamp_with_tempo(None);
        assert_eq!(epochs.state().epoch_length, 100);
        epochs.clamp_with_tempo(Some(0));
        assert_eq!(epochs.state().epoch_length, 100);
        epochs.clamp_with_tempo(Some(72));
        assert_eq!(epochs.state().epoch_length, 72);
    }
}
