//! # Reward computation and per-peer score tracking
//!
//! A round's aggregated batch is submitted to the trust scorer. Its answer is
//! accepted only if every check passes:
//!
//! - no `error` field
//! - `values` non-empty and the same length as the submitted uids
//! - returned `uids` identical (same order) to the submitted uids
//! - every value finite and non-negative, with a positive sum
//!
//! Accepted values are L1-normalized into the reward vector. Anything else
//! yields a stake-only vector: the same length, all zeros. Both kinds go
//! through the same EMA update, so an unavailable scorer shows up as decay.
//!
//! Scores persist as `blake3(body) || bincode(body)`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{ErrorKind, ValidatorError};
use crate::messages::{deserialize_bounded, serialize_frame, ValidateRequest, ValidateResponse};
use crate::protocols::TrustScorer;
use crate::registry::Uid;

const CHECKSUM_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RewardMode {
    Normalized,
    StakeOnly,
}

impl std::fmt::Display for RewardMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RewardMode::Normalized => f.write_str("normalized"),
            RewardMode::StakeOnly => f.write_str("stake_only"),
        }
    }
}

/// Rewards aligned 1:1 with the round's uids.
#[derive(Clone, Debug, PartialEq)]
pub struct RewardVector {
    values: Vec<f64>,
    mode: RewardMode,
    /// Why the stake-only fallback was taken.
    fallback: Option<ErrorKind>,
}

impl RewardVector {
    pub fn stake_only(len: usize, reason: ErrorKind) -> Self {
        Self {
            values: vec![0.0; len],
            mode: RewardMode::StakeOnly,
            fallback: Some(reason),
        }
    }

    /// Run the acceptance checks and normalize.
    pub fn normalized(uids: &[Uid], response: &ValidateResponse) -> Result<Self, ValidatorError> {
        let reject = |reason: String| Err(ValidatorError::ValidationServiceError(reason));

        if let Some(message) = &response.error {
            return reject(format!("scorer reported: {message}"));
        }
        if response.values.is_empty() {
            return reject("empty values".into());
        }
        if response.values.len() != uids.len() {
            return reject(format!(
                "{} values for {} uids",
                response.values.len(),
                uids.len()
            ));
        }
        if response.uids != uids {
            return reject("returned uids differ from submitted uids".into());
        }
        if response.values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return reject("negative or non-finite value".into());
        }
        let sum: f64 = response.values.iter().sum();
        if sum <= 0.0 {
            return reject("values sum to zero".into());
        }

        Ok(Self {
            values: response.values.iter().map(|v| v / sum).collect(),
            mode: RewardMode::Normalized,
            fallback: None,
        })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn mode(&self) -> RewardMode {
        self.mode
    }

    pub fn fallback(&self) -> Option<ErrorKind> {
        self.fallback
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Per-peer exponential moving average score.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreStore {
    scores: BTreeMap<Uid, f64>,
}

impl ScoreStore {
    pub fn get(&self, uid: Uid) -> f64 {
        self.scores.get(&uid).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Uid, f64)> + '_ {
        self.scores.iter().map(|(&uid, &score)| (uid, score))
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Make sure every uid has an entry, starting at zero.
    pub fn cover(&mut self, uids: impl IntoIterator<Item = Uid>) {
        for uid in uids {
            self.scores.entry(uid).or_insert(0.0);
        }
    }

    pub fn reset(&mut self, uid: Uid) {
        self.scores.insert(uid, 0.0);
    }

    fn blend(&mut self, uid: Uid, reward: f64, alpha: f64) {
        let score = self.scores.entry(uid).or_insert(0.0);
        *score = (alpha * reward + (1.0 - alpha) * *score).clamp(0.0, 1.0);
    }

    /// Load from disk. A missing or corrupt file gives an empty store.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(store) => {
                debug!(path = %path.display(), peers = store.len(), "loaded score store");
                store
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "starting from zero scores");
                Self::default()
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read score store {}", path.display()))?;
        if bytes.len() < CHECKSUM_LEN {
            anyhow::bail!("score store truncated ({} bytes)", bytes.len());
        }
        let (checksum, body) = bytes.split_at(CHECKSUM_LEN);
        if blake3::hash(body).as_bytes() != checksum {
            anyhow::bail!("score store checksum mismatch");
        }
        deserialize_bounded(body).context("failed to decode score store")
    }

    /// Write atomically: temp file then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let body = serialize_frame(self).context("failed to encode score store")?;
        let mut bytes = Vec::with_capacity(CHECKSUM_LEN + body.len());
        bytes.extend_from_slice(blake3::hash(&body).as_bytes());
        bytes.extend_from_slice(&body);

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

/// Single writer of the score store.
#[derive(Debug)]
pub struct ScoreTracker {
    alpha: f64,
    store: ScoreStore,
}

impl ScoreTracker {
    pub fn new(alpha: f64, store: ScoreStore) -> Self {
        Self { alpha, store }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn store(&self) -> &ScoreStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ScoreStore {
        &mut self.store
    }

    /// Ask the scorer for values and turn them into rewards. Never fails:
    /// every problem becomes a stake-only vector carrying the reason.
    pub async fn score<S: TrustScorer + ?Sized>(
        &self,
        scorer: &S,
        credential: &str,
        request: &ValidateRequest,
    ) -> RewardVector {
        let len = request.uids.len();
        if request.responses.len() != len {
            error!(uids = len, records = request.responses.len(), "batch misaligned, skipping scorer");
            return RewardVector::stake_only(len, ErrorKind::ArrayLengthMismatch);
        }

        let response = match scorer.validate(credential, request).await {
            Ok(response) => response,
            Err(e) => {
                let kind = if ValidatorError::is_auth_expired(&e) {
                    ErrorKind::AuthExpired
                } else {
                    ErrorKind::ValidationServiceError
                };
                warn!(error = %e, kind = %kind, "scorer call failed, using stake-only rewards");
                return RewardVector::stake_only(len, kind);
            }
        };

        match RewardVector::normalized(&request.uids, &response) {
            Ok(rewards) => rewards,
            Err(e) => {
                warn!(error = %e, "scorer answer rejected, using stake-only rewards");
                RewardVector::stake_only(len, e.kind())
            }
        }
    }

    /// Fold `rewards` into the store. Nothing is written on a length mismatch,
    /// including one detected before the scorer was called.
    pub fn apply_rewards(&mut self, uids: &[Uid], rewards: &RewardVector) -> Result<(), ValidatorError> {
        if rewards.fallback() == Some(ErrorKind::ArrayLengthMismatch) {
            error!(uids = uids.len(), "round batch was misaligned, update skipped");
            return Err(ValidatorError::ArrayLengthMismatch {
                what: "responses",
                expected: uids.len(),
                actual: rewards.len(),
            });
        }
        if rewards.len() != uids.len() {
            error!(uids = uids.len(), rewards = rewards.len(), "reward vector misaligned, update skipped");
            return Err(ValidatorError::ArrayLengthMismatch {
                what: "rewards",
                expected: uids.len(),
                actual: rewards.len(),
            });
        }
        for (&uid, &reward) in uids.iter().zip(rewards.values()) {
            self.store.blend(uid, reward, self.alpha);
        }
        Ok(())
    }

    /// L1-normalized scores over every known uid. All zeros if nothing has
    /// scored yet.
    pub fn weights(&self) -> (Vec<Uid>, Vec<f64>) {
        let uids: Vec<Uid> = self.store.iter().map(|(uid, _)| uid).collect();
        let scores: Vec<f64> = self.store.iter().map(|(_, s)| s).collect();
        let sum: f64 = scores.iter().sum();
        let weights = if sum > 0.0 {
            scores.iter().map(|s| s / sum).collect()
        } else {
            vec![0.0; scores.len()]
        };
        (uids, weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;

    use crate::messages::ResponseRecord;

    struct ScriptedScorer {
        answer: Mutex<Option<Result<ValidateResponse>>>,
        seen_credential: Mutex<Option<String>>,
    }

    impl ScriptedScorer {
        fn new(answer: Result<ValidateResponse>) -> Self {
            Self {
                answer: Mutex::new(Some(answer)),
                seen_credential: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl TrustScorer for ScriptedScorer {
        async fn validate(&self, credential: &str, _request: &ValidateRequest) -> Result<ValidateResponse> {
            *self.seen_credential.lock().unwrap() = Some(credential.to_string());
            self.answer.lock().unwrap().take().unwrap_or_else(|| Err(anyhow!("no script")))
        }
    }

    fn request(uids: &[Uid]) -> ValidateRequest {
        ValidateRequest {
            uids: uids.to_vec(),
            responses: uids.iter().map(|&u| ResponseRecord::self_result(u)).collect(),
            chain: "bittensor".into(),
            uid: *uids.last().unwrap(),
            netuid: 2,
        }
    }

    fn answer(values: &[f64], uids: &[Uid]) -> ValidateResponse {
        ValidateResponse { values: values.to_vec(), uids: uids.to_vec(), error: None }
    }

    #[tokio::test]
    async fn normal_round_rewards() {
        let uids = [1, 3, 9];
        let scorer = ScriptedScorer::new(Ok(answer(&[3.0, 1.0, 0.0], &uids)));
        let tracker = ScoreTracker::new(0.1, ScoreStore::default());

        let rewards = tracker.score(&scorer, "tok", &request(&uids)).await;

        assert_eq!(rewards.mode(), RewardMode::Normalized);
        assert_eq!(rewards.values(), &[0.75, 0.25, 0.0]);
        assert!((rewards.values().iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert_eq!(scorer.seen_credential.lock().unwrap().as_deref(), Some("tok"));
    }

    #[test]
    fn acceptance_checks_fall_back_to_zeros() {
        let uids = [1, 2, 9];
        let cases = [
            ValidateResponse::error("db down"),
            answer(&[], &[]),
            answer(&[1.0, 1.0], &uids),
            answer(&[1.0, 1.0, 1.0], &[2, 1, 9]),
            answer(&[0.0, 0.0, 0.0], &uids),
            answer(&[1.0, f64::NAN, 1.0], &uids),
            answer(&[2.0, -1.0, 0.0], &uids),
            ValidateResponse { error: Some("partial".into()), ..answer(&[1.0, 1.0, 1.0], &uids) },
        ];
        for case in cases {
            let err = RewardVector::normalized(&uids, &case).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ValidationServiceError, "{case:?}");
        }
    }

    #[tokio::test]
    async fn scorer_outage_decays_scores() {
        let uids = [1, 2, 9];
        let mut store = ScoreStore::default();
        for &uid in &uids {
            store.blend(uid, 0.5, 1.0);
        }
        let scorer = ScriptedScorer::new(Ok(ValidateResponse::error("unavailable")));
        let mut tracker = ScoreTracker::new(0.1, store);

        let rewards = tracker.score(&scorer, "tok", &request(&uids)).await;
        assert_eq!(rewards.values(), &[0.0, 0.0, 0.0]);
        assert_eq!(rewards.mode(), RewardMode::StakeOnly);
        assert_eq!(rewards.fallback(), Some(ErrorKind::ValidationServiceError));

        tracker.apply_rewards(&uids, &rewards).unwrap();
        for &uid in &uids {
            assert!((tracker.store().get(uid) - 0.45).abs() < 1e-12);
        }
    }

    #[tokio::test]
    async fn auth_rejection_is_reported() {
        let uids = [4, 9];
        let scorer = ScriptedScorer::new(Err(ValidatorError::AuthExpired.into()));
        let tracker = ScoreTracker::new(0.1, ScoreStore::default());
        let rewards = tracker.score(&scorer, "stale", &request(&uids)).await;
        assert_eq!(rewards.fallback(), Some(ErrorKind::AuthExpired));
        assert_eq!(rewards.values(), &[0.0, 0.0]);
    }

    #[test]
    fn misaligned_rewards_leave_store_untouched() {
        let mut tracker = ScoreTracker::new(0.5, ScoreStore::default());
        tracker.store_mut().cover([1, 2]);
        let rewards = RewardVector::stake_only(3, ErrorKind::ValidationServiceError);
        let err = tracker.apply_rewards(&[1, 2], &rewards).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArrayLengthMismatch);
        assert_eq!(tracker.store().len(), 2);
    }

    #[tokio::test]
    async fn misaligned_batch_skips_update() {
        let uids = [1, 2, 9];
        let mut store = ScoreStore::default();
        for &uid in &uids {
            store.blend(uid, 0.5, 1.0);
        }
        let scorer = ScriptedScorer::new(Ok(answer(&[1.0, 1.0, 1.0], &uids)));
        let mut tracker = ScoreTracker::new(0.1, store.clone());

        let mut batch = request(&uids);
        batch.responses.pop();
        let rewards = tracker.score(&scorer, "tok", &batch).await;
        assert_eq!(rewards.fallback(), Some(ErrorKind::ArrayLengthMismatch));
        assert!(scorer.seen_credential.lock().unwrap().is_none());

        let err = tracker.apply_rewards(&uids, &rewards).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArrayLengthMismatch);
        assert_eq!(tracker.store(), &store);
    }

    #[test]
    fn ema_update() {
        let mut tracker = ScoreTracker::new(0.1, ScoreStore::default());
        let rewards = RewardVector::normalized(&[1, 2], &answer(&[1.0, 3.0], &[1, 2])).unwrap();
        tracker.apply_rewards(&[1, 2], &rewards).unwrap();
        assert!((tracker.store().get(1) - 0.025).abs() < 1e-12);
        assert!((tracker.store().get(2) - 0.075).abs() < 1e-12);
    }

    #[test]
    fn weights_are_l1_normalized() {
        let mut tracker = ScoreTracker::new(1.0, ScoreStore::default());
        tracker.store_mut().cover([5]);
        let (uids, weights) = tracker.weights();
        assert_eq!(uids, vec![5]);
        assert_eq!(weights, vec![0.0]);

        let rewards = RewardVector::normalized(&[1, 2], &answer(&[1.0, 3.0], &[1, 2])).unwrap();
        tracker.apply_rewards(&[1, 2], &rewards).unwrap();
        let (uids, weights) = tracker.weights();
        assert_eq!(uids, vec![1, 2, 5]);
        assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((weights[1] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn store_persists_and_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("scores.bin");

        let mut store = ScoreStore::default();
        store.blend(3, 0.4, 1.0);
        store.cover([7]);
        store.save(&path).unwrap();
        assert_eq!(ScoreStore::load(&path).unwrap(), store);

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();
        assert!(ScoreStore::load(&path).is_err());
        assert!(ScoreStore::load_or_default(&path).is_empty());
        assert!(ScoreStore::load_or_default(&dir.path().join("missing")).is_empty());
    }
}
