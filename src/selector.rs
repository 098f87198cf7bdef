//! Candidate selection for a query round.
//!
//! Two sources feed a round: an explicit id list (relayed tasks, the peer
//! listing service) taken verbatim, or a uniform random draw over serving
//! peers backfilled from the rest of the registry. Both pass through the same
//! validity filter and self-exclusion.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, trace};

use crate::error::ValidatorError;
use crate::registry::{Peer, RegistrySnapshot, Uid};

#[derive(Clone, Debug)]
pub struct PeerSelector {
    self_uid: Uid,
}

impl PeerSelector {
    pub fn new(self_uid: Uid) -> Self {
        Self { self_uid }
    }

    pub fn self_uid(&self) -> Uid {
        self.self_uid
    }

    /// Pick the candidate set for a round.
    ///
    /// Returns [`ValidatorError::NoAvailablePeers`] when nothing survives the
    /// filters; the caller must not dispatch in that case.
    pub fn select<R: Rng + ?Sized>(
        &self,
        registry: &RegistrySnapshot,
        explicit_ids: Option<&[Uid]>,
        exclude_self: bool,
        k: usize,
        rng: &mut R,
    ) -> Result<Vec<Uid>, ValidatorError> {
        let selected = match explicit_ids {
            Some(ids) => self.filter_explicit(registry, ids, exclude_self),
            None => self.sample(registry, exclude_self, k, rng),
        };

        if selected.is_empty() {
            debug!(
                explicit = explicit_ids.is_some(),
                registry = registry.len(),
                "no candidates after filtering"
            );
            return Err(ValidatorError::NoAvailablePeers);
        }
        Ok(selected)
    }

    fn admissible(&self, peer: &Peer, exclude_self: bool) -> bool {
        if exclude_self && peer.uid == self.self_uid {
            return false;
        }
        if !peer.is_reachable() {
            trace!(uid = peer.uid, addr = %peer.addr, "skipping unreachable peer");
            return false;
        }
        true
    }

    fn filter_explicit(&self, registry: &RegistrySnapshot, ids: &[Uid], exclude_self: bool) -> Vec<Uid> {
        let mut seen = HashSet::with_capacity(ids.len());
        ids.iter()
            .copied()
            .filter(|uid| seen.insert(*uid))
            .filter(|uid| {
                registry
                    .get(*uid)
                    .is_some_and(|peer| self.admissible(peer, exclude_self))
            })
            .collect()
    }

    fn sample<R: Rng + ?Sized>(
        &self,
        registry: &RegistrySnapshot,
        exclude_self: bool,
        k: usize,
        rng: &mut R,
    ) -> Vec<Uid> {
        let mut serving = Vec::new();
        let mut idle = Vec::new();
        for peer in registry.peers().filter(|p| self.admissible(p, exclude_self)) {
            if peer.is_serving {
                serving.push(peer.uid);
            } else {
                idle.push(peer.uid);
            }
        }

        let mut picked: Vec<Uid> = serving.choose_multiple(rng, k).copied().collect();
        if picked.len() < k {
            let missing = k - picked.len();
            picked.extend(idle.choose_multiple(rng, missing).copied());
        }
        picked
    }
}
