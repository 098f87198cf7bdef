//! # Bounded fan-out of one envelope to many peers
//!
//! One task per candidate in a [`JoinSet`], gated by a semaphore of
//! `max_concurrency` permits. Each call runs under the per-peer timeout; the
//! batch as a whole runs under the round deadline. When the deadline fires the
//! set is aborted and drained before returning, so no task outlives the round.
//!
//! Failures are isolated per peer: a refused connection, a timeout, a
//! malformed frame or even a panicking call only downgrades that peer's
//! record. The returned records are aligned with the candidate order
//! regardless of completion order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::ErrorKind;
use crate::messages::{RequestEnvelope, ResponseRecord};
use crate::protocols::PeerRpc;
use crate::registry::{Peer, RegistrySnapshot, Uid};

/// Default number of concurrent peer calls.
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;

#[derive(Clone, Copy, Debug)]
pub struct DispatchSettings {
    pub per_peer_timeout: Duration,
    pub round_deadline: Duration,
    pub max_concurrency: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            per_peer_timeout: Duration::from_secs(12),
            round_deadline: Duration::from_secs(15),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

pub struct RpcDispatcher<N: PeerRpc + ?Sized> {
    network: Arc<N>,
}

impl<N: PeerRpc + ?Sized> Clone for RpcDispatcher<N> {
    fn clone(&self) -> Self {
        Self { network: self.network.clone() }
    }
}

impl<N: PeerRpc + ?Sized> RpcDispatcher<N> {
    pub fn new(network: Arc<N>) -> Self {
        Self { network }
    }

    /// Query every candidate and return exactly one record per candidate, in
    /// candidate order.
    pub async fn dispatch(
        &self,
        registry: &RegistrySnapshot,
        candidates: &[Uid],
        envelope: &RequestEnvelope,
        settings: &DispatchSettings,
    ) -> Vec<ResponseRecord> {
        let started = Instant::now();
        let deadline = started + settings.round_deadline;
        let gate = Arc::new(Semaphore::new(settings.max_concurrency.max(1)));
        let envelope = Arc::new(envelope.clone());

        let mut slots: Vec<Option<ResponseRecord>> = vec![None; candidates.len()];
        let mut task_slots = HashMap::with_capacity(candidates.len());
        let mut join_set = JoinSet::new();

        for (idx, &uid) in candidates.iter().enumerate() {
            let Some(peer) = registry.get(uid).cloned() else {
                debug!(uid, "candidate missing from registry snapshot");
                slots[idx] = Some(ResponseRecord::failed(uid, ErrorKind::PeerUnreachable));
                continue;
            };
            let network = self.network.clone();
            let gate = gate.clone();
            let envelope = envelope.clone();
            let per_peer_timeout = settings.per_peer_timeout;
            let handle = join_set.spawn(async move {
                let Ok(_permit) = gate.acquire_owned().await else {
                    return ResponseRecord::failed(uid, ErrorKind::PeerUnreachable);
                };
                query_peer(network.as_ref(), &peer, &envelope, per_peer_timeout).await
            });
            task_slots.insert(handle.id(), idx);
        }

        let collected = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = join_set.join_next_with_id().await {
                match joined {
                    Ok((id, record)) => {
                        if let Some(&idx) = task_slots.get(&id) {
                            slots[idx] = Some(record);
                        }
                    }
                    Err(e) => {
                        if let Some(&idx) = task_slots.get(&e.id()) {
                            let kind = if e.is_panic() {
                                warn!(uid = candidates[idx], "peer call panicked");
                                ErrorKind::InvalidResponse
                            } else {
                                ErrorKind::Timeout
                            };
                            slots[idx] = Some(ResponseRecord::failed(candidates[idx], kind));
                        }
                    }
                }
            }
        })
        .await;

        if collected.is_err() {
            let pending = join_set.len();
            warn!(
                pending,
                deadline_ms = settings.round_deadline.as_millis() as u64,
                "round deadline reached, cancelling outstanding peer calls"
            );
            join_set.abort_all();
        }
        let reclaimed = reclaim(&mut join_set).await;
        if reclaimed > 0 {
            trace!(reclaimed, "reclaimed cancelled peer calls");
        }

        let records: Vec<ResponseRecord> = slots
            .into_iter()
            .zip(candidates)
            .map(|(slot, &uid)| {
                slot.unwrap_or_else(|| ResponseRecord::failed(uid, ErrorKind::Timeout))
            })
            .collect();

        debug!(
            candidates = candidates.len(),
            succeeded = records.iter().filter(|r| r.success).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dispatch complete"
        );
        records
    }
}

/// Await every task left in the set so that nothing from this round stays
/// scheduled. Returns how many tasks were drained.
async fn reclaim<T: 'static>(join_set: &mut JoinSet<T>) -> usize {
    let mut drained = 0;
    while join_set.join_next().await.is_some() {
        drained += 1;
    }
    drained
}

async fn query_peer<N: PeerRpc + ?Sized>(
    network: &N,
    peer: &Peer,
    envelope: &RequestEnvelope,
    per_peer_timeout: Duration,
) -> ResponseRecord {
    let uid = peer.uid;
    match tokio::time::timeout(per_peer_timeout, network.call(peer, envelope)).await {
        Err(_) => {
            debug!(uid, addr = %peer.addr, "peer call timed out");
            ResponseRecord::failed(uid, ErrorKind::Timeout)
        }
        Ok(Err(e)) => {
            let kind = ErrorKind::classify(&e);
            debug!(uid, addr = %peer.addr, error = %e, kind = %kind, "peer call failed");
            ResponseRecord::failed(uid, kind)
        }
        Ok(Ok(response)) => {
            let declared_failure = response
                .output
                .get("success")
                .is_some_and(|s| s == "false");
            if response.is_ok() && !declared_failure {
                ResponseRecord::ok(uid, response.output)
            } else {
                debug!(uid, status = response.status, "peer answered with failure");
                ResponseRecord {
                    peer_id: uid,
                    success: false,
                    payload: Some(response.output),
                    error_kind: Some(ErrorKind::InvalidResponse),
                }
            }
        }
    }
}
