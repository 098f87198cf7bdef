//! Merge dispatch output into the batch handed to the scorer.
//!
//! The batch is `candidates ++ [self]` on both sides, index-aligned. Records
//! are matched to candidates by peer id, so a dispatcher that returned fewer
//! records, extra records or nothing at all still produces one record per
//! candidate.

use std::collections::HashMap;

use anyhow::Result;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::messages::ResponseRecord;
use crate::registry::Uid;

/// Aligned result of one round.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregatedRound {
    pub uids: Vec<Uid>,
    pub records: Vec<ResponseRecord>,
    pub succeeded: usize,
    pub failed: usize,
}

impl AggregatedRound {
    /// Records for the queried peers, without the trailing self record.
    pub fn peer_records(&self) -> &[ResponseRecord] {
        &self.records[..self.records.len().saturating_sub(1)]
    }
}

#[derive(Clone, Debug)]
pub struct ResponseAggregator {
    self_uid: Uid,
}

impl ResponseAggregator {
    pub fn new(self_uid: Uid) -> Self {
        Self { self_uid }
    }

    pub fn aggregate(
        &self,
        candidates: &[Uid],
        dispatched: Result<Vec<ResponseRecord>>,
        self_result: ResponseRecord,
    ) -> AggregatedRound {
        let dispatched = match dispatched {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, candidates = candidates.len(), "dispatch failed, treating batch as empty");
                Vec::new()
            }
        };

        let mut by_uid: HashMap<Uid, ResponseRecord> = HashMap::with_capacity(dispatched.len());
        for record in dispatched {
            by_uid.entry(record.peer_id).or_insert(record);
        }

        let mut uids = Vec::with_capacity(candidates.len() + 1);
        let mut records = Vec::with_capacity(candidates.len() + 1);
        for &uid in candidates {
            let record = by_uid.remove(&uid).unwrap_or_else(|| {
                debug!(uid, "no record for candidate");
                ResponseRecord::failed(uid, ErrorKind::Timeout)
            });
            uids.push(uid);
            records.push(record);
        }
        if !by_uid.is_empty() {
            debug!(extra = by_uid.len(), "dropping records for uids that were not candidates");
        }

        let mut self_result = self_result;
        self_result.peer_id = self.self_uid;
        self_result.success = true;
        self_result.error_kind = None;
        uids.push(self.self_uid);
        records.push(self_result);

        // Our own record counts as a success.
        let succeeded = records.iter().filter(|r| r.success).count();
        let failed = records.len() - succeeded;

        AggregatedRound { uids, records, succeeded, failed }
    }
}
