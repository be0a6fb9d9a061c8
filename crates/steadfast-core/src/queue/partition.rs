// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-function queue shards.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::id::{FunctionId, QueueItemId};

/// Sort key of a ready item: earliest time first, then higher priority, then
/// enqueue order.
pub type ReadyKey = (DateTime<Utc>, Reverse<i64>, u64, QueueItemId);

/// Proof of holding a partition. Workers pass it back to lease items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionLease {
    pub partition: FunctionId,
    pub worker: String,
    pub token: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub(crate) struct HeldLease {
    pub worker: String,
    pub token: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub(crate) struct Partition {
    pub id: FunctionId,
    /// Items not currently leased.
    pub ready: BTreeSet<ReadyKey>,
    /// Ready plus leased items.
    pub items: usize,
    pub lease: Option<HeldLease>,
    /// Consecutive gate failures, for backoff.
    pub gate_failures: u32,
    pub not_before: Option<DateTime<Utc>>,
    pub empty_since: Option<DateTime<Utc>>,
}

impl Partition {
    pub fn new(id: FunctionId) -> Self {
        Self {
            id,
            ready: BTreeSet::new(),
            items: 0,
            lease: None,
            gate_failures: 0,
            not_before: None,
            empty_since: None,
        }
    }

    /// Earliest `earliest_at` among ready items.
    pub fn pointer_score(&self) -> Option<DateTime<Utc>> {
        self.ready.first().map(|(at, ..)| *at)
    }

    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| l.expires_at > now)
    }

    pub fn holds(&self, lease: &PartitionLease, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| {
            l.token == lease.token && l.worker == lease.worker && l.expires_at > now
        })
    }

    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_some_and(|at| at > now)
    }

    pub fn track_emptiness(&mut self, now: DateTime<Utc>) {
        if self.items == 0 {
            self.empty_since.get_or_insert(now);
        } else {
            self.empty_since = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_ready_order() {
        let mut p = Partition::new(FunctionId::generate());
        let t0 = Utc::now();
        let low = QueueItemId::generate();
        let high = QueueItemId::generate();
        let later = QueueItemId::generate();
        p.ready.insert((t0, Reverse(0), 1, low));
        p.ready.insert((t0, Reverse(60), 2, high));
        p.ready.insert((t0 + Duration::seconds(1), Reverse(600), 0, later));

        let order: Vec<QueueItemId> = p.ready.iter().map(|k| k.3).collect();
        assert_eq!(order, vec![high, low, later]);
        assert_eq!(p.pointer_score(), Some(t0));
    }
}
