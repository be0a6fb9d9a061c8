// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GCRA leaky buckets for throttling (dequeue side) and rate limiting (enqueue side).

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// Bucket shape: `limit` admissions per `period`, up to `burst` at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    pub limit: u32,
    pub period: Duration,
    pub burst: u32,
}

impl Rate {
    pub fn new(limit: u32, period: Duration, burst: u32) -> Self {
        Self {
            limit: limit.max(1),
            period,
            burst: burst.max(1),
        }
    }

    /// Rate limits allow a tenth of the limit as burst.
    pub fn rate_limit(limit: u32, period: Duration) -> Self {
        Self::new(limit, period, limit / 10)
    }

    fn emission_interval(&self) -> Duration {
        self.period / self.limit as i32
    }

    fn tolerance(&self) -> Duration {
        self.emission_interval() * (self.burst as i32 - 1)
    }
}

/// Theoretical-arrival-time buckets keyed by an opaque string.
#[derive(Debug, Default)]
pub struct Gcra {
    buckets: HashMap<String, DateTime<Utc>>,
}

impl Gcra {
    /// Admit one unit for `key` at `now`, or return when the next unit fits.
    pub fn check(&mut self, key: &str, rate: Rate, now: DateTime<Utc>) -> Result<(), DateTime<Utc>> {
        let tat = self
            .buckets
            .get(key)
            .copied()
            .unwrap_or(now)
            .max(now);
        let allow_at = tat - rate.tolerance();
        if allow_at > now {
            return Err(allow_at);
        }
        self.buckets
            .insert(key.to_string(), tat + rate.emission_interval());
        Ok(())
    }

    /// Forget buckets that have fully drained.
    pub fn evict_idle(&mut self, now: DateTime<Utc>) {
        self.buckets.retain(|_, tat| *tat > now);
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
