// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-flight counters for concurrency scopes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One bucket an item counts against, e.g. `f:<fn_id>` or `e:<env_id>:<key hash>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcurrencyKey {
    pub key: String,
    pub limit: u32,
}

impl ConcurrencyKey {
    pub fn new(key: impl Into<String>, limit: u32) -> Self {
        Self {
            key: key.into(),
            limit,
        }
    }
}

/// Counters are only changed through `acquire` and `release`, both under the
/// queue lock, so a counter never exceeds its limit.
#[derive(Debug, Default)]
pub struct ConcurrencyCounters {
    in_flight: HashMap<String, u32>,
}

impl ConcurrencyCounters {
    pub fn in_flight(&self, key: &str) -> u32 {
        self.in_flight.get(key).copied().unwrap_or(0)
    }

    /// The first key without spare capacity.
    pub fn saturated<'a>(&self, keys: impl IntoIterator<Item = &'a ConcurrencyKey>) -> Option<&'a str> {
        keys.into_iter()
            .find(|k| k.limit > 0 && self.in_flight(&k.key) >= k.limit)
            .map(|k| k.key.as_str())
    }

    /// Take a slot in every bucket, or none if any bucket is full.
    pub fn acquire<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a ConcurrencyKey> + Clone,
    ) -> Result<(), String> {
        if let Some(full) = self.saturated(keys.clone()) {
            return Err(full.to_string());
        }
        for k in keys {
            *self.in_flight.entry(k.key.clone()).or_insert(0) += 1;
        }
        Ok(())
    }

    pub fn release<'a>(&mut self, keys: impl IntoIterator<Item = &'a ConcurrencyKey>) {
        for k in keys {
            if let Some(count) = self.in_flight.get_mut(&k.key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.in_flight.remove(&k.key);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_respects_every_bucket() {
        let mut counters = ConcurrencyCounters::default();
        let f = ConcurrencyKey::new("f:1", 1);
        let e = ConcurrencyKey::new("e:1", 5);

        assert!(counters.acquire([&f, &e]).is_ok());
        assert_eq!(counters.acquire([&f, &e]).unwrap_err(), "f:1");
        // A failed acquire takes nothing.
        assert_eq!(counters.in_flight("e:1"), 1);

        counters.release([&f, &e]);
        assert!(counters.is_empty());
        assert!(counters.acquire([&f]).is_ok());
    }

    #[test]
    fn test_zero_limit_is_unbounded() {
        let mut counters = ConcurrencyCounters::default();
        let a = ConcurrencyKey::new("a", 0);
        for _ in 0..10 {
            assert!(counters.acquire([&a]).is_ok());
        }
        assert_eq!(counters.in_flight("a"), 10);
    }
}
