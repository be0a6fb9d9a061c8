// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Partition re-peek backoff floor.
pub const PARTITION_BACKOFF_BASE: Duration = Duration::from_millis(50);
/// Partition re-peek backoff ceiling.
pub const PARTITION_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// `min(max, base * 2^attempt)`, saturating.
pub fn exponential(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
    let millis = (base.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(millis).min(max)
}

/// Spread `delay` uniformly over `delay * (1 ± fraction)`.
pub fn with_jitter(delay: Duration, fraction: f64) -> Duration {
    if delay.is_zero() || fraction <= 0.0 {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - fraction)..=(1.0 + fraction));
    delay.mul_f64(factor.max(0.0))
}

/// Delay before a partition that hit a concurrency or throttle gate is peeked again.
pub fn partition_backoff(attempt: u32) -> Duration {
    let delay = exponential(attempt, PARTITION_BACKOFF_BASE, PARTITION_BACKOFF_MAX);
    // Only ever shorten, so the ceiling holds.
    let jitter = rand::thread_rng().gen_range(0.8..=1.0);
    delay.mul_f64(jitter)
}
