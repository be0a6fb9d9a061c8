// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background schedulers.
//!
//! Each scheduler owns a poll loop that runs until its shutdown handle is
//! notified. A failed tick is logged and the loop carries on. Every loop
//! also exposes its `tick` so tests can drive it with a manual clock.

pub mod batch;
pub mod cron;
pub mod timeout;

pub use self::batch::{BatchScheduler, BatchSchedulerConfig};
pub use self::cron::{CronScheduler, CronSchedulerConfig};
pub use self::timeout::{TimeoutScheduler, TimeoutSchedulerConfig};
