// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steadfast Core - Durable Function Engine
//!
//! Accepts events, starts the functions they trigger and drives every run as
//! a sequence of step requests against the function's HTTP target, with
//! retries, sleeps, event waits, invocations, flow control and cancellation.
//!
//! # Architecture
//!
//! ```text
//!   POST /e/{key}                               step target (SDK)
//!        │                                            ▲
//!        ▼                                            │ POST {event, steps, ctx}
//! ┌─────────────┐  start items  ┌──────────────┐  ┌───┴────────┐
//! │  Lifecycle  │──────────────►│ Partitioned  │─►│  Workers   │
//! │  triggers   │◄──────────────│    Queue     │  │  Executor  │
//! │  pauses     │  follow-ups   └──────────────┘  └─────┬──────┘
//! │  cancels    │                                       │ opcodes
//! └──┬──────┬───┘                                       ▼
//!    │      │ index             ┌──────────────┐  ┌────────────┐
//!    │      └──────────────────►│ Pause index  │  │ StateStore │
//!    │                          │ (expr match) │  │  (stacks)  │
//!    ▼                          └──────────────┘  └────────────┘
//! ┌─────────────┐
//! │ PauseStore  │  timeouts ◄── TimeoutScheduler / CronScheduler / BatchScheduler
//! └─────────────┘
//! ```
//!
//! # Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`queue`] | Per-function partitions, leases, concurrency, throttle, retries, DLQ |
//! | [`state`] | Run metadata and the append-only step stack |
//! | [`executor`] | One step request per item, response classification |
//! | [`pause`] / [`matcher`] | Suspended runs and event-to-pause matching |
//! | [`cancel`] | Bulk cancellation rules checked before dispatch |
//! | [`lifecycle`] | Scheduling rules, follow-ups, run termination, recovery |
//! | [`worker`] / [`scheduler`] | Background loops |
//! | [`runtime`] | Wiring and startup |
//!
//! # Retries
//!
//! Every dispatch of an item counts as an attempt. Infra failures (transport
//! errors, 5xx, non-SDK responses) draw from a separate budget so a flaky
//! target does not consume the function's step retries.

pub mod cancel;
pub mod clock;
pub mod config;
pub mod driver;
pub mod duration;
pub mod error;
pub mod event;
pub mod executor;
pub mod function;
pub mod id;
pub mod lifecycle;
pub mod matcher;
pub mod migrations;
pub mod opcode;
pub mod pause;
pub mod queue;
pub mod run;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod worker;

pub use config::{Config, ConfigError};
pub use error::{Component, CoreError, QueueError, Result};
pub use lifecycle::{IngestResult, Lifecycle, Scheduled};
pub use runtime::{SteadfastRuntime, SteadfastRuntimeBuilder};
