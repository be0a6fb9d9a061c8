// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-run checkpoint storage.
//!
//! The stack is the durable memoization of a run: retried requests replay
//! previously recorded step outputs instead of executing the step again.
//! `append_stack` is idempotent on `(run_id, step_id)` and refuses to write
//! to terminal runs.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStateStore;
pub use self::sqlite::SqliteStateStore;

use async_trait::async_trait;
use serde_json::Value;

use crate::cancel::Cancellation;
use crate::error::{Component, CoreError, Result};
use crate::event::Event;
use crate::id::{CancellationId, EventId, PauseId, RunId};
use crate::opcode::OpcodeKind;
use crate::run::{Appended, Run, RunFilter, RunState, RunStatus, StatusUpdate};

/// State store interface used by the executor and lifecycle.
#[allow(missing_docs)]
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn create_run(&self, run: &Run) -> Result<()>;

    async fn load_run(&self, run_id: RunId) -> Result<Option<Run>>;

    /// Run metadata, stack and trigger events. Unknown runs are `NotFound`.
    async fn load(&self, run_id: RunId) -> Result<RunState>;

    /// Append a step result at the next free index.
    ///
    /// A second append for the same step id is dropped and the existing entry
    /// is returned with `inserted == false`. Appending to a terminal run fails
    /// with `RunTerminal`.
    async fn append_stack(
        &self,
        run_id: RunId,
        step_id: &str,
        opcode: OpcodeKind,
        data: Option<Value>,
        attempt: u32,
    ) -> Result<Appended>;

    /// Move the run to `status`. Returns false, without writing, when the run
    /// is already terminal.
    async fn set_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        update: StatusUpdate,
    ) -> Result<bool>;

    async fn get_step_output(&self, run_id: RunId, step_id: &str) -> Result<Option<Value>>;

    async fn save_pause_ref(&self, run_id: RunId, pause_id: PauseId) -> Result<()>;

    async fn remove_pause_ref(&self, run_id: RunId, pause_id: PauseId) -> Result<()>;

    async fn pause_refs(&self, run_id: RunId) -> Result<Vec<PauseId>>;

    async fn save_event(&self, event: &Event) -> Result<()>;

    async fn load_event(&self, event_id: EventId) -> Result<Option<Event>>;

    /// Point a debounced run at its newest trigger event.
    async fn replace_trigger_event(&self, run_id: RunId, event_id: EventId) -> Result<()>;

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>>;

    async fn save_cancellation(&self, cancellation: &Cancellation) -> Result<()>;

    async fn load_cancellations(&self) -> Result<Vec<Cancellation>>;

    async fn delete_cancellation(&self, id: CancellationId) -> Result<bool>;
}

pub(crate) fn run_not_found(run_id: RunId) -> CoreError {
    CoreError::not_found(Component::StateStore, "run", run_id)
}

pub(crate) fn run_terminal(run_id: RunId, status: RunStatus) -> CoreError {
    CoreError::RunTerminal {
        run_id: run_id.to_string(),
        status: status.to_string(),
    }
}
