// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory state store for tests and `memory` deployments.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use super::{StateStore, run_not_found, run_terminal};
use crate::cancel::Cancellation;
use crate::error::Result;
use crate::event::Event;
use crate::id::{CancellationId, EventId, PauseId, RunId};
use crate::opcode::OpcodeKind;
use crate::run::{Appended, Run, RunFilter, RunState, RunStatus, StackEntry, StatusUpdate};

#[derive(Debug, Default)]
struct Inner {
    runs: BTreeMap<RunId, Run>,
    stacks: HashMap<RunId, Vec<StackEntry>>,
    pause_refs: HashMap<RunId, BTreeSet<PauseId>>,
    events: HashMap<EventId, Event>,
    cancellations: BTreeMap<CancellationId, Cancellation>,
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_run(&self, run: &Run) -> Result<()> {
        let mut inner = self.lock();
        inner.runs.insert(run.run_id, run.clone());
        inner.stacks.entry(run.run_id).or_default();
        Ok(())
    }

    async fn load_run(&self, run_id: RunId) -> Result<Option<Run>> {
        Ok(self.lock().runs.get(&run_id).cloned())
    }

    async fn load(&self, run_id: RunId) -> Result<RunState> {
        let inner = self.lock();
        let run = inner
            .runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| run_not_found(run_id))?;
        let stack = inner.stacks.get(&run_id).cloned().unwrap_or_default();
        let events = run
            .trigger_event_ids
            .iter()
            .filter_map(|id| inner.events.get(id).cloned())
            .collect();
        Ok(RunState { run, stack, events })
    }

    async fn append_stack(
        &self,
        run_id: RunId,
        step_id: &str,
        opcode: OpcodeKind,
        data: Option<Value>,
        attempt: u32,
    ) -> Result<Appended> {
        let mut inner = self.lock();
        let status = inner
            .runs
            .get(&run_id)
            .map(|r| r.status)
            .ok_or_else(|| run_not_found(run_id))?;

        let stack = inner.stacks.entry(run_id).or_default();
        if let Some(existing) = stack.iter().find(|e| e.step_id == step_id) {
            return Ok(Appended {
                index: existing.index,
                entry: existing.clone(),
                inserted: false,
            });
        }
        if status.is_terminal() {
            return Err(run_terminal(run_id, status));
        }

        let entry = StackEntry {
            index: stack.len() as u32,
            step_id: step_id.to_string(),
            opcode,
            data,
            attempt,
        };
        stack.push(entry.clone());
        Ok(Appended {
            index: entry.index,
            entry,
            inserted: true,
        })
    }

    async fn set_status(
        &self,
        run_id: RunId,
        status: RunStatus,
        update: StatusUpdate,
    ) -> Result<bool> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| run_not_found(run_id))?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        run.status = status;
        if update.output.is_some() {
            run.output = update.output;
        }
        if update.error.is_some() {
            run.error = update.error;
        }
        if update.ended_at.is_some() {
            run.ended_at = update.ended_at;
        }
        Ok(true)
    }

    async fn get_step_output(&self, run_id: RunId, step_id: &str) -> Result<Option<Value>> {
        let inner = self.lock();
        Ok(inner.stacks.get(&run_id).and_then(|stack| {
            stack
                .iter()
                .find(|e| e.step_id == step_id)
                .map(|e| e.data.clone().unwrap_or(Value::Null))
        }))
    }

    async fn save_pause_ref(&self, run_id: RunId, pause_id: PauseId) -> Result<()> {
        self.lock()
            .pause_refs
            .entry(run_id)
            .or_default()
            .insert(pause_id);
        Ok(())
    }

    async fn remove_pause_ref(&self, run_id: RunId, pause_id: PauseId) -> Result<()> {
        let mut inner = self.lock();
        if let Some(refs) = inner.pause_refs.get_mut(&run_id) {
            refs.remove(&pause_id);
            if refs.is_empty() {
                inner.pause_refs.remove(&run_id);
            }
        }
        Ok(())
    }

    async fn pause_refs(&self, run_id: RunId) -> Result<Vec<PauseId>> {
        Ok(self
            .lock()
            .pause_refs
            .get(&run_id)
            .map(|refs| refs.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn save_event(&self, event: &Event) -> Result<()> {
        self.lock()
            .events
            .entry(event.internal_id)
            .or_insert_with(|| event.clone());
        Ok(())
    }

    async fn load_event(&self, event_id: EventId) -> Result<Option<Event>> {
        Ok(self.lock().events.get(&event_id).cloned())
    }

    async fn replace_trigger_event(&self, run_id: RunId, event_id: EventId) -> Result<()> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| run_not_found(run_id))?;
        run.trigger_event_ids = vec![event_id];
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>> {
        let inner = self.lock();
        let runs = inner.runs.values().filter(|r| filter.accepts(r)).cloned();
        Ok(match filter.limit {
            Some(limit) => runs.take(limit).collect(),
            None => runs.collect(),
        })
    }

    async fn save_cancellation(&self, cancellation: &Cancellation) -> Result<()> {
        self.lock()
            .cancellations
            .insert(cancellation.id, cancellation.clone());
        Ok(())
    }

    async fn load_cancellations(&self) -> Result<Vec<Cancellation>> {
        Ok(self.lock().cancellations.values().cloned().collect())
    }

    async fn delete_cancellation(&self, id: CancellationId) -> Result<bool> {
        Ok(self.lock().cancellations.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::FunctionId;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn run() -> Run {
        Run::new(FunctionId::generate(), 1, Uuid::nil(), vec![], Utc::now())
    }

    #[tokio::test]
    async fn test_append_is_contiguous_and_deduplicated() {
        let store = MemoryStateStore::new();
        let run = run();
        store.create_run(&run).await.unwrap();

        let a = store
            .append_stack(run.run_id, "a", OpcodeKind::Step, Some(json!(1)), 0)
            .await
            .unwrap();
        let b = store
            .append_stack(run.run_id, "b", OpcodeKind::Step, Some(json!(2)), 1)
            .await
            .unwrap();
        let again = store
            .append_stack(run.run_id, "a", OpcodeKind::Step, Some(json!(99)), 2)
            .await
            .unwrap();

        assert_eq!((a.index, b.index), (0, 1));
        assert!(!again.inserted);
        assert_eq!(again.entry.data, Some(json!(1)));
        assert_eq!(
            store.get_step_output(run.run_id, "a").await.unwrap(),
            Some(json!(1))
        );
        assert_eq!(store.load(run.run_id).await.unwrap().stack.len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_run_rejects_writes() {
        let store = MemoryStateStore::new();
        let run = run();
        store.create_run(&run).await.unwrap();
        assert!(
            store
                .set_status(run.run_id, RunStatus::Completed, StatusUpdate::ended(Utc::now()))
                .await
                .unwrap()
        );
        assert!(
            !store
                .set_status(run.run_id, RunStatus::Failed, StatusUpdate::default())
                .await
                .unwrap()
        );
        let err = store
            .append_stack(run.run_id, "a", OpcodeKind::Step, None, 0)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "RUN_TERMINAL");
        assert_eq!(
            store.load_run(run.run_id).await.unwrap().unwrap().status,
            RunStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let store = MemoryStateStore::new();
        let err = store.load(RunId::generate()).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }
}
