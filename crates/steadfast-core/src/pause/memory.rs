// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory pause store.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Pause, PauseStore};
use crate::error::Result;
use crate::id::{EnvId, PauseId, RunId};

#[derive(Debug, Default)]
struct Inner {
    pauses: HashMap<PauseId, Pause>,
    by_event: HashMap<(EnvId, String), BTreeSet<PauseId>>,
    by_timeout: BTreeSet<(DateTime<Utc>, PauseId)>,
}

impl Inner {
    fn take(&mut self, pause_id: PauseId) -> Option<Pause> {
        let pause = self.pauses.remove(&pause_id)?;
        if let Some(name) = &pause.event_name {
            let key = (pause.env_id, name.clone());
            if let Some(ids) = self.by_event.get_mut(&key) {
                ids.remove(&pause_id);
                if ids.is_empty() {
                    self.by_event.remove(&key);
                }
            }
        }
        self.by_timeout.remove(&(pause.timeout_at, pause_id));
        Some(pause)
    }
}

#[derive(Debug, Default)]
pub struct MemoryPauseStore {
    inner: Mutex<Inner>,
}

impl MemoryPauseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PauseStore for MemoryPauseStore {
    async fn create(&self, pause: &Pause) -> Result<PauseId> {
        let mut inner = self.lock();
        inner.take(pause.id);
        if let Some(name) = &pause.event_name {
            inner
                .by_event
                .entry((pause.env_id, name.clone()))
                .or_default()
                .insert(pause.id);
        }
        inner.by_timeout.insert((pause.timeout_at, pause.id));
        inner.pauses.insert(pause.id, pause.clone());
        Ok(pause.id)
    }

    async fn consume(&self, pause_id: PauseId) -> Result<Option<Pause>> {
        Ok(self.lock().take(pause_id))
    }

    async fn by_timeout(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Pause>> {
        let inner = self.lock();
        Ok(inner
            .by_timeout
            .iter()
            .take_while(|(at, _)| *at <= now)
            .take(limit)
            .filter_map(|(_, id)| inner.pauses.get(id).cloned())
            .collect())
    }

    async fn by_event(&self, env_id: EnvId, event_name: &str) -> Result<Vec<PauseId>> {
        let inner = self.lock();
        Ok(inner
            .by_event
            .get(&(env_id, event_name.to_string()))
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn get(&self, pause_id: PauseId) -> Result<Option<Pause>> {
        Ok(self.lock().pauses.get(&pause_id).cloned())
    }

    async fn by_run(&self, run_id: RunId) -> Result<Vec<Pause>> {
        let inner = self.lock();
        let mut pauses: Vec<Pause> = inner
            .pauses
            .values()
            .filter(|p| p.run_id == run_id)
            .cloned()
            .collect();
        pauses.sort_by_key(|p| p.id);
        Ok(pauses)
    }

    async fn by_invoke_correlation(&self, correlation_id: &str) -> Result<Option<Pause>> {
        let inner = self.lock();
        Ok(inner
            .pauses
            .values()
            .find(|p| p.invoke_correlation_id.as_deref() == Some(correlation_id))
            .cloned())
    }

    async fn delete(&self, pause_id: PauseId) -> Result<bool> {
        Ok(self.lock().take(pause_id).is_some())
    }

    async fn delete_by_run(&self, run_id: RunId) -> Result<Vec<PauseId>> {
        let mut inner = self.lock();
        let ids: Vec<PauseId> = inner
            .pauses
            .values()
            .filter(|p| p.run_id == run_id)
            .map(|p| p.id)
            .collect();
        for id in &ids {
            inner.take(*id);
        }
        Ok(ids)
    }

    async fn all(&self) -> Result<Vec<Pause>> {
        let inner = self.lock();
        let mut pauses: Vec<Pause> = inner.pauses.values().cloned().collect();
        pauses.sort_by_key(|p| p.id);
        Ok(pauses)
    }

    async fn list_event_names(&self, env_id: EnvId) -> Result<Vec<String>> {
        let inner = self.lock();
        let names: BTreeSet<String> = inner
            .by_event
            .keys()
            .filter(|(env, _)| *env == env_id)
            .map(|(_, name)| name.clone())
            .collect();
        Ok(names.into_iter().collect())
    }
}
