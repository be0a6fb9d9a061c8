// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Matching engines.
//!
//! Each engine indexes one family of predicates and, given an event, returns the
//! parts whose predicate holds. Engine state is sharded by ident so that adding
//! or removing parts on unrelated fields never contends on the same lock.
//!
//! | Engine | Operators | Literal |
//! |---|---|---|
//! | [`StringEngine`] | `==`, `!=` | non-empty string |
//! | [`NumberEngine`] | `==`, `<`, `<=`, `>`, `>=` | int / float |
//! | [`NullEngine`] | `==`, `!=` | null |

mod null;
mod number;
mod string;

pub use null::NullEngine;
pub use number::NumberEngine;
pub use string::StringEngine;

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{PoisonError, RwLock};

use serde_json::Value;
use ulid::Ulid;

use crate::tree::{GroupId, Operator, Predicate};

/// Shards per engine.
pub(crate) const DEFAULT_SHARDS: usize = 32;

/// Below this many indexed idents a search stays on the calling thread.
const PARALLEL_THRESHOLD: usize = 256;

/// Which engine indexes a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    StringHash,
    BTree,
    Null,
}

/// Route a predicate to its engine, or `None` when it must be evaluated in full.
pub fn engine_kind(predicate: &Predicate) -> Option<EngineKind> {
    if predicate.literal_ident.is_some() {
        return None;
    }
    match (&predicate.literal, predicate.operator) {
        (Value::Number(_), Operator::NotEq | Operator::Opaque) => None,
        (Value::Number(_), _) => Some(EngineKind::BTree),
        (Value::String(s), Operator::Eq | Operator::NotEq) if !s.is_empty() => {
            Some(EngineKind::StringHash)
        }
        (Value::Null, Operator::Eq | Operator::NotEq) => Some(EngineKind::Null),
        _ => None,
    }
}

/// A predicate owned by one group of one evaluable.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionPart {
    pub eval_id: Ulid,
    pub group_id: GroupId,
    pub predicate: Predicate,
}

/// A part whose predicate matched an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchedPart {
    pub eval_id: Ulid,
    pub group_id: GroupId,
}

impl From<&ExpressionPart> for MatchedPart {
    fn from(part: &ExpressionPart) -> Self {
        Self {
            eval_id: part.eval_id,
            group_id: part.group_id,
        }
    }
}

/// Common interface of the indexing engines.
pub trait MatchingEngine: Send + Sync + fmt::Debug {
    fn kind(&self) -> EngineKind;

    /// Index a part. The caller guarantees `engine_kind(&part.predicate) == Some(self.kind())`.
    fn add(&self, part: ExpressionPart);

    /// Remove a previously added part; empty index entries are dropped.
    fn remove(&self, part: &ExpressionPart);

    /// Every part whose predicate holds for `input`.
    ///
    /// `concurrency` bounds the number of threads the search may fan out to.
    fn search(&self, input: &Value, concurrency: usize) -> Vec<MatchedPart>;

    fn is_empty(&self) -> bool;
}

pub(crate) fn hash_str(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Ident-keyed maps split across independently locked shards.
pub(crate) struct Sharded<T> {
    shards: Vec<RwLock<HashMap<String, T>>>,
}

impl<T: Default + Send + Sync> Sharded<T> {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            shards: (0..count.max(1))
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, ident: &str) -> &RwLock<HashMap<String, T>> {
        let index = (hash_str(ident) % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Mutate the entry for `ident` under its shard's write lock, dropping the
    /// entry afterwards if `is_empty` reports it empty.
    pub(crate) fn update(
        &self,
        ident: &str,
        f: impl FnOnce(&mut T),
        is_empty: impl FnOnce(&T) -> bool,
    ) {
        let mut shard = self.shard(ident).write().unwrap_or_else(PoisonError::into_inner);
        let entry = shard.entry(ident.to_string()).or_default();
        f(entry);
        if is_empty(entry) {
            shard.remove(ident);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| {
            s.read()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
        })
    }

    fn ident_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Visit every `(ident, entry)` under read locks, collecting what `f` pushes.
    ///
    /// Large indexes are split across up to `concurrency` scoped threads.
    pub(crate) fn scan<R, F>(&self, concurrency: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(&str, &T, &mut Vec<R>) + Sync,
    {
        let visit = |shards: &[RwLock<HashMap<String, T>>]| {
            let mut out = Vec::new();
            for shard in shards {
                let shard = shard.read().unwrap_or_else(PoisonError::into_inner);
                for (ident, entry) in shard.iter() {
                    f(ident, entry, &mut out);
                }
            }
            out
        };

        if concurrency <= 1 || self.ident_count() < PARALLEL_THRESHOLD {
            return visit(&self.shards);
        }

        let chunk = self.shards.len().div_ceil(concurrency);
        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .shards
                .chunks(chunk)
                .map(|shards| scope.spawn(|| visit(shards)))
                .collect();
            let mut out = Vec::new();
            for handle in handles {
                match handle.join() {
                    Ok(found) => out.extend(found),
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
            out
        })
    }
}

impl<T: fmt::Debug> fmt::Debug for Sharded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for shard in &self.shards {
            let shard = shard.read().unwrap_or_else(PoisonError::into_inner);
            let mut entries: Vec<_> = shard.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for entry in entries {
                list.entry(&entry);
            }
        }
        list.finish()
    }
}

/// Remove every copy of `part` from `parts`.
pub(crate) fn remove_part(parts: &mut Vec<ExpressionPart>, part: &ExpressionPart) {
    parts.retain(|p| p != part);
}
