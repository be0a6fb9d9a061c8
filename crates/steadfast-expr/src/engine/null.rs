// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `== null` / `!= null` engine.

use serde_json::Value;

use super::{
    DEFAULT_SHARDS, EngineKind, ExpressionPart, MatchedPart, MatchingEngine, Sharded, remove_part,
};
use crate::path;
use crate::tree::Operator;

#[derive(Debug, Default)]
struct NullIndex {
    null: Vec<ExpressionPart>,
    not_null: Vec<ExpressionPart>,
}

impl NullIndex {
    fn is_empty(&self) -> bool {
        self.null.is_empty() && self.not_null.is_empty()
    }
}

/// Absent paths count as null.
#[derive(Debug)]
pub struct NullEngine {
    index: Sharded<NullIndex>,
}

impl Default for NullEngine {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl NullEngine {
    pub fn new(shards: usize) -> Self {
        Self {
            index: Sharded::new(shards),
        }
    }
}

impl MatchingEngine for NullEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Null
    }

    fn add(&self, part: ExpressionPart) {
        let ident = part.predicate.ident.clone();
        self.index.update(
            &ident,
            |index| match part.predicate.operator {
                Operator::NotEq => index.not_null.push(part),
                _ => index.null.push(part),
            },
            NullIndex::is_empty,
        );
    }

    fn remove(&self, part: &ExpressionPart) {
        self.index.update(
            &part.predicate.ident,
            |index| match part.predicate.operator {
                Operator::NotEq => remove_part(&mut index.not_null, part),
                _ => remove_part(&mut index.null, part),
            },
            NullIndex::is_empty,
        );
    }

    fn search(&self, input: &Value, concurrency: usize) -> Vec<MatchedPart> {
        self.index.scan(concurrency, |ident, index, out| {
            let is_null = path::resolve(input, ident).is_none_or(Value::is_null);
            let parts = if is_null { &index.null } else { &index.not_null };
            out.extend(parts.iter().map(MatchedPart::from));
        })
    }

    fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{ids, part};
    use serde_json::json;

    #[test]
    fn test_null_and_not_null() {
        let engine = NullEngine::default();
        engine.add(part(1, "a", Operator::Eq, Value::Null));
        engine.add(part(2, "a", Operator::NotEq, Value::Null));

        assert_eq!(ids(&engine.search(&json!({}), 1)), vec![1]);
        assert_eq!(ids(&engine.search(&json!({"a": null}), 1)), vec![1]);
        assert_eq!(ids(&engine.search(&json!({"a": 0}), 1)), vec![2]);
        assert_eq!(ids(&engine.search(&json!({"a": ""}), 1)), vec![2]);
    }

    #[test]
    fn test_add_remove_restores_empty_state() {
        let engine = NullEngine::default();
        let p = part(1, "a.b", Operator::NotEq, Value::Null);
        engine.add(p.clone());
        assert!(!engine.is_empty());
        engine.remove(&p);
        assert!(engine.is_empty());
        assert_eq!(format!("{engine:?}"), format!("{:?}", NullEngine::default()));
    }
}
