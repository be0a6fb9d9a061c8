// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Numeric comparison engine backed by ordered maps.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;

use serde_json::Value;

use super::{
    DEFAULT_SHARDS, EngineKind, ExpressionPart, MatchedPart, MatchingEngine, Sharded, remove_part,
};
use crate::path;
use crate::tree::Operator;

/// `f64` with a total order so it can key a `BTreeMap`.
#[derive(Debug, Clone, Copy)]
struct Key(f64);

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

type Tree = BTreeMap<Key, Vec<ExpressionPart>>;

#[derive(Debug, Default)]
struct NumberIndex {
    /// `ident == v`
    exact: Tree,
    /// `ident > v` and `ident >= v`
    gt: Tree,
    /// `ident < v` and `ident <= v`
    lt: Tree,
}

impl NumberIndex {
    fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.gt.is_empty() && self.lt.is_empty()
    }

    fn tree_mut(&mut self, operator: Operator) -> &mut Tree {
        match operator {
            Operator::Gt | Operator::GtEq => &mut self.gt,
            Operator::Lt | Operator::LtEq => &mut self.lt,
            _ => &mut self.exact,
        }
    }
}

/// Indexes `ident <op> number` for `==, <, <=, >, >=`.
///
/// A query value `q` matches `exact[q]`, every `gt` key up to and including `q`
/// and every `lt` key from `q` upwards. Keys equal to `q` are returned for strict
/// operators too: integers beyond 2^53 can collide as floats, and the full
/// evaluation drops the strict misses.
#[derive(Debug)]
pub struct NumberEngine {
    index: Sharded<NumberIndex>,
}

impl Default for NumberEngine {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl NumberEngine {
    pub fn new(shards: usize) -> Self {
        Self {
            index: Sharded::new(shards),
        }
    }
}

fn key(value: &Value) -> Option<Key> {
    // -0.0 and 0.0 must share a key.
    value
        .as_f64()
        .filter(|f| !f.is_nan())
        .map(|f| Key(if f == 0.0 { 0.0 } else { f }))
}

impl MatchingEngine for NumberEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::BTree
    }

    fn add(&self, part: ExpressionPart) {
        let Some(k) = key(&part.predicate.literal) else {
            return;
        };
        let ident = part.predicate.ident.clone();
        let operator = part.predicate.operator;
        self.index.update(
            &ident,
            |index| index.tree_mut(operator).entry(k).or_default().push(part),
            NumberIndex::is_empty,
        );
    }

    fn remove(&self, part: &ExpressionPart) {
        let Some(k) = key(&part.predicate.literal) else {
            return;
        };
        self.index.update(
            &part.predicate.ident,
            |index| {
                let tree = index.tree_mut(part.predicate.operator);
                if let Some(parts) = tree.get_mut(&k) {
                    remove_part(parts, part);
                    if parts.is_empty() {
                        tree.remove(&k);
                    }
                }
            },
            NumberIndex::is_empty,
        );
    }

    fn search(&self, input: &Value, concurrency: usize) -> Vec<MatchedPart> {
        self.index.scan(concurrency, |ident, index, out| {
            let Some(q) = path::resolve(input, ident).and_then(key) else {
                return;
            };
            let hits = index
                .exact
                .get(&q)
                .into_iter()
                .chain(index.gt.range(..=q).map(|(_, parts)| parts))
                .chain(
                    index
                        .lt
                        .range((Bound::Included(q), Bound::Unbounded))
                        .map(|(_, parts)| parts),
                );
            for parts in hits {
                out.extend(parts.iter().map(MatchedPart::from));
            }
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

    fn engine() -> NumberEngine {
        let engine = NumberEngine::default();
        engine.add(part(1, "n", Operator::Eq, json!(10)));
        engine.add(part(2, "n", Operator::Gt, json!(5)));
        engine.add(part(3, "n", Operator::GtEq, json!(10)));
        engine.add(part(4, "n", Operator::Lt, json!(20)));
        engine.add(part(5, "n", Operator::LtEq, json!(9.5)));
        engine
    }

    #[test]
    fn test_ranges() {
        let engine = engine();
        assert_eq!(ids(&engine.search(&json!({"n": 10}), 1)), vec![1, 2, 3, 4]);
        assert_eq!(ids(&engine.search(&json!({"n": 7}), 1)), vec![2, 4, 5]);
        assert_eq!(ids(&engine.search(&json!({"n": 25.0}), 1)), vec![2, 3]);
        assert_eq!(ids(&engine.search(&json!({"n": -1}), 1)), vec![4, 5]);
    }

    #[test]
    fn test_int_and_float_share_keys() {
        let engine = engine();
        assert_eq!(ids(&engine.search(&json!({"n": 10.0}), 1)), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_non_numeric_values_match_nothing() {
        let engine = engine();
        assert!(engine.search(&json!({"n": "10"}), 1).is_empty());
        assert!(engine.search(&json!({"n": null}), 1).is_empty());
        assert!(engine.search(&json!({}), 1).is_empty());
    }

    #[test]
    fn test_add_remove_restores_empty_state() {
        let engine = NumberEngine::default();
        let fresh = format!("{:?}", NumberEngine::default());
        let parts = [
            part(1, "n", Operator::Eq, json!(1)),
            part(2, "n", Operator::Gt, json!(1)),
            part(3, "m", Operator::LtEq, json!(2.5)),
        ];
        for p in &parts {
            engine.add(p.clone());
        }
        for p in &parts {
            engine.remove(p);
        }
        assert!(engine.is_empty());
        assert_eq!(format!("{engine:?}"), fresh);
    }
}
