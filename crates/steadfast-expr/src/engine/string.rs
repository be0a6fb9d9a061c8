// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! String equality and inequality engine.

use std::collections::HashMap;

use serde_json::Value;

use super::{
    DEFAULT_SHARDS, EngineKind, ExpressionPart, MatchedPart, MatchingEngine, Sharded, hash_str,
    remove_part,
};
use crate::path;
use crate::tree::{GroupId, Operator};

#[derive(Debug, Default)]
struct StringIndex {
    /// `==` parts by hashed literal.
    equality: HashMap<u64, Vec<ExpressionPart>>,
    /// `!=` parts by hashed literal.
    inequality: HashMap<u64, Vec<ExpressionPart>>,
}

impl StringIndex {
    fn is_empty(&self) -> bool {
        self.equality.is_empty() && self.inequality.is_empty()
    }
}

/// Indexes `ident == "lit"` and `ident != "lit"`.
///
/// Bucket hits are verified against the stored literal, so hash collisions never
/// surface a part. A `!=` part whose group is flagged is only returned once every
/// string `==` of that group has matched.
#[derive(Debug)]
pub struct StringEngine {
    index: Sharded<StringIndex>,
}

impl Default for StringEngine {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl StringEngine {
    pub fn new(shards: usize) -> Self {
        Self {
            index: Sharded::new(shards),
        }
    }
}

enum Hit {
    Eq(MatchedPart),
    NotEq(MatchedPart),
}

impl MatchingEngine for StringEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::StringHash
    }

    fn add(&self, part: ExpressionPart) {
        let Some(literal) = part.predicate.literal.as_str() else {
            return;
        };
        let key = hash_str(literal);
        let ident = part.predicate.ident.clone();
        let operator = part.predicate.operator;
        self.index.update(
            &ident,
            |index| {
                let map = match operator {
                    Operator::NotEq => &mut index.inequality,
                    _ => &mut index.equality,
                };
                map.entry(key).or_default().push(part);
            },
            StringIndex::is_empty,
        );
    }

    fn remove(&self, part: &ExpressionPart) {
        let Some(literal) = part.predicate.literal.as_str() else {
            return;
        };
        let key = hash_str(literal);
        self.index.update(
            &part.predicate.ident,
            |index| {
                let map = match part.predicate.operator {
                    Operator::NotEq => &mut index.inequality,
                    _ => &mut index.equality,
                };
                if let Some(parts) = map.get_mut(&key) {
                    remove_part(parts, part);
                    if parts.is_empty() {
                        map.remove(&key);
                    }
                }
            },
            StringIndex::is_empty,
        );
    }

    fn search(&self, input: &Value, concurrency: usize) -> Vec<MatchedPart> {
        let hits = self.index.scan(concurrency, |ident, index, out| {
            let value = path::resolve(input, ident).and_then(Value::as_str);

            if let Some(value) = value
                && let Some(parts) = index.equality.get(&hash_str(value))
            {
                for part in parts {
                    if part.predicate.literal.as_str() == Some(value) {
                        out.push(Hit::Eq(MatchedPart::from(part)));
                    }
                }
            }

            // Absent and non-string values differ from every string literal.
            for parts in index.inequality.values() {
                for part in parts {
                    if value.is_none() || part.predicate.literal.as_str() != value {
                        out.push(Hit::NotEq(MatchedPart::from(part)));
                    }
                }
            }
        });

        let mut eq_counts: HashMap<MatchedPart, u8> = HashMap::new();
        let mut found = Vec::with_capacity(hits.len());
        let mut pending_neq = Vec::new();
        for hit in hits {
            match hit {
                Hit::Eq(m) => {
                    let count = eq_counts.entry(m).or_default();
                    *count = count.saturating_add(1);
                    found.push(m);
                }
                Hit::NotEq(m) => pending_neq.push(m),
            }
        }
        for m in pending_neq {
            if flag_satisfied(m.group_id, eq_counts.get(&m).copied().unwrap_or(0)) {
                found.push(m);
            }
        }
        found
    }

    fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

fn flag_satisfied(group_id: GroupId, eq_count: u8) -> bool {
    group_id.flag() == 0 || eq_count >= group_id.flag()
}
