// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The aggregate evaluator: indexes many evaluables and finds the ones an input
//! satisfies without evaluating each of them.
//!
//! Every evaluable is classified on [`AggregateEvaluator::add`]:
//!
//! - **Fast**: every root group consists only of indexed predicates. A group is a
//!   candidate once all of its parts matched.
//! - **Mixed**: every root group has at least one indexed predicate but also
//!   clauses the engines cannot answer. A group is a candidate once any of its
//!   indexed parts matched.
//! - **Constant**: some root group has no indexed predicate at all (or the
//!   expression uses macros). Evaluated against every input.
//!
//! Candidates are always confirmed by a full evaluation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::{debug, trace};
use ulid::Ulid;

use crate::compiler::{Compiler, Program};
use crate::engine::{
    EngineKind, ExpressionPart, MatchedPart, MatchingEngine, NullEngine, NumberEngine,
    StringEngine, engine_kind,
};
use crate::error::{ExprError, Result};
use crate::tree::{GroupId, Node, ParsedExpression, Predicate};

/// Anything with an id and an expression, e.g. a pause or a cancellation rule.
pub trait Evaluable: Send + Sync {
    fn id(&self) -> Ulid;

    /// The expression; an empty string always matches.
    fn expression(&self) -> &str;
}

/// How an evaluable is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Fast,
    Mixed,
    Constant,
}

/// Output of [`AggregateEvaluator::evaluate`].
#[derive(Debug)]
pub struct Matches<E> {
    pub matched: Vec<Arc<E>>,
    /// Number of full evaluations performed.
    pub evaluated: usize,
    /// Evaluations that errored; each counts as "no match".
    pub errors: usize,
}

impl<E> Default for Matches<E> {
    fn default() -> Self {
        Self {
            matched: Vec::new(),
            evaluated: 0,
            errors: 0,
        }
    }
}

struct Entry<E> {
    evaluable: Arc<E>,
    /// `None` for empty expressions.
    program: Option<Program>,
    parts: Vec<ExpressionPart>,
    classification: Classification,
}

struct Registry<E> {
    entries: HashMap<Ulid, Entry<E>>,
    constants: HashSet<Ulid>,
}

/// Indexes evaluables into the string, number and null engines.
pub struct AggregateEvaluator<E> {
    compiler: Arc<Compiler>,
    string: StringEngine,
    number: NumberEngine,
    null: NullEngine,
    registry: RwLock<Registry<E>>,
    concurrency: usize,
}

impl<E: Evaluable> std::fmt::Debug for AggregateEvaluator<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateEvaluator")
            .field("len", &self.len())
            .field("fast", &self.fast_len())
            .field("mixed", &self.mixed_len())
            .field("constant", &self.constant_len())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl<E: Evaluable> Default for AggregateEvaluator<E> {
    fn default() -> Self {
        Self::new(Arc::new(Compiler::default()), num_cpus::get())
    }
}

impl<E: Evaluable> AggregateEvaluator<E> {
    /// `concurrency` bounds the threads a single search may fan out to.
    pub fn new(compiler: Arc<Compiler>, concurrency: usize) -> Self {
        Self {
            compiler,
            string: StringEngine::default(),
            number: NumberEngine::default(),
            null: NullEngine::default(),
            registry: RwLock::new(Registry {
                entries: HashMap::new(),
                constants: HashSet::new(),
            }),
            concurrency: concurrency.max(1),
        }
    }

    fn engine(&self, kind: EngineKind) -> &dyn MatchingEngine {
        match kind {
            EngineKind::StringHash => &self.string,
            EngineKind::BTree => &self.number,
            EngineKind::Null => &self.null,
        }
    }

    /// Index an evaluable. Adding an id that is already present is a no-op that
    /// returns the existing classification.
    ///
    /// Compilation errors reject the evaluable; nothing is indexed.
    pub fn add(&self, evaluable: E) -> Result<Classification> {
        let id = evaluable.id();
        if let Some(existing) = self.read().entries.get(&id) {
            return Ok(existing.classification);
        }

        let expression = evaluable.expression().trim();
        let (program, parts, classification) = if expression.is_empty() {
            (None, Vec::new(), Classification::Constant)
        } else {
            let program = self.compiler.compile(expression)?;
            let parsed = program.predicate_tree(id);
            let (parts, classification) = classify(&parsed);
            (Some(program), parts, classification)
        };

        let mut registry = self.write();
        if let Some(existing) = registry.entries.get(&id) {
            return Ok(existing.classification);
        }
        for part in &parts {
            if let Some(kind) = engine_kind(&part.predicate) {
                self.engine(kind).add(part.clone());
            }
        }
        if classification == Classification::Constant {
            registry.constants.insert(id);
        }
        debug!(evaluable_id = %id, ?classification, parts = parts.len(), "evaluable added");
        registry.entries.insert(
            id,
            Entry {
                evaluable: Arc::new(evaluable),
                program,
                parts,
                classification,
            },
        );
        Ok(classification)
    }

    /// Remove an evaluable and every part it indexed.
    pub fn remove(&self, id: Ulid) -> Result<Arc<E>> {
        let mut registry = self.write();
        let entry = registry.entries.remove(&id).ok_or(ExprError::NotFound(id))?;
        registry.constants.remove(&id);
        for part in &entry.parts {
            if let Some(kind) = engine_kind(&part.predicate) {
                self.engine(kind).remove(part);
            }
        }
        Ok(entry.evaluable)
    }

    pub fn get(&self, id: Ulid) -> Option<Arc<E>> {
        self.read()
            .entries
            .get(&id)
            .map(|e| Arc::clone(&e.evaluable))
    }

    /// Ids whose groups pass the match-count filter, before full evaluation.
    /// Constants are not included.
    pub fn aggregate_match(&self, input: &Value) -> Vec<Ulid> {
        let mut counts: HashMap<MatchedPart, usize> = HashMap::new();
        for engine in [
            &self.string as &dyn MatchingEngine,
            &self.number as &dyn MatchingEngine,
            &self.null as &dyn MatchingEngine,
        ] {
            for hit in engine.search(input, self.concurrency) {
                *counts.entry(hit).or_default() += 1;
            }
        }

        let registry = self.read();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for (hit, count) in counts {
            let Some(entry) = registry.entries.get(&hit.eval_id) else {
                continue;
            };
            let passes = match entry.classification {
                Classification::Fast => count >= usize::from(hit.group_id.size()),
                Classification::Mixed => true,
                Classification::Constant => false,
            };
            if passes && seen.insert(hit.eval_id) {
                candidates.push(hit.eval_id);
            }
        }
        candidates
    }

    /// Every evaluable whose expression is true for `input`.
    pub fn evaluate(&self, input: &Value) -> Matches<E> {
        let candidates = self.aggregate_match(input);
        let registry = self.read();
        let mut result = Matches::default();

        for id in candidates.iter().chain(registry.constants.iter()) {
            let Some(entry) = registry.entries.get(id) else {
                continue;
            };
            let Some(program) = &entry.program else {
                result.matched.push(Arc::clone(&entry.evaluable));
                continue;
            };
            result.evaluated += 1;
            match program.matches(input) {
                Ok(true) => result.matched.push(Arc::clone(&entry.evaluable)),
                Ok(false) => {}
                Err(err) => {
                    trace!(evaluable_id = %id, error = %err, "evaluation failed");
                    result.errors += 1;
                }
            }
        }
        trace!(
            candidates = candidates.len(),
            evaluated = result.evaluated,
            matched = result.matched.len(),
            "aggregate evaluation"
        );
        result
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fast_len(&self) -> usize {
        self.count(Classification::Fast)
    }

    pub fn mixed_len(&self) -> usize {
        self.count(Classification::Mixed)
    }

    /// Evaluables checked against every input.
    pub fn constant_len(&self) -> usize {
        self.read().constants.len()
    }

    /// True when no engine holds any part.
    pub fn engines_empty(&self) -> bool {
        self.string.is_empty() && self.number.is_empty() && self.null.is_empty()
    }

    fn count(&self, classification: Classification) -> usize {
        self.read()
            .entries
            .values()
            .filter(|e| e.classification == classification)
            .count()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry<E>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry<E>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decide how an expression is matched and which parts go into the engines.
fn classify(parsed: &ParsedExpression) -> (Vec<ExpressionPart>, Classification) {
    if parsed.has_macros {
        return (Vec::new(), Classification::Constant);
    }

    let mut parts = Vec::new();
    let mut mixed = false;
    for group in parsed.root_groups() {
        let (indexed, slow) = group_parts(parsed.evaluable_id, group);
        if indexed.is_empty() {
            return (Vec::new(), Classification::Constant);
        }
        mixed |= slow;
        parts.extend(indexed);
    }

    let classification = if mixed {
        Classification::Mixed
    } else {
        Classification::Fast
    };
    (parts, classification)
}

/// The indexable parts of a root group, and whether it also needs full evaluation.
fn group_parts(eval_id: Ulid, group: &Node) -> (Vec<ExpressionPart>, bool) {
    let mut slow = !group.ors.is_empty();
    let mut leaves: Vec<(GroupId, &Predicate)> = Vec::new();
    for child in &group.ands {
        match &child.predicate {
            Some(predicate) if child.is_leaf() => leaves.push((child.group_id, predicate)),
            _ => slow = true,
        }
    }
    if let Some(predicate) = &group.predicate {
        leaves.push((group.group_id, predicate));
    }

    let mut parts = Vec::new();
    for (group_id, predicate) in leaves {
        if engine_kind(predicate).is_some() {
            parts.push(ExpressionPart {
                eval_id,
                group_id,
                predicate: predicate.clone(),
            });
        } else {
            slow = true;
        }
    }
    (parts, slow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct Rule {
        id: Ulid,
        expr: String,
    }

    impl Evaluable for Rule {
        fn id(&self) -> Ulid {
            self.id
        }

        fn expression(&self) -> &str {
            &self.expr
        }
    }

    fn rule(n: u64, expr: &str) -> Rule {
        Rule {
            id: Ulid::from_parts(n, 0),
            expr: expr.to_string(),
        }
    }

    fn evaluator() -> AggregateEvaluator<Rule> {
        AggregateEvaluator::new(Arc::new(Compiler::default()), 2)
    }

    #[test]
    fn test_classification() {
        let agg = evaluator();
        assert_eq!(
            agg.add(rule(1, "event.data.id == 'a' && event.data.n > 3")).unwrap(),
            Classification::Fast
        );
        assert_eq!(
            agg.add(rule(2, "event.data.id == 'a' && size(event.data.items) > 2"))
                .unwrap(),
            Classification::Mixed
        );
        assert_eq!(
            agg.add(rule(3, "event.data.items.exists(i, i == 1)")).unwrap(),
            Classification::Constant
        );
        assert_eq!(
            agg.add(rule(4, "event.data.id == 'a' || event.data.flag == true"))
                .unwrap(),
            Classification::Constant
        );
        assert_eq!(agg.add(rule(5, "")).unwrap(), Classification::Constant);
        assert_eq!(agg.len(), 5);
        assert_eq!(agg.fast_len(), 1);
        assert_eq!(agg.mixed_len(), 1);
        assert_eq!(agg.constant_len(), 3);
    }

    #[test]
    fn test_fast_group_needs_every_part() {
        let agg = evaluator();
        agg.add(rule(1, "event.data.id == 'a' && event.data.n > 3")).unwrap();

        let hit = json!({"event": {"data": {"id": "a", "n": 4}}});
        let partial = json!({"event": {"data": {"id": "a", "n": 1}}});
        assert_eq!(agg.aggregate_match(&hit).len(), 1);
        assert!(agg.aggregate_match(&partial).is_empty());
        assert_eq!(agg.evaluate(&hit).matched.len(), 1);
        assert!(agg.evaluate(&partial).matched.is_empty());
    }

    #[test]
    fn test_or_groups() {
        let agg = evaluator();
        agg.add(rule(1, "event.data.id == 'a' || event.data.id == 'b'")).unwrap();
        let found = agg.evaluate(&json!({"event": {"data": {"id": "b"}}}));
        assert_eq!(found.matched.len(), 1);
        assert_eq!(found.evaluated, 1);
    }

    #[test]
    fn test_errors_count_as_no_match() {
        let agg = evaluator();
        agg.add(rule(1, "event.data.id == 'a' && event.data.n > 3")).unwrap();
        agg.add(rule(2, "event.data.id == 'a' && event.data.s > 3")).unwrap();
        let found = agg.evaluate(&json!({"event": {"data": {"id": "a", "n": 4, "s": "x"}}}));
        assert_eq!(found.matched.len(), 1);
        assert_eq!(found.matched[0].id(), Ulid::from_parts(1, 0));
    }

    #[test]
    fn test_add_is_idempotent_and_remove_unknown_fails() {
        let agg = evaluator();
        agg.add(rule(1, "event.data.id == 'a'")).unwrap();
        agg.add(rule(1, "event.data.id == 'a'")).unwrap();
        assert_eq!(agg.len(), 1);
        assert!(agg.remove(Ulid::from_parts(1, 0)).is_ok());
        assert_eq!(
            agg.remove(Ulid::from_parts(1, 0)).unwrap_err(),
            ExprError::NotFound(Ulid::from_parts(1, 0))
        );
        assert!(agg.engines_empty());
    }

    #[test]
    fn test_compilation_error_rejects_evaluable() {
        let agg = evaluator();
        let err = agg.add(rule(1, "event.data.id == ")).err().unwrap();
        assert!(err.is_compilation());
        assert!(agg.is_empty());
        assert!(agg.engines_empty());
    }
}
