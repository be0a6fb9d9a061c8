// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steadfast Expr - Aggregate Expression Matcher
//!
//! Indexes thousands of CEL-subset predicates so that an incoming event finds the
//! evaluables (pauses, cancellation rules) it satisfies without evaluating every
//! expression.
//!
//! # Pipeline
//!
//! ```text
//!  "event.data.id == 'A' && event.data.n > 3"
//!                     │ lift literals
//!                     ▼
//!  "event.data.id == vars.a && event.data.n > vars.b"   vars = {a: "A", b: 3}
//!                     │ parse (cached by lifted text)
//!                     ▼
//!                    AST ──────────────► Program (full evaluation)
//!                     │ walk
//!                     ▼
//!  Node { group: (size 2), ands: [id == "A", n > 3] }
//!                     │ route by (operator, literal)
//!          ┌──────────┼───────────┐
//!          ▼          ▼           ▼
//!     StringEngine NumberEngine NullEngine
//! ```
//!
//! # Matching
//!
//! | Step | What happens |
//! |------|--------------|
//! | Search | Every engine resolves its known idents against the event |
//! | Count | Matched parts are counted per `(evaluable, group)` |
//! | Filter | A group is a candidate once `count >= size` (or on any hit for mixed evaluables) |
//! | Confirm | Candidates and constants are evaluated in full; errors count as no match |
//!
//! # Example
//!
//! ```
//! use steadfast_expr::{AggregateEvaluator, Evaluable};
//! use serde_json::json;
//! use ulid::Ulid;
//!
//! struct Wait { id: Ulid, expr: String }
//!
//! impl Evaluable for Wait {
//!     fn id(&self) -> Ulid { self.id }
//!     fn expression(&self) -> &str { &self.expr }
//! }
//!
//! let agg = AggregateEvaluator::default();
//! agg.add(Wait { id: Ulid::new(), expr: "event.data.id == 'A'".into() }).unwrap();
//!
//! let found = agg.evaluate(&json!({"event": {"data": {"id": "A"}}}));
//! assert_eq!(found.matched.len(), 1);
//! ```

pub mod aggregate;
pub mod ast;
pub mod compiler;
pub mod engine;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod lift;
pub mod parser;
pub mod path;
pub mod tree;

pub use aggregate::{AggregateEvaluator, Classification, Evaluable, Matches};
pub use compiler::{Compiler, Program};
pub use error::{ExprError, Result};
pub use eval::{evaluate, values_equal};
pub use lift::{Lifted, interpolate, lift_literals};
pub use parser::parse;
pub use tree::{GroupId, Node, Operator, ParsedExpression, Predicate};
