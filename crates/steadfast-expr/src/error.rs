// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Expression error types.

use thiserror::Error;
use ulid::Ulid;

/// Errors produced while compiling, indexing or evaluating expressions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    /// The expression text could not be tokenized or parsed.
    #[error("parse error at offset {offset}: {message}")]
    Parse {
        /// Byte offset into the source expression
        offset: usize,
        /// What went wrong
        message: String,
    },

    /// The expression parsed but uses a construct outside the supported subset.
    #[error("unsupported expression: {0}")]
    Unsupported(String),

    /// Evaluation failed (type mismatch, unknown function, division by zero).
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// An evaluable or expression part was not present in the aggregator.
    #[error("evaluable not found: {0}")]
    NotFound(Ulid),
}

impl ExprError {
    pub(crate) fn parse(offset: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            offset,
            message: message.into(),
        }
    }

    pub(crate) fn eval(message: impl Into<String>) -> Self {
        Self::Evaluation(message.into())
    }

    /// Whether this error was raised while compiling (as opposed to evaluating).
    pub fn is_compilation(&self) -> bool {
        matches!(self, Self::Parse { .. } | Self::Unsupported(_))
    }
}

/// Result alias for expression operations.
pub type Result<T> = std::result::Result<T, ExprError>;
