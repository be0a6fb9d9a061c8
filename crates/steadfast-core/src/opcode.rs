// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Generator opcodes returned by step targets.
//!
//! A step target answers each request with one of:
//!
//! | Response | Meaning |
//! |----------|---------|
//! | `200` + opcode array | the SDK reports steps, sleeps, waits or invocations |
//! | `200` + anything else | the function returned; the body is its output |
//! | `206` + opcode array | more work to do; keep calling |
//! | `4xx` + `{error, retryable}` | step failure, optionally non-retryable |
//! | `5xx` / transport error | infrastructure failure |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::duration::{parse_duration, resolve_until};
use crate::error::{Component, CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpcodeKind {
    /// A step ran and produced `data`.
    #[serde(alias = "step")]
    Step,
    #[serde(alias = "step_run")]
    StepRun,
    /// The SDK found a step it wants executed in its own request.
    #[serde(alias = "step_planned")]
    StepPlanned,
    #[serde(alias = "sleep")]
    Sleep,
    #[serde(alias = "wait_for_event")]
    WaitForEvent,
    #[serde(alias = "invoke", alias = "invoke_function")]
    InvokeFunction,
    #[serde(alias = "run_complete")]
    RunComplete,
    #[serde(alias = "error", alias = "step_error")]
    StepError,
    #[serde(alias = "none")]
    None,
}

impl OpcodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Step => "Step",
            Self::StepRun => "StepRun",
            Self::StepPlanned => "StepPlanned",
            Self::Sleep => "Sleep",
            Self::WaitForEvent => "WaitForEvent",
            Self::InvokeFunction => "InvokeFunction",
            Self::RunComplete => "RunComplete",
            Self::StepError => "StepError",
            Self::None => "None",
        }
    }

    /// Opcodes that carry a step result worth memoizing.
    pub fn is_step_result(&self) -> bool {
        matches!(self, Self::Step | Self::StepRun)
    }
}

/// Error payload reported by a failing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
            stack: None,
        }
    }

    /// Read a 4xx body. Returns the failure and whether it may be retried.
    ///
    /// Accepts `{"error": "msg", "retryable": false}` as well as
    /// `{"error": {"name", "message", "stack"}}` and `{"message": ...}`.
    pub fn from_body(body: &Value) -> (Self, bool) {
        let retryable = body
            .get("retryable")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let failure = match body.get("error") {
            Some(Value::String(message)) => Self {
                name: body.get("name").and_then(Value::as_str).map(str::to_string),
                message: message.clone(),
                stack: body.get("stack").and_then(Value::as_str).map(str::to_string),
            },
            Some(obj @ Value::Object(_)) => serde_json::from_value(obj.clone())
                .unwrap_or_else(|_| Self::new(obj.to_string())),
            _ => match body.get("message").and_then(Value::as_str) {
                Some(message) => Self::new(message),
                None => Self::new(body.to_string()),
            },
        };
        (failure, retryable)
    }
}

/// Options of a `WaitForEvent` opcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitOpts {
    pub event: String,
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    pub timeout: String,
    #[serde(default, alias = "bindAs", skip_serializing_if = "Option::is_none")]
    pub bind_as: Option<String>,
}

/// Options of an `InvokeFunction` opcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeOpts {
    #[serde(alias = "functionId")]
    pub function_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// One instruction from a step target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorOpcode {
    #[serde(alias = "opcode")]
    pub op: OpcodeKind,
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        alias = "displayName",
        skip_serializing_if = "Option::is_none"
    )]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opts: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
}

impl GeneratorOpcode {
    /// When a `Sleep` opcode should wake. The target comes from
    /// `opts.duration`, falling back to the opcode name.
    pub fn sleep_until(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let raw = self
            .opts
            .as_ref()
            .and_then(|o| o.get("duration"))
            .and_then(Value::as_str)
            .or(self.name.as_deref())
            .ok_or_else(|| {
                CoreError::validation(Component::Executor, "sleep opcode without duration")
            })?;
        resolve_until(raw, now)
    }

    pub fn wait_opts(&self) -> Result<WaitOpts> {
        let opts = self.opts.clone().ok_or_else(|| {
            CoreError::validation(Component::Executor, "wait_for_event opcode without opts")
        })?;
        let opts: WaitOpts = serde_json::from_value(opts)?;
        parse_duration(&opts.timeout)?;
        Ok(opts)
    }

    pub fn invoke_opts(&self) -> Result<InvokeOpts> {
        let opts = self.opts.clone().ok_or_else(|| {
            CoreError::validation(Component::Executor, "invoke opcode without opts")
        })?;
        Ok(serde_json::from_value(opts)?)
    }

    /// The key a resumed run finds this wait's result under.
    pub fn bind_key(&self, opts: &WaitOpts) -> String {
        opts.bind_as.clone().unwrap_or_else(|| self.id.clone())
    }
}

fn is_opcode_shaped(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.contains_key("op") || map.contains_key("opcode"))
}

fn parse_one(index: usize, value: &Value) -> Result<GeneratorOpcode> {
    serde_json::from_value(value.clone()).map_err(|e| {
        CoreError::validation(Component::Executor, format!("invalid opcode at index {index}: {e}"))
    })
}

/// Interpret a response body as opcodes. `Ok(None)` means the body is plain
/// output. A body carrying any opcode-shaped element is an opcode batch, and
/// every element of it must parse.
pub fn parse_opcodes(body: &Value) -> Result<Option<Vec<GeneratorOpcode>>> {
    match body {
        Value::Array(items) if items.iter().any(is_opcode_shaped) => items
            .iter()
            .enumerate()
            .map(|(i, item)| parse_one(i, item))
            .collect::<Result<Vec<_>>>()
            .map(Some),
        value if is_opcode_shaped(value) => Ok(Some(vec![parse_one(0, value)?])),
        _ => Ok(None),
    }
}
