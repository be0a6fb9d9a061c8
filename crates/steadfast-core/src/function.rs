// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function definitions and the versioned function registry.
//!
//! A function is addressed by `(env_id, slug)`. Definitions are immutable:
//! syncing a changed definition produces a new version, and runs keep pointing
//! at the version they were created with.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use steadfast_expr::Compiler;
use tracing::info;

use crate::duration::Period;
use crate::error::{Component, CoreError, Result};
use crate::id::{EnvId, FunctionId};

/// Default retry count for a step when the definition omits it.
pub const DEFAULT_STEP_RETRIES: u32 = 3;

/// Priority factors are clamped to this many seconds either way.
pub const MAX_PRIORITY_FACTOR: i64 = 600;

/// A function definition as synced by an SDK or loaded from a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionConfig {
    pub slug: String,
    #[serde(default)]
    pub name: String,
    pub triggers: Vec<Trigger>,
    pub steps: Vec<StepConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concurrency: Vec<ConcurrencyLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<Throttle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce: Option<Debounce>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub singleton: Option<Singleton>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_events: Option<EventBatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancel: Vec<CancelOn>,
}

/// What starts a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Trigger {
    Event {
        event: String,
        #[serde(default, alias = "if", skip_serializing_if = "Option::is_none")]
        expression: Option<String>,
    },
    Cron {
        cron: String,
    },
}

/// The HTTP target that executes the function's steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub id: String,
    pub url: String,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_retries() -> u32 {
    DEFAULT_STEP_RETRIES
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyScope {
    Account,
    Env,
    #[serde(alias = "function")]
    Fn,
}

impl ConcurrencyScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Account => "a",
            Self::Env => "e",
            Self::Fn => "f",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyLimit {
    #[serde(default = "default_scope")]
    pub scope: ConcurrencyScope,
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

fn default_scope() -> ConcurrencyScope {
    ConcurrencyScope::Fn
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Throttle {
    pub limit: u32,
    pub period: Period,
    #[serde(default)]
    pub burst: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: u32,
    pub period: Period,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Debounce {
    pub period: Period,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Upper bound on how long the first event of a bucket can be delayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Period>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SingletonMode {
    Skip,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Singleton {
    pub mode: SingletonMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBatch {
    pub max_size: usize,
    pub timeout: Period,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Priority {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
}

/// Cancel a run when a matching event arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelOn {
    pub event: String,
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Period>,
}

impl FunctionConfig {
    /// Check structural rules and compile every expression the definition carries.
    pub fn validate(&self, compiler: &Compiler) -> Result<()> {
        let fail = |msg: String| Err(CoreError::validation(Component::Lifecycle, msg));

        if self.slug.trim().is_empty() {
            return fail("function slug is required".into());
        }
        if self.triggers.is_empty() {
            return fail(format!("function '{}' needs at least one trigger", self.slug));
        }
        if self.steps.is_empty() {
            return fail(format!("function '{}' needs at least one step", self.slug));
        }
        if self.batch_events.is_some() && !self.cancel.is_empty() {
            return fail("batching and cancellation are mutually exclusive".into());
        }
        if self.batch_events.is_some() && self.debounce.is_some() {
            return fail("batching and debounce are mutually exclusive".into());
        }

        for trigger in &self.triggers {
            match trigger {
                Trigger::Event { event, expression } => {
                    if event.trim().is_empty() {
                        return fail("event trigger needs an event name".into());
                    }
                    compile_opt(compiler, expression.as_deref())?;
                }
                Trigger::Cron { cron } => {
                    croner::Cron::new(cron).parse().map_err(|e| {
                        CoreError::validation(
                            Component::Lifecycle,
                            format!("invalid cron '{cron}': {e}"),
                        )
                    })?;
                }
            }
        }
        for step in &self.steps {
            if step.url.trim().is_empty() {
                return fail(format!("step '{}' needs a url", step.id));
            }
        }
        for limit in &self.concurrency {
            if limit.limit == 0 {
                return fail("concurrency limit must be greater than 0".into());
            }
            compile_opt(compiler, limit.key.as_deref())?;
        }
        if let Some(t) = &self.throttle {
            compile_opt(compiler, t.key.as_deref())?;
        }
        if let Some(r) = &self.rate_limit {
            if r.limit == 0 {
                return fail("rate limit must be greater than 0".into());
            }
            compile_opt(compiler, r.key.as_deref())?;
        }
        if let Some(d) = &self.debounce {
            compile_opt(compiler, d.key.as_deref())?;
        }
        if let Some(s) = &self.singleton {
            compile_opt(compiler, s.key.as_deref())?;
        }
        if let Some(b) = &self.batch_events {
            if b.max_size < 2 {
                return fail("batch size must be at least 2".into());
            }
            compile_opt(compiler, b.key.as_deref())?;
        }
        if let Some(p) = &self.priority {
            compile_opt(compiler, p.run.as_deref())?;
        }
        for cancel in &self.cancel {
            compile_opt(compiler, cancel.expression.as_deref())?;
        }
        Ok(())
    }

    /// Event names this function is triggered by.
    pub fn event_triggers(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.triggers.iter().filter_map(|t| match t {
            Trigger::Event { event, expression } => Some((event.as_str(), expression.as_deref())),
            Trigger::Cron { .. } => None,
        })
    }

    pub fn crons(&self) -> impl Iterator<Item = &str> {
        self.triggers.iter().filter_map(|t| match t {
            Trigger::Cron { cron } => Some(cron.as_str()),
            Trigger::Event { .. } => None,
        })
    }
}

fn compile_opt(compiler: &Compiler, expression: Option<&str>) -> Result<()> {
    if let Some(expr) = expression {
        compiler
            .compile(expr)
            .map_err(|e| CoreError::compilation(Component::Lifecycle, e))?;
    }
    Ok(())
}

/// One immutable version of a function.
#[derive(Debug, Clone, Serialize)]
pub struct Function {
    pub id: FunctionId,
    pub env_id: EnvId,
    pub version: u32,
    pub config: FunctionConfig,
    pub created_at: DateTime<Utc>,
}

impl Function {
    pub fn slug(&self) -> &str {
        &self.config.slug
    }

    /// The step target invoked for every request of a run.
    pub fn target(&self) -> &StepConfig {
        // validate() guarantees at least one step
        &self.config.steps[0]
    }

    pub fn retries(&self) -> u32 {
        self.target().retries
    }
}

/// Evaluate a key expression against an event and render it as a bucket key.
pub fn evaluate_key(compiler: &Compiler, expression: &str, event: &Value) -> Result<String> {
    let program = compiler
        .compile(expression)
        .map_err(|e| CoreError::compilation(Component::Lifecycle, e))?;
    let value = program
        .evaluate(&json!({ "event": event }))
        .map_err(|e| CoreError::validation(Component::Lifecycle, e.to_string()))?;
    Ok(match value {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Evaluate a priority expression to a factor in seconds.
pub fn evaluate_priority(compiler: &Compiler, expression: &str, event: &Value) -> i64 {
    let Ok(program) = compiler.compile(expression) else {
        return 0;
    };
    let factor = match program.evaluate(&json!({ "event": event })) {
        Ok(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        _ => 0,
    };
    factor.clamp(-MAX_PRIORITY_FACTOR, MAX_PRIORITY_FACTOR)
}

#[derive(Debug, Default)]
struct RegistryInner {
    versions: HashMap<FunctionId, Vec<Arc<Function>>>,
    by_event: HashMap<(EnvId, String), Vec<FunctionId>>,
}

/// Versioned, in-memory function registry.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    compiler: Arc<Compiler>,
    inner: RwLock<RegistryInner>,
}

impl FunctionRegistry {
    pub fn new(compiler: Arc<Compiler>) -> Self {
        Self {
            compiler,
            inner: RwLock::default(),
        }
    }

    /// Register a definition. Unchanged definitions keep their version;
    /// changed ones get the next version.
    pub fn sync(
        &self,
        env_id: EnvId,
        config: FunctionConfig,
        now: DateTime<Utc>,
    ) -> Result<Arc<Function>> {
        config.validate(&self.compiler)?;
        let id = FunctionId::for_slug(env_id, &config.slug);

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let versions = inner.versions.entry(id).or_default();
        if let Some(latest) = versions.last()
            && latest.config == config
        {
            return Ok(latest.clone());
        }

        let version = versions.last().map(|f| f.version + 1).unwrap_or(1);
        let function = Arc::new(Function {
            id,
            env_id,
            version,
            config,
            created_at: now,
        });
        versions.push(function.clone());

        for ids in inner.by_event.values_mut() {
            ids.retain(|f| *f != id);
        }
        inner.by_event.retain(|_, ids| !ids.is_empty());
        for (event, _) in function.config.event_triggers() {
            inner
                .by_event
                .entry((env_id, event.to_string()))
                .or_default()
                .push(id);
        }

        info!(fn_id = %id, slug = %function.slug(), version, "Function synced");
        Ok(function)
    }

    pub fn compiler(&self) -> &Arc<Compiler> {
        &self.compiler
    }

    /// Latest version of a function.
    pub fn get(&self, id: FunctionId) -> Option<Arc<Function>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.versions.get(&id).and_then(|v| v.last().cloned())
    }

    /// A specific version, as referenced by a run.
    pub fn get_version(&self, id: FunctionId, version: u32) -> Option<Arc<Function>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .versions
            .get(&id)
            .and_then(|v| v.iter().find(|f| f.version == version).cloned())
    }

    pub fn by_slug(&self, env_id: EnvId, slug: &str) -> Option<Arc<Function>> {
        self.get(FunctionId::for_slug(env_id, slug))
    }

    /// Latest versions of functions triggered by `event_name` in `env_id`.
    pub fn triggered_by(&self, env_id: EnvId, event_name: &str) -> Vec<Arc<Function>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_event
            .get(&(env_id, event_name.to_string()))
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.versions.get(id).and_then(|v| v.last().cloned()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Latest versions of every function.
    pub fn all(&self) -> Vec<Arc<Function>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .versions
            .values()
            .filter_map(|v| v.last().cloned())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use uuid::Uuid;

    pub(crate) fn config(slug: &str, event: &str) -> FunctionConfig {
        serde_json::from_value(json!({
            "slug": slug,
            "name": slug,
            "triggers": [{"event": event}],
            "steps": [{"id": "step", "url": "http://localhost/api"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_deserialize_full_definition() {
        let cfg: FunctionConfig = serde_json::from_value(json!({
            "slug": "send-email",
            "triggers": [
                {"event": "user.created", "expression": "event.data.plan == 'pro'"},
                {"cron": "0 * * * *"}
            ],
            "steps": [{"id": "step", "url": "http://localhost/api", "retries": 5}],
            "concurrency": [{"scope": "fn", "limit": 2, "key": "event.data.user_id"}],
            "throttle": {"limit": 10, "period": "1m", "burst": 2},
            "rateLimit": {"limit": 1, "period": "1h"},
            "debounce": {"period": "5s", "timeout": "1m"},
            "singleton": {"mode": "skip"},
            "priority": {"run": "event.data.vip ? 120 : 0"},
            "cancel": [{"event": "user.deleted", "if": "event.data.id == 'x'"}]
        }))
        .unwrap();

        assert_eq!(cfg.steps[0].retries, 5);
        assert_eq!(cfg.event_triggers().count(), 1);
        assert_eq!(cfg.crons().collect::<Vec<_>>(), vec!["0 * * * *"]);
        assert_eq!(cfg.concurrency[0].scope, ConcurrencyScope::Fn);
        assert_eq!(cfg.singleton.as_ref().unwrap().mode, SingletonMode::Skip);
        assert!(cfg.validate(&Compiler::default()).is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_parts() {
        let compiler = Compiler::default();
        let mut cfg = config("a", "x");
        cfg.steps.clear();
        assert!(cfg.validate(&compiler).is_err());

        let mut cfg = config("a", "x");
        cfg.triggers.clear();
        assert!(cfg.validate(&compiler).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_expression() {
        let mut cfg = config("a", "x");
        cfg.triggers = vec![Trigger::Event {
            event: "x".into(),
            expression: Some("event.data.id ==".into()),
        }];
        let err = cfg.validate(&Compiler::default()).unwrap_err();
        assert_eq!(err.error_code(), "COMPILATION_ERROR");
    }

    #[test]
    fn test_validate_rejects_batch_with_cancel() {
        let mut cfg = config("a", "x");
        cfg.batch_events = Some(EventBatch {
            max_size: 10,
            timeout: "5s".parse().unwrap(),
            key: None,
        });
        cfg.cancel = vec![CancelOn {
            event: "y".into(),
            expression: None,
            timeout: None,
        }];
        assert!(cfg.validate(&Compiler::default()).is_err());
    }

    #[test]
    fn test_registry_versions() {
        let registry = FunctionRegistry::default();
        let env = Uuid::nil();
        let now = Utc::now();

        let v1 = registry.sync(env, config("a", "x"), now).unwrap();
        let same = registry.sync(env, config("a", "x"), now).unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(same.version, 1);

        let v2 = registry.sync(env, config("a", "y"), now).unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.id, v1.id);
        assert!(registry.triggered_by(env, "x").is_empty());
        assert_eq!(registry.triggered_by(env, "y").len(), 1);
        assert_eq!(registry.get_version(v1.id, 1).unwrap().version, 1);
        assert_eq!(registry.get(v1.id).unwrap().version, 2);
    }

    #[test]
    fn test_evaluate_key_and_priority() {
        let compiler = Compiler::default();
        let event = json!({"data": {"user": "u1", "n": 5, "vip": true}});
        assert_eq!(evaluate_key(&compiler, "event.data.user", &event).unwrap(), "u1");
        assert_eq!(evaluate_key(&compiler, "event.data.n", &event).unwrap(), "5");
        assert_eq!(evaluate_priority(&compiler, "event.data.n * 1000", &event), 600);
        assert_eq!(evaluate_priority(&compiler, "event.data.missing", &event), 0);
    }
}
