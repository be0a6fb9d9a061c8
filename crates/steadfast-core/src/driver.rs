// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step target drivers.
//!
//! A driver carries one request to a function's step target and hands back
//! the raw response. Classifying the response is the executor's job.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{Component, CoreError, Result};
use crate::id::{EnvId, FunctionId, RunId};

/// Header every SDK response carries.
pub const SDK_HEADER: &str = "x-inngest-sdk";

/// Body POSTed to a step target.
#[derive(Debug, Clone, Serialize)]
pub struct StepRequest {
    pub event: Value,
    pub events: Option<Vec<Value>>,
    pub ctx: RequestContext,
    /// Memoized outputs keyed by step id.
    pub steps: BTreeMap<String, Value>,
    pub use_api: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestContext {
    pub run_id: RunId,
    pub attempt: u32,
    /// Step ids in the order they were recorded.
    pub stack: Vec<String>,
    pub env: EnvId,
    pub fn_id: FunctionId,
    /// Set when a single planned step should be run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

/// Raw response from a step target.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResponse {
    pub status: u16,
    /// Whether the SDK header was present.
    pub sdk: bool,
    /// JSON body, or the raw text as a JSON string when it is not JSON.
    pub body: Value,
}

/// Transport to step targets.
#[allow(missing_docs)]
#[async_trait]
pub trait Driver: Send + Sync {
    /// Call `url` once. Transport failures are `TransientInfra`.
    async fn execute(&self, url: &str, request: &StepRequest) -> Result<StepResponse>;
}

/// Driver for HTTP step targets.
#[derive(Debug, Clone)]
pub struct HttpDriver {
    client: reqwest::Client,
}

impl HttpDriver {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::infra(Component::Executor, format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Driver for HttpDriver {
    async fn execute(&self, url: &str, request: &StepRequest) -> Result<StepResponse> {
        debug!(url, run_id = %request.ctx.run_id, attempt = request.ctx.attempt, "Calling step target");

        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| CoreError::infra(Component::Executor, format!("request to {url} failed: {e}")))?;

        let status = response.status().as_u16();
        let sdk = response.headers().contains_key(SDK_HEADER);
        let text = response
            .text()
            .await
            .map_err(|e| CoreError::infra(Component::Executor, format!("reading response from {url}: {e}")))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(StepResponse { status, sdk, body })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Replays canned responses and records requests.
    #[derive(Default)]
    pub(crate) struct ScriptedDriver {
        pub responses: Mutex<VecDeque<Result<StepResponse>>>,
        pub requests: Mutex<Vec<StepRequest>>,
        /// Time each call takes before answering.
        pub stall: Mutex<Option<Duration>>,
    }

    impl ScriptedDriver {
        pub fn push(&self, status: u16, body: Value) {
            self.responses.lock().unwrap().push_back(Ok(StepResponse {
                status,
                sdk: true,
                body,
            }));
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Driver for ScriptedDriver {
        async fn execute(&self, _url: &str, request: &StepRequest) -> Result<StepResponse> {
            self.requests.lock().unwrap().push(request.clone());
            let stall = *self.stall.lock().unwrap();
            if let Some(stall) = stall {
                tokio::time::sleep(stall).await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CoreError::infra(Component::Executor, "no response")))
        }
    }

    fn request(run_id: RunId) -> StepRequest {
        StepRequest {
            event: json!({"name": "user.created", "data": {"id": 1}}),
            events: None,
            ctx: RequestContext {
                run_id,
                attempt: 2,
                stack: vec!["a".into()],
                env: Uuid::nil(),
                fn_id: FunctionId::generate(),
                step_id: None,
            },
            steps: BTreeMap::from([("a".to_string(), json!(1))]),
            use_api: false,
        }
    }

    #[tokio::test]
    async fn test_posts_request_and_reads_opcodes() {
        let server = MockServer::start().await;
        let run_id = RunId::generate();
        Mock::given(method("POST"))
            .and(path("/api/steps"))
            .and(body_partial_json(json!({
                "ctx": {"run_id": run_id.to_string(), "attempt": 2, "stack": ["a"]},
                "steps": {"a": 1},
                "use_api": false
            })))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header(SDK_HEADER, "rust:v1")
                    .set_body_json(json!([{"op": "Step", "id": "b", "data": 2}])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let driver = HttpDriver::new(Duration::from_secs(5)).unwrap();
        let response = driver
            .execute(&format!("{}/api/steps", server.uri()), &request(run_id))
            .await
            .unwrap();

        assert_eq!(response.status, 206);
        assert!(response.sdk);
        assert_eq!(response.body[0]["id"], "b");
    }

    #[tokio::test]
    async fn test_missing_header_and_text_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let driver = HttpDriver::new(Duration::from_secs(5)).unwrap();
        let response = driver
            .execute(&server.uri(), &request(RunId::generate()))
            .await
            .unwrap();
        assert_eq!(response.status, 502);
        assert!(!response.sdk);
        assert_eq!(response.body, json!("bad gateway"));
    }

    #[tokio::test]
    async fn test_connection_error_is_transient() {
        let driver = HttpDriver::new(Duration::from_secs(1)).unwrap();
        let err = driver
            .execute("http://127.0.0.1:1/unreachable", &request(RunId::generate()))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "TRANSIENT_INFRA_ERROR");
    }
}
