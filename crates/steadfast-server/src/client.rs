// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP client for a running steadfast server.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The server answered with an error body.
    #[error("API error ({status}) {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ClientError {
    /// 4xx responses are caused by the caller's input.
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::Api { status, .. } if (400..500).contains(status))
    }
}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Send one event through the ingest endpoint. Returns the response body.
    pub async fn send_event(&self, source_key: &str, event: &Value) -> Result<Value, ClientError> {
        self.request(Method::POST, &format!("/e/{source_key}"), Some(event)).await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Value, ClientError> {
        self.request(Method::GET, &format!("/v1/runs/{run_id}"), None).await
    }

    pub async fn cancel_run(&self, run_id: &str) -> Result<Value, ClientError> {
        self.request(Method::POST, &format!("/v1/runs/{run_id}/cancel"), None).await
    }

    pub async fn drain(&self, function_id: &str) -> Result<Value, ClientError> {
        self.request(Method::POST, &format!("/v1/partitions/{function_id}/drain"), None)
            .await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, ClientError> {
        let mut req = self.client.request(method, format!("{}{}", self.base_url, path));
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(api_error(status, &text))
    }
}

fn api_error(status: StatusCode, body: &str) -> ClientError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let field = |name: &str| {
        parsed
            .as_ref()
            .and_then(|v| v.get(name))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    ClientError::Api {
        status: status.as_u16(),
        code: field("code").unwrap_or_else(|| "UNKNOWN".to_string()),
        message: field("error").unwrap_or_else(|| body.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_send_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/e/cli"))
            .and(body_json(json!({"name": "order.created"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ids": ["01J0"]})))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(&format!("{}/", server.uri())).unwrap();
        let body = client
            .send_event("cli", &json!({"name": "order.created"}))
            .await
            .unwrap();
        assert_eq!(body["ids"][0], "01J0");
    }

    #[tokio::test]
    async fn test_api_error_is_user_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/runs/nope"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"error": "bad run id", "code": "VALIDATION_ERROR"})),
            )
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri()).unwrap();
        let err = client.get_run("nope").await.unwrap_err();
        assert!(err.is_user_error());
        match err {
            ClientError::Api { status, code, message } => {
                assert_eq!(status, 400);
                assert_eq!(code, "VALIDATION_ERROR");
                assert_eq!(message, "bad run id");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_not_user_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let client = ApiClient::new(&server.uri()).unwrap();
        let err = client.drain("01J0").await.unwrap_err();
        assert!(!err.is_user_error());
        assert!(matches!(
            err,
            ClientError::Api { status: 502, ref code, ref message } if code == "UNKNOWN" && message == "bad gateway"
        ));
    }
}
