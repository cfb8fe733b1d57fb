// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Built-in HTTP request tool.

use crate::tool::{
    success_result, InvocationContext, ParameterType, Tool, ToolError, ToolParameter, ToolSchema,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// Default per-attempt timeout for tool HTTP calls.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Generic JSON-over-HTTP tool: GET or POST a URL and return the
/// response body. External integrations that only need a plain HTTP
/// exchange can be planned against this tool without a bespoke
/// implementation.
pub struct HttpRequestTool {
    client: Client,
}

impl HttpRequestTool {
    /// Create the tool with the default timeout.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
    }

    /// Create the tool with a custom per-attempt timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }

    fn convert_error(err: reqwest::Error) -> ToolError {
        if err.is_timeout() || err.is_connect() {
            ToolError::Http(err.to_string())
        } else {
            ToolError::Execution {
                message: err.to_string(),
                retriable: false,
            }
        }
    }
}

impl Default for HttpRequestTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpRequestTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn description(&self) -> &str {
        "Perform an HTTP GET or POST request and return the JSON response body"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::from_parameters([
            (
                "url",
                ToolParameter {
                    min_length: Some(8),
                    ..ToolParameter::required(ParameterType::String, "Absolute request URL")
                },
            ),
            (
                "method",
                ToolParameter {
                    enum_values: vec!["GET".to_string(), "POST".to_string()],
                    ..ToolParameter::optional(ParameterType::String, "HTTP method, default GET")
                },
            ),
            (
                "body",
                ToolParameter::optional(ParameterType::Object, "JSON body for POST requests"),
            ),
        ])
    }

    async fn execute(&self, params: Value, ctx: &InvocationContext) -> Result<Value, ToolError> {
        self.schema().validate(&params)?;

        let url = params["url"].as_str().unwrap_or_default();
        let method = params["method"].as_str().unwrap_or("GET").to_uppercase();

        tracing::debug!(
            session = %ctx.session_id,
            url = %url,
            method = %method,
            "Executing HTTP request tool"
        );

        let request = match method.as_str() {
            "POST" => self.client.post(url).json(&params["body"]),
            _ => self.client.get(url),
        };

        let response = request.send().await.map_err(Self::convert_error)?;
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("Failed to read response body"));

        if status.is_server_error() {
            return Err(ToolError::Execution {
                message: format!("[{}] {}", status.as_u16(), body),
                retriable: true,
            });
        }

        if !status.is_success() {
            return Err(ToolError::Execution {
                message: format!("[{}] {}", status.as_u16(), body),
                retriable: false,
            });
        }

        let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::String(body));
        Ok(success_result(json!({
            "http_status": status.as_u16(),
            "body": parsed,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> InvocationContext {
        InvocationContext::new("user-1", "session-1", "wf-1")
    }

    #[tokio::test]
    async fn test_get_request_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/data")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jobs": ["a", "b"]}"#)
            .create_async()
            .await;

        let tool = HttpRequestTool::new();
        let params = json!({"url": format!("{}/data", server.url())});
        let result = tool.execute(params, &ctx()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(result["status"], json!("success"));
        assert_eq!(result["body"]["jobs"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_server_error_is_retriable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/flaky")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let tool = HttpRequestTool::new();
        let params = json!({"url": format!("{}/flaky", server.url())});
        let err = tool.execute(params, &ctx()).await.unwrap_err();

        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/missing")
            .with_status(404)
            .with_body("not found")
            .create_async()
            .await;

        let tool = HttpRequestTool::new();
        let params = json!({"url": format!("{}/missing", server.url())});
        let err = tool.execute(params, &ctx()).await.unwrap_err();

        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_invalid_parameters_rejected_without_request() {
        let tool = HttpRequestTool::new();
        let err = tool.execute(json!({"method": "GET"}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::Invalid(_)));
    }
}
