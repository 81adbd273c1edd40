//! HTTP clients for the reasoning service and the execution sandbox.

use std::time::Duration;

use async_trait::async_trait;
use orchestrator::{
    parse_reasoning_response, CollaboratorError, ExecutionSandbox, FaultKind, ReasoningResponse,
    ReasoningService,
};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sheetflow_core::{Datasets, FilePreview, OutputData};

use crate::config::{ReasoningConfig, SandboxConfig};

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    previews: &'a [FilePreview],
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    code: &'a str,
    datasets: &'a Datasets,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    success: bool,
    #[serde(default)]
    output: OutputData,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpReasoningService {
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    client: Client,
}

impl HttpReasoningService {
    pub fn new(config: &ReasoningConfig, max_tokens: u32) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key(),
            max_tokens,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl ReasoningService for HttpReasoningService {
    async fn generate_code(
        &self,
        prompt: &str,
        previews: &[FilePreview],
    ) -> Result<ReasoningResponse, CollaboratorError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            previews,
            max_tokens: self.max_tokens,
        };

        let mut builder = self
            .client
            .post(format!("{}/generate", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(request_fault)?;
        let body = checked_body(response).await?;

        Ok(parse_reasoning_response(&body))
    }
}

pub struct HttpSandbox {
    base_url: String,
    client: Client,
}

impl HttpSandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl ExecutionSandbox for HttpSandbox {
    async fn execute(
        &self,
        code: &str,
        datasets: &Datasets,
        timeout: Duration,
    ) -> Result<OutputData, CollaboratorError> {
        let request = ExecuteRequest {
            code,
            datasets,
            timeout_ms: timeout.as_millis() as u64,
        };

        let response = self
            .client
            .post(format!("{}/execute", self.base_url))
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(request_fault)?;
        let body = checked_body(response).await?;

        let reply: ExecuteResponse = serde_json::from_str(&body).map_err(|e| {
            CollaboratorError::new(
                FaultKind::InvalidResponse,
                format!("Malformed sandbox reply: {e}"),
            )
        })?;

        if reply.success {
            Ok(reply.output)
        } else {
            Err(CollaboratorError::execution(
                reply
                    .error
                    .unwrap_or_else(|| "Execution failed without an error message".to_string()),
            ))
        }
    }
}

async fn checked_body(response: reqwest::Response) -> Result<String, CollaboratorError> {
    let status = response.status();
    let body = response.text().await.map_err(request_fault)?;

    if status.is_success() {
        Ok(body)
    } else {
        Err(CollaboratorError::new(
            status_kind(status),
            format!("Status {}: {}", status, body),
        ))
    }
}

fn status_kind(status: StatusCode) -> FaultKind {
    match status {
        StatusCode::TOO_MANY_REQUESTS => FaultKind::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => FaultKind::Timeout,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => FaultKind::InvalidInput,
        s if s.is_server_error() => FaultKind::Unavailable,
        _ => FaultKind::InvalidResponse,
    }
}

fn request_fault(error: reqwest::Error) -> CollaboratorError {
    let kind = if error.is_timeout() {
        FaultKind::Timeout
    } else if error.is_connect() || error.is_request() {
        FaultKind::Network
    } else if error.is_decode() || error.is_body() {
        FaultKind::InvalidResponse
    } else {
        FaultKind::Other
    };
    CollaboratorError::new(kind, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_kinds() {
        assert_eq!(
            status_kind(StatusCode::TOO_MANY_REQUESTS),
            FaultKind::RateLimited
        );
        assert_eq!(status_kind(StatusCode::GATEWAY_TIMEOUT), FaultKind::Timeout);
        assert_eq!(
            status_kind(StatusCode::SERVICE_UNAVAILABLE),
            FaultKind::Unavailable
        );
        assert_eq!(status_kind(StatusCode::BAD_REQUEST), FaultKind::InvalidInput);
        assert_eq!(status_kind(StatusCode::NOT_FOUND), FaultKind::InvalidResponse);
    }

    #[test]
    fn test_base_url_trimmed() {
        let sandbox = HttpSandbox::new(&SandboxConfig {
            url: "http://localhost:8200/".to_string(),
        });
        assert_eq!(sandbox.base_url, "http://localhost:8200");
    }

    #[test]
    fn test_execute_reply_defaults() {
        let reply: ExecuteResponse =
            serde_json::from_str(r#"{"success": false, "error": "NameError: x"}"#).unwrap();
        assert!(!reply.success);
        assert!(reply.output.is_empty());
        assert_eq!(reply.error.as_deref(), Some("NameError: x"));
    }
}
