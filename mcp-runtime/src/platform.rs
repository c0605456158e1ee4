use async_trait::async_trait;
use cloudkit_core::{AccountInfo, EnvCandidate};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::util::client;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("platform returned HTTP {status}: {body}")]
    Status { status: u16, body: Value },
    #[error("not authenticated: {0}")]
    Unauthenticated(String),
}

/// Source of selectable environments. The setup page re-queries it on refresh.
#[async_trait]
pub trait EnvironmentSource: Send + Sync {
    async fn list_environments(&self) -> Result<Vec<EnvCandidate>, PlatformError>;

    async fn account_info(&self) -> Result<Option<AccountInfo>, PlatformError> {
        Ok(None)
    }
}

/// Result of a pass-through platform call, shaped for tool envelopes.
#[derive(Debug)]
pub struct ApiCallResult {
    pub status: u16,
    pub body: Value,
}

impl ApiCallResult {
    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "ok": self.is_success(),
            "status": self.status,
            "body": self.body
        })
    }
}

#[derive(Deserialize)]
struct EnvListResponse {
    #[serde(default, alias = "envList", alias = "environments")]
    envs: Vec<EnvCandidate>,
}

/// Thin HTTP client for the platform API.
pub struct PlatformClient {
    api_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl PlatformClient {
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
            http: client(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<Value>,
    ) -> Result<ApiCallResult, PlatformError> {
        let url = format!("{}{}", self.api_url, path);
        let mut req = self.http.request(method, &url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        tracing::debug!(%url, status, "platform request completed");
        Ok(ApiCallResult { status, body })
    }

    async fn get_json(&self, path: &str) -> Result<Value, PlatformError> {
        let result = self.request(Method::GET, path, &[], None).await?;
        if result.status == 401 {
            return Err(PlatformError::Unauthenticated(
                "the platform rejected the configured credentials".to_string(),
            ));
        }
        if !result.is_success() {
            return Err(PlatformError::Status {
                status: result.status,
                body: result.body,
            });
        }
        Ok(result.body)
    }
}

#[async_trait]
impl EnvironmentSource for PlatformClient {
    async fn list_environments(&self) -> Result<Vec<EnvCandidate>, PlatformError> {
        let body = self.get_json("/v1/envs").await?;
        let parsed: EnvListResponse = match body {
            Value::Array(items) => EnvListResponse {
                envs: serde_json::from_value(Value::Array(items)).unwrap_or_default(),
            },
            other => serde_json::from_value(other).unwrap_or(EnvListResponse { envs: Vec::new() }),
        };
        Ok(parsed.envs)
    }

    async fn account_info(&self) -> Result<Option<AccountInfo>, PlatformError> {
        let body = self.get_json("/v1/account").await?;
        Ok(serde_json::from_value(body).ok())
    }
}
