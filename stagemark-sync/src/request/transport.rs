//! Transport seam
//!
//! The engine never talks HTTP directly; it hands a [`TransportRequest`] to
//! whatever [`Transport`] the host supplied. [`HttpTransport`] is the
//! default `reqwest` implementation.

use async_trait::async_trait;
use error_common::{RequestError, RequestResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::cancel::AbortSignal;
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportRequest {
    pub method: Method,
    /// Path relative to the transport's base URL, or an absolute URL
    pub url: String,
    pub body: Option<Value>,
}

impl TransportRequest {
    pub fn new(method: Method, url: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            method,
            url: url.into(),
            body,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url, None)
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, url, Some(body))
    }

    pub fn put(url: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Put, url, Some(body))
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url, None)
    }

    /// Serialized body size, used to scale timeouts
    pub fn payload_bytes(&self) -> Option<usize> {
        self.body.as_ref().map(|body| body.to_string().len())
    }
}

/// Host-supplied request function: resolves with a parsed body or fails
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &TransportRequest, signal: AbortSignal) -> RequestResult<Value>;
}

/// `reqwest`-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpTransport {
    /// Timeouts are applied by the request layer, not by the HTTP client
    pub fn new(base_url: impl Into<String>) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SyncError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: None,
        })
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }

    async fn execute(&self, request: &TransportRequest) -> RequestResult<Value> {
        let url = self.resolve(&request.url);
        let mut req = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Patch => self.client.patch(&url),
            Method::Delete => self.client.delete(&url),
        };

        if let Some(body) = &request.body {
            req = req.json(body);
        }
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }

        let response = req.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_reqwest_error)?;

        if !status.is_success() {
            return Err(RequestError::from_status(status.as_u16(), text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &TransportRequest, signal: AbortSignal) -> RequestResult<Value> {
        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(RequestError::Cancelled),
            result = self.execute(request) => result,
        }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> RequestError {
    if let Some(status) = err.status() {
        RequestError::from_status(status.as_u16(), err.to_string())
    } else if err.is_decode() {
        RequestError::Decode(err.to_string())
    } else {
        RequestError::Network(err.to_string())
    }
}
