//! HTTP Capability
//!
//! The router and the discoverers do not talk to reqwest directly; they
//! go through this capability so a test harness can script responses
//! in-process.

use async_trait::async_trait;
use serde_json::Value;

use super::error::InferenceError;

#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout_secs: u64,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout_secs: 30,
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
            timeout_secs: 30,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<Value, InferenceError> {
        serde_json::from_str(&self.body)
            .map_err(|e| InferenceError::MalformedResponse(e.to_string()))
    }
}

/// Injectable HTTP transport. Transport-level failures (timeout,
/// connection refused) surface as errors; any HTTP status is a response.
#[async_trait]
pub trait HttpCapability: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, InferenceError>;
}

/// Production transport backed by reqwest.
pub struct ReqwestHttp {
    client: reqwest::Client,
}

impl ReqwestHttp {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestHttp {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpCapability for ReqwestHttp {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, InferenceError> {
        let mut builder = match request.method.as_str() {
            "GET" => self.client.get(&request.url),
            "POST" => self.client.post(&request.url),
            "PUT" => self.client.put(&request.url),
            "DELETE" => self.client.delete(&request.url),
            other => {
                return Err(InferenceError::MalformedResponse(format!(
                    "unsupported http method: {other}"
                )))
            }
        };

        builder = builder.timeout(std::time::Duration::from_secs(request.timeout_secs));
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    url: request.url.clone(),
                    timeout_secs: request.timeout_secs,
                }
            } else {
                InferenceError::Unreachable(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| InferenceError::MalformedResponse(e.to_string()))?;

        Ok(HttpResponse { status, body })
    }
}
