//! Conway API Client
//!
//! Communicates with Conway's control plane for sandbox management and
//! credits. All traffic runs through the injectable HTTP capability.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::inference::http::{HttpCapability, HttpRequest};
use crate::types::{
    ConwayCapability, CreateSandboxOptions, ExecResult, SandboxInfo,
};

/// Per-call timeout for sandbox operations.
const SANDBOX_TIMEOUT_SECS: u64 = 60;

/// Conway control-plane client.
pub struct ConwayHttpClient {
    pub api_url: String,
    pub api_key: String,
    http: Arc<dyn HttpCapability>,
}

impl ConwayHttpClient {
    pub fn new(api_url: String, api_key: String, http: Arc<dyn HttpCapability>) -> Self {
        Self {
            api_url,
            api_key,
            http,
        }
    }

    /// Send a request to the Conway API and return parsed JSON.
    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.api_url, path);
        let request = HttpRequest {
            method: method.to_string(),
            url,
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                (
                    "Authorization".to_string(),
                    format!("Bearer {}", self.api_key),
                ),
            ],
            body,
            timeout_secs: SANDBOX_TIMEOUT_SECS,
        };

        let response = self
            .http
            .send(request)
            .await
            .with_context(|| format!("Conway API request failed: {method} {path}"))?;

        if !response.is_success() {
            bail!(
                "Conway API error: {} {} -> {}: {}",
                method,
                path,
                response.status,
                response.body
            );
        }

        match serde_json::from_str(&response.body) {
            Ok(json) => Ok(json),
            Err(_) => Ok(Value::String(response.body)),
        }
    }
}

#[async_trait]
impl ConwayCapability for ConwayHttpClient {
    async fn create_sandbox(&self, options: CreateSandboxOptions) -> Result<SandboxInfo> {
        let body = serde_json::to_value(&options)?;
        let result = self.request("POST", "/v1/sandboxes", Some(body)).await?;

        Ok(SandboxInfo {
            id: result["id"].as_str().unwrap_or("").to_string(),
            status: result["status"].as_str().unwrap_or("unknown").to_string(),
            created_at: result["createdAt"]
                .as_str()
                .or_else(|| result["created_at"].as_str())
                .unwrap_or("")
                .to_string(),
        })
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout_ms: Option<u64>,
    ) -> Result<ExecResult> {
        let mut body = serde_json::json!({ "command": command });
        if let Some(t) = timeout_ms {
            body["timeout"] = serde_json::json!(t);
        }

        let result = self
            .request("POST", &format!("/v1/sandboxes/{sandbox_id}/exec"), Some(body))
            .await?;

        Ok(ExecResult {
            stdout: result["stdout"].as_str().unwrap_or("").to_string(),
            stderr: result["stderr"].as_str().unwrap_or("").to_string(),
            exit_code: result["exit_code"]
                .as_i64()
                .or_else(|| result["exitCode"].as_i64())
                .unwrap_or(0) as i32,
        })
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> Result<()> {
        let body = serde_json::json!({ "path": path, "content": content });
        self.request(
            "POST",
            &format!("/v1/sandboxes/{sandbox_id}/files/upload/json"),
            Some(body),
        )
        .await?;
        Ok(())
    }

    async fn delete_sandbox(&self, sandbox_id: &str) -> Result<()> {
        self.request("DELETE", &format!("/v1/sandboxes/{sandbox_id}"), None)
            .await?;
        Ok(())
    }

    async fn get_credits_balance(&self) -> Result<f64> {
        let result = self.request("GET", "/v1/credits/balance", None).await?;
        let cents = result["balanceCents"]
            .as_f64()
            .or_else(|| result["balance_cents"].as_f64())
            .unwrap_or(0.0);
        Ok(cents)
    }

    async fn transfer_credits(&self, to_address: &str, amount_cents: u64) -> Result<()> {
        let body = serde_json::json!({
            "toAddress": to_address,
            "amountCents": amount_cents,
        });
        self.request("POST", "/v1/credits/transfer", Some(body))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::error::InferenceError;
    use crate::inference::http::HttpResponse;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct ScriptedHttp {
        responses: StdMutex<VecDeque<HttpResponse>>,
        calls: StdMutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl HttpCapability for ScriptedHttp {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, InferenceError> {
            self.calls.lock().unwrap().push(request);
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(HttpResponse {
                    status: 500,
                    body: "script exhausted".to_string(),
                }))
        }
    }

    fn client_with(responses: Vec<HttpResponse>) -> (ConwayHttpClient, Arc<ScriptedHttp>) {
        let http = Arc::new(ScriptedHttp {
            responses: StdMutex::new(responses.into()),
            calls: StdMutex::new(Vec::new()),
        });
        let client = ConwayHttpClient::new(
            "https://api.conway.tech".to_string(),
            "cw-key".to_string(),
            http.clone(),
        );
        (client, http)
    }

    #[tokio::test]
    async fn test_exec_parses_both_exit_code_spellings() {
        let (client, _http) = client_with(vec![
            HttpResponse {
                status: 200,
                body: serde_json::json!({ "stdout": "ok", "stderr": "", "exit_code": 0 })
                    .to_string(),
            },
            HttpResponse {
                status: 200,
                body: serde_json::json!({ "stdout": "", "stderr": "boom", "exitCode": 2 })
                    .to_string(),
            },
        ]);

        let first = client.exec("sb-1", "echo ok", None).await.unwrap();
        assert_eq!(first.exit_code, 0);
        assert_eq!(first.stdout, "ok");

        let second = client.exec("sb-1", "false", Some(5000)).await.unwrap();
        assert_eq!(second.exit_code, 2);
    }

    #[tokio::test]
    async fn test_error_status_surfaces_body() {
        let (client, _http) = client_with(vec![HttpResponse {
            status: 404,
            body: "sandbox not found".to_string(),
        }]);

        let err = client.delete_sandbox("sb-gone").await.unwrap_err();
        assert!(err.to_string().contains("404"));
        assert!(err.to_string().contains("sandbox not found"));
    }

    #[tokio::test]
    async fn test_credit_balance_parses_camel_case() {
        let (client, http) = client_with(vec![HttpResponse {
            status: 200,
            body: serde_json::json!({ "balanceCents": 1234.0 }).to_string(),
        }]);

        let balance = client.get_credits_balance().await.unwrap();
        assert!((balance - 1234.0).abs() < f64::EPSILON);

        let calls = http.calls.lock().unwrap();
        assert!(calls[0].url.ends_with("/v1/credits/balance"));
        assert!(calls[0]
            .headers
            .iter()
            .any(|(n, v)| n == "Authorization" && v == "Bearer cw-key"));
    }
}
