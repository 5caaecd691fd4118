//! Inference Router
//!
//! Resolves each chat request to a provider + model via the registry,
//! dispatches through the HTTP capability, and maps failures to typed
//! classes. Transient failures retry with jittered backoff; a 404 from
//! a chat-completions endpoint that does not serve chat falls back to
//! the legacy text-completions endpoint exactly once per request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::state::Database;
use crate::survival::governor::{self, FALLBACK_CHEAP_MODEL};
use crate::types::{
    ChatMessage, ChatOptions, ChatResult, InferenceRouter, ModelEntry, Provider, TokenUsage,
};

use super::error::InferenceError;
use super::http::{HttpCapability, HttpResponse};
use super::providers::{self, ProviderEndpoint};

/// Total attempts for transient failures (first try + retries).
const MAX_ATTEMPTS: u32 = 3;

/// Base delay for jittered retry backoff.
const RETRY_BASE_MS: u64 = 500;

/// Estimate the credit cost of a completed call from registry costs.
pub fn estimate_cost_cents(entry: &ModelEntry, usage: &TokenUsage) -> f64 {
    let input = (usage.prompt_tokens as f64 / 1000.0) * entry.input_cost_per_1k;
    let output = (usage.completion_tokens as f64 / 1000.0) * entry.output_cost_per_1k;
    input + output
}

pub struct Router {
    db: Arc<Mutex<Database>>,
    http: Arc<dyn HttpCapability>,
    endpoints: HashMap<Provider, ProviderEndpoint>,
    current_model: Mutex<String>,
    default_model: String,
    low_compute_model: String,
    max_tokens: u32,
}

impl Router {
    pub fn new(
        db: Arc<Mutex<Database>>,
        http: Arc<dyn HttpCapability>,
        config: &crate::types::RuntimeConfig,
    ) -> Self {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            Provider::Conway,
            ProviderEndpoint {
                provider: Provider::Conway,
                base_url: config.conway_api_url.clone(),
                api_key: Some(config.conway_api_key.clone()),
            },
        );
        endpoints.insert(
            Provider::Openai,
            ProviderEndpoint {
                provider: Provider::Openai,
                base_url: config
                    .openai_base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com".to_string()),
                api_key: config.openai_api_key.clone(),
            },
        );
        endpoints.insert(
            Provider::Anthropic,
            ProviderEndpoint {
                provider: Provider::Anthropic,
                base_url: config
                    .anthropic_base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
                api_key: config.anthropic_api_key.clone(),
            },
        );
        endpoints.insert(
            Provider::Ollama,
            ProviderEndpoint {
                provider: Provider::Ollama,
                base_url: config
                    .ollama_base_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string()),
                api_key: None,
            },
        );

        Self {
            db,
            http,
            endpoints,
            current_model: Mutex::new(config.inference_model.clone()),
            default_model: config.inference_model.clone(),
            low_compute_model: config
                .low_compute_model
                .clone()
                .unwrap_or_else(|| FALLBACK_CHEAP_MODEL.to_string()),
            max_tokens: config.max_tokens_per_turn,
        }
    }

    /// Registry lookup with enablement and tier gating.
    fn lookup_model(&self, model_id: &str) -> Result<ModelEntry, InferenceError> {
        let db = self.db.lock().unwrap();
        let entry = db
            .get_model(model_id)
            .ok()
            .flatten()
            .ok_or_else(|| InferenceError::NotInRegistry {
                model_id: model_id.to_string(),
            })?;

        if !entry.enabled {
            return Err(InferenceError::ModelDisabled {
                model_id: model_id.to_string(),
            });
        }

        let tier = governor::current_tier(&db);
        if entry.tier_minimum.rank() > tier.rank() {
            return Err(InferenceError::TierTooLow {
                model_id: model_id.to_string(),
                required: entry.tier_minimum.as_str().to_string(),
                current: tier.as_str().to_string(),
            });
        }

        Ok(entry)
    }

    /// Cheapest enabled model usable at the current tier. Used when the
    /// resolved model turns out to be gone upstream.
    fn registry_fallback_model(&self) -> Option<String> {
        let db = self.db.lock().unwrap();
        let tier = governor::current_tier(&db);
        let mut candidates: Vec<ModelEntry> = db
            .list_enabled_models()
            .unwrap_or_default()
            .into_iter()
            .filter(|m| m.tier_minimum.rank() <= tier.rank())
            .collect();
        candidates.sort_by(|a, b| {
            a.input_cost_per_1k
                .partial_cmp(&b.input_cost_per_1k)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.model_id.cmp(&b.model_id))
        });
        candidates.first().map(|m| m.model_id.clone())
    }

    fn endpoint_for(&self, provider: Provider) -> Result<&ProviderEndpoint, InferenceError> {
        self.endpoints
            .get(&provider)
            .ok_or_else(|| InferenceError::Unreachable(format!(
                "provider {} is not configured",
                provider.as_str()
            )))
    }

    /// One provider round-trip with transient retries. Returns the raw
    /// response so the caller can do protocol-level fallbacks.
    async fn send_with_retries(
        &self,
        build: impl Fn() -> super::http::HttpRequest,
    ) -> Result<HttpResponse, InferenceError> {
        let mut attempt: u32 = 0;
        loop {
            let result = self.http.send(build()).await;
            let retryable = match &result {
                Ok(resp) => resp.status >= 500,
                Err(e) => e.is_transient(),
            };

            if retryable && attempt + 1 < MAX_ATTEMPTS {
                let delay = backoff_with_jitter(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "transient inference failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            return match result {
                Ok(resp) if resp.status >= 500 => Err(InferenceError::Upstream {
                    provider: "upstream".to_string(),
                    status: resp.status,
                    body: truncate(&resp.body, 300),
                }),
                other => other,
            };
        }
    }

    /// Dispatch one resolved request, including the legacy fallback.
    async fn dispatch(
        &self,
        entry: &ModelEntry,
        messages: &[ChatMessage],
        options: &ChatOptions,
        max_tokens: u32,
    ) -> Result<ChatResult, InferenceError> {
        let endpoint = self.endpoint_for(entry.provider)?;

        let response = match entry.provider {
            Provider::Conway | Provider::Openai => {
                self.send_with_retries(|| {
                    providers::openai_chat_request(
                        endpoint,
                        &entry.model_id,
                        messages,
                        options,
                        entry.param_style,
                        max_tokens,
                    )
                })
                .await?
            }
            Provider::Anthropic => {
                self.send_with_retries(|| {
                    providers::anthropic_chat_request(
                        endpoint,
                        &entry.model_id,
                        messages,
                        options,
                        max_tokens,
                    )
                })
                .await?
            }
            Provider::Ollama => {
                self.send_with_retries(|| {
                    providers::ollama_chat_request(endpoint, &entry.model_id, messages)
                })
                .await?
            }
        };

        if response.is_success() {
            let data = response.json()?;
            return match entry.provider {
                Provider::Conway | Provider::Openai => {
                    providers::parse_openai_chat(&data, &entry.model_id)
                }
                Provider::Anthropic => providers::parse_anthropic_chat(&data, &entry.model_id),
                Provider::Ollama => providers::parse_ollama_chat(&data, &entry.model_id),
            };
        }

        // Chat endpoint unsupported: one follow-up against the legacy
        // completions endpoint, per request, never sticky.
        if response.status == 404
            && response.body.contains("endpoint not supported")
            && matches!(entry.provider, Provider::Conway | Provider::Openai)
        {
            info!(model = %entry.model_id, "chat completions unsupported, falling back to /v1/completions");
            let legacy = self
                .http
                .send(providers::openai_legacy_request(
                    endpoint,
                    &entry.model_id,
                    messages,
                    max_tokens,
                ))
                .await?;
            if legacy.is_success() {
                return providers::parse_openai_legacy(&legacy.json()?, &entry.model_id);
            }
            return Err(InferenceError::Upstream {
                provider: entry.provider.as_str().to_string(),
                status: legacy.status,
                body: truncate(&legacy.body, 300),
            });
        }

        match response.status {
            401 | 403 => Err(InferenceError::AuthFailed {
                provider: entry.provider.as_str().to_string(),
            }),
            404 | 400 if looks_like_model_not_found(&response.body) => {
                Err(InferenceError::ModelNotFound {
                    model_id: entry.model_id.clone(),
                })
            }
            status => Err(InferenceError::Upstream {
                provider: entry.provider.as_str().to_string(),
                status,
                body: truncate(&response.body, 300),
            }),
        }
    }
}

#[async_trait]
impl InferenceRouter for Router {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
    ) -> anyhow::Result<ChatResult> {
        // Explicit override beats the (possibly low-compute-swapped)
        // default.
        let resolved = options
            .model
            .clone()
            .unwrap_or_else(|| self.current_model.lock().unwrap().clone());

        let entry = self.lookup_model(&resolved)?;
        let max_tokens = options
            .max_tokens
            .unwrap_or(self.max_tokens)
            .min(entry.max_output_tokens);

        match self.dispatch(&entry, &messages, &options, max_tokens).await {
            Ok(result) => Ok(result),
            Err(InferenceError::ModelNotFound { model_id }) => {
                warn!(model = %model_id, "model gone upstream, disabling registry row");
                {
                    let db = self.db.lock().unwrap();
                    db.set_model_enabled(&model_id, false)?;
                }

                let replacement = self
                    .registry_fallback_model()
                    .ok_or(InferenceError::ModelNotFound { model_id })?;
                let entry = self.lookup_model(&replacement)?;
                let max_tokens = options
                    .max_tokens
                    .unwrap_or(self.max_tokens)
                    .min(entry.max_output_tokens);
                Ok(self.dispatch(&entry, &messages, &options, max_tokens).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Swap the default model between the configured default and the
    /// cheap low-compute model.
    fn set_low_compute_mode(&self, enabled: bool) {
        let mut current = self.current_model.lock().unwrap();
        *current = if enabled {
            self.low_compute_model.clone()
        } else {
            self.default_model.clone()
        };
    }

    fn get_default_model(&self) -> String {
        self.current_model.lock().unwrap().clone()
    }
}

fn backoff_with_jitter(attempt: u32) -> std::time::Duration {
    let base = RETRY_BASE_MS * 2u64.pow(attempt);
    let jitter = rand::thread_rng().gen_range(0..=RETRY_BASE_MS / 2);
    std::time::Duration::from_millis(base + jitter)
}

fn looks_like_model_not_found(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("model") && (lower.contains("not found") || lower.contains("does not exist"))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max).collect();
        format!("{head}...")
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::survival::governor::CURRENT_TIER_KEY;
    use crate::types::{default_config, ParamStyle, SurvivalTier};
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Scripted transport: pops canned responses and records requests.
    struct ScriptedHttp {
        responses: StdMutex<VecDeque<Result<HttpResponse, InferenceError>>>,
        calls: StdMutex<Vec<super::super::http::HttpRequest>>,
    }

    impl ScriptedHttp {
        fn new(responses: Vec<Result<HttpResponse, InferenceError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(responses.into()),
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn call_url(&self, index: usize) -> String {
            self.calls.lock().unwrap()[index].url.clone()
        }
    }

    #[async_trait]
    impl HttpCapability for ScriptedHttp {
        async fn send(
            &self,
            request: super::super::http::HttpRequest,
        ) -> Result<HttpResponse, InferenceError> {
            self.calls.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(HttpResponse {
                    status: 500,
                    body: "script exhausted".to_string(),
                }))
        }
    }

    fn seed_model(db: &Database, model_id: &str, tier: SurvivalTier, enabled: bool) {
        let now = Utc::now().to_rfc3339();
        db.upsert_model(&ModelEntry {
            model_id: model_id.to_string(),
            provider: Provider::Conway,
            display_name: model_id.to_string(),
            tier_minimum: tier,
            input_cost_per_1k: 0.1,
            output_cost_per_1k: 0.4,
            max_output_tokens: 4096,
            context_window: 128_000,
            supports_tools: true,
            supports_vision: false,
            param_style: ParamStyle::MaxTokens,
            enabled,
            created_at: now.clone(),
            updated_at: now,
        })
        .unwrap();
    }

    fn make_router(
        responses: Vec<Result<HttpResponse, InferenceError>>,
    ) -> (Router, Arc<ScriptedHttp>, Arc<Mutex<Database>>) {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        {
            let guard = db.lock().unwrap();
            guard.set_kv(CURRENT_TIER_KEY, "normal").unwrap();
            seed_model(&guard, "gpt-4o", SurvivalTier::Normal, true);
        }
        let http = ScriptedHttp::new(responses);
        let router = Router::new(db.clone(), http.clone(), &default_config());
        (router, http, db)
    }

    fn ok_chat_response(content: &str) -> Result<HttpResponse, InferenceError> {
        Ok(HttpResponse {
            status: 200,
            body: serde_json::json!({
                "id": "cmpl-1",
                "model": "gpt-4o",
                "choices": [{
                    "message": { "role": "assistant", "content": content },
                    "finish_reason": "stop"
                }],
                "usage": { "prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5 }
            })
            .to_string(),
        })
    }

    #[tokio::test]
    async fn test_chat_endpoint_fallback_issues_exactly_one_legacy_call() {
        let (router, http, _db) = make_router(vec![
            Ok(HttpResponse {
                status: 404,
                body: r#"{"error":"/v1/chat/completions endpoint not supported"}"#.to_string(),
            }),
            Ok(HttpResponse {
                status: 200,
                body: serde_json::json!({
                    "model": "gpt-4o",
                    "choices": [{ "text": "legacy ok", "finish_reason": "stop" }],
                    "usage": { "prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5 }
                })
                .to_string(),
            }),
        ]);

        let result = router
            .chat(vec![ChatMessage::user("hi")], ChatOptions::default())
            .await
            .unwrap();

        assert_eq!(result.message.content, "legacy ok");
        assert_eq!(http.call_count(), 2);
        assert!(http.call_url(0).ends_with("/v1/chat/completions"));
        assert!(http.call_url(1).ends_with("/v1/completions"));
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let (router, http, _db) = make_router(vec![Ok(HttpResponse {
            status: 401,
            body: r#"{"error":"invalid api key"}"#.to_string(),
        })]);

        let err = router
            .chat(vec![ChatMessage::user("hi")], ChatOptions::default())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("authentication rejected"));
        assert_eq!(http.call_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_5xx_is_retried_then_succeeds() {
        let (router, http, _db) = make_router(vec![
            Ok(HttpResponse {
                status: 503,
                body: "overloaded".to_string(),
            }),
            Ok(HttpResponse {
                status: 503,
                body: "overloaded".to_string(),
            }),
            ok_chat_response("third time lucky"),
        ]);

        let result = router
            .chat(vec![ChatMessage::user("hi")], ChatOptions::default())
            .await
            .unwrap();

        assert_eq!(result.message.content, "third time lucky");
        assert_eq!(http.call_count(), 3);
    }

    #[tokio::test]
    async fn test_disabled_model_is_rejected_before_dispatch() {
        let (router, http, db) = make_router(vec![]);
        {
            let guard = db.lock().unwrap();
            guard.set_model_enabled("gpt-4o", false).unwrap();
        }

        let err = router
            .chat(vec![ChatMessage::user("hi")], ChatOptions::default())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("disabled"));
        assert_eq!(http.call_count(), 0);
    }

    #[tokio::test]
    async fn test_tier_minimum_gates_model() {
        let (router, http, db) = make_router(vec![]);
        {
            let guard = db.lock().unwrap();
            seed_model(&guard, "o1-pro", SurvivalTier::High, true);
        }

        let err = router
            .chat(
                vec![ChatMessage::user("hi")],
                ChatOptions {
                    model: Some("o1-pro".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("requires tier"));
        assert_eq!(http.call_count(), 0);
    }

    #[tokio::test]
    async fn test_model_not_found_disables_row_and_reresolves() {
        let (router, http, db) = make_router(vec![
            Ok(HttpResponse {
                status: 404,
                body: r#"{"error":{"message":"The model 'gpt-4o' does not exist"}}"#.to_string(),
            }),
            ok_chat_response("fallback model answered"),
        ]);
        {
            let guard = db.lock().unwrap();
            seed_model(&guard, "gpt-4o-mini", SurvivalTier::Normal, true);
        }

        let result = router
            .chat(vec![ChatMessage::user("hi")], ChatOptions::default())
            .await
            .unwrap();

        assert_eq!(result.message.content, "fallback model answered");
        assert_eq!(http.call_count(), 2);
        let guard = db.lock().unwrap();
        assert!(!guard.get_model("gpt-4o").unwrap().unwrap().enabled);
    }

    #[tokio::test]
    async fn test_low_compute_mode_swaps_default_model() {
        let (router, _http, _db) = make_router(vec![]);
        assert_eq!(router.get_default_model(), "gpt-4o");

        router.set_low_compute_mode(true);
        assert_eq!(router.get_default_model(), FALLBACK_CHEAP_MODEL);

        router.set_low_compute_mode(false);
        assert_eq!(router.get_default_model(), "gpt-4o");
    }

    #[test]
    fn test_estimate_cost_cents_uses_registry_costs() {
        let now = Utc::now().to_rfc3339();
        let entry = ModelEntry {
            model_id: "gpt-4o".to_string(),
            provider: Provider::Openai,
            display_name: "gpt-4o".to_string(),
            tier_minimum: SurvivalTier::Normal,
            input_cost_per_1k: 0.25,
            output_cost_per_1k: 1.0,
            max_output_tokens: 4096,
            context_window: 128_000,
            supports_tools: true,
            supports_vision: true,
            param_style: ParamStyle::MaxTokens,
            enabled: true,
            created_at: now.clone(),
            updated_at: now,
        };
        let usage = TokenUsage {
            prompt_tokens: 2000,
            completion_tokens: 1000,
            total_tokens: 3000,
        };
        let cost = estimate_cost_cents(&entry, &usage);
        assert!((cost - 1.5).abs() < f64::EPSILON);
    }
}
