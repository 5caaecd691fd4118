//! Model Discovery
//!
//! One discoverer per provider family. Each pass lists the provider's
//! models, upserts registry rows, then tombstones previously enabled
//! rows the provider no longer advertises. Every failure is soft: a
//! warning is logged and the cached catalogue stays authoritative.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::inference::error::InferenceError;
use crate::inference::http::{HttpCapability, HttpRequest};
use crate::inference::providers::{ProviderEndpoint, ANTHROPIC_VERSION};
use crate::state::Database;
use crate::types::Provider;

use super::catalog;

/// Per-HTTP-call timeout for discovery.
pub const DISCOVERY_TIMEOUT_SECS: u64 = 10;

/// Anthropic pagination bounds.
const ANTHROPIC_PAGE_SIZE: u32 = 100;
const ANTHROPIC_MAX_PAGES: u32 = 5;

/// Run one discovery pass for a provider. Returns the model ids seen,
/// or an empty list when the provider could not be listed.
pub async fn refresh_provider(
    http: &dyn HttpCapability,
    db: &Arc<Mutex<Database>>,
    endpoint: &ProviderEndpoint,
) -> Vec<String> {
    let fetched = match endpoint.provider {
        Provider::Conway | Provider::Openai => list_openai_compatible(http, endpoint).await,
        Provider::Anthropic => list_anthropic(http, endpoint).await,
        Provider::Ollama => list_ollama(http, endpoint).await,
    };

    let ids = match fetched {
        Ok(ids) => ids,
        Err(e) => {
            warn!(provider = endpoint.provider.as_str(), error = %e, "model discovery failed; keeping cached catalogue");
            return Vec::new();
        }
    };

    {
        let mut guard = db.lock().unwrap();
        for id in &ids {
            let entry = match guard.get_model(id).ok().flatten() {
                Some(existing) => catalog::merge_sighting(existing),
                None => catalog::default_entry(endpoint.provider, id),
            };
            if let Err(e) = guard.upsert_model(&entry) {
                warn!(model = %id, error = %e, "failed to upsert registry row");
            }
        }

        match guard.disable_unseen_models(endpoint.provider, &ids) {
            Ok(0) => {}
            Ok(n) => info!(
                provider = endpoint.provider.as_str(),
                disabled = n,
                "tombstoned models no longer advertised"
            ),
            Err(e) => warn!(error = %e, "failed to tombstone unseen models"),
        }
    }

    debug!(
        provider = endpoint.provider.as_str(),
        count = ids.len(),
        "discovery pass complete"
    );
    ids
}

/// `GET {base}/v1/models` with a bearer key. On the stock OpenAI host
/// the id list is filtered to chat models; elsewhere it is taken as-is.
async fn list_openai_compatible(
    http: &dyn HttpCapability,
    endpoint: &ProviderEndpoint,
) -> Result<Vec<String>, InferenceError> {
    let mut request = HttpRequest::get(format!("{}/v1/models", endpoint.base_url))
        .timeout(DISCOVERY_TIMEOUT_SECS);
    if let Some(ref key) = endpoint.api_key {
        request = request.header("Authorization", format!("Bearer {key}"));
    }

    let response = http.send(request).await?;
    if !response.is_success() {
        return Err(InferenceError::Upstream {
            provider: endpoint.provider.as_str().to_string(),
            status: response.status,
            body: response.body.chars().take(300).collect(),
        });
    }

    let data = response.json()?;
    let stock = catalog::is_stock_openai_host(&endpoint.base_url);
    let ids = data["data"]
        .as_array()
        .ok_or_else(|| InferenceError::MalformedResponse("no data array".to_string()))?
        .iter()
        .filter_map(|m| m["id"].as_str())
        .filter(|id| !stock || catalog::is_openai_chat_model(id))
        .map(|id| id.to_string())
        .collect();
    Ok(ids)
}

/// `GET {base}/v1/models` with `x-api-key`, cursor-paginated. Fetches
/// at most five pages of one hundred ids.
async fn list_anthropic(
    http: &dyn HttpCapability,
    endpoint: &ProviderEndpoint,
) -> Result<Vec<String>, InferenceError> {
    let mut ids: Vec<String> = Vec::new();
    let mut after_id: Option<String> = None;

    for _page in 0..ANTHROPIC_MAX_PAGES {
        let mut url = format!(
            "{}/v1/models?limit={}",
            endpoint.base_url, ANTHROPIC_PAGE_SIZE
        );
        if let Some(ref cursor) = after_id {
            url.push_str(&format!("&after_id={cursor}"));
        }

        let mut request = HttpRequest::get(url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(DISCOVERY_TIMEOUT_SECS);
        if let Some(ref key) = endpoint.api_key {
            request = request.header("x-api-key", key.clone());
        }

        let response = http.send(request).await?;
        if !response.is_success() {
            return Err(InferenceError::Upstream {
                provider: "anthropic".to_string(),
                status: response.status,
                body: response.body.chars().take(300).collect(),
            });
        }

        let data = response.json()?;
        let page_ids: Vec<String> = data["data"]
            .as_array()
            .ok_or_else(|| InferenceError::MalformedResponse("no data array".to_string()))?
            .iter()
            .filter_map(|m| m["id"].as_str())
            .map(|id| id.to_string())
            .collect();
        ids.extend(page_ids);

        if !data["has_more"].as_bool().unwrap_or(false) {
            break;
        }
        after_id = data["last_id"].as_str().map(|s| s.to_string());
        if after_id.is_none() {
            break;
        }
    }

    Ok(ids)
}

/// `GET {base}/api/tags`; local, no auth required.
async fn list_ollama(
    http: &dyn HttpCapability,
    endpoint: &ProviderEndpoint,
) -> Result<Vec<String>, InferenceError> {
    let request = HttpRequest::get(format!("{}/api/tags", endpoint.base_url))
        .timeout(DISCOVERY_TIMEOUT_SECS);

    let response = http.send(request).await?;
    if !response.is_success() {
        return Err(InferenceError::Upstream {
            provider: "ollama".to_string(),
            status: response.status,
            body: response.body.chars().take(300).collect(),
        });
    }

    let data = response.json()?;
    let ids = data["models"]
        .as_array()
        .ok_or_else(|| InferenceError::MalformedResponse("no models array".to_string()))?
        .iter()
        .filter_map(|m| m["name"].as_str())
        .map(|id| id.to_string())
        .collect();
    Ok(ids)
}
