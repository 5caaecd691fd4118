//! Heartbeat Tasks
//!
//! The periodic jobs the timer task runs between turns: model discovery
//! refresh and dead-child pruning. Both are optional side-effects and
//! are skipped outright while the runtime is in a starved tier.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::info;

use crate::agent::agent_loop::HEARTBEAT_REPORT_KEY;
use crate::inference::http::HttpCapability;
use crate::inference::providers::ProviderEndpoint;
use crate::registry::discovery::refresh_provider;
use crate::replication::prune_dead_children;
use crate::state::Database;
use crate::survival::governor::{current_tier, suspends_optional_tasks};
use crate::types::{ConwayCapability, Provider, RuntimeConfig};

/// Default number of dead children kept for the audit trail.
pub const DEFAULT_KEEP_LAST_DEAD: usize = 5;

/// Shared context for heartbeat task execution.
pub struct HeartbeatContext {
    pub db: Arc<Mutex<Database>>,
    pub http: Arc<dyn HttpCapability>,
    pub conway: Arc<dyn ConwayCapability>,
    pub endpoints: Vec<ProviderEndpoint>,
    pub keep_last_dead: usize,
}

/// Provider endpoints worth polling for discovery, from configuration.
pub fn discovery_endpoints(config: &RuntimeConfig) -> Vec<ProviderEndpoint> {
    let mut endpoints = vec![ProviderEndpoint {
        provider: Provider::Conway,
        base_url: config.conway_api_url.clone(),
        api_key: Some(config.conway_api_key.clone()),
    }];

    if config.openai_api_key.is_some() || config.openai_base_url.is_some() {
        endpoints.push(ProviderEndpoint {
            provider: Provider::Openai,
            base_url: config
                .openai_base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key: config.openai_api_key.clone(),
        });
    }
    if config.anthropic_api_key.is_some() || config.anthropic_base_url.is_some() {
        endpoints.push(ProviderEndpoint {
            provider: Provider::Anthropic,
            base_url: config
                .anthropic_base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            api_key: config.anthropic_api_key.clone(),
        });
    }
    if let Some(ref base) = config.ollama_base_url {
        endpoints.push(ProviderEndpoint {
            provider: Provider::Ollama,
            base_url: base.clone(),
            api_key: None,
        });
    }

    endpoints
}

/// Run one task by name. Unknown names are an error so a misconfigured
/// schedule surfaces in the log.
pub async fn execute_task(name: &str, ctx: &HeartbeatContext) -> Result<()> {
    let tier = {
        let guard = ctx.db.lock().unwrap();
        current_tier(&guard)
    };
    if suspends_optional_tasks(tier) {
        info!(task = name, tier = tier.as_str(), "optional task suspended");
        return Ok(());
    }

    let report = match name {
        "refresh_models" => refresh_models(ctx).await?,
        "prune_dead_children" => prune_dead(ctx).await?,
        other => anyhow::bail!("no heartbeat task named '{other}'"),
    };

    let guard = ctx.db.lock().unwrap();
    guard.set_kv(HEARTBEAT_REPORT_KEY, &report)?;
    Ok(())
}

async fn refresh_models(ctx: &HeartbeatContext) -> Result<String> {
    let mut total = 0usize;
    for endpoint in &ctx.endpoints {
        let seen = refresh_provider(ctx.http.as_ref(), &ctx.db, endpoint).await;
        total += seen.len();
    }
    Ok(format!(
        "model discovery refreshed {} models across {} providers",
        total,
        ctx.endpoints.len()
    ))
}

async fn prune_dead(ctx: &HeartbeatContext) -> Result<String> {
    let removed = prune_dead_children(ctx.conway.as_ref(), &ctx.db, ctx.keep_last_dead).await?;
    Ok(format!("pruned {removed} dead children"))
}
