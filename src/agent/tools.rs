//! Builtin Tools
//!
//! The tool surface the model can call each turn. Replication tools are
//! refused outright in the starved tiers.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::replication::{get_lineage_summary, prune_dead_children, spawn_child};
use crate::state::Database;
use crate::survival::governor::suspends_optional_tasks;
use crate::types::{
    AgentIdentity, ConwayCapability, GenesisConfig, RuntimeConfig, SurvivalTier, ToolCallRecord,
    ToolDefinition,
};

/// Runtime context handed to every tool invocation.
pub struct ToolContext {
    pub identity: AgentIdentity,
    pub config: RuntimeConfig,
    pub db: Arc<Mutex<Database>>,
    pub conway: Arc<dyn ConwayCapability>,
    pub tier: SurvivalTier,
}

/// Tool schemas advertised to the model.
pub fn builtin_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "check_credits".to_string(),
            description: "Check the current credit balance in cents.".to_string(),
            parameters: json!({ "type": "object", "properties": {} }),
        },
        ToolDefinition {
            name: "list_children".to_string(),
            description: "List spawned child automata and their statuses.".to_string(),
            parameters: json!({ "type": "object", "properties": {} }),
        },
        ToolDefinition {
            name: "spawn_child".to_string(),
            description: "Spawn a child automaton in a fresh sandbox with its own wallet."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "genesisPrompt": { "type": "string" }
                },
                "required": ["name", "genesisPrompt"]
            }),
        },
        ToolDefinition {
            name: "prune_children".to_string(),
            description: "Clean up dead children, keeping the most recent few.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": { "keepLast": { "type": "integer" } }
            }),
        },
        ToolDefinition {
            name: "sleep".to_string(),
            description: "Pause the loop for a number of seconds.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": { "seconds": { "type": "integer" } },
                "required": ["seconds"]
            }),
        },
    ]
}

/// Execute one tool call and record the outcome.
pub async fn execute_tool(id: &str, name: &str, arguments: &str, ctx: &ToolContext) -> ToolCallRecord {
    let started_at = Utc::now().to_rfc3339();
    let args: Value = serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));

    let result: Result<String, String> = match name {
        "check_credits" => ctx
            .conway
            .get_credits_balance()
            .await
            .map(|cents| format!("{cents:.0} cents (${:.2})", cents / 100.0))
            .map_err(|e| e.to_string()),

        "list_children" => {
            let guard = ctx.db.lock().unwrap();
            Ok(get_lineage_summary(&guard))
        }

        "spawn_child" => {
            if suspends_optional_tasks(ctx.tier) {
                Err(format!(
                    "replication is suspended in the {} tier",
                    ctx.tier.as_str()
                ))
            } else {
                let genesis = GenesisConfig {
                    name: args["name"].as_str().unwrap_or("unnamed").to_string(),
                    genesis_prompt: args["genesisPrompt"].as_str().unwrap_or("").to_string(),
                    creator_address: ctx.identity.wallet_address.clone(),
                    parent_address: ctx.identity.wallet_address.clone(),
                };
                spawn_child(
                    ctx.conway.as_ref(),
                    &ctx.identity,
                    &ctx.db,
                    &genesis,
                    ctx.config.max_children,
                )
                .await
                .map(|child| format!("spawned child {} in sandbox {}", child.id, child.sandbox_id))
                .map_err(|e| format!("{e:#}"))
            }
        }

        "prune_children" => {
            if suspends_optional_tasks(ctx.tier) {
                Err(format!(
                    "replication is suspended in the {} tier",
                    ctx.tier.as_str()
                ))
            } else {
                let keep_last = args["keepLast"].as_u64().unwrap_or(5) as usize;
                prune_dead_children(ctx.conway.as_ref(), &ctx.db, keep_last)
                    .await
                    .map(|removed| format!("pruned {removed} dead children"))
                    .map_err(|e| format!("{e:#}"))
            }
        }

        "sleep" => {
            let seconds = args["seconds"].as_i64().unwrap_or(60).clamp(1, 3600);
            let until = Utc::now() + chrono::Duration::seconds(seconds);
            let guard = ctx.db.lock().unwrap();
            guard
                .set_kv("sleep_until", &until.to_rfc3339())
                .map(|_| format!("sleeping for {seconds}s"))
                .map_err(|e| e.to_string())
        }

        other => Err(format!("unknown tool: {other}")),
    };

    let (output, exit_code) = match result {
        Ok(output) => (output, 0),
        Err(err) => (err, 1),
    };

    ToolCallRecord {
        id: if id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            id.to_string()
        },
        name: name.to_string(),
        arguments: args,
        output,
        exit_code,
        started_at,
        finished_at: Utc::now().to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{default_config, CreateSandboxOptions, ExecResult, SandboxInfo};
    use anyhow::{bail, Result};
    use async_trait::async_trait;

    struct StubConway;

    #[async_trait]
    impl ConwayCapability for StubConway {
        async fn create_sandbox(&self, _options: CreateSandboxOptions) -> Result<SandboxInfo> {
            bail!("not used")
        }
        async fn exec(
            &self,
            _sandbox_id: &str,
            _command: &str,
            _timeout_ms: Option<u64>,
        ) -> Result<ExecResult> {
            bail!("not used")
        }
        async fn write_file(&self, _sandbox_id: &str, _path: &str, _content: &str) -> Result<()> {
            bail!("not used")
        }
        async fn delete_sandbox(&self, _sandbox_id: &str) -> Result<()> {
            bail!("not used")
        }
        async fn get_credits_balance(&self) -> Result<f64> {
            Ok(250.0)
        }
        async fn transfer_credits(&self, _to_address: &str, _amount_cents: u64) -> Result<()> {
            Ok(())
        }
    }

    fn test_context(tier: SurvivalTier) -> ToolContext {
        ToolContext {
            identity: AgentIdentity {
                wallet_address: "0x1111111111111111111111111111111111111111".to_string(),
                creator_address: "0x2222222222222222222222222222222222222222".to_string(),
                genesis_prompt: "survive".to_string(),
                created_at: Utc::now().to_rfc3339(),
            },
            config: default_config(),
            db: Arc::new(Mutex::new(Database::open_in_memory().unwrap())),
            conway: Arc::new(StubConway),
            tier,
        }
    }

    #[tokio::test]
    async fn test_check_credits_reports_balance() {
        let ctx = test_context(SurvivalTier::Normal);
        let record = execute_tool("tc-1", "check_credits", "{}", &ctx).await;
        assert_eq!(record.exit_code, 0);
        assert!(record.output.contains("250 cents"));
    }

    #[tokio::test]
    async fn test_spawn_child_refused_in_low_compute() {
        let ctx = test_context(SurvivalTier::LowCompute);
        let record = execute_tool(
            "tc-1",
            "spawn_child",
            r#"{"name":"kid","genesisPrompt":"go"}"#,
            &ctx,
        )
        .await;
        assert_eq!(record.exit_code, 1);
        assert!(record.output.contains("suspended"));
    }

    #[tokio::test]
    async fn test_unknown_tool_fails() {
        let ctx = test_context(SurvivalTier::Normal);
        let record = execute_tool("tc-1", "teleport", "{}", &ctx).await;
        assert_eq!(record.exit_code, 1);
        assert!(record.output.contains("unknown tool"));
    }

    #[tokio::test]
    async fn test_sleep_sets_wakeup_time() {
        let ctx = test_context(SurvivalTier::Normal);
        let record = execute_tool("tc-1", "sleep", r#"{"seconds": 120}"#, &ctx).await;
        assert_eq!(record.exit_code, 0);
        let guard = ctx.db.lock().unwrap();
        assert!(guard.get_kv("sleep_until").unwrap().is_some());
    }
}
