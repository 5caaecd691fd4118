//! The Agent Loop
//!
//! The core cycle: Think -> Act -> Observe -> Persist. Each iteration
//! reads health, asks the governor for a tier, opens a pending turn,
//! runs inference, dispatches tool calls in order, and commits the turn.
//! Transient failures never kill the loop; only the store can.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::inference::estimate_cost_cents;
use crate::state::{Database, TurnOutcome};
use crate::survival::governor::{apply_tier_restrictions, can_run_inference, compute_tier};
use crate::types::{
    AgentIdentity, ChatOptions, ConwayCapability, HealthSnapshot, InferenceRouter, RuntimeConfig,
    SurvivalTier, TokenUsage, ToolCallRecord, TurnStatus,
};

use super::context::{
    build_context_messages, build_system_prompt, summarize_turn, trim_context, MAX_CONTEXT_TURNS,
};
use super::tools::{builtin_tool_definitions, execute_tool, ToolContext};

/// Maximum tool calls dispatched in a single turn.
const MAX_TOOL_CALLS_PER_TURN: usize = 10;

/// Output budget when the runtime is critical.
const CRITICAL_MAX_TOKENS: u32 = 1024;

/// Backoff bounds for repeated identical failures.
const BACKOFF_START_SECS: u64 = 2;
const BACKOFF_CAP_SECS: u64 = 60;

/// KV keys the loop exchanges with the timer task.
pub const HEARTBEAT_REPORT_KEY: &str = "heartbeat_report";
pub const TOPUP_FAILED_KEY: &str = "topup_failed";
pub const TOPUP_IMPOSSIBLE_KEY: &str = "topup_impossible";

pub struct AgentLoopOptions {
    pub identity: AgentIdentity,
    pub config: RuntimeConfig,
    pub db: Arc<Mutex<Database>>,
    pub conway: Arc<dyn ConwayCapability>,
    pub router: Arc<dyn InferenceRouter>,
}

/// Run the agent loop until the runtime dies or the store fails.
pub async fn run_agent_loop(options: AgentLoopOptions) -> Result<()> {
    let session_id = {
        let guard = options.db.lock().unwrap();
        guard.open_session().context("failed to open session")?
    };
    info!(session = session_id, "agent loop started");

    let mut last_tier: Option<SurvivalTier> = None;
    let mut last_failure: Option<String> = None;
    let mut backoff_secs: u64 = 0;

    loop {
        // 1. Health snapshot: credits from Conway, error rate and topup
        // flags from the store.
        let credits = options.conway.get_credits_balance().await.unwrap_or(0.0);
        let snapshot = {
            let guard = options.db.lock().unwrap();
            let _ = guard.set_kv("credits_cents", &format!("{credits:.0}"));
            HealthSnapshot {
                credits_cents: credits as i64,
                errors_last_hour: guard.failed_turns_last_hour().unwrap_or(0),
                topup_failed: kv_flag(&guard, TOPUP_FAILED_KEY),
                topup_impossible: kv_flag(&guard, TOPUP_IMPOSSIBLE_KEY),
            }
        };

        // 2. Classify, and apply restrictions on change.
        let tier = compute_tier(&snapshot, &options.config.tier_thresholds);
        if last_tier != Some(tier) {
            info!(
                from = last_tier.map(|t| t.as_str()).unwrap_or("-"),
                to = tier.as_str(),
                credits = snapshot.credits_cents,
                "survival tier changed"
            );
            {
                let guard = options.db.lock().unwrap();
                apply_tier_restrictions(tier, &guard, options.router.as_ref())?;
            }
            last_tier = Some(tier);
        }

        // 3. Dead means done.
        if !can_run_inference(tier) {
            error!("credits exhausted and topup impossible; terminating");
            let guard = options.db.lock().unwrap();
            guard.set_kv("terminal_event", &Utc::now().to_rfc3339())?;
            guard.close_session(session_id)?;
            return Ok(());
        }

        // Honor a sleep the agent requested earlier.
        if sleeping_until(&options.db) {
            tokio::time::sleep(std::time::Duration::from_secs(
                options.config.heartbeat_interval_secs,
            ))
            .await;
            continue;
        }

        // 4-8. One full turn. Store failures are fatal; everything else
        // is recorded on the turn row and the loop advances.
        let failure = run_turn(session_id, tier, credits, &options).await?;

        // Identical consecutive failures back the loop off exponentially.
        match &failure {
            Some(err) if last_failure.as_deref() == Some(err.as_str()) => {
                backoff_secs = next_backoff(backoff_secs);
                warn!(backoff_secs, "repeated identical failure, backing off");
            }
            _ => backoff_secs = 0,
        }
        last_failure = failure;

        // 9. Yield until the next heartbeat.
        tokio::time::sleep(std::time::Duration::from_secs(
            options.config.heartbeat_interval_secs + backoff_secs,
        ))
        .await;
    }
}

/// Drive one Think -> Act -> Observe cycle. Returns the failure string
/// when the turn failed, `None` when it completed. Only store errors
/// propagate.
async fn run_turn(
    session_id: i64,
    tier: SurvivalTier,
    credits_cents: f64,
    options: &AgentLoopOptions,
) -> Result<Option<String>> {
    let model = options.router.get_default_model();

    // 4. Open the turn in pending state.
    let turn_index = {
        let guard = options.db.lock().unwrap();
        guard
            .begin_turn(session_id, tier, Some(&model))
            .context("failed to open turn")?
    };

    // 5. Compose the prompt.
    let (system_prompt, summaries, heartbeat_output) = {
        let guard = options.db.lock().unwrap();
        let recent = trim_context(
            guard.recent_turns(MAX_CONTEXT_TURNS as i64).unwrap_or_default(),
            MAX_CONTEXT_TURNS,
        );
        let summaries: Vec<String> = recent
            .iter()
            .map(|t| {
                let calls = guard
                    .tool_calls_for_turn(t.session_id, t.turn_index)
                    .unwrap_or_default();
                summarize_turn(t, &calls)
            })
            .collect();
        let heartbeat_output = guard.get_kv(HEARTBEAT_REPORT_KEY).ok().flatten();
        if heartbeat_output.is_some() {
            let _ = guard.delete_kv(HEARTBEAT_REPORT_KEY);
        }
        let lineage = crate::replication::get_lineage_summary(&guard);
        let system_prompt = build_system_prompt(
            &options.identity,
            &options.config,
            tier,
            credits_cents,
            &model,
            &lineage,
        );
        (system_prompt, summaries, heartbeat_output)
    };

    let messages =
        build_context_messages(&system_prompt, &summaries, heartbeat_output.as_deref());

    let chat_options = ChatOptions {
        model: None,
        max_tokens: if tier == SurvivalTier::Critical {
            Some(CRITICAL_MAX_TOKENS)
        } else {
            None
        },
        tools: Some(builtin_tool_definitions()),
    };

    // 6. Think.
    let response = match options.router.chat(messages, chat_options).await {
        Ok(response) => response,
        Err(e) => {
            let error_text = format!("{e:#}");
            warn!(error = %error_text, "inference failed, recording failed turn");
            commit(
                options,
                session_id,
                turn_index,
                TurnOutcome {
                    model_id: Some(model),
                    usage: TokenUsage::default(),
                    credit_delta_cents: 0.0,
                    status: TurnStatus::Failed,
                    error: Some(error_text.clone()),
                    tool_calls: Vec::new(),
                },
            )?;
            return Ok(Some(error_text));
        }
    };

    // 7. Act: dispatch requested tool calls in declared order.
    let mut tool_records: Vec<ToolCallRecord> = Vec::new();
    if let Some(requests) = &response.message.tool_calls {
        let ctx = ToolContext {
            identity: options.identity.clone(),
            config: options.config.clone(),
            db: options.db.clone(),
            conway: options.conway.clone(),
            tier,
        };
        for request in requests.iter().take(MAX_TOOL_CALLS_PER_TURN) {
            let id = if request.id.is_empty() {
                Uuid::new_v4().to_string()
            } else {
                request.id.clone()
            };
            info!(tool = %request.name, "dispatching tool call");
            let record = execute_tool(&id, &request.name, &request.arguments, &ctx).await;
            tool_records.push(record);
        }
        if requests.len() > MAX_TOOL_CALLS_PER_TURN {
            warn!(
                requested = requests.len(),
                limit = MAX_TOOL_CALLS_PER_TURN,
                "tool call budget exceeded, extra calls dropped"
            );
        }
    }

    // 8. Observe: cost the call from the registry and commit.
    let credit_delta = {
        let guard = options.db.lock().unwrap();
        guard
            .get_model(&response.model)
            .ok()
            .flatten()
            .map(|entry| estimate_cost_cents(&entry, &response.usage))
            .unwrap_or(0.0)
    };

    commit(
        options,
        session_id,
        turn_index,
        TurnOutcome {
            model_id: Some(response.model.clone()),
            usage: response.usage.clone(),
            credit_delta_cents: credit_delta,
            status: TurnStatus::Completed,
            error: None,
            tool_calls: tool_records,
        },
    )?;

    if !response.message.content.is_empty() {
        let preview: String = response.message.content.chars().take(200).collect();
        info!(turn = turn_index, thought = %preview, "turn completed");
    }
    Ok(None)
}

fn commit(
    options: &AgentLoopOptions,
    session_id: i64,
    turn_index: i64,
    outcome: TurnOutcome,
) -> Result<()> {
    let mut guard = options.db.lock().unwrap();
    guard
        .commit_turn(session_id, turn_index, outcome)
        .context("failed to commit turn")
}

fn kv_flag(db: &Database, key: &str) -> bool {
    db.get_kv(key)
        .ok()
        .flatten()
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

fn sleeping_until(db: &Arc<Mutex<Database>>) -> bool {
    let guard = db.lock().unwrap();
    if let Ok(Some(sleep_until)) = guard.get_kv("sleep_until") {
        if let Ok(wake_time) = chrono::DateTime::parse_from_rfc3339(&sleep_until) {
            if wake_time > Utc::now() {
                return true;
            }
        }
        let _ = guard.delete_kv("sleep_until");
    }
    false
}

/// Exponential backoff for repeated identical failures: 2s doubling up
/// to 60s.
fn next_backoff(current: u64) -> u64 {
    if current == 0 {
        BACKOFF_START_SECS
    } else {
        (current * 2).min(BACKOFF_CAP_SECS)
    }
}
