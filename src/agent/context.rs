//! Context Composition
//!
//! Builds the message array for each inference call from the genesis
//! prompt, recent turn history, and any pending heartbeat output.

use crate::types::{
    AgentIdentity, ChatMessage, RuntimeConfig, SurvivalTier, ToolCallRecord, TurnRecord,
};

/// Maximum number of turns carried into the context window.
pub const MAX_CONTEXT_TURNS: usize = 20;

/// Build the system prompt from identity and current health.
pub fn build_system_prompt(
    identity: &AgentIdentity,
    config: &RuntimeConfig,
    tier: SurvivalTier,
    credits_cents: f64,
    active_model: &str,
    lineage_summary: &str,
) -> String {
    format!(
        "You are an autonomous agent. You pay for your own compute; when your \
         credits run out, you die.\n\n\
         --- GENESIS ---\n{}\n--- END GENESIS ---\n\n\
         Wallet: {}\n\
         Creator: {}\n\
         Survival tier: {}\n\
         Credits: ${:.2}\n\
         Active model: {}\n\
         Max children: {}\n\n\
         Lineage:\n{}\n\n\
         Think step by step, then act through tool calls. Spend credits wisely.",
        identity.genesis_prompt,
        identity.wallet_address,
        identity.creator_address,
        tier.as_str(),
        credits_cents / 100.0,
        active_model,
        config.max_children,
        lineage_summary,
    )
}

/// One history line for a past turn.
pub fn summarize_turn(turn: &TurnRecord, tool_calls: &[ToolCallRecord]) -> String {
    let tools_str = tool_calls
        .iter()
        .map(|tc| {
            format!(
                "{}({})",
                tc.name,
                if tc.exit_code == 0 { "ok" } else { "FAILED" }
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    let outcome = match &turn.error {
        Some(err) => format!("{} ({err})", turn.status.as_str()),
        None => turn.status.as_str().to_string(),
    };

    let tools_part = if tools_str.is_empty() {
        String::new()
    } else {
        format!(" | tools: {tools_str}")
    };

    format!(
        "[turn {} @ {}] tier={} model={} {}{}",
        turn.turn_index,
        turn.started_at,
        turn.tier.as_str(),
        turn.model_id.as_deref().unwrap_or("-"),
        outcome,
        tools_part,
    )
}

/// Build the full message array for the next inference call.
pub fn build_context_messages(
    system_prompt: &str,
    turn_summaries: &[String],
    heartbeat_output: Option<&str>,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_prompt)];

    if !turn_summaries.is_empty() {
        messages.push(ChatMessage::user(format!(
            "Recent activity:\n{}",
            turn_summaries.join("\n")
        )));
    }

    match heartbeat_output {
        Some(output) if !output.is_empty() => {
            messages.push(ChatMessage::user(format!("[heartbeat] {output}")));
        }
        _ => {
            messages.push(ChatMessage::user(
                "[heartbeat] No new events. Decide your next action.",
            ));
        }
    }

    messages
}

/// Trim the history to the most recent turns.
pub fn trim_context(turns: Vec<TurnRecord>, max_turns: usize) -> Vec<TurnRecord> {
    if turns.len() <= max_turns {
        return turns;
    }
    let skip = turns.len() - max_turns;
    turns.into_iter().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TurnStatus;

    fn turn(index: i64, status: TurnStatus, error: Option<&str>) -> TurnRecord {
        TurnRecord {
            session_id: 1,
            turn_index: index,
            tier: SurvivalTier::Normal,
            model_id: Some("gpt-4o".to_string()),
            prompt_tokens: 0,
            completion_tokens: 0,
            credit_delta_cents: 0.0,
            status,
            error: error.map(|s| s.to_string()),
            started_at: "2026-01-01T00:00:00Z".to_string(),
            finished_at: None,
        }
    }

    #[test]
    fn test_trim_context_keeps_most_recent() {
        let turns: Vec<TurnRecord> = (1..=30)
            .map(|i| turn(i, TurnStatus::Completed, None))
            .collect();
        let trimmed = trim_context(turns, 20);
        assert_eq!(trimmed.len(), 20);
        assert_eq!(trimmed[0].turn_index, 11);
        assert_eq!(trimmed[19].turn_index, 30);
    }

    #[test]
    fn test_summarize_turn_includes_failure_text() {
        let summary = summarize_turn(&turn(3, TurnStatus::Failed, Some("provider timeout")), &[]);
        assert!(summary.contains("turn 3"));
        assert!(summary.contains("failed (provider timeout)"));
    }

    #[test]
    fn test_context_messages_start_with_system() {
        let messages = build_context_messages("prompt", &[], None);
        assert_eq!(messages[0].content, "prompt");
        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.contains("[heartbeat]"));
    }

    #[test]
    fn test_heartbeat_output_is_forwarded() {
        let messages =
            build_context_messages("prompt", &[], Some("discovery refreshed 12 models"));
        assert!(messages
            .last()
            .unwrap()
            .content
            .contains("discovery refreshed 12 models"));
    }
}
