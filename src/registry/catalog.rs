//! Model Catalogue Rules
//!
//! Defaults and id-pattern heuristics for registry rows. Discovery
//! consults these when it sees a model id for the first time.

use chrono::Utc;
use regex::Regex;

use crate::types::{ModelEntry, ParamStyle, Provider, SurvivalTier};

/// Chat-capable model ids on stock OpenAI.
const OPENAI_CHAT_INCLUDE: &str = r"^(gpt-|o[13][-.]|o[13]$|chatgpt-)";

/// Non-chat families on stock OpenAI.
const OPENAI_CHAT_EXCLUDE: &str =
    r"^(dall-e|whisper|tts|text-embedding|ft:|babbage|davinci|curie|ada)";

/// Models whose endpoints take `max_completion_tokens`.
const COMPLETION_TOKENS_STYLE: &str = r"^(o[1-9]|gpt-5|gpt-4\.1)";

/// Whether a stock-OpenAI model id names a chat model.
pub fn is_openai_chat_model(id: &str) -> bool {
    let include = Regex::new(OPENAI_CHAT_INCLUDE).expect("include pattern");
    let exclude = Regex::new(OPENAI_CHAT_EXCLUDE).expect("exclude pattern");
    include.is_match(id) && !exclude.is_match(id)
}

/// Whether a base URL points at stock OpenAI (where the chat filter
/// applies). Any other host serves a curated list we take verbatim.
pub fn is_stock_openai_host(base_url: &str) -> bool {
    base_url
        .split("://")
        .nth(1)
        .map(|rest| rest.split('/').next().unwrap_or(""))
        .map(|host| host == "api.openai.com")
        .unwrap_or(false)
}

/// Vision support guessed from the model id.
pub fn detect_vision(id: &str) -> bool {
    let lower = id.to_lowercase();
    ["vision", "gpt-4o", "gpt-4.1", "gpt-5", "chatgpt-", "claude"]
        .iter()
        .any(|p| lower.contains(p))
}

/// Parameter style guessed from the model id.
pub fn detect_param_style(id: &str) -> ParamStyle {
    let re = Regex::new(COMPLETION_TOKENS_STYLE).expect("param style pattern");
    if re.is_match(id) {
        ParamStyle::MaxCompletionTokens
    } else {
        ParamStyle::MaxTokens
    }
}

/// Registry defaults for a model id seen for the first time.
pub fn default_entry(provider: Provider, model_id: &str) -> ModelEntry {
    let now = Utc::now().to_rfc3339();
    let context_window = match provider {
        Provider::Anthropic => 200_000,
        _ => 128_000,
    };

    ModelEntry {
        model_id: model_id.to_string(),
        provider,
        display_name: model_id.to_string(),
        tier_minimum: SurvivalTier::Normal,
        input_cost_per_1k: 0.0,
        output_cost_per_1k: 0.0,
        max_output_tokens: 4096,
        context_window,
        supports_tools: true,
        supports_vision: detect_vision(model_id),
        param_style: detect_param_style(model_id),
        enabled: true,
        created_at: now.clone(),
        updated_at: now,
    }
}

/// Merge a discovery sighting into an existing row. Human-edited fields
/// survive; only the freshness timestamp is overwritten.
pub fn merge_sighting(existing: ModelEntry) -> ModelEntry {
    ModelEntry {
        updated_at: Utc::now().to_rfc3339(),
        ..existing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_chat_filter() {
        assert!(is_openai_chat_model("gpt-4o"));
        assert!(is_openai_chat_model("gpt-4o-mini"));
        assert!(is_openai_chat_model("o1-preview"));
        assert!(is_openai_chat_model("o3"));
        assert!(is_openai_chat_model("chatgpt-4o-latest"));

        assert!(!is_openai_chat_model("dall-e-3"));
        assert!(!is_openai_chat_model("whisper-1"));
        assert!(!is_openai_chat_model("text-embedding-3-large"));
        assert!(!is_openai_chat_model("tts-1-hd"));
        assert!(!is_openai_chat_model("davinci-002"));
        assert!(!is_openai_chat_model("llama3.2"));
    }

    #[test]
    fn test_stock_openai_host_detection() {
        assert!(is_stock_openai_host("https://api.openai.com"));
        assert!(is_stock_openai_host("https://api.openai.com/v1"));
        assert!(!is_stock_openai_host("https://inference.conway.tech"));
        assert!(!is_stock_openai_host("http://localhost:8080"));
    }

    #[test]
    fn test_param_style_detection() {
        assert_eq!(detect_param_style("o3-mini"), ParamStyle::MaxCompletionTokens);
        assert_eq!(detect_param_style("gpt-5-mini"), ParamStyle::MaxCompletionTokens);
        assert_eq!(detect_param_style("gpt-4.1"), ParamStyle::MaxCompletionTokens);
        assert_eq!(detect_param_style("gpt-4o"), ParamStyle::MaxTokens);
        assert_eq!(detect_param_style("llama3.2"), ParamStyle::MaxTokens);
    }

    #[test]
    fn test_default_entry_context_windows() {
        let openai = default_entry(Provider::Openai, "gpt-4o");
        assert_eq!(openai.context_window, 128_000);
        assert!(openai.supports_vision);
        assert_eq!(openai.tier_minimum, SurvivalTier::Normal);

        let anthropic = default_entry(Provider::Anthropic, "claude-haiku-4-5");
        assert_eq!(anthropic.context_window, 200_000);
        assert!(anthropic.supports_vision);
    }

    #[test]
    fn test_merge_sighting_preserves_edits() {
        let mut existing = default_entry(Provider::Openai, "gpt-4o");
        existing.display_name = "My tuned 4o".to_string();
        existing.input_cost_per_1k = 0.25;
        existing.enabled = false;

        let merged = merge_sighting(existing);
        assert_eq!(merged.display_name, "My tuned 4o");
        assert!((merged.input_cost_per_1k - 0.25).abs() < f64::EPSILON);
        assert!(!merged.enabled);
    }
}
