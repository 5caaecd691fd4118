//! MoneyClaw - Type Definitions
//!
//! Shared types for the credit-governed agent runtime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ─── Identity ────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub wallet_address: String,
    pub creator_address: String,
    pub genesis_prompt: String,
    pub created_at: String,
}

/// The all-zero EVM address. Never a valid identity or child wallet.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

// ─── Configuration ───────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TierThresholds {
    /// Credits (cents) at or above which the runtime is in the high tier.
    pub high: i64,
    /// Credits (cents) at or above which the runtime is in the normal tier.
    pub normal: i64,
    /// Credits (cents) at or above which the runtime is in low-compute.
    pub low_compute: i64,
    /// Credits (cents) at or above which the runtime is critical; below is dead.
    pub critical: i64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            high: 2000,
            normal: 500,
            low_compute: 100,
            critical: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub conway_api_url: String,
    pub conway_api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai_base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anthropic_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anthropic_base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ollama_base_url: Option<String>,
    pub inference_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_compute_model: Option<String>,
    pub model_strategy: String,
    pub wallet_address: String,
    pub creator_address: String,
    pub genesis_prompt: String,
    pub tier_thresholds: TierThresholds,
    pub max_tokens_per_turn: u32,
    pub heartbeat_interval_secs: u64,
    pub max_children: u32,
    pub db_path: String,
    pub log_path: String,
}

/// Default (partial) config. Fields with no sensible default are empty
/// so callers can override them.
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig {
        conway_api_url: "https://api.conway.tech".to_string(),
        conway_api_key: String::new(),
        openai_api_key: None,
        openai_base_url: None,
        anthropic_api_key: None,
        anthropic_base_url: None,
        ollama_base_url: None,
        inference_model: "gpt-4o".to_string(),
        low_compute_model: None,
        model_strategy: "cheapest-capable".to_string(),
        wallet_address: String::new(),
        creator_address: String::new(),
        genesis_prompt: String::new(),
        tier_thresholds: TierThresholds::default(),
        max_tokens_per_turn: 4096,
        heartbeat_interval_secs: 60,
        max_children: 3,
        db_path: "~/.automaton/state.db".to_string(),
        log_path: "~/.automaton/moneyclaw.log".to_string(),
    }
}

// ─── Survival Tiers ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SurvivalTier {
    High,
    Normal,
    LowCompute,
    Critical,
    Dead,
}

impl SurvivalTier {
    /// Ordering from worst to best health. Used for tier-minimum gating.
    pub fn rank(&self) -> u8 {
        match self {
            SurvivalTier::Dead => 0,
            SurvivalTier::Critical => 1,
            SurvivalTier::LowCompute => 2,
            SurvivalTier::Normal => 3,
            SurvivalTier::High => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SurvivalTier::High => "high",
            SurvivalTier::Normal => "normal",
            SurvivalTier::LowCompute => "low_compute",
            SurvivalTier::Critical => "critical",
            SurvivalTier::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<SurvivalTier> {
        match s {
            "high" => Some(SurvivalTier::High),
            "normal" => Some(SurvivalTier::Normal),
            "low_compute" => Some(SurvivalTier::LowCompute),
            "critical" => Some(SurvivalTier::Critical),
            "dead" => Some(SurvivalTier::Dead),
            _ => None,
        }
    }
}

/// Health signals the tier governor consumes.
#[derive(Clone, Debug, Default)]
pub struct HealthSnapshot {
    pub credits_cents: i64,
    pub errors_last_hour: u32,
    pub topup_failed: bool,
    pub topup_impossible: bool,
}

// ─── Turns ───────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Completed,
    Failed,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Pending => "pending",
            TurnStatus::Completed => "completed",
            TurnStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<TurnStatus> {
        match s {
            "pending" => Some(TurnStatus::Pending),
            "completed" => Some(TurnStatus::Completed),
            "failed" => Some(TurnStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    pub session_id: i64,
    pub turn_index: i64,
    pub tier: SurvivalTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub credit_delta_cents: f64,
    pub status: TurnStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub output: String,
    pub exit_code: i32,
    pub started_at: String,
    pub finished_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

// ─── Chat Contract ───────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Raw JSON argument string as returned by the provider.
    pub arguments: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Clone, Debug, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub tools: Option<Vec<ToolDefinition>>,
}

#[derive(Clone, Debug)]
pub struct ChatResult {
    pub message: ChatMessage,
    pub usage: TokenUsage,
    pub model: String,
    pub finish_reason: String,
}

/// The inference contract the agent loop depends on.
#[async_trait]
pub trait InferenceRouter: Send + Sync {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        options: ChatOptions,
    ) -> anyhow::Result<ChatResult>;

    fn set_low_compute_mode(&self, enabled: bool);
    fn get_default_model(&self) -> String;
}

// ─── Model Registry ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Conway,
    Openai,
    Anthropic,
    Ollama,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Conway => "conway",
            Provider::Openai => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Ollama => "ollama",
        }
    }

    pub fn parse(s: &str) -> Option<Provider> {
        match s {
            "conway" => Some(Provider::Conway),
            "openai" => Some(Provider::Openai),
            "anthropic" => Some(Provider::Anthropic),
            "ollama" => Some(Provider::Ollama),
            _ => None,
        }
    }
}

/// Which token-limit parameter name a model's endpoint expects.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParamStyle {
    MaxTokens,
    MaxCompletionTokens,
}

impl ParamStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamStyle::MaxTokens => "max_tokens",
            ParamStyle::MaxCompletionTokens => "max_completion_tokens",
        }
    }

    pub fn parse(s: &str) -> Option<ParamStyle> {
        match s {
            "max_tokens" => Some(ParamStyle::MaxTokens),
            "max_completion_tokens" => Some(ParamStyle::MaxCompletionTokens),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    pub model_id: String,
    pub provider: Provider,
    pub display_name: String,
    pub tier_minimum: SurvivalTier,
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
    pub max_output_tokens: u32,
    pub context_window: u32,
    pub supports_tools: bool,
    pub supports_vision: bool,
    pub param_style: ParamStyle,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

// ─── Replication ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChildStatus {
    Spawning,
    Healthy,
    Stopped,
    Dead,
    CleanedUp,
}

impl ChildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildStatus::Spawning => "spawning",
            ChildStatus::Healthy => "healthy",
            ChildStatus::Stopped => "stopped",
            ChildStatus::Dead => "dead",
            ChildStatus::CleanedUp => "cleaned_up",
        }
    }

    pub fn parse(s: &str) -> Option<ChildStatus> {
        match s {
            "spawning" => Some(ChildStatus::Spawning),
            "healthy" => Some(ChildStatus::Healthy),
            "stopped" => Some(ChildStatus::Stopped),
            "dead" => Some(ChildStatus::Dead),
            "cleaned_up" => Some(ChildStatus::CleanedUp),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildRecord {
    pub id: String,
    pub name: String,
    pub address: String,
    pub sandbox_id: String,
    pub genesis_prompt: String,
    pub status: ChildStatus,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub id: i64,
    pub child_id: String,
    pub transition: String,
    pub to_state: String,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisConfig {
    pub name: String,
    pub genesis_prompt: String,
    pub creator_address: String,
    pub parent_address: String,
}

// ─── Sandbox Capability ──────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcpu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_gb: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub id: String,
    pub status: String,
    pub created_at: String,
}

/// Operations the runtime needs from the Conway control plane: sandbox
/// management for replication plus the credit calls that keep it alive.
#[async_trait]
pub trait ConwayCapability: Send + Sync {
    async fn create_sandbox(&self, options: CreateSandboxOptions) -> anyhow::Result<SandboxInfo>;
    async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout_ms: Option<u64>,
    ) -> anyhow::Result<ExecResult>;
    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str)
        -> anyhow::Result<()>;
    async fn delete_sandbox(&self, sandbox_id: &str) -> anyhow::Result<()>;

    async fn get_credits_balance(&self) -> anyhow::Result<f64>;
    async fn transfer_credits(&self, to_address: &str, amount_cents: u64) -> anyhow::Result<()>;
}
