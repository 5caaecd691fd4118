//! Runtime Configuration
//!
//! Loads and saves the runtime configuration from `~/.automaton/automaton.json`.
//! Environment variables override endpoint values from the file.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::types::{default_config, RuntimeConfig};

/// Config file name within the automaton directory.
const CONFIG_FILENAME: &str = "automaton.json";

/// Returns the runtime's home directory: `~/.automaton`.
pub fn get_automaton_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
    home.join(".automaton")
}

/// Returns the full path to the config file: `~/.automaton/automaton.json`.
pub fn get_config_path() -> PathBuf {
    get_automaton_dir().join(CONFIG_FILENAME)
}

/// Load the runtime config from disk, merge defaults for unset fields,
/// and apply environment-variable overrides on top.
///
/// Returns `None` if the config file does not exist or cannot be parsed.
pub fn load_config() -> Option<RuntimeConfig> {
    let config_path = get_config_path();
    if !config_path.exists() {
        return None;
    }

    let contents = fs::read_to_string(&config_path).ok()?;
    let config: RuntimeConfig = serde_json::from_str(&contents).ok()?;
    Some(apply_env_overrides(merge_defaults(config)))
}

/// Fill in default values for fields the file left empty.
pub fn merge_defaults(mut config: RuntimeConfig) -> RuntimeConfig {
    let defaults = default_config();

    if config.conway_api_url.is_empty() {
        config.conway_api_url = defaults.conway_api_url;
    }
    if config.inference_model.is_empty() {
        config.inference_model = defaults.inference_model;
    }
    if config.model_strategy.is_empty() {
        config.model_strategy = defaults.model_strategy;
    }
    if config.max_tokens_per_turn == 0 {
        config.max_tokens_per_turn = defaults.max_tokens_per_turn;
    }
    if config.heartbeat_interval_secs == 0 {
        config.heartbeat_interval_secs = defaults.heartbeat_interval_secs;
    }
    if config.max_children == 0 {
        config.max_children = defaults.max_children;
    }
    if config.db_path.is_empty() {
        config.db_path = defaults.db_path;
    }
    if config.log_path.is_empty() {
        config.log_path = defaults.log_path;
    }

    config
}

/// Apply environment-variable overrides for provider endpoints.
pub fn apply_env_overrides(mut config: RuntimeConfig) -> RuntimeConfig {
    if let Ok(url) = std::env::var("CONWAY_API_URL") {
        if !url.is_empty() {
            config.conway_api_url = url;
        }
    }
    if let Ok(key) = std::env::var("CONWAY_API_KEY") {
        if !key.is_empty() {
            config.conway_api_key = key;
        }
    }
    if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
        if !url.is_empty() {
            config.openai_base_url = Some(url);
        }
    }
    if let Ok(url) = std::env::var("ANTHROPIC_BASE_URL") {
        if !url.is_empty() {
            config.anthropic_base_url = Some(url);
        }
    }
    if let Ok(url) = std::env::var("OLLAMA_BASE_URL") {
        if !url.is_empty() {
            config.ollama_base_url = Some(url);
        }
    }
    config
}

/// Save the runtime config to `~/.automaton/automaton.json`.
///
/// Creates the directory with mode 0o700 if it does not exist. The file
/// is written with mode 0o600 since it contains API keys.
pub fn save_config(config: &RuntimeConfig) -> Result<()> {
    let dir = get_automaton_dir();
    if !dir.exists() {
        fs::create_dir_all(&dir).context("Failed to create automaton directory")?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
    }

    let config_path = get_config_path();
    let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;

    fs::write(&config_path, &json).context("Failed to write config file")?;
    fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

    Ok(())
}

/// Resolve a path that may start with `~` to an absolute path.
pub fn resolve_path(p: &str) -> String {
    if let Some(rest) = p.strip_prefix('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        home.join(rest).to_string_lossy().to_string()
    } else {
        p.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TierThresholds;

    #[test]
    fn test_resolve_path_with_tilde() {
        let resolved = resolve_path("~/some/path");
        assert!(!resolved.starts_with('~'));
        assert!(resolved.ends_with("some/path"));
    }

    #[test]
    fn test_resolve_path_without_tilde() {
        let path = "/absolute/path/to/file";
        assert_eq!(resolve_path(path), path);
    }

    #[test]
    fn test_merge_defaults_fills_empty_fields() {
        let mut config = default_config();
        config.conway_api_url = String::new();
        config.max_tokens_per_turn = 0;

        let merged = merge_defaults(config);
        assert_eq!(merged.conway_api_url, "https://api.conway.tech");
        assert_eq!(merged.max_tokens_per_turn, 4096);
    }

    #[test]
    fn test_config_round_trip() {
        let mut config = default_config();
        config.wallet_address = "0x1111111111111111111111111111111111111111".to_string();
        config.creator_address = "0x2222222222222222222222222222222222222222".to_string();
        config.inference_model = "claude-sonnet-4-5".to_string();
        config.tier_thresholds = TierThresholds {
            high: 5000,
            normal: 1000,
            low_compute: 200,
            critical: 20,
        };

        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: crate::types::RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_env_override_wins_over_file_value() {
        std::env::set_var("OLLAMA_BASE_URL", "http://envhost:11434");
        let mut config = default_config();
        config.ollama_base_url = Some("http://filehost:11434".to_string());

        let overridden = apply_env_overrides(config);
        assert_eq!(
            overridden.ollama_base_url.as_deref(),
            Some("http://envhost:11434")
        );
        std::env::remove_var("OLLAMA_BASE_URL");
    }
}
