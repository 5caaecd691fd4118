//! Survival Tier Governor
//!
//! Maps observable health signals (credits, error rate, topup flags) to
//! a survival tier and applies per-tier restrictions. The classification
//! itself is pure; only `apply_tier_restrictions` touches state.

use tracing::{info, warn};

use crate::state::Database;
use crate::types::{HealthSnapshot, InferenceRouter, SurvivalTier, TierThresholds};

/// Hardcoded fallback when no low-compute model is configured.
pub const FALLBACK_CHEAP_MODEL: &str = "gpt-5-mini";

/// Errors per hour at or above which the high tier is withheld.
const HIGH_TIER_MAX_ERRORS_PER_HOUR: u32 = 10;

/// KV key holding the tier last applied by `apply_tier_restrictions`.
pub const CURRENT_TIER_KEY: &str = "current_tier";

/// Classify runtime health into a survival tier.
///
/// Evaluation is top-down from worst to best: running out of credits
/// dominates, a recent failed topup pulls an otherwise healthy runtime
/// down to low-compute, and the high tier additionally requires a quiet
/// error rate.
pub fn compute_tier(snapshot: &HealthSnapshot, thresholds: &TierThresholds) -> SurvivalTier {
    let credits = snapshot.credits_cents;

    if credits < thresholds.critical {
        if snapshot.topup_impossible {
            return SurvivalTier::Dead;
        }
        return SurvivalTier::Critical;
    }
    if credits < thresholds.low_compute {
        return SurvivalTier::Critical;
    }
    if credits < thresholds.normal || snapshot.topup_failed {
        return SurvivalTier::LowCompute;
    }
    if credits < thresholds.high || snapshot.errors_last_hour >= HIGH_TIER_MAX_ERRORS_PER_HOUR {
        return SurvivalTier::Normal;
    }
    SurvivalTier::High
}

/// Persist the tier and toggle the router's low-compute mode.
pub fn apply_tier_restrictions(
    tier: SurvivalTier,
    db: &Database,
    router: &dyn InferenceRouter,
) -> anyhow::Result<()> {
    match tier {
        SurvivalTier::High | SurvivalTier::Normal => {
            info!(tier = tier.as_str(), "tier restrictions: none");
            router.set_low_compute_mode(false);
        }
        SurvivalTier::LowCompute => {
            warn!("low-compute tier: cheap model forced, discovery and replication suspended");
            router.set_low_compute_mode(true);
        }
        SurvivalTier::Critical => {
            warn!("critical tier: cheap model forced, reduced output budget");
            router.set_low_compute_mode(true);
        }
        SurvivalTier::Dead => {
            warn!("dead tier: inference disabled");
            router.set_low_compute_mode(true);
        }
    }

    db.set_kv(CURRENT_TIER_KEY, tier.as_str())?;
    Ok(())
}

/// Read the last applied tier from the store. Defaults to normal when
/// nothing has been applied yet.
pub fn current_tier(db: &Database) -> SurvivalTier {
    db.get_kv(CURRENT_TIER_KEY)
        .ok()
        .flatten()
        .and_then(|s| SurvivalTier::parse(&s))
        .unwrap_or(SurvivalTier::Normal)
}

/// Whether inference is permitted at all in this tier.
pub fn can_run_inference(tier: SurvivalTier) -> bool {
    tier != SurvivalTier::Dead
}

/// Whether optional heartbeat side-effects (discovery refresh,
/// replication) are suspended in this tier.
pub fn suspends_optional_tasks(tier: SurvivalTier) -> bool {
    matches!(
        tier,
        SurvivalTier::LowCompute | SurvivalTier::Critical | SurvivalTier::Dead
    )
}

/// Model to use at a given tier. High and normal keep the default;
/// every starved tier gets the cheap model.
pub fn get_model_for_tier(
    tier: SurvivalTier,
    default_model: &str,
    cheap_model: Option<&str>,
) -> String {
    match tier {
        SurvivalTier::High | SurvivalTier::Normal => default_model.to_string(),
        SurvivalTier::LowCompute | SurvivalTier::Critical | SurvivalTier::Dead => {
            cheap_model.unwrap_or(FALLBACK_CHEAP_MODEL).to_string()
        }
    }
}
