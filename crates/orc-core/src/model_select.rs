//! ModelSelector (spec §4.5): a pure, deterministic policy mapping
//! `(stage, complexity, effort, attemptCount, subtaskFlag)` to a model tier.
//!
//! The base tier table is read from `model_tiers.toml` at compile time (the
//! "hard-coded defaults" the contract requires), overridable per
//! `(stage, complexity, effort)` by rows cached from the `model_configs`
//! table. Nothing here touches I/O or global state; callers own loading the
//! override rows.

use std::fmt;

use orc_db::models::{Complexity, Effort, ModelConfig};
use serde::Deserialize;

/// The two stages that ask the selector for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Coder,
    Fixer,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Self::Coder => "coder",
            Self::Fixer => "fixer",
        }
    }
}

/// A capability tier, ordered from cheapest/fastest to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModelTier {
    Nano,
    Small,
    Medium,
    Strong,
    Highest,
}

impl ModelTier {
    fn escalate(self) -> Self {
        match self {
            Self::Nano => Self::Small,
            Self::Small => Self::Medium,
            Self::Medium => Self::Strong,
            Self::Strong | Self::Highest => Self::Highest,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Nano => "nano",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Strong => "strong",
            Self::Highest => "highest",
        }
    }

    fn cost_bucket(self) -> &'static str {
        match self {
            Self::Nano => "minimal",
            Self::Small => "low",
            Self::Medium => "moderate",
            Self::Strong => "high",
            Self::Highest => "maximum",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "nano" => Some(Self::Nano),
            "small" => Some(Self::Small),
            "medium" => Some(Self::Medium),
            "strong" => Some(Self::Strong),
            "highest" => Some(Self::Highest),
            _ => None,
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The selector's verdict: a tier, its model identifier, an estimated cost
/// bucket, and a stable rationale string (spec §4.5, §8 property 8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub tier: ModelTier,
    pub model: String,
    pub cost_bucket: String,
    pub rationale: String,
}

/// Failure modes that stop model selection before a tier is picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ModelSelectError {
    #[error("complexity requires decomposition before model selection")]
    NeedsDecomposition,
    #[error("COMPLEXITY_TOO_HIGH: no further decomposition possible")]
    ComplexityTooHigh,
}

#[derive(Deserialize)]
struct TierTableEntry {
    stage: String,
    complexity: String,
    effort: String,
    tier: String,
}

#[derive(Deserialize)]
struct TierTable {
    entries: Vec<TierTableEntry>,
}

static TIER_TABLE_TOML: &str = include_str!("model_tiers.toml");

fn default_base_tier(complexity: Complexity, effort: Effort) -> ModelTier {
    let table: TierTable =
        toml::from_str(TIER_TABLE_TOML).expect("embedded model_tiers.toml is invalid");

    table
        .entries
        .iter()
        .find(|e| {
            e.stage == "coder"
                && e.complexity == complexity.to_string()
                && e.effort == effort.to_string()
        })
        .and_then(|e| ModelTier::from_str(&e.tier))
        .unwrap_or(ModelTier::Medium)
}

/// Look up a cached override row for `(stage, complexity, effort)`, if any.
fn lookup_override(
    overrides: &[ModelConfig],
    stage: Stage,
    complexity: Complexity,
    effort: Effort,
) -> Option<ModelTier> {
    overrides
        .iter()
        .find(|c| {
            c.stage == stage.as_str()
                && c.complexity == Some(complexity)
                && c.effort == Some(effort)
        })
        .and_then(|c| ModelTier::from_str(&c.tier))
}

/// Select a model tier for one agent invocation.
///
/// `L` and `XL` complexity route to decomposition instead of direct
/// selection unless `subtask_flag` is set (meaning this call is already for
/// a post-decomposition subtask). An `XL` subtask has nowhere further to
/// decompose to, so it fails with [`ModelSelectError::ComplexityTooHigh`].
pub fn select(
    stage: Stage,
    complexity: Complexity,
    effort: Effort,
    attempt_count: u32,
    subtask_flag: bool,
    overrides: &[ModelConfig],
) -> Result<ModelSelection, ModelSelectError> {
    match complexity {
        Complexity::L if !subtask_flag => return Err(ModelSelectError::NeedsDecomposition),
        Complexity::Xl if !subtask_flag => return Err(ModelSelectError::NeedsDecomposition),
        Complexity::Xl if subtask_flag => return Err(ModelSelectError::ComplexityTooHigh),
        _ => {}
    }

    let base = match stage {
        // Fixer selection is independent of complexity: the error model
        // expects the fixer to be at least as capable as the coder that
        // produced the error, so it always starts from a strong tier.
        Stage::Fixer => ModelTier::Strong,
        Stage::Coder => lookup_override(overrides, stage, complexity, effort)
            .unwrap_or_else(|| default_base_tier(complexity, effort)),
    };

    let tier = match attempt_count {
        0 => base,
        1 => base.escalate(),
        _ => ModelTier::Highest,
    };

    let rationale = format!(
        "stage={} complexity={complexity} effort={effort} attempt={attempt_count} subtask={subtask_flag} -> tier={tier}",
        stage.as_str(),
    );

    Ok(ModelSelection {
        tier,
        model: tier.to_string(),
        cost_bucket: tier.cost_bucket().to_owned(),
        rationale,
    })
}
