//! Database query functions for the `model_configs` cache table
//! (spec §4.5, §5).
//!
//! The model selector (spec §4.5) is a pure function over defaults loaded
//! from embedded TOML; this table is an operator-editable override cache
//! consulted before falling back to the pure defaults.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{Complexity, Effort, ModelConfig};

/// Look up a cached tier override for a given stage/complexity/effort
/// combination. `complexity`/`effort` use `NULL` for stage-wide overrides
/// that don't vary on those axes (e.g. `"review"`).
pub async fn get_model_config(
    pool: &PgPool,
    stage: &str,
    complexity: Option<Complexity>,
    effort: Option<Effort>,
) -> Result<Option<ModelConfig>> {
    let config = sqlx::query_as::<_, ModelConfig>(
        "SELECT * FROM model_configs \
         WHERE stage = $1 \
           AND complexity IS NOT DISTINCT FROM $2 \
           AND effort IS NOT DISTINCT FROM $3",
    )
    .bind(stage)
    .bind(complexity)
    .bind(effort)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to fetch model config for stage {stage}"))?;

    Ok(config)
}

/// Insert or update a model-tier override. `(stage, complexity, effort)` is
/// the unique key, so a repeated call is an upsert.
pub async fn upsert_model_config(
    pool: &PgPool,
    stage: &str,
    complexity: Option<Complexity>,
    effort: Option<Effort>,
    tier: &str,
    cost_bucket: &str,
) -> Result<ModelConfig> {
    let config = sqlx::query_as::<_, ModelConfig>(
        "INSERT INTO model_configs (stage, complexity, effort, tier, cost_bucket) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (stage, complexity, effort) \
         DO UPDATE SET tier = EXCLUDED.tier, \
                       cost_bucket = EXCLUDED.cost_bucket, \
                       updated_at = NOW() \
         RETURNING *",
    )
    .bind(stage)
    .bind(complexity)
    .bind(effort)
    .bind(tier)
    .bind(cost_bucket)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to upsert model config for stage {stage}"))?;

    Ok(config)
}

/// List every cached override, for the `orc invariant`-style inspection
/// commands.
pub async fn list_model_configs(pool: &PgPool) -> Result<Vec<ModelConfig>> {
    let configs = sqlx::query_as::<_, ModelConfig>("SELECT * FROM model_configs ORDER BY stage")
        .fetch_all(pool)
        .await
        .context("failed to list model configs")?;

    Ok(configs)
}
