//! Process-wide configuration surface (spec §6.3).
//!
//! Every knob is environment-driven with a hard-coded default, read once at
//! process start into one immutable struct (the §9 "global mutable state →
//! single process-context value" re-architecture) and passed down as an
//! `Arc<OrcConfig>`.

use std::env;
use std::sync::Arc;

/// All tunables from spec §6.3, resolved once at startup.
#[derive(Debug, Clone)]
pub struct OrcConfig {
    pub max_attempts: i32,
    pub max_diff_lines: usize,
    pub stale_task_hours: i64,
    pub max_subtask_attempts: i32,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub batch_timeout_minutes: i64,
    pub enable_batch_merge: bool,
    pub use_foreman: bool,
    pub foreman_max_attempts: i32,
    pub validate_diff: bool,
    pub expand_imports: bool,
    pub import_depth: u32,
    pub max_related_files: usize,
    pub use_agentic_loop: bool,
    pub agentic_loop_max_iterations: u32,
    pub agentic_loop_max_replans: u32,
    pub agentic_loop_confidence_threshold: f32,
    pub enable_learning: bool,
    pub enable_knowledge_graph: bool,
    pub enable_rag: bool,
    pub comment_on_failure: bool,
}

impl OrcConfig {
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_i32("MAX_ATTEMPTS", 3),
            max_diff_lines: env_usize("MAX_DIFF_LINES", 700),
            stale_task_hours: env_i64("STALE_TASK_HOURS", 24),
            max_subtask_attempts: env_i32("MAX_SUBTASK_ATTEMPTS", 2),
            min_batch_size: env_usize("MIN_BATCH_SIZE", 2),
            max_batch_size: env_usize("MAX_BATCH_SIZE", 10),
            batch_timeout_minutes: env_i64("BATCH_TIMEOUT_MINUTES", 30),
            enable_batch_merge: env_bool("ENABLE_BATCH_MERGE", true),
            use_foreman: env_bool("USE_FOREMAN", false),
            foreman_max_attempts: env_i32("FOREMAN_MAX_ATTEMPTS", 2),
            validate_diff: env_bool("VALIDATE_DIFF", true),
            expand_imports: env_bool("EXPAND_IMPORTS", true),
            import_depth: env_u32("IMPORT_DEPTH", 1),
            max_related_files: env_usize("MAX_RELATED_FILES", 10),
            use_agentic_loop: env_bool("USE_AGENTIC_LOOP", false),
            agentic_loop_max_iterations: env_u32("AGENTIC_LOOP_MAX_ITERATIONS", 5),
            agentic_loop_max_replans: env_u32("AGENTIC_LOOP_MAX_REPLANS", 2),
            agentic_loop_confidence_threshold: env_f32("AGENTIC_LOOP_CONFIDENCE_THRESHOLD", 0.6),
            enable_learning: env_bool("ENABLE_LEARNING", true),
            enable_knowledge_graph: env_bool("ENABLE_KNOWLEDGE_GRAPH", false),
            enable_rag: env_bool("ENABLE_RAG", false),
            comment_on_failure: env_bool("COMMENT_ON_FAILURE", false),
        }
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl Default for OrcConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_i32(name: &str, default: i32) -> i32 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f32(name: &str, default: f32) -> f32 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        // SAFETY: single-threaded test, no env vars touched concurrently.
        for key in [
            "MAX_ATTEMPTS",
            "MAX_DIFF_LINES",
            "STALE_TASK_HOURS",
            "USE_AGENTIC_LOOP",
        ] {
            unsafe { env::remove_var(key) };
        }
        let cfg = OrcConfig::from_env();
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.max_diff_lines, 700);
        assert_eq!(cfg.stale_task_hours, 24);
        assert!(!cfg.use_agentic_loop);
        assert_eq!(cfg.min_batch_size, 2);
        assert_eq!(cfg.max_batch_size, 10);
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        unsafe { env::set_var("ORC_TEST_BOOL_FLAG", "yes") };
        assert!(env_bool("ORC_TEST_BOOL_FLAG", false));
        unsafe { env::remove_var("ORC_TEST_BOOL_FLAG") };
    }
}
