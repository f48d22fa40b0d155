//! Closed record types for each agent family's output (spec §9:
//! "define closed record types ... with explicit optional fields" instead
//! of runtime shape-checking).

use orc_db::models::{Complexity, CommandPhase, Effort, PlannedCommand, RootCause};
use serde::{Deserialize, Serialize};

/// What the planner produced for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerOutput {
    pub definition_of_done: Vec<String>,
    pub plan: Vec<String>,
    pub target_files: Vec<String>,
    pub complexity: Complexity,
    #[serde(default)]
    pub effort: Option<Effort>,
    #[serde(default)]
    pub commands: Vec<PlannedCommand>,
    #[serde(default)]
    pub requires_approval: bool,
}

/// What the coder (or fixer, reusing the same shape) produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoderOutput {
    pub diff: String,
    #[serde(default)]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// What the fixer produced: a coder-shaped diff plus the root cause it
/// attributes the failure to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixerOutput {
    pub diff: String,
    pub root_cause: RootCause,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Normalized reviewer verdict. Raw agent text like `"APPROVE"`,
/// `"approved"`, `"LGTM"` is folded into `approved` during parsing
/// (spec §9: "normalize APPROVE|APPROVED and similar synonyms").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewVerdict {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewerOutput {
    pub verdict: ReviewVerdict,
    #[serde(default)]
    pub comments: Vec<String>,
}

/// One subtask as proposed by the breakdown agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedSubtask {
    pub description: String,
    pub target_files: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownOutput {
    pub subtasks: Vec<ProposedSubtask>,
}

/// A reflection pass's verdict on why a stage failed (spec §4.7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionOutput {
    pub root_cause: RootCause,
    pub confidence: f32,
    #[serde(default)]
    pub should_replan: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Marker for whether a planned command runs before or after the coder's
/// diff is applied; re-exported here so callers of this module don't need
/// to reach into `orc_db` directly for it.
pub type Phase = CommandPhase;
