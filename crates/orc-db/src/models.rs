use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task -- the closed set from the state machine (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    New,
    Planning,
    PlanningDone,
    PlanPendingApproval,
    BreakingDown,
    BreakdownDone,
    Orchestrating,
    Coding,
    CodingDone,
    Testing,
    TestsPassed,
    TestsFailed,
    VisualTesting,
    VisualTestsPassed,
    VisualTestsFailed,
    Fixing,
    Reflecting,
    Replanning,
    Reviewing,
    ReviewApproved,
    ReviewRejected,
    WaitingBatch,
    PrCreated,
    WaitingHuman,
    Completed,
    Failed,
}

impl TaskStatus {
    /// All 26 states, in declaration order. Used by exhaustive tests and by
    /// the stale-task sweep's "intermediate states" filter.
    pub const ALL: &'static [TaskStatus] = &[
        Self::New,
        Self::Planning,
        Self::PlanningDone,
        Self::PlanPendingApproval,
        Self::BreakingDown,
        Self::BreakdownDone,
        Self::Orchestrating,
        Self::Coding,
        Self::CodingDone,
        Self::Testing,
        Self::TestsPassed,
        Self::TestsFailed,
        Self::VisualTesting,
        Self::VisualTestsPassed,
        Self::VisualTestsFailed,
        Self::Fixing,
        Self::Reflecting,
        Self::Replanning,
        Self::Reviewing,
        Self::ReviewApproved,
        Self::ReviewRejected,
        Self::WaitingBatch,
        Self::PrCreated,
        Self::WaitingHuman,
        Self::Completed,
        Self::Failed,
    ];

    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// States in which a task is waiting on an external signal (human input
    /// or batch readiness) rather than actively advancing.
    pub fn is_waiting(self) -> bool {
        matches!(self, Self::WaitingHuman | Self::WaitingBatch)
    }

    /// Intermediate (non-terminal, non-waiting) states eligible for the
    /// stale-task sweep (spec §6.4).
    pub fn is_intermediate(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Planning => "planning",
            Self::PlanningDone => "planning_done",
            Self::PlanPendingApproval => "plan_pending_approval",
            Self::BreakingDown => "breaking_down",
            Self::BreakdownDone => "breakdown_done",
            Self::Orchestrating => "orchestrating",
            Self::Coding => "coding",
            Self::CodingDone => "coding_done",
            Self::Testing => "testing",
            Self::TestsPassed => "tests_passed",
            Self::TestsFailed => "tests_failed",
            Self::VisualTesting => "visual_testing",
            Self::VisualTestsPassed => "visual_tests_passed",
            Self::VisualTestsFailed => "visual_tests_failed",
            Self::Fixing => "fixing",
            Self::Reflecting => "reflecting",
            Self::Replanning => "replanning",
            Self::Reviewing => "reviewing",
            Self::ReviewApproved => "review_approved",
            Self::ReviewRejected => "review_rejected",
            Self::WaitingBatch => "waiting_batch",
            Self::PrCreated => "pr_created",
            Self::WaitingHuman => "waiting_human",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "planning" => Ok(Self::Planning),
            "planning_done" => Ok(Self::PlanningDone),
            "plan_pending_approval" => Ok(Self::PlanPendingApproval),
            "breaking_down" => Ok(Self::BreakingDown),
            "breakdown_done" => Ok(Self::BreakdownDone),
            "orchestrating" => Ok(Self::Orchestrating),
            "coding" => Ok(Self::Coding),
            "coding_done" => Ok(Self::CodingDone),
            "testing" => Ok(Self::Testing),
            "tests_passed" => Ok(Self::TestsPassed),
            "tests_failed" => Ok(Self::TestsFailed),
            "visual_testing" => Ok(Self::VisualTesting),
            "visual_tests_passed" => Ok(Self::VisualTestsPassed),
            "visual_tests_failed" => Ok(Self::VisualTestsFailed),
            "fixing" => Ok(Self::Fixing),
            "reflecting" => Ok(Self::Reflecting),
            "replanning" => Ok(Self::Replanning),
            "reviewing" => Ok(Self::Reviewing),
            "review_approved" => Ok(Self::ReviewApproved),
            "review_rejected" => Ok(Self::ReviewRejected),
            "waiting_batch" => Ok(Self::WaitingBatch),
            "pr_created" => Ok(Self::PrCreated),
            "waiting_human" => Ok(Self::WaitingHuman),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Estimated complexity of a task, assigned during planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Xs,
    S,
    M,
    L,
    Xl,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Xs => "xs",
            Self::S => "s",
            Self::M => "m",
            Self::L => "l",
            Self::Xl => "xl",
        };
        f.write_str(s)
    }
}

impl FromStr for Complexity {
    type Err = ComplexityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "xs" => Ok(Self::Xs),
            "s" => Ok(Self::S),
            "m" => Ok(Self::M),
            "l" => Ok(Self::L),
            "xl" => Ok(Self::Xl),
            other => Err(ComplexityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Complexity`] string.
#[derive(Debug, Clone)]
pub struct ComplexityParseError(pub String);

impl fmt::Display for ComplexityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid complexity: {:?}", self.0)
    }
}

impl std::error::Error for ComplexityParseError {}

// ---------------------------------------------------------------------------

/// Qualitative effort dimension within a complexity class (spec GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    Low,
    Medium,
    High,
}

impl Default for Effort {
    fn default() -> Self {
        Self::Medium
    }
}

impl fmt::Display for Effort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for Effort {
    type Err = EffortParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(EffortParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Effort`] string.
#[derive(Debug, Clone)]
pub struct EffortParseError(pub String);

impl fmt::Display for EffortParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid effort: {:?}", self.0)
    }
}

impl std::error::Error for EffortParseError {}

// ---------------------------------------------------------------------------

/// Root cause a reflection step attributes a test failure to (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RootCause {
    Plan,
    Code,
    Test,
    Environment,
}

impl fmt::Display for RootCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plan => "plan",
            Self::Code => "code",
            Self::Test => "test",
            Self::Environment => "environment",
        };
        f.write_str(s)
    }
}

impl FromStr for RootCause {
    type Err = RootCauseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "code" => Ok(Self::Code),
            "test" => Ok(Self::Test),
            "environment" => Ok(Self::Environment),
            other => Err(RootCauseParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RootCause`] string.
#[derive(Debug, Clone)]
pub struct RootCauseParseError(pub String);

impl fmt::Display for RootCauseParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid root cause: {:?}", self.0)
    }
}

impl std::error::Error for RootCauseParseError {}

// ---------------------------------------------------------------------------

/// Status of a subtask within a task's [`OrchestrationState`] (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl FromStr for SubtaskStatus {
    type Err = SubtaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            other => Err(SubtaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SubtaskStatus`] string.
#[derive(Debug, Clone)]
pub struct SubtaskStatusParseError(pub String);

impl fmt::Display for SubtaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid subtask status: {:?}", self.0)
    }
}

impl std::error::Error for SubtaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a batch of file-overlapping tasks merged into one PR (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for BatchStatus {
    type Err = BatchStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(BatchStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`BatchStatus`] string.
#[derive(Debug, Clone)]
pub struct BatchStatusParseError(pub String);

impl fmt::Display for BatchStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid batch status: {:?}", self.0)
    }
}

impl std::error::Error for BatchStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of memory pattern (spec §3 Observation/Pattern/Archive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Fix,
    Convention,
    Failure,
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fix => "fix",
            Self::Convention => "convention",
            Self::Failure => "failure",
        };
        f.write_str(s)
    }
}

impl FromStr for PatternKind {
    type Err = PatternKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fix" => Ok(Self::Fix),
            "convention" => Ok(Self::Convention),
            "failure" => Ok(Self::Failure),
            other => Err(PatternKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PatternKind`] string.
#[derive(Debug, Clone)]
pub struct PatternKindParseError(pub String);

impl fmt::Display for PatternKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pattern kind: {:?}", self.0)
    }
}

impl std::error::Error for PatternKindParseError {}

// ---------------------------------------------------------------------------

/// Kind of invariant check run during Testing/DiffValidator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvariantKind {
    TestSuite,
    Typecheck,
    Lint,
    Coverage,
    Custom,
}

impl fmt::Display for InvariantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TestSuite => "test_suite",
            Self::Typecheck => "typecheck",
            Self::Lint => "lint",
            Self::Coverage => "coverage",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

impl FromStr for InvariantKind {
    type Err = InvariantKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test_suite" => Ok(Self::TestSuite),
            "typecheck" => Ok(Self::Typecheck),
            "lint" => Ok(Self::Lint),
            "coverage" => Ok(Self::Coverage),
            "custom" => Ok(Self::Custom),
            other => Err(InvariantKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`InvariantKind`] string.
#[derive(Debug, Clone)]
pub struct InvariantKindParseError(pub String);

impl fmt::Display for InvariantKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid invariant kind: {:?}", self.0)
    }
}

impl std::error::Error for InvariantKindParseError {}

// ---------------------------------------------------------------------------

/// Scope of an invariant -- global or repo-level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvariantScope {
    Global,
    Repo,
}

impl fmt::Display for InvariantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Global => "global",
            Self::Repo => "repo",
        };
        f.write_str(s)
    }
}

impl FromStr for InvariantScope {
    type Err = InvariantScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "repo" => Ok(Self::Repo),
            other => Err(InvariantScopeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`InvariantScope`] string.
#[derive(Debug, Clone)]
pub struct InvariantScopeParseError(pub String);

impl fmt::Display for InvariantScopeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid invariant scope: {:?}", self.0)
    }
}

impl std::error::Error for InvariantScopeParseError {}

// ---------------------------------------------------------------------------
// Embedded (non-enum) value types
// ---------------------------------------------------------------------------

/// The phase tag attached to a planner-issued command (spec §3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandPhase {
    BeforeDiff,
    AfterDiff,
}

/// One entry in a task's ordered command list, stored as a JSON array in
/// `tasks.commands`. The [`crate::models::CommandPhase`] tag lets the Coding
/// handler split the list into "run before applying the diff" and "run
/// after" per spec §4.4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedCommand {
    pub command: String,
    pub args: Vec<String>,
    pub phase: CommandPhase,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// The primary entity: one unit of work driven by the state machine, scoped
/// to a single repository issue (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,

    // Identity (natural key: repo + issue number).
    pub repo: String,
    pub issue_number: i32,

    pub status: TaskStatus,

    // Planning artifacts.
    pub dod: Vec<String>,
    pub plan_steps: Vec<String>,
    pub target_files: Vec<String>,
    pub multi_file_plan: Option<serde_json::Value>,
    pub commands: serde_json::Value,
    pub complexity: Option<Complexity>,
    pub effort: Option<Effort>,
    pub requested_harness: Option<String>,

    // Coding artifacts.
    pub branch_name: Option<String>,
    pub current_diff: Option<String>,
    pub commit_message: Option<String>,
    pub worktree_path: Option<String>,

    // Review/PR.
    pub pr_number: Option<i32>,
    pub pr_url: Option<String>,
    pub pr_title: Option<String>,

    // Retry bookkeeping.
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub root_cause: Option<RootCause>,

    // Agentic loop metrics.
    pub loop_iterations: i32,
    pub loop_replans: i32,
    pub last_confidence: Option<f32>,
    pub loop_duration_ms: Option<i64>,

    // Hierarchy.
    pub parent_task_id: Option<Uuid>,
    pub subtask_index: Option<i32>,
    pub is_orchestrated: bool,
    pub current_subtask_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// `true` once this task has exhausted its retry budget (spec invariant 2).
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// An element of a task's [`crate::models::TaskStatus::Orchestrating`] phase:
/// one subtask produced by decomposition (spec §3, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subtask {
    pub id: Uuid,
    pub parent_task_id: Uuid,
    pub child_task_id: Option<Uuid>,
    pub status: SubtaskStatus,
    pub diff: Option<String>,
    pub attempt_count: i32,
    pub target_files: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub depends_on: Vec<Uuid>,
    pub seq: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A group of file-overlapping approved tasks merged into a single PR
/// (spec §3, §4.9).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Batch {
    pub id: Uuid,
    pub repo: String,
    pub base_branch: String,
    pub target_files: Vec<String>,
    pub status: BatchStatus,
    pub pr_number: Option<i32>,
    pub pr_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Membership of a task in a batch, with insertion time (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BatchMembership {
    pub task_id: Uuid,
    pub batch_id: Uuid,
    pub joined_at: DateTime<Utc>,
}

/// An append-only structured event in a task's history (spec §3).
///
/// `event_type` is drawn from a closed set maintained in
/// `orc_core::events::EventType`; it is stored as free text here (as the
/// teacher stores every enum) rather than re-deriving a second `sqlx::Type`
/// enum, since the event type set is owned by the orchestration core, not
/// the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: Uuid,
    pub event_type: String,
    pub agent: Option<String>,
    pub input_summary: Option<String>,
    pub output_summary: Option<String>,
    pub tokens: Option<i64>,
    pub duration_ms: Option<i64>,
    pub metadata: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// A reusable invariant definition (build/test/lint/typecheck command).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invariant {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub kind: InvariantKind,
    pub command: String,
    pub args: Vec<String>,
    pub expected_exit_code: i32,
    pub threshold: Option<f32>,
    pub scope: InvariantScope,
    pub timeout_secs: i32,
    pub created_at: DateTime<Utc>,
}

/// Join row linking a task to an invariant it must satisfy during Testing.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskInvariant {
    pub task_id: Uuid,
    pub invariant_id: Uuid,
}

/// Result of running an invariant during a Testing/DiffValidator pass.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GateResult {
    pub id: Uuid,
    pub task_id: Uuid,
    pub invariant_id: Uuid,
    pub attempt: i32,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub duration_ms: Option<i32>,
    pub checked_at: DateTime<Utc>,
}

/// A recorded observation: a decision, error, or other note an agent or
/// handler surfaces during processing (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Observation {
    pub id: Uuid,
    pub task_id: Uuid,
    pub obs_type: String,
    pub agent: Option<String>,
    pub content: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A learned fix/convention/failure pattern scoped to a repo or global
/// (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Pattern {
    pub id: Uuid,
    pub repo: Option<String>,
    pub kind: PatternKind,
    pub trigger: String,
    pub solution: String,
    pub confidence: f32,
    pub success_count: i32,
    pub last_used: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// An archived piece of knowledge with an importance score (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Archive {
    pub id: Uuid,
    pub repo: Option<String>,
    pub content: String,
    pub summary: String,
    pub source_type: String,
    pub importance: f32,
    pub created_at: DateTime<Utc>,
}

/// A cached model-tier mapping entry (spec §4.5, §5 "model-config cache").
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ModelConfig {
    pub id: Uuid,
    pub stage: String,
    pub complexity: Option<Complexity>,
    pub effort: Option<Effort>,
    pub tier: String,
    pub cost_bucket: String,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        for v in TaskStatus::ALL {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_all_is_complete() {
        assert_eq!(TaskStatus::ALL.len(), 26);
    }

    #[test]
    fn task_status_invalid() {
        let result = "nope".parse::<TaskStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn task_status_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::New.is_terminal());
        assert!(!TaskStatus::Reviewing.is_terminal());
    }

    #[test]
    fn task_status_waiting_states() {
        assert!(TaskStatus::WaitingHuman.is_waiting());
        assert!(TaskStatus::WaitingBatch.is_waiting());
        assert!(!TaskStatus::Coding.is_waiting());
    }

    #[test]
    fn complexity_display_roundtrip_and_order() {
        let variants = [
            Complexity::Xs,
            Complexity::S,
            Complexity::M,
            Complexity::L,
            Complexity::Xl,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: Complexity = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
        assert!(Complexity::Xs < Complexity::S);
        assert!(Complexity::L < Complexity::Xl);
    }

    #[test]
    fn effort_display_roundtrip() {
        for v in [Effort::Low, Effort::Medium, Effort::High] {
            let s = v.to_string();
            let parsed: Effort = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn effort_default_is_medium() {
        assert_eq!(Effort::default(), Effort::Medium);
    }

    #[test]
    fn root_cause_display_roundtrip() {
        for v in [
            RootCause::Plan,
            RootCause::Code,
            RootCause::Test,
            RootCause::Environment,
        ] {
            let s = v.to_string();
            let parsed: RootCause = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn subtask_status_display_roundtrip() {
        for v in [
            SubtaskStatus::Pending,
            SubtaskStatus::InProgress,
            SubtaskStatus::Completed,
            SubtaskStatus::Failed,
            SubtaskStatus::Blocked,
        ] {
            let s = v.to_string();
            let parsed: SubtaskStatus = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn batch_status_display_roundtrip() {
        for v in [
            BatchStatus::Pending,
            BatchStatus::Processing,
            BatchStatus::Completed,
            BatchStatus::Failed,
        ] {
            let s = v.to_string();
            let parsed: BatchStatus = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn pattern_kind_display_roundtrip() {
        for v in [PatternKind::Fix, PatternKind::Convention, PatternKind::Failure] {
            let s = v.to_string();
            let parsed: PatternKind = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn invariant_kind_display_roundtrip() {
        let variants = [
            InvariantKind::TestSuite,
            InvariantKind::Typecheck,
            InvariantKind::Lint,
            InvariantKind::Coverage,
            InvariantKind::Custom,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: InvariantKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn invariant_scope_display_roundtrip() {
        for v in [InvariantScope::Global, InvariantScope::Repo] {
            let s = v.to_string();
            let parsed: InvariantScope = s.parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn task_attempts_exhausted() {
        let mut task = sample_task();
        task.attempt_count = 2;
        task.max_attempts = 3;
        assert!(!task.attempts_exhausted());
        task.attempt_count = 3;
        assert!(task.attempts_exhausted());
    }

    fn sample_task() -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            repo: "acme/x".to_string(),
            issue_number: 1,
            status: TaskStatus::New,
            dod: vec![],
            plan_steps: vec![],
            target_files: vec![],
            multi_file_plan: None,
            commands: serde_json::json!([]),
            complexity: None,
            effort: None,
            requested_harness: None,
            branch_name: None,
            current_diff: None,
            commit_message: None,
            worktree_path: None,
            pr_number: None,
            pr_url: None,
            pr_title: None,
            attempt_count: 0,
            max_attempts: 3,
            last_error: None,
            root_cause: None,
            loop_iterations: 0,
            loop_replans: 0,
            last_confidence: None,
            loop_duration_ms: None,
            parent_task_id: None,
            subtask_index: None,
            is_orchestrated: false,
            current_subtask_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}
