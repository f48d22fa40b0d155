//! The closed error taxonomy of spec §7.
//!
//! `CoreErrorCode` is the enumerated set every handler maps its failures
//! onto; `OrchestratorError` carries one plus the contextual fields (task
//! id, message, recoverability) that `failTask`/the outer dispatcher need.

use std::fmt;

use uuid::Uuid;

/// The enumerated error codes of spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreErrorCode {
    InvalidState,
    MissingField,
    InvalidDiff,
    SyntaxError,
    TypecheckFailed,
    CommandFailed,
    DiffTooLarge,
    ComplexityTooHigh,
    SubtaskFailed,
    AgenticLoopExhausted,
    MaxAttemptsReached,
    Timeout,
    UnknownError,
}

impl CoreErrorCode {
    /// Whether this code is recoverable by construction (i.e. the handler
    /// that raises it is expected to retry rather than fail the task
    /// outright). Handlers may still choose to treat a recoverable code as
    /// terminal once the retry budget is spent; see [`OrchestratorError::recoverable`].
    pub fn default_recoverable(self) -> bool {
        !matches!(
            self,
            CoreErrorCode::ComplexityTooHigh
                | CoreErrorCode::MaxAttemptsReached
                | CoreErrorCode::AgenticLoopExhausted
                | CoreErrorCode::UnknownError
        )
    }

    /// A short, operator-facing suggested action, used both in PR/issue
    /// failure comments and in the memory subsystem's avoidance-strategy
    /// note (spec §7).
    pub fn suggested_action(self) -> &'static str {
        match self {
            CoreErrorCode::InvalidState => "check for a concurrent writer racing this task",
            CoreErrorCode::MissingField => "verify the upstream agent produced all required fields",
            CoreErrorCode::InvalidDiff => "inspect the coder's diff for malformed hunk headers",
            CoreErrorCode::SyntaxError => "inspect the coder's diff for unbalanced braces or strings",
            CoreErrorCode::TypecheckFailed => "review the typecheck output attached to the last gate result",
            CoreErrorCode::CommandFailed => "inspect stdout/stderr of the failing command",
            CoreErrorCode::DiffTooLarge => "ask the planner to split this task into subtasks",
            CoreErrorCode::ComplexityTooHigh => "decompose the task manually or raise MAX_DIFF_LINES",
            CoreErrorCode::SubtaskFailed => "inspect the failing subtask's diff and acceptance criteria",
            CoreErrorCode::AgenticLoopExhausted => "raise AGENTIC_LOOP_MAX_ITERATIONS or fix manually",
            CoreErrorCode::MaxAttemptsReached => "raise MAX_ATTEMPTS or intervene manually",
            CoreErrorCode::Timeout => "raise the operation's timeout or investigate hangs",
            CoreErrorCode::UnknownError => "inspect the orchestrator logs for the underlying panic/error",
        }
    }
}

impl fmt::Display for CoreErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidState => "invalid_state",
            Self::MissingField => "missing_field",
            Self::InvalidDiff => "invalid_diff",
            Self::SyntaxError => "syntax_error",
            Self::TypecheckFailed => "typecheck_failed",
            Self::CommandFailed => "command_failed",
            Self::DiffTooLarge => "diff_too_large",
            Self::ComplexityTooHigh => "complexity_too_high",
            Self::SubtaskFailed => "subtask_failed",
            Self::AgenticLoopExhausted => "agentic_loop_exhausted",
            Self::MaxAttemptsReached => "max_attempts_reached",
            Self::Timeout => "timeout",
            Self::UnknownError => "unknown_error",
        };
        f.write_str(s)
    }
}

/// An error raised by a handler, carrying everything `failTask` and the
/// outer dispatcher need (spec §7).
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message} (task {task_id}, recoverable={recoverable})")]
pub struct OrchestratorError {
    pub code: CoreErrorCode,
    pub message: String,
    pub task_id: Uuid,
    pub recoverable: bool,
}

impl OrchestratorError {
    pub fn new(code: CoreErrorCode, task_id: Uuid, message: impl Into<String>) -> Self {
        let recoverable = code.default_recoverable();
        Self {
            code,
            message: message.into(),
            task_id,
            recoverable,
        }
    }

    /// Force this error to be treated as non-recoverable regardless of the
    /// code's default (e.g. a recoverable `TypecheckFailed` becomes
    /// terminal once `attempt_count == max_attempts`).
    pub fn non_recoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }

    /// Wrap any uncaught error from a handler as `UnknownError`,
    /// non-recoverable, per spec §7's "outer dispatcher catches every
    /// uncaught exception" rule.
    pub fn unknown(task_id: Uuid, source: &anyhow::Error) -> Self {
        Self {
            code: CoreErrorCode::UnknownError,
            message: source.to_string(),
            task_id,
            recoverable: false,
        }
    }
}
