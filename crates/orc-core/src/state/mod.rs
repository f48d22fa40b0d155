//! Task state machine transitions (spec §4.1).
//!
//! Validates and executes state transitions for tasks, enforcing the
//! allowed transition graph and optimistic locking on every write.

pub mod dispatch;

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use orc_db::models::TaskStatus;
use orc_db::queries::tasks as db;

/// The next handler the [`crate::orchestrator`] dispatch table should run
/// for a given task status (spec §4.1 "Next-action table").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    Plan,
    Breakdown,
    Orchestrate,
    Code,
    Test,
    Fix,
    Review,
    OpenPr,
    Wait,
    Done,
    FailedTerminal,
}

/// The task state machine.
///
/// Enforces the valid transition graph from spec §4.1 exactly: every edge
/// not explicitly listed fails with an `InvalidState`-flavored error.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph (spec §4.1).
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;

        if from.is_terminal() {
            return false;
        }

        matches!(
            (from, to),
            (New, Planning)
                | (New, Failed)
                | (Planning, PlanningDone)
                | (Planning, PlanPendingApproval)
                | (Planning, Failed)
                | (PlanPendingApproval, PlanningDone)
                | (PlanPendingApproval, Failed)
                | (PlanningDone, Coding)
                | (PlanningDone, BreakingDown)
                | (PlanningDone, Failed)
                | (BreakingDown, BreakdownDone)
                | (BreakingDown, Failed)
                | (BreakdownDone, Orchestrating)
                | (BreakdownDone, Failed)
                | (Orchestrating, CodingDone)
                | (Orchestrating, Failed)
                | (Coding, CodingDone)
                | (Coding, TestsFailed)
                | (Coding, Failed)
                | (CodingDone, Testing)
                | (CodingDone, Failed)
                | (Testing, TestsPassed)
                | (Testing, TestsFailed)
                | (Testing, Failed)
                | (TestsPassed, VisualTesting)
                | (TestsPassed, Reviewing)
                | (TestsPassed, Failed)
                | (TestsFailed, Fixing)
                | (TestsFailed, Reflecting)
                | (TestsFailed, Failed)
                | (VisualTesting, VisualTestsPassed)
                | (VisualTesting, VisualTestsFailed)
                | (VisualTesting, Failed)
                | (VisualTestsPassed, Reviewing)
                | (VisualTestsPassed, Failed)
                | (VisualTestsFailed, Fixing)
                | (VisualTestsFailed, Reflecting)
                | (VisualTestsFailed, Failed)
                | (Reflecting, Replanning)
                | (Reflecting, Fixing)
                | (Reflecting, Failed)
                | (Replanning, Coding)
                | (Replanning, Failed)
                | (Fixing, CodingDone)
                | (Fixing, Failed)
                | (Reviewing, Reviewing)
                | (Reviewing, ReviewApproved)
                | (Reviewing, ReviewRejected)
                | (Reviewing, Failed)
                | (ReviewApproved, PrCreated)
                | (ReviewApproved, WaitingBatch)
                | (ReviewApproved, Failed)
                | (ReviewRejected, Coding)
                | (ReviewRejected, Failed)
                | (WaitingBatch, PrCreated)
                | (WaitingBatch, ReviewApproved)
                | (WaitingBatch, Failed)
                | (PrCreated, WaitingHuman)
                | (PrCreated, Failed)
                | (WaitingHuman, Completed)
                | (WaitingHuman, ReviewRejected)
                | (WaitingHuman, Failed)
        )
    }

    /// The handler the orchestrator should run next for a task currently in
    /// `status` (spec §4.1 "Next-action table").
    pub fn next_action(status: TaskStatus) -> NextAction {
        use TaskStatus::*;

        match status {
            New => NextAction::Plan,
            PlanningDone => NextAction::Code,
            BreakdownDone | Orchestrating => NextAction::Orchestrate,
            CodingDone | TestsPassed => NextAction::Test,
            TestsFailed | VisualTestsFailed => NextAction::Fix,
            VisualTestsPassed | Reviewing => NextAction::Review,
            ReviewApproved => NextAction::OpenPr,
            ReviewRejected => NextAction::Code,
            Completed => NextAction::Done,
            Failed => NextAction::FailedTerminal,
            _ => NextAction::Wait,
        }
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// Validates the transition is legal before touching the database, then
    /// relies on `transition_task_status`'s `WHERE status = $from` clause to
    /// detect a lost race against a concurrent writer.
    pub async fn transition(
        pool: &PgPool,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            warn!(%task_id, %from, %to, "rejected invalid state transition");
            bail!("invalid state transition: {from} -> {to} for task {task_id}");
        }

        let rows = db::transition_task_status(pool, task_id, from, to)
            .await
            .with_context(|| format!("failed to transition task {task_id} from {from} to {to}"))?;

        if rows == 0 {
            let task = db::get_task(pool, task_id).await?;
            return match task {
                None => bail!("task {task_id} not found"),
                Some(t) => bail!(
                    "optimistic lock failed: task {task_id} has status {}, expected {from}",
                    t.status
                ),
            };
        }

        info!(%task_id, %from, %to, "task transitioned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_db::models::TaskStatus::*;

    #[test]
    fn happy_path_is_fully_connected() {
        let path = [
            New,
            Planning,
            PlanningDone,
            Coding,
            CodingDone,
            Testing,
            TestsPassed,
            Reviewing,
            ReviewApproved,
            PrCreated,
            WaitingHuman,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(
                TaskStateMachine::is_valid_transition(pair[0], pair[1]),
                "{:?} -> {:?} should be valid",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn decomposition_path_is_connected() {
        let path = [
            PlanningDone,
            BreakingDown,
            BreakdownDone,
            Orchestrating,
            CodingDone,
        ];
        for pair in path.windows(2) {
            assert!(TaskStateMachine::is_valid_transition(pair[0], pair[1]));
        }
    }

    #[test]
    fn plan_approval_detour_is_connected() {
        assert!(TaskStateMachine::is_valid_transition(
            Planning,
            PlanPendingApproval
        ));
        assert!(TaskStateMachine::is_valid_transition(
            PlanPendingApproval,
            PlanningDone
        ));
        assert!(TaskStateMachine::is_valid_transition(
            PlanPendingApproval,
            Failed
        ));
        assert!(!TaskStateMachine::is_valid_transition(
            PlanPendingApproval,
            Coding
        ));
    }

    #[test]
    fn coding_failure_routes_to_tests_failed() {
        assert!(TaskStateMachine::is_valid_transition(Coding, TestsFailed));
        assert!(TaskStateMachine::is_valid_transition(TestsFailed, Fixing));
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for &to in TaskStatus::ALL {
            assert!(!TaskStateMachine::is_valid_transition(Completed, to));
            assert!(!TaskStateMachine::is_valid_transition(Failed, to));
        }
    }

    #[test]
    fn reviewing_self_loop_is_allowed() {
        assert!(TaskStateMachine::is_valid_transition(Reviewing, Reviewing));
    }

    #[test]
    fn arbitrary_skip_is_rejected() {
        assert!(!TaskStateMachine::is_valid_transition(New, Coding));
        assert!(!TaskStateMachine::is_valid_transition(Testing, Completed));
    }

    #[test]
    fn next_action_matches_table() {
        assert_eq!(TaskStateMachine::next_action(New), NextAction::Plan);
        assert_eq!(
            TaskStateMachine::next_action(PlanningDone),
            NextAction::Code
        );
        assert_eq!(
            TaskStateMachine::next_action(BreakdownDone),
            NextAction::Orchestrate
        );
        assert_eq!(
            TaskStateMachine::next_action(TestsFailed),
            NextAction::Fix
        );
        assert_eq!(
            TaskStateMachine::next_action(ReviewApproved),
            NextAction::OpenPr
        );
        assert_eq!(TaskStateMachine::next_action(PrCreated), NextAction::Wait);
        assert_eq!(TaskStateMachine::next_action(Completed), NextAction::Done);
        assert_eq!(
            TaskStateMachine::next_action(Failed),
            NextAction::FailedTerminal
        );
    }
}
