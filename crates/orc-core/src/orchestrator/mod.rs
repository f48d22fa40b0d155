//! The Orchestrator (spec §4.10): the single entry point that, given a
//! task id, loads its current status, consults [`TaskStateMachine::next_action`]
//! for which handler applies, and runs that handler to completion.
//!
//! Every handler follows the same discipline: do all agent/validation work
//! while the task is still parked at its precondition status, and only
//! persist the transition(s) to the next meaningful status once the
//! outcome is known. `next_action` maps every status it does not name
//! explicitly to `Wait`, so a task left sitting in an in-flight status
//! (`Coding`, `Testing`, `Fixing`, ...) between ticks would simply never be
//! picked up again except by the scheduler's stale-task sweep. Handlers
//! therefore never return having left a task at one of those statuses on
//! their normal exit path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use orc_db::models::{Complexity, Invariant, InvariantKind, InvariantScope, RootCause, Task, TaskStatus};
use orc_db::queries::{
    gate_results::{self, NewGateResult},
    invariants as invariant_db, model_config, tasks as task_db,
};

use crate::agent::types::ReviewVerdict;
use crate::agent::{self, Agent, AgentInput};
use crate::agentic_loop::{self, AgenticLoopInputs, AgenticLoopOutcome, AgenticLoopParams};
use crate::batch::{self, BatchDecision};
use crate::config::OrcConfig;
use crate::consensus;
use crate::decompose::{self, TickOutcome};
use crate::diff::validator;
use crate::error::CoreErrorCode;
use crate::events::{self, EventType};
use crate::gate;
use crate::invariant::runner::run_invariant;
use crate::model_select::{self, ModelSelectError, ModelSelection, Stage};
use crate::state::dispatch;
use crate::state::{NextAction, TaskStateMachine};
use crate::vcs::VcsHost;
use crate::worktree::WorktreeManager;

/// The set of agent-family implementations the orchestrator drives. One
/// `Arc<dyn Agent>` per family, plus an optional pool of additional coder
/// variants for multi-agent consensus (spec §4.6); an empty `coder_variants`
/// means consensus is skipped and `coder` runs alone.
pub struct AgentSet {
    pub planner: Arc<dyn Agent>,
    pub coder: Arc<dyn Agent>,
    pub coder_variants: Vec<Arc<dyn Agent>>,
    pub fixer: Arc<dyn Agent>,
    pub reviewer: Arc<dyn Agent>,
    pub breakdown: Arc<dyn Agent>,
    pub reflector: Arc<dyn Agent>,
}

/// A coder (or fixer) invocation that passed quick and full validation,
/// ready to be persisted onto the task.
struct CodedResult {
    branch_name: String,
    diff: String,
    commit_message: String,
    worktree_path: PathBuf,
}

/// A `run_coder`/`validate_and_apply` validation failure, carrying the real
/// [`CoreErrorCode`] the validator assigned instead of forcing callers to
/// guess one.
#[derive(Debug)]
struct CoderError {
    code: CoreErrorCode,
    message: String,
}

impl std::fmt::Display for CoderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CoderError {}

/// Recover the real error code from a coding-pipeline failure, falling back
/// to `InvalidDiff` for anything raised before validation ran (agent or VCS
/// host errors).
fn coder_error_code(err: &anyhow::Error) -> CoreErrorCode {
    err.downcast_ref::<CoderError>()
        .map(|e| e.code)
        .unwrap_or(CoreErrorCode::InvalidDiff)
}

/// The root-cause bucket a given error code falls into, shared by
/// `record_recoverable_failure` and `record_coding_failure`.
fn root_cause_for_code(code: CoreErrorCode) -> RootCause {
    match code {
        CoreErrorCode::InvalidDiff | CoreErrorCode::SyntaxError | CoreErrorCode::TypecheckFailed => {
            RootCause::Code
        }
        CoreErrorCode::ComplexityTooHigh => RootCause::Plan,
        _ => RootCause::Environment,
    }
}

/// Wires every core collaborator together behind one `process(task_id)`
/// entry point.
pub struct Orchestrator {
    pool: PgPool,
    vcs: Arc<dyn VcsHost>,
    worktrees: WorktreeManager,
    agents: AgentSet,
    config: Arc<OrcConfig>,
}

impl Orchestrator {
    pub fn new(
        pool: PgPool,
        vcs: Arc<dyn VcsHost>,
        worktrees: WorktreeManager,
        agents: AgentSet,
        config: Arc<OrcConfig>,
    ) -> Self {
        Self {
            pool,
            vcs,
            worktrees,
            agents,
            config,
        }
    }

    /// Load `task_id`'s current status, dispatch to the matching handler,
    /// and let it run to completion. The scheduler catches an `Err` return
    /// here and routes it through [`dispatch::fail_task`] as `UnknownError`
    /// (spec §7 "the outer dispatcher catches every uncaught exception").
    pub async fn process(&self, task_id: Uuid) -> Result<()> {
        let task = task_db::get_task(&self.pool, task_id)
            .await?
            .with_context(|| format!("task {task_id} not found"))?;

        match TaskStateMachine::next_action(task.status) {
            NextAction::Plan => self.handle_plan(&task).await,
            NextAction::Code => self.handle_code(&task).await,
            NextAction::Orchestrate => self.handle_orchestrate(&task).await,
            NextAction::Test => self.handle_test(&task).await,
            NextAction::Fix => self.handle_fix(&task).await,
            NextAction::Review => self.handle_review(&task).await,
            NextAction::OpenPr => self.handle_open_pr(&task).await,
            NextAction::Breakdown | NextAction::Wait | NextAction::Done | NextAction::FailedTerminal => {
                Ok(())
            }
        }
    }

    /// Periodic batch sweep (spec §4.9): combine any batch that has become
    /// ready since the last pass. Not part of `process(task)` since a
    /// batch member's own status stops advancing once it reaches
    /// `WaitingBatch` -- nothing would ever call this from a per-task tick.
    pub async fn sweep_batches(&self, repos: &[String]) -> Result<()> {
        batch::process_ready_batches(
            &self.pool,
            self.vcs.as_ref(),
            repos,
            self.config.batch_timeout_minutes,
        )
        .await
    }

    async fn reload(&self, task_id: Uuid) -> Result<Task> {
        task_db::get_task(&self.pool, task_id)
            .await?
            .with_context(|| format!("task {task_id} not found"))
    }

    /// A handler's attempt failed in a recoverable way: bump
    /// `attempt_count` and, only once the budget is spent, fail the task
    /// terminally. The task's status is left untouched either way --
    /// callers must invoke this only while the task still sits at its
    /// precondition status, so a retry next tick re-enters the same
    /// handler.
    async fn record_recoverable_failure(
        &self,
        task: &Task,
        code: CoreErrorCode,
        message: &str,
    ) -> Result<()> {
        task_db::record_failure(&self.pool, task.id, message, Some(root_cause_for_code(code))).await?;
        let refreshed = self.reload(task.id).await?;
        if refreshed.attempt_count >= refreshed.max_attempts {
            dispatch::fail_task(&self.pool, task.id, code, message).await?;
        }
        Ok(())
    }

    /// A `run_coder`/`validate_and_apply` failure during `Coding` or
    /// `Replanning`: record the real error code and, budget permitting,
    /// route the task to `TestsFailed` so the next tick hands it to the
    /// Fixer instead of silently retrying the Coder against the same
    /// precondition status.
    async fn record_coding_failure(
        &self,
        task_id: Uuid,
        from_status: TaskStatus,
        err: &anyhow::Error,
    ) -> Result<()> {
        let code = coder_error_code(err);
        let message = err.to_string();
        task_db::record_failure(&self.pool, task_id, &message, Some(root_cause_for_code(code))).await?;

        let refreshed = self.reload(task_id).await?;
        if refreshed.attempt_count >= refreshed.max_attempts {
            return dispatch::fail_task(&self.pool, task_id, code, &message).await;
        }

        TaskStateMachine::transition(&self.pool, task_id, from_status, TaskStatus::Coding).await?;
        TaskStateMachine::transition(&self.pool, task_id, TaskStatus::Coding, TaskStatus::TestsFailed).await
    }

    // -- Plan -----------------------------------------------------------

    async fn handle_plan(&self, task: &Task) -> Result<()> {
        TaskStateMachine::transition(&self.pool, task.id, TaskStatus::New, TaskStatus::Planning)
            .await?;

        let issue = self.vcs.get_issue(&task.repo, task.issue_number).await?;
        let repo_ctx = self.vcs.get_repo_context(&task.repo).await?;

        let prompt = format!(
            "Plan issue #{}: {}\n\n{}\n\nRepo default branch: {}\nFile tree ({} entries):\n{}",
            issue.number,
            issue.title,
            issue.body,
            repo_ctx.default_branch,
            repo_ctx.file_tree.len(),
            repo_ctx.file_tree.join("\n"),
        );

        let invocation = self
            .agents
            .planner
            .run(&AgentInput {
                prompt,
                model: self.agents.planner.model_name().to_owned(),
            })
            .await?;

        let output = agent::parse_planner_output(&invocation.raw_output)
            .map_err(|e| anyhow::anyhow!("planner returned invalid output: {e}"))?;

        task_db::record_planning_output(
            &self.pool,
            task.id,
            &output.definition_of_done,
            &output.plan,
            &output.target_files,
            None,
            &serde_json::to_value(&output.commands)?,
            output.complexity,
            output.effort.unwrap_or_default(),
        )
        .await?;

        events::record(
            &self.pool,
            task.id,
            EventType::Planned,
            Some(self.agents.planner.model_name()),
            Some(&issue.title),
            Some(&format!(
                "{} plan steps, {} target files, complexity={}",
                output.plan.len(),
                output.target_files.len(),
                output.complexity
            )),
        )
        .await;

        // Auto-subscribe the task to every repo-wide/global invariant so
        // the Testing handler has something to run. Planner output does
        // not (yet) name invariants explicitly, so this is the only place
        // `task_invariants` rows get populated.
        for invariant in invariant_db::list_invariants(&self.pool).await? {
            if invariant.scope == InvariantScope::Global {
                invariant_db::link_task_invariant(&self.pool, task.id, invariant.id).await?;
            }
        }

        let refreshed = self.reload(task.id).await?;
        gate::check(&self.pool, task.id, gate::planning_complete(&refreshed)).await;

        if output.requires_approval {
            TaskStateMachine::transition(
                &self.pool,
                task.id,
                TaskStatus::Planning,
                TaskStatus::PlanPendingApproval,
            )
            .await
        } else {
            TaskStateMachine::transition(
                &self.pool,
                task.id,
                TaskStatus::Planning,
                TaskStatus::PlanningDone,
            )
            .await
        }
    }

    // -- Code -------------------------------------------------------------

    /// Covers both `PlanningDone` (first coding attempt) and
    /// `ReviewRejected` (recoding after a rejected review) -- both map to
    /// `NextAction::Code` (spec §4.1 next-action table).
    async fn handle_code(&self, task: &Task) -> Result<()> {
        let from_status = task.status;
        let complexity = task.complexity.unwrap_or(Complexity::M);
        let effort = task.effort.unwrap_or_default();
        let overrides = model_config::list_model_configs(&self.pool).await?;

        match model_select::select(
            Stage::Coder,
            complexity,
            effort,
            task.attempt_count.max(0) as u32,
            false,
            &overrides,
        ) {
            Err(ModelSelectError::NeedsDecomposition) => self.handle_breakdown(task, from_status).await,
            Err(ModelSelectError::ComplexityTooHigh) => {
                dispatch::fail_task(
                    &self.pool,
                    task.id,
                    CoreErrorCode::ComplexityTooHigh,
                    "complexity too high to decompose further",
                )
                .await
            }
            Ok(selection) => {
                let branch = task
                    .branch_name
                    .clone()
                    .unwrap_or_else(|| WorktreeManager::branch_name(&task.repo, &task.issue_number.to_string()));
                let typecheck = self.typecheck_invariant(task.id).await?;
                let prompt = coder_prompt(task, None);

                match self
                    .run_coder(&task.repo, &branch, &prompt, &selection, typecheck.as_ref())
                    .await
                {
                    Ok(coded) => {
                        self.finish_coding(task, from_status, coded, &selection).await
                    }
                    Err(err) => self.record_coding_failure(task.id, from_status, &err).await,
                }
            }
        }
    }

    async fn finish_coding(
        &self,
        task: &Task,
        from_status: TaskStatus,
        coded: CodedResult,
        selection: &ModelSelection,
    ) -> Result<()> {
        task_db::record_coding_output(
            &self.pool,
            task.id,
            &coded.branch_name,
            &coded.diff,
            &coded.commit_message,
        )
        .await?;
        task_db::set_worktree_path(&self.pool, task.id, &coded.worktree_path.display().to_string())
            .await?;

        let refreshed = self.reload(task.id).await?;
        gate::check(
            &self.pool,
            task.id,
            gate::coding_complete(&refreshed, self.config.max_diff_lines),
        )
        .await;

        events::record(
            &self.pool,
            task.id,
            EventType::Coded,
            Some(&selection.model),
            None,
            Some(&format!("tier={} cost={}", selection.tier, selection.cost_bucket)),
        )
        .await;

        TaskStateMachine::transition(&self.pool, task.id, from_status, TaskStatus::Coding).await?;
        TaskStateMachine::transition(&self.pool, task.id, TaskStatus::Coding, TaskStatus::CodingDone).await
    }

    async fn handle_breakdown(&self, task: &Task, from_status: TaskStatus) -> Result<()> {
        TaskStateMachine::transition(&self.pool, task.id, from_status, TaskStatus::BreakingDown)
            .await?;

        let prompt = format!(
            "Break this task into an ordered list of XS/S subtasks with dependencies:\n\ndod: {:?}\nplan: {:?}\ntarget_files: {:?}",
            task.dod, task.plan_steps, task.target_files,
        );
        let invocation = self
            .agents
            .breakdown
            .run(&AgentInput {
                prompt,
                model: self.agents.breakdown.model_name().to_owned(),
            })
            .await?;
        let breakdown = agent::parse_breakdown_output(&invocation.raw_output)
            .map_err(|e| anyhow::anyhow!("breakdown agent returned invalid output: {e}"))?;

        decompose::decompose(&self.pool, task.id, &breakdown).await?;

        TaskStateMachine::transition(
            &self.pool,
            task.id,
            TaskStatus::BreakingDown,
            TaskStatus::BreakdownDone,
        )
        .await
    }

    // -- Orchestrate (subtask-by-subtask) ---------------------------------

    /// Covers `BreakdownDone` (first tick) and `Orchestrating` (resumed).
    /// Per spec §4.8, a ready subtask is coded *inline*: there is no
    /// separate `Task` row or independent pipeline per subtask, just a
    /// direct coder invocation against the subtask's own acceptance
    /// criteria and target files.
    async fn handle_orchestrate(&self, task: &Task) -> Result<()> {
        if task.status == TaskStatus::BreakdownDone {
            TaskStateMachine::transition(
                &self.pool,
                task.id,
                TaskStatus::BreakdownDone,
                TaskStatus::Orchestrating,
            )
            .await?;
        }

        match decompose::tick(&self.pool, task.id, self.config.max_subtask_attempts).await? {
            TickOutcome::Waiting | TickOutcome::SubtaskExhausted { .. } => Ok(()),
            TickOutcome::AllComplete { combined_diff } => {
                let branch = task
                    .branch_name
                    .clone()
                    .unwrap_or_else(|| WorktreeManager::branch_name(&task.repo, &task.issue_number.to_string()));
                decompose::finish_orchestration(&self.pool, task.id, &combined_diff, &branch).await
            }
            TickOutcome::Advanced { subtask_id } => self.advance_subtask(task, subtask_id).await,
        }
    }

    async fn advance_subtask(&self, task: &Task, subtask_id: Uuid) -> Result<()> {
        let subtask = orc_db::queries::subtasks::get_subtask(&self.pool, subtask_id)
            .await?
            .with_context(|| format!("subtask {subtask_id} not found"))?;

        let overrides = model_config::list_model_configs(&self.pool).await?;
        let selection = match model_select::select(
            Stage::Coder,
            Complexity::Xs,
            task.effort.unwrap_or_default(),
            subtask.attempt_count.max(0) as u32,
            true,
            &overrides,
        ) {
            Ok(sel) => sel,
            Err(err) => {
                decompose::fail_subtask_attempt(&self.pool, subtask_id).await?;
                bail!("subtask {subtask_id} model selection failed: {err}");
            }
        };

        let branch = task
            .branch_name
            .clone()
            .unwrap_or_else(|| WorktreeManager::branch_name(&task.repo, &task.issue_number.to_string()));
        let typecheck = self.typecheck_invariant(task.id).await?;
        let prompt = format!(
            "Implement this subtask:\n\nacceptance criteria: {:?}\ntarget files: {:?}\n\nParent plan: {:?}",
            subtask.acceptance_criteria, subtask.target_files, task.plan_steps,
        );

        match self
            .run_coder(&task.repo, &branch, &prompt, &selection, typecheck.as_ref())
            .await
        {
            Ok(coded) => decompose::complete_subtask(&self.pool, subtask_id, &coded.diff).await,
            Err(err) => {
                tracing::warn!(subtask_id = %subtask_id, error = %err, "subtask coding attempt failed");
                decompose::fail_subtask_attempt(&self.pool, subtask_id).await
            }
        }
    }

    // -- Test ---------------------------------------------------------------

    /// Covers `CodingDone` (run the test suite) and `TestsPassed` (run
    /// visual tests if any are configured, otherwise hand off to review).
    async fn handle_test(&self, task: &Task) -> Result<()> {
        match task.status {
            TaskStatus::CodingDone => self.run_test_suite(task).await,
            TaskStatus::TestsPassed => self.run_visual_tests_or_skip(task).await,
            _ => Ok(()),
        }
    }

    async fn run_test_suite(&self, task: &Task) -> Result<()> {
        TaskStateMachine::transition(&self.pool, task.id, TaskStatus::CodingDone, TaskStatus::Testing)
            .await?;

        let invariants = invariant_db::get_invariants_for_task(&self.pool, task.id).await?;
        let test_invariants: Vec<&Invariant> = invariants
            .iter()
            .filter(|i| i.kind == InvariantKind::TestSuite)
            .collect();

        let working_dir = self.ensure_worktree(task).await?;
        let (passed, errors) = self
            .run_invariants(task, &test_invariants, &working_dir)
            .await?;

        if passed {
            events::record(&self.pool, task.id, EventType::Tested, None, None, None).await;
            let refreshed = self.reload(task.id).await?;
            gate::check(&self.pool, task.id, gate::testing_complete(&refreshed)).await;
            TaskStateMachine::transition(&self.pool, task.id, TaskStatus::Testing, TaskStatus::TestsPassed)
                .await
        } else {
            let message = errors.join("; ");
            task_db::record_failure(&self.pool, task.id, &message, Some(RootCause::Test)).await?;
            TaskStateMachine::transition(&self.pool, task.id, TaskStatus::Testing, TaskStatus::TestsFailed)
                .await
        }
    }

    async fn run_visual_tests_or_skip(&self, task: &Task) -> Result<()> {
        let invariants = invariant_db::get_invariants_for_task(&self.pool, task.id).await?;
        let visual: Vec<&Invariant> = invariants
            .iter()
            .filter(|i| i.kind == InvariantKind::Custom && i.name.to_lowercase().contains("visual"))
            .collect();

        if visual.is_empty() {
            return TaskStateMachine::transition(
                &self.pool,
                task.id,
                TaskStatus::TestsPassed,
                TaskStatus::Reviewing,
            )
            .await;
        }

        TaskStateMachine::transition(
            &self.pool,
            task.id,
            TaskStatus::TestsPassed,
            TaskStatus::VisualTesting,
        )
        .await?;

        let working_dir = self.ensure_worktree(task).await?;
        let (passed, errors) = self.run_invariants(task, &visual, &working_dir).await?;

        if passed {
            TaskStateMachine::transition(
                &self.pool,
                task.id,
                TaskStatus::VisualTesting,
                TaskStatus::VisualTestsPassed,
            )
            .await
        } else {
            let message = errors.join("; ");
            task_db::record_failure(&self.pool, task.id, &message, Some(RootCause::Test)).await?;
            TaskStateMachine::transition(
                &self.pool,
                task.id,
                TaskStatus::VisualTesting,
                TaskStatus::VisualTestsFailed,
            )
            .await
        }
    }

    /// Run every invariant in `to_run` against `working_dir`, persisting a
    /// `GateResult` row per invariant, and report whether all passed.
    async fn run_invariants(
        &self,
        task: &Task,
        to_run: &[&Invariant],
        working_dir: &std::path::Path,
    ) -> Result<(bool, Vec<String>)> {
        let mut all_passed = true;
        let mut errors = Vec::new();

        for invariant in to_run {
            let outcome = run_invariant(invariant, working_dir).await?;
            gate_results::insert_gate_result(
                &self.pool,
                &NewGateResult {
                    task_id: task.id,
                    invariant_id: invariant.id,
                    attempt: task.attempt_count + 1,
                    passed: outcome.passed,
                    exit_code: outcome.exit_code,
                    stdout: Some(outcome.stdout.clone()),
                    stderr: Some(outcome.stderr.clone()),
                    duration_ms: i32::try_from(outcome.duration_ms).ok(),
                },
            )
            .await?;

            if !outcome.passed {
                all_passed = false;
                errors.push(format!(
                    "{} exited {:?}: {}",
                    invariant.name,
                    outcome.exit_code,
                    tail(&outcome.stderr, 500)
                ));
            }
        }

        Ok((all_passed, errors))
    }

    // -- Fix ------------------------------------------------------------

    /// Covers `TestsFailed` and `VisualTestsFailed`.
    async fn handle_fix(&self, task: &Task) -> Result<()> {
        let from_status = task.status;

        if self.config.use_agentic_loop {
            self.handle_fix_agentic_loop(task, from_status).await
        } else {
            self.handle_fix_simple(task, from_status).await
        }
    }

    async fn handle_fix_simple(&self, task: &Task, from_status: TaskStatus) -> Result<()> {
        let complexity = task.complexity.unwrap_or(Complexity::M);
        let effort = task.effort.unwrap_or_default();
        let overrides = model_config::list_model_configs(&self.pool).await?;

        let selection = match model_select::select(
            Stage::Fixer,
            complexity,
            effort,
            task.attempt_count.max(0) as u32,
            false,
            &overrides,
        ) {
            Ok(sel) => sel,
            Err(err) => {
                return self
                    .record_recoverable_failure(task, CoreErrorCode::ComplexityTooHigh, &err.to_string())
                    .await
            }
        };

        let branch = task
            .branch_name
            .clone()
            .context("task has no branch_name at TestsFailed/VisualTestsFailed")?;
        let typecheck = self.typecheck_invariant(task.id).await?;
        let prompt = format!(
            "The following diff is failing with:\n{}\n\n{}\n\nProduce a corrected diff.",
            task.last_error.as_deref().unwrap_or("(no error recorded)"),
            task.current_diff.as_deref().unwrap_or(""),
        );

        match self
            .run_coder(&task.repo, &branch, &prompt, &selection, typecheck.as_ref())
            .await
        {
            Ok(coded) => {
                task_db::record_coding_output(
                    &self.pool,
                    task.id,
                    &coded.branch_name,
                    &coded.diff,
                    &coded.commit_message,
                )
                .await?;
                events::record(
                    &self.pool,
                    task.id,
                    EventType::Fixed,
                    Some(&selection.model),
                    None,
                    None,
                )
                .await;
                TaskStateMachine::transition(&self.pool, task.id, from_status, TaskStatus::Fixing).await?;
                TaskStateMachine::transition(&self.pool, task.id, TaskStatus::Fixing, TaskStatus::CodingDone)
                    .await
            }
            Err(err) => {
                // Already parked at TestsFailed/VisualTestsFailed, whose
                // `next_action` is `Fix` -- a retry re-enters this same
                // handler, i.e. the Fixer, so no further transition is
                // needed here (unlike the Coder-class call sites).
                let code = coder_error_code(&err);
                self.record_recoverable_failure(task, code, &err.to_string()).await
            }
        }
    }

    async fn handle_fix_agentic_loop(&self, task: &Task, from_status: TaskStatus) -> Result<()> {
        let params = AgenticLoopParams {
            max_iterations: self.config.agentic_loop_max_iterations,
            max_replans: self.config.agentic_loop_max_replans,
            confidence_threshold: self.config.agentic_loop_confidence_threshold,
        };
        let inputs = AgenticLoopInputs {
            plan_summary: task.plan_steps.join("\n"),
            current_diff: task.current_diff.clone().unwrap_or_default(),
            last_error: task.last_error.clone().unwrap_or_default(),
        };

        let outcome = agentic_loop::run(
            &self.pool,
            task.id,
            params,
            self.agents.reflector.as_ref(),
            self.agents.fixer.as_ref(),
            inputs,
        )
        .await?;

        events::record_with_metadata(
            &self.pool,
            task.id,
            EventType::AgenticLoopComplete,
            None,
            None,
            None,
            serde_json::json!({ "outcome": format!("{outcome:?}") }),
        )
        .await;

        match outcome {
            AgenticLoopOutcome::Succeeded { diff, iterations } => {
                task_db::record_loop_iteration(&self.pool, task.id, 1.0, 0, false).await?;
                let branch = task
                    .branch_name
                    .clone()
                    .context("task has no branch_name at TestsFailed/VisualTestsFailed")?;
                let commit_message = format!("fix: agentic loop converged after {iterations} iteration(s)");
                let typecheck = self.typecheck_invariant(task.id).await?;

                // The loop only ran `quick_validate` on its winning diff;
                // apply it, refresh the worktree, and full validate it
                // here -- the same bar `run_coder` holds a simple fixer
                // diff to -- before it can count as coded.
                match self
                    .validate_and_apply(&task.repo, &branch, &diff, &commit_message, typecheck.as_ref())
                    .await
                {
                    Ok(coded) => {
                        task_db::record_coding_output(
                            &self.pool,
                            task.id,
                            &coded.branch_name,
                            &coded.diff,
                            &coded.commit_message,
                        )
                        .await?;
                        task_db::set_worktree_path(
                            &self.pool,
                            task.id,
                            &coded.worktree_path.display().to_string(),
                        )
                        .await?;
                        TaskStateMachine::transition(&self.pool, task.id, from_status, TaskStatus::Fixing)
                            .await?;
                        TaskStateMachine::transition(
                            &self.pool,
                            task.id,
                            TaskStatus::Fixing,
                            TaskStatus::CodingDone,
                        )
                        .await
                    }
                    Err(err) => {
                        let code = coder_error_code(&err);
                        self.record_recoverable_failure(task, code, &err.to_string()).await
                    }
                }
            }
            AgenticLoopOutcome::ReplanRequested { replans, iterations } => {
                task_db::record_loop_iteration(&self.pool, task.id, 0.0, 0, true).await?;
                TaskStateMachine::transition(&self.pool, task.id, from_status, TaskStatus::Reflecting).await?;
                TaskStateMachine::transition(
                    &self.pool,
                    task.id,
                    TaskStatus::Reflecting,
                    TaskStatus::Replanning,
                )
                .await?;
                tracing::info!(task_id = %task.id, replans, iterations, "replan requested, recoding against existing plan");
                self.recode_after_replan(task).await
            }
            AgenticLoopOutcome::Failed { reason, .. } => {
                dispatch::fail_task(&self.pool, task.id, CoreErrorCode::AgenticLoopExhausted, &reason).await
            }
        }
    }

    /// `Replanning` only has an edge to `Coding`/`Failed` (spec §4.1), so
    /// this must resolve within the same handler call rather than leaving
    /// the task parked there between ticks.
    async fn recode_after_replan(&self, task: &Task) -> Result<()> {
        let refreshed = self.reload(task.id).await?;
        let complexity = refreshed.complexity.unwrap_or(Complexity::M);
        let effort = refreshed.effort.unwrap_or_default();
        let overrides = model_config::list_model_configs(&self.pool).await?;

        let selection = match model_select::select(
            Stage::Coder,
            complexity,
            effort,
            refreshed.attempt_count.max(0) as u32,
            false,
            &overrides,
        ) {
            Ok(sel) => sel,
            Err(err) => {
                return dispatch::fail_task(
                    &self.pool,
                    task.id,
                    CoreErrorCode::ComplexityTooHigh,
                    &err.to_string(),
                )
                .await
            }
        };

        let branch = refreshed
            .branch_name
            .clone()
            .unwrap_or_else(|| WorktreeManager::branch_name(&refreshed.repo, &refreshed.issue_number.to_string()));
        let typecheck = self.typecheck_invariant(task.id).await?;
        let prompt = coder_prompt(&refreshed, Some("This is a recode after a replan."));

        match self
            .run_coder(&refreshed.repo, &branch, &prompt, &selection, typecheck.as_ref())
            .await
        {
            Ok(coded) => {
                task_db::record_coding_output(
                    &self.pool,
                    task.id,
                    &coded.branch_name,
                    &coded.diff,
                    &coded.commit_message,
                )
                .await?;
                TaskStateMachine::transition(&self.pool, task.id, TaskStatus::Replanning, TaskStatus::Coding)
                    .await?;
                TaskStateMachine::transition(&self.pool, task.id, TaskStatus::Coding, TaskStatus::CodingDone)
                    .await
            }
            Err(err) => {
                self.record_coding_failure(task.id, refreshed.status, &err).await
            }
        }
    }

    // -- Review -----------------------------------------------------------

    /// Covers `VisualTestsPassed` (first entry) and `Reviewing` (resumed,
    /// e.g. after a crash -- simply re-running the same logic is idempotent
    /// enough that no separate self-loop detection is needed).
    async fn handle_review(&self, task: &Task) -> Result<()> {
        if task.status == TaskStatus::VisualTestsPassed {
            TaskStateMachine::transition(
                &self.pool,
                task.id,
                TaskStatus::VisualTestsPassed,
                TaskStatus::Reviewing,
            )
            .await?;
        }

        let prompt = format!(
            "Review this diff against the plan.\n\nPlan:\n{}\n\nDiff:\n{}",
            task.plan_steps.join("\n"),
            task.current_diff.as_deref().unwrap_or(""),
        );
        let invocation = self
            .agents
            .reviewer
            .run(&AgentInput {
                prompt,
                model: self.agents.reviewer.model_name().to_owned(),
            })
            .await?;
        let output = agent::parse_reviewer_output(&invocation.raw_output)
            .map_err(|e| anyhow::anyhow!("reviewer returned invalid output: {e}"))?;

        events::record(
            &self.pool,
            task.id,
            EventType::Reviewed,
            Some(self.agents.reviewer.model_name()),
            None,
            Some(&format!("{:?}: {} comment(s)", output.verdict, output.comments.len())),
        )
        .await;

        match output.verdict {
            ReviewVerdict::Approved => {
                TaskStateMachine::transition(
                    &self.pool,
                    task.id,
                    TaskStatus::Reviewing,
                    TaskStatus::ReviewApproved,
                )
                .await
            }
            ReviewVerdict::Rejected => {
                let message = if output.comments.is_empty() {
                    "review rejected".to_owned()
                } else {
                    format!("review rejected: {}", output.comments.join("; "))
                };
                task_db::record_failure(&self.pool, task.id, &message, Some(RootCause::Code)).await?;
                TaskStateMachine::transition(
                    &self.pool,
                    task.id,
                    TaskStatus::Reviewing,
                    TaskStatus::ReviewRejected,
                )
                .await
            }
        }
    }

    // -- Open PR ------------------------------------------------------------

    async fn handle_open_pr(&self, task: &Task) -> Result<()> {
        gate::check(&self.pool, task.id, gate::review_complete(task)).await;

        if self.config.enable_batch_merge {
            let repo_ctx = self.vcs.get_repo_context(&task.repo).await?;
            let decision = batch::coordinate(
                &self.pool,
                task,
                &repo_ctx.default_branch,
                self.config.min_batch_size,
                self.config.max_batch_size,
                self.config.batch_timeout_minutes,
            )
            .await?;

            match decision {
                BatchDecision::Joined { .. } | BatchDecision::Formed { .. } => return Ok(()),
                BatchDecision::AlreadyMember { .. } => return Ok(()),
                BatchDecision::Individual => {}
            }
        }

        self.open_individual_pr(task).await
    }

    async fn open_individual_pr(&self, task: &Task) -> Result<()> {
        let repo_ctx = self.vcs.get_repo_context(&task.repo).await?;
        let branch = task
            .branch_name
            .clone()
            .context("task has no branch_name at ReviewApproved")?;
        let title = format!("Fix #{}", task.issue_number);
        let body = task.dod.join("\n");

        let pr = self
            .vcs
            .create_pr(&task.repo, &branch, &repo_ctx.default_branch, &title, &body)
            .await?;

        task_db::record_pr(&self.pool, task.id, pr.number, &pr.url, &title).await?;
        events::record(
            &self.pool,
            task.id,
            EventType::PrOpened,
            None,
            None,
            Some(&format!("#{}", pr.number)),
        )
        .await;

        TaskStateMachine::transition(&self.pool, task.id, TaskStatus::ReviewApproved, TaskStatus::PrCreated)
            .await
    }

    // -- Shared coder plumbing --------------------------------------------

    /// Fetch the linked typecheck invariant for a task, if any is
    /// configured (spec §4.3 full validation's "typecheck via an invariant
    /// command").
    async fn typecheck_invariant(&self, task_id: Uuid) -> Result<Option<Invariant>> {
        let invariants = invariant_db::get_invariants_for_task(&self.pool, task_id).await?;
        Ok(invariants.into_iter().find(|i| i.kind == InvariantKind::Typecheck))
    }

    /// Ensure a local worktree exists for the task's branch and return its
    /// path, creating one (and persisting it) if needed. Git operations
    /// are synchronous, so this always runs inside `spawn_blocking`.
    async fn ensure_worktree(&self, task: &Task) -> Result<PathBuf> {
        if let Some(path) = &task.worktree_path {
            return Ok(PathBuf::from(path));
        }

        let branch = task
            .branch_name
            .clone()
            .context("cannot create a worktree for a task with no branch_name")?;
        let worktrees = self.worktrees.clone();
        let info = tokio::task::spawn_blocking(move || worktrees.create_worktree(&branch))
            .await
            .context("worktree creation task panicked")??;

        task_db::set_worktree_path(&self.pool, task.id, &info.path.display().to_string()).await?;
        Ok(info.path)
    }

    /// Run the coder (single agent, or a consensus fan-out when
    /// `coder_variants` is configured), apply the resulting diff through
    /// the VCS host, and run full validation against a local worktree.
    /// Returns the validated result or an error describing what failed.
    async fn run_coder(
        &self,
        repo: &str,
        branch: &str,
        prompt: &str,
        selection: &ModelSelection,
        typecheck: Option<&Invariant>,
    ) -> Result<CodedResult> {
        self.vcs.ensure_branch_exists(repo, branch).await.ok();

        let input = AgentInput {
            prompt: prompt.to_owned(),
            model: selection.model.clone(),
        };

        let (diff, commit_message) = if self.agents.coder_variants.is_empty() {
            let invocation = self.agents.coder.run(&input).await?;
            let output = agent::parse_coder_output(&invocation.raw_output)
                .map_err(|e| anyhow::anyhow!("coder returned invalid output: {e}"))?;
            (
                output.diff,
                output.commit_message.unwrap_or_else(|| default_commit_message()),
            )
        } else {
            let decision = consensus::consensus_heuristic(&self.agents.coder_variants, &input, 0).await;
            let winner = decision
                .winner
                .ok_or_else(|| anyhow::anyhow!("no coder variant produced a valid diff: {}", decision.reasoning))?;
            let diff = winner
                .diff
                .ok_or_else(|| anyhow::anyhow!("winning candidate had no diff"))?;
            (diff, default_commit_message())
        };

        self.validate_and_apply(repo, branch, &diff, &commit_message, typecheck)
            .await
    }

    /// Validate a candidate diff (quick then full), apply it through the
    /// VCS host, and refresh the worktree against the applied result. This
    /// is the common tail `run_coder` uses after a fresh coder/fixer
    /// invocation, and what any other candidate diff (e.g. the agentic
    /// loop's winning fix, which only ever passed `quick_validate`) must
    /// also pass before being recorded as coded.
    async fn validate_and_apply(
        &self,
        repo: &str,
        branch: &str,
        diff: &str,
        commit_message: &str,
        typecheck: Option<&Invariant>,
    ) -> Result<CodedResult> {
        let (validation, sanitized_diff, _) = validator::quick_validate(diff);
        if !validation.valid {
            return Err(CoderError {
                code: validation.code.unwrap_or(CoreErrorCode::InvalidDiff),
                message: validation.errors.join("; "),
            }
            .into());
        }

        let file_contents = self
            .vcs
            .apply_diff(repo, branch, &sanitized_diff, commit_message)
            .await?;

        let worktrees = self.worktrees.clone();
        let branch_owned = branch.to_owned();
        let info = tokio::task::spawn_blocking(move || worktrees.create_worktree(&branch_owned))
            .await
            .context("worktree creation task panicked")??;

        let full = validator::full_validate(
            &file_contents,
            typecheck,
            &info.path,
            Duration::from_secs(180),
        )
        .await;

        if !full.valid {
            return Err(CoderError {
                code: full.code.unwrap_or(CoreErrorCode::SyntaxError),
                message: full.errors.join("; "),
            }
            .into());
        }

        Ok(CodedResult {
            branch_name: branch.to_owned(),
            diff: sanitized_diff,
            commit_message: commit_message.to_owned(),
            worktree_path: info.path,
        })
    }
}

fn default_commit_message() -> String {
    "apply automated changes".to_owned()
}

fn coder_prompt(task: &Task, extra: Option<&str>) -> String {
    format!(
        "Implement this plan.\n\ndefinition of done: {:?}\nplan: {:?}\ntarget files: {:?}\n{}",
        task.dod,
        task.plan_steps,
        task.target_files,
        extra.unwrap_or(""),
    )
}

fn tail(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        s
    } else {
        &s[s.len() - max_len..]
    }
}
