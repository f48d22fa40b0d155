//! Decomposer/SubtaskManager (spec §4.8): splits an `L`/`XL` task into a
//! topologically-ordered list of subtasks, then advances one subtask at a
//! time until the parent task's diff is fully assembled.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use orc_db::models::{Subtask, SubtaskStatus, TaskStatus};
use orc_db::queries::subtasks::{self, NewSubtask};
use orc_db::queries::tasks as task_db;

use crate::agent::types::{BreakdownOutput, ProposedSubtask};
use crate::error::CoreErrorCode;
use crate::events::{self, EventType};
use crate::state::dispatch;
use crate::state::TaskStateMachine;

/// What the orchestrator should do after one `tick` call (spec §4.8
/// "per-tick subtask advancement").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A subtask was picked and marked `in_progress`; the caller should
    /// dispatch coding/testing for it.
    Advanced { subtask_id: Uuid },
    /// Every subtask is `completed`; the caller should assemble the
    /// combined diff and move the parent to `CodingDone`.
    AllComplete { combined_diff: String },
    /// No subtask is ready yet (all remaining are blocked on an
    /// in-progress or not-yet-reached dependency).
    Waiting,
    /// A subtask exhausted `MAX_SUBTASK_ATTEMPTS`; the parent task has been
    /// failed.
    SubtaskExhausted { subtask_id: Uuid },
}

/// Decompose a breakdown agent's proposed subtasks into persisted rows
/// under `parent_task_id`, topologically ordered by their `depends_on`
/// indices (spec §4.8 "execution_order"). Returns the inserted subtasks in
/// `seq` order.
pub async fn decompose(
    pool: &PgPool,
    parent_task_id: Uuid,
    breakdown: &BreakdownOutput,
) -> Result<Vec<Subtask>> {
    let order = topological_order(&breakdown.subtasks)?;

    let mut index_to_id: HashMap<usize, Uuid> = HashMap::new();
    let mut inserted = Vec::with_capacity(order.len());

    for (seq, &idx) in order.iter().enumerate() {
        let proposed = &breakdown.subtasks[idx];
        let depends_on = proposed
            .depends_on
            .iter()
            .map(|dep_idx| {
                index_to_id.get(dep_idx).copied().with_context(|| {
                    format!("subtask {idx} depends on {dep_idx} which has not been inserted yet")
                })
            })
            .collect::<Result<Vec<Uuid>>>()?;

        let new_subtask = NewSubtask {
            parent_task_id,
            target_files: proposed.target_files.clone(),
            acceptance_criteria: proposed.acceptance_criteria.clone(),
            depends_on,
            seq: seq as i32,
        };

        let subtask = subtasks::insert_subtask(pool, &new_subtask).await?;
        index_to_id.insert(idx, subtask.id);
        inserted.push(subtask);
    }

    task_db::set_is_orchestrated(pool, parent_task_id, true).await?;

    events::record_with_metadata(
        pool,
        parent_task_id,
        EventType::Decomposed,
        None,
        None,
        None,
        serde_json::json!({ "subtask_count": inserted.len() }),
    )
    .await;

    Ok(inserted)
}

/// Kahn's algorithm over `depends_on` indices; fails if the proposed graph
/// has a cycle.
fn topological_order(proposed: &[ProposedSubtask]) -> Result<Vec<usize>> {
    let n = proposed.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (i, p) in proposed.iter().enumerate() {
        for &dep in &p.depends_on {
            if dep >= n {
                bail!("subtask {i} depends on out-of-range index {dep}");
            }
            dependents[dep].push(i);
            in_degree[i] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    let mut seen: HashSet<usize> = HashSet::new();

    while let Some(i) = queue.pop_front() {
        order.push(i);
        seen.insert(i);
        for &dep in &dependents[i] {
            in_degree[dep] -= 1;
            if in_degree[dep] == 0 {
                queue.push_back(dep);
            }
        }
    }

    if order.len() != n {
        bail!("subtask dependency graph has a cycle");
    }

    Ok(order)
}

/// Advance the parent task's orchestration by one tick (spec §4.8):
/// aggregate and finish if every subtask is `completed`, otherwise pick
/// the next `pending` subtask whose dependencies are all `completed` and
/// mark it `in_progress`.
pub async fn tick(pool: &PgPool, parent_task_id: Uuid, max_subtask_attempts: i32) -> Result<TickOutcome> {
    if subtasks::all_subtasks_completed(pool, parent_task_id).await? {
        let all = subtasks::list_subtasks(pool, parent_task_id).await?;
        let combined_diff = combine_subtask_diffs(&all);
        task_db::set_current_subtask(pool, parent_task_id, None).await?;
        events::record_with_metadata(
            pool,
            parent_task_id,
            EventType::SubtaskCompleted,
            None,
            None,
            None,
            serde_json::json!({ "all_complete": true }),
        )
        .await;
        return Ok(TickOutcome::AllComplete { combined_diff });
    }

    let all = subtasks::list_subtasks(pool, parent_task_id).await?;
    let completed: HashSet<Uuid> = all
        .iter()
        .filter(|s| s.status == SubtaskStatus::Completed)
        .map(|s| s.id)
        .collect();

    for subtask in &all {
        if subtask.status == SubtaskStatus::Failed && subtask.attempt_count >= max_subtask_attempts {
            dispatch::fail_task(
                pool,
                parent_task_id,
                CoreErrorCode::SubtaskFailed,
                &format!("subtask {} exhausted max_subtask_attempts", subtask.id),
            )
            .await?;
            return Ok(TickOutcome::SubtaskExhausted {
                subtask_id: subtask.id,
            });
        }
    }

    let ready = all.iter().find(|s| {
        s.status == SubtaskStatus::Pending && s.depends_on.iter().all(|d| completed.contains(d))
    });

    match ready {
        Some(subtask) => {
            subtasks::update_subtask_status(pool, subtask.id, SubtaskStatus::InProgress, None, false)
                .await?;
            task_db::set_current_subtask(pool, parent_task_id, Some(subtask.id)).await?;
            Ok(TickOutcome::Advanced {
                subtask_id: subtask.id,
            })
        }
        None => Ok(TickOutcome::Waiting),
    }
}

/// Record a subtask's finished diff and mark it `completed` (spec §4.8,
/// called once the subtask's own coding/testing/review cycle succeeds).
pub async fn complete_subtask(pool: &PgPool, subtask_id: Uuid, diff: &str) -> Result<()> {
    subtasks::update_subtask_status(pool, subtask_id, SubtaskStatus::Completed, Some(diff), false)
        .await
}

/// Record a subtask attempt failure, bumping its attempt counter (spec
/// §4.8 `MAX_SUBTASK_ATTEMPTS`).
pub async fn fail_subtask_attempt(pool: &PgPool, subtask_id: Uuid) -> Result<()> {
    subtasks::update_subtask_status(pool, subtask_id, SubtaskStatus::Failed, None, true).await
}

/// Once every subtask completes, move the parent task from `Orchestrating`
/// to `CodingDone` with the combined diff recorded.
pub async fn finish_orchestration(
    pool: &PgPool,
    parent_task_id: Uuid,
    combined_diff: &str,
    branch_name: &str,
) -> Result<()> {
    task_db::record_coding_output(
        pool,
        parent_task_id,
        branch_name,
        combined_diff,
        "combine subtask diffs",
    )
    .await?;
    TaskStateMachine::transition(
        pool,
        parent_task_id,
        TaskStatus::Orchestrating,
        TaskStatus::CodingDone,
    )
    .await
}

/// Concatenate every completed subtask's diff in `seq` order into one
/// combined patch (naive concatenation suffices: subtasks are decomposed
/// by non-overlapping target file sets, spec §4.8).
fn combine_subtask_diffs(subtasks: &[Subtask]) -> String {
    subtasks
        .iter()
        .filter_map(|s| s.diff.as_deref())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposed(depends_on: Vec<usize>) -> ProposedSubtask {
        ProposedSubtask {
            description: "do work".to_owned(),
            target_files: vec!["f.ts".to_owned()],
            acceptance_criteria: vec!["works".to_owned()],
            depends_on,
        }
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let subtasks = vec![proposed(vec![1]), proposed(vec![]), proposed(vec![1])];
        let order = topological_order(&subtasks).unwrap();
        let pos = |idx: usize| order.iter().position(|&i| i == idx).unwrap();
        assert!(pos(1) < pos(0));
        assert!(pos(1) < pos(2));
    }

    #[test]
    fn topological_order_detects_cycle() {
        let subtasks = vec![proposed(vec![1]), proposed(vec![0])];
        assert!(topological_order(&subtasks).is_err());
    }

    #[test]
    fn topological_order_rejects_out_of_range_dependency() {
        let subtasks = vec![proposed(vec![5])];
        assert!(topological_order(&subtasks).is_err());
    }

    #[test]
    fn combine_subtask_diffs_joins_in_order() {
        let now = chrono::Utc::now();
        let mk = |diff: Option<&str>| Subtask {
            id: Uuid::new_v4(),
            parent_task_id: Uuid::new_v4(),
            child_task_id: None,
            status: SubtaskStatus::Completed,
            diff: diff.map(str::to_owned),
            attempt_count: 0,
            target_files: vec![],
            acceptance_criteria: vec![],
            depends_on: vec![],
            seq: 0,
            created_at: now,
            updated_at: now,
        };
        let combined = combine_subtask_diffs(&[mk(Some("diff-a")), mk(Some("diff-b"))]);
        assert_eq!(combined, "diff-a\ndiff-b");
    }
}
