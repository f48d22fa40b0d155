//! BatchCoordinator + DiffCombiner (spec §4.9): group file-overlapping
//! approved tasks into one PR instead of opening one per task. Batching is
//! optional and only consulted from the `OpenPr` handler, on tasks that
//! have just reached `ReviewApproved`.

use std::collections::HashMap;

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use orc_db::models::{Batch, BatchStatus, Task, TaskStatus};
use orc_db::queries::batches;
use orc_db::queries::tasks as task_db;

use crate::diff::parser::{self, DiffHunk};
use crate::events::{self, EventType};
use crate::state::TaskStateMachine;
use crate::vcs::VcsHost;

/// What the coordinator decided for one task about to open a PR (spec
/// §4.9 steps 1-4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchDecision {
    /// Joined an existing pending batch; the task moved to `WaitingBatch`.
    Joined { batch_id: Uuid },
    /// Formed a new batch from `>= min_batch_size` overlapping approved
    /// tasks; this task moved to `WaitingBatch`.
    Formed { batch_id: Uuid, member_count: usize },
    /// No batching opportunity; the caller should open an individual PR.
    Individual,
    /// Already a batch member; `ready` says whether the batch can now be
    /// combined (spec §4.9 "Readiness").
    AlreadyMember { batch_id: Uuid, ready: bool },
}

/// Run the membership/join/form-new decision for `task` (spec §4.9 steps
/// 1-3). Call this from the `OpenPr` handler before opening an individual
/// PR; a [`BatchDecision::Individual`] means proceed as normal.
pub async fn coordinate(
    pool: &PgPool,
    task: &Task,
    base_branch: &str,
    min_batch_size: usize,
    max_batch_size: usize,
    batch_timeout_minutes: i64,
) -> anyhow::Result<BatchDecision> {
    if let Some(batch) = batches::get_batch_by_task(pool, task.id).await? {
        let ready = is_ready(pool, &batch, batch_timeout_minutes).await?;
        return Ok(BatchDecision::AlreadyMember {
            batch_id: batch.id,
            ready,
        });
    }

    let pending = batches::get_pending_batches(pool, &task.repo).await?;
    for candidate in &pending {
        let overlaps = candidate
            .target_files
            .iter()
            .any(|f| task.target_files.contains(f));
        if !overlaps {
            continue;
        }
        let member_count = batches::get_tasks_by_batch(pool, candidate.id).await?.len();
        if member_count >= max_batch_size {
            continue;
        }
        batches::add_task_to_batch(pool, task.id, candidate.id).await?;
        TaskStateMachine::transition(pool, task.id, task.status, TaskStatus::WaitingBatch).await?;
        events::record(
            pool,
            task.id,
            EventType::BatchPrCreated,
            None,
            None,
            Some(&format!("joined pending batch {}", candidate.id)),
        )
        .await;
        return Ok(BatchDecision::Joined {
            batch_id: candidate.id,
        });
    }

    let approved = task_db::list_tasks_by_status(pool, TaskStatus::ReviewApproved).await?;
    let overlapping: Vec<&Task> = approved
        .iter()
        .filter(|t| t.repo == task.repo && t.id != task.id)
        .filter(|t| t.target_files.iter().any(|f| task.target_files.contains(f)))
        .collect();

    if overlapping.len() + 1 < min_batch_size {
        return Ok(BatchDecision::Individual);
    }

    let mut target_files = task.target_files.clone();
    for other in &overlapping {
        for f in &other.target_files {
            if !target_files.contains(f) {
                target_files.push(f.clone());
            }
        }
    }

    let batch = batches::insert_batch(pool, &task.repo, base_branch, &target_files).await?;
    batches::add_task_to_batch(pool, task.id, batch.id).await?;
    TaskStateMachine::transition(pool, task.id, task.status, TaskStatus::WaitingBatch).await?;

    let mut member_count = 1;
    for other in overlapping.iter().take(max_batch_size.saturating_sub(1)) {
        if other.status != TaskStatus::ReviewApproved {
            continue;
        }
        batches::add_task_to_batch(pool, other.id, batch.id).await?;
        TaskStateMachine::transition(pool, other.id, other.status, TaskStatus::WaitingBatch).await?;
        member_count += 1;
    }

    events::record(
        pool,
        task.id,
        EventType::BatchPrCreated,
        None,
        None,
        Some(&format!("formed new batch {} with {member_count} members", batch.id)),
    )
    .await;

    Ok(BatchDecision::Formed {
        batch_id: batch.id,
        member_count,
    })
}

/// A batch is ready once every member is `WaitingBatch`/`ReviewApproved`
/// or the batch has aged past `batch_timeout_minutes` (spec §4.9
/// "Readiness"). Public so the periodic batch sweep (below) and tests can
/// poll it directly; `coordinate` also consults it for a task that is
/// already a member.
pub async fn is_ready(pool: &PgPool, batch: &Batch, batch_timeout_minutes: i64) -> anyhow::Result<bool> {
    if batches::is_batch_timed_out(batch, Utc::now(), batch_timeout_minutes) {
        return Ok(true);
    }

    let task_ids = batches::get_tasks_by_batch(pool, batch.id).await?;
    for task_id in &task_ids {
        let Some(task) = task_db::get_task(pool, *task_id).await? else {
            continue;
        };
        if !matches!(task.status, TaskStatus::WaitingBatch | TaskStatus::ReviewApproved) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// A hunk-overlap conflict the combiner could not resolve automatically
/// (spec §4.9 `Conflict {file,line,taskIds,resolution=manual}`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub file: String,
    pub line: u32,
    pub task_ids: Vec<Uuid>,
}

/// The result of combining a ready batch's member diffs.
#[derive(Debug, Clone)]
pub enum CombineOutcome {
    Combined {
        diff: String,
        title: String,
        commit_message: String,
        pr_body: String,
    },
    Conflicted {
        conflicts: Vec<Conflict>,
    },
}

/// DiffCombiner (spec §4.9): fetch every member task's diff, detect
/// overlapping-and-deleting hunks, and either emit one combined unified
/// diff or report the conflicts that block it.
pub async fn combine(pool: &PgPool, batch_id: Uuid) -> anyhow::Result<CombineOutcome> {
    let task_ids = batches::get_tasks_by_batch(pool, batch_id).await?;
    let mut members = Vec::with_capacity(task_ids.len());
    for task_id in &task_ids {
        if let Some(task) = task_db::get_task(pool, *task_id).await? {
            members.push(task);
        }
    }
    combine_diffs(&members)
}

/// Handle a ready batch whose combiner run succeeded: record the shared
/// PR on every member task and mark the batch `completed`.
pub async fn apply_combined_pr(
    pool: &PgPool,
    batch: &Batch,
    pr_number: i32,
    pr_url: &str,
    pr_title: &str,
) -> anyhow::Result<()> {
    let task_ids = batches::get_tasks_by_batch(pool, batch.id).await?;
    for task_id in &task_ids {
        task_db::record_pr(pool, *task_id, pr_number, pr_url, pr_title).await?;
        if let Some(task) = task_db::get_task(pool, *task_id).await? {
            if task.status == TaskStatus::WaitingBatch {
                TaskStateMachine::transition(pool, *task_id, TaskStatus::WaitingBatch, TaskStatus::PrCreated)
                    .await?;
            }
        }
        events::record(
            pool,
            *task_id,
            EventType::BatchPrCreated,
            None,
            None,
            Some(&format!("batch {} opened PR #{pr_number}", batch.id)),
        )
        .await;
    }
    batches::update_batch_status(pool, batch.id, BatchStatus::Completed, Some(pr_number), Some(pr_url))
        .await?;
    Ok(())
}

/// Handle a ready batch whose combiner run hit conflicts: release every
/// member back to `ReviewApproved` so the next tick opens an individual PR
/// for each, and mark the batch `failed` (spec §4.9 "its tasks are removed
/// and each proceeds to an individual PR").
pub async fn fail_batch_to_individual(pool: &PgPool, batch: &Batch, conflicts: &[Conflict]) -> anyhow::Result<()> {
    let task_ids = batches::get_tasks_by_batch(pool, batch.id).await?;
    for task_id in &task_ids {
        batches::remove_task_from_batch(pool, *task_id).await?;
        if let Some(task) = task_db::get_task(pool, *task_id).await? {
            if task.status == TaskStatus::WaitingBatch {
                let _ =
                    TaskStateMachine::transition(pool, *task_id, TaskStatus::WaitingBatch, TaskStatus::ReviewApproved)
                        .await;
            }
        }
        events::record(
            pool,
            *task_id,
            EventType::ConflictDetected,
            None,
            None,
            Some(&format!("batch {} conflicted ({} conflicts); falling back to individual PR", batch.id, conflicts.len())),
        )
        .await;
    }
    batches::update_batch_status(pool, batch.id, BatchStatus::Failed, None, None).await?;
    Ok(())
}

/// Poll every pending batch for the given repos and combine the ready
/// ones (spec §4.9 readiness + combiner, driven periodically rather than
/// from the `OpenPr` handler since a batch member's own status stops
/// advancing once it reaches `WaitingBatch`). Applies the combined diff to
/// a dedicated batch branch and opens one PR, or releases the batch's
/// tasks back to an individual PR on conflict.
pub async fn process_ready_batches(
    pool: &PgPool,
    vcs: &dyn VcsHost,
    repos: &[String],
    batch_timeout_minutes: i64,
) -> anyhow::Result<()> {
    for repo in repos {
        let pending = batches::get_pending_batches(pool, repo).await?;
        for batch in pending {
            if !is_ready(pool, &batch, batch_timeout_minutes).await? {
                continue;
            }

            match combine(pool, batch.id).await? {
                CombineOutcome::Combined {
                    diff,
                    title,
                    commit_message,
                    pr_body,
                } => {
                    let branch = format!("orc/batch/{}", batch.id);
                    vcs.create_branch_from_main(repo, &branch).await?;
                    vcs.apply_diff(repo, &branch, &diff, &commit_message).await?;
                    let pr = vcs
                        .create_pr(repo, &branch, &batch.base_branch, &title, &pr_body)
                        .await?;
                    apply_combined_pr(pool, &batch, pr.number, &pr.url, &title).await?;
                }
                CombineOutcome::Conflicted { conflicts } => {
                    fail_batch_to_individual(pool, &batch, &conflicts).await?;
                }
            }
        }
    }
    Ok(())
}

/// Pure combination logic, kept separate from persistence so it is
/// unit-testable without a database.
fn combine_diffs(members: &[Task]) -> anyhow::Result<CombineOutcome> {
    let mut by_file: HashMap<String, Vec<(Uuid, DiffHunk)>> = HashMap::new();
    let mut file_order: Vec<String> = Vec::new();

    for task in members {
        let Some(diff) = task.current_diff.as_deref() else {
            continue;
        };
        let files = parser::parse(diff)?;
        for file in files {
            let entry = by_file.entry(file.path.clone()).or_insert_with(|| {
                file_order.push(file.path.clone());
                Vec::new()
            });
            for hunk in file.hunks {
                entry.push((task.id, hunk));
            }
        }
    }

    let mut conflicts = Vec::new();
    for file in &file_order {
        let hunks = by_file.get_mut(file).expect("file present in by_file");
        hunks.sort_by_key(|(_, h)| h.old_start);
        for pair in hunks.windows(2) {
            let (task_a, hunk_a) = &pair[0];
            let (task_b, hunk_b) = &pair[1];
            let overlaps = hunk_a.old_end() > hunk_b.old_start;
            if overlaps && (hunk_a.deletes_lines() || hunk_b.deletes_lines()) {
                conflicts.push(Conflict {
                    file: file.clone(),
                    line: hunk_b.old_start,
                    task_ids: vec![*task_a, *task_b],
                });
            }
        }
    }

    if !conflicts.is_empty() {
        return Ok(CombineOutcome::Conflicted { conflicts });
    }

    let mut diff = String::new();
    for file in &file_order {
        let hunks = &by_file[file];
        diff.push_str(&format!("--- a/{file}\n+++ b/{file}\n"));
        let mut delta: i64 = 0;
        for (_, hunk) in hunks {
            let old_count = hunk
                .lines
                .iter()
                .filter(|l| l.starts_with('-') || l.starts_with(' '))
                .count() as u32;
            let new_count = hunk
                .lines
                .iter()
                .filter(|l| l.starts_with('+') || l.starts_with(' '))
                .count() as u32;
            let new_start = (hunk.old_start as i64 + delta).max(0) as u32;
            diff.push_str(&format!(
                "@@ -{},{} +{},{} @@\n",
                hunk.old_start, old_count, new_start, new_count
            ));
            for line in &hunk.lines {
                diff.push_str(line);
                diff.push('\n');
            }
            delta += new_count as i64 - old_count as i64;
        }
    }

    Ok(CombineOutcome::Combined {
        diff,
        title: combined_title(members),
        commit_message: combined_commit_message(members),
        pr_body: combined_pr_body(members),
    })
}

fn combined_title(members: &[Task]) -> String {
    let issues: Vec<String> = members.iter().map(|t| format!("#{}", t.issue_number)).collect();
    format!("Batch: {}", issues.join(", "))
}

fn combined_commit_message(members: &[Task]) -> String {
    let mut msg = String::from("Combine changes for:\n");
    for task in members {
        msg.push_str(&format!("- {} #{}\n", task.repo, task.issue_number));
    }
    msg
}

fn combined_pr_body(members: &[Task]) -> String {
    let mut body = String::from("This PR combines the following issues:\n\n");
    for task in members {
        body.push_str(&format!("- #{}\n", task.issue_number));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orc_db::models::TaskStatus;
    use uuid::Uuid;

    fn task_with_diff(issue_number: i32, diff: &str) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            repo: "acme/x".to_owned(),
            issue_number,
            status: TaskStatus::ReviewApproved,
            dod: vec![],
            plan_steps: vec![],
            target_files: vec![],
            multi_file_plan: None,
            commands: serde_json::json!([]),
            complexity: None,
            effort: None,
            requested_harness: None,
            branch_name: Some("orc/b".to_owned()),
            current_diff: Some(diff.to_owned()),
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

    #[test]
    fn non_overlapping_diffs_combine_cleanly() {
        let a = task_with_diff(1, "--- a/f1\n+++ b/f1\n@@ -1,1 +1,1 @@\n-old\n+new\n");
        let b = task_with_diff(2, "--- a/f2\n+++ b/f2\n@@ -1,1 +1,1 @@\n-x\n+y\n");
        let outcome = combine_diffs(&[a, b]).unwrap();
        match outcome {
            CombineOutcome::Combined { diff, title, .. } => {
                assert!(diff.contains("f1"));
                assert!(diff.contains("f2"));
                assert_eq!(title, "Batch: #1, #2");
            }
            other => panic!("expected combined, got {other:?}"),
        }
    }

    #[test]
    fn overlapping_deleting_hunks_conflict() {
        let a = task_with_diff(1, "--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n-a\n-b\n-c\n+x\n+y\n+z\n");
        let b = task_with_diff(2, "--- a/f\n+++ b/f\n@@ -2,1 +2,1 @@\n-b\n+q\n");
        let outcome = combine_diffs(&[a, b]).unwrap();
        match outcome {
            CombineOutcome::Conflicted { conflicts } => assert_eq!(conflicts.len(), 1),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn same_file_non_overlapping_hunks_combine_with_recomputed_headers() {
        let a = task_with_diff(1, "--- a/f\n+++ b/f\n@@ -1,1 +1,1 @@\n-old\n+new line\n+extra\n");
        let b = task_with_diff(2, "--- a/f\n+++ b/f\n@@ -10,1 +10,1 @@\n-far\n+away\n");
        let outcome = combine_diffs(&[a, b]).unwrap();
        match outcome {
            CombineOutcome::Combined { diff, .. } => {
                // The second hunk's newStart should shift by +1 (one net
                // added line from the first hunk).
                assert!(diff.contains("@@ -10,1 +11,1 @@"), "{diff}");
            }
            other => panic!("expected combined, got {other:?}"),
        }
    }
}

impl std::fmt::Debug for CombineOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CombineOutcome::Combined { diff, title, .. } => f
                .debug_struct("Combined")
                .field("title", title)
                .field("diff_len", &diff.len())
                .finish(),
            CombineOutcome::Conflicted { conflicts } => {
                f.debug_struct("Conflicted").field("conflicts", conflicts).finish()
            }
        }
    }
}
