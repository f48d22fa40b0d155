//! `orc cleanup <task-id>` command: remove a task's worktree.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use orc_core::worktree::WorktreeManager;
use orc_db::queries::tasks as task_db;

/// Run the cleanup command: remove the local worktree backing `task_id`,
/// if one was ever created, under the repo checked out at `repo_path`.
pub async fn run_cleanup(pool: &PgPool, task_id_str: &str, repo_path: &str) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;

    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    let Some(wt_path) = task.worktree_path.as_deref() else {
        println!("Task {task_id} has no worktree to clean up.");
        return Ok(());
    };

    let worktree_manager =
        WorktreeManager::new(repo_path, None).map_err(|e| anyhow::anyhow!("{e}"))?;

    worktree_manager
        .remove_worktree(std::path::Path::new(wt_path))
        .map_err(|e| anyhow::anyhow!("failed to remove worktree at {wt_path}: {e}"))?;

    println!("Removed worktree for task {task_id} at {wt_path}.");

    let _ = worktree_manager.cleanup_stale();

    Ok(())
}
