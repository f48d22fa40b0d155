//! `orc tasks` commands: create and inspect tasks outside the agent loop.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use orc_db::models::TaskStatus;
use orc_db::queries::tasks as task_db;

/// `orc tasks new <repo> <issue-number>`: register a new task for an issue.
pub async fn run_new(
    pool: &PgPool,
    repo: &str,
    issue_number: i32,
    max_attempts: i32,
    harness: Option<&str>,
) -> Result<()> {
    if let Some(existing) = task_db::get_task_by_repo_issue(pool, repo, issue_number).await? {
        println!(
            "Task already exists for {repo}#{issue_number}: {} ({})",
            existing.id, existing.status
        );
        return Ok(());
    }

    let task = task_db::insert_task(pool, repo, issue_number, max_attempts, harness).await?;
    println!("Created task {} for {repo}#{issue_number}.", task.id);
    Ok(())
}

/// `orc tasks show <task-id>`: print one task's full state.
pub async fn run_show(pool: &PgPool, task_id_str: &str) -> Result<()> {
    let task_id =
        Uuid::parse_str(task_id_str).with_context(|| format!("invalid task ID: {task_id_str}"))?;
    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("id:             {}", task.id);
    println!("repo:           {}", task.repo);
    println!("issue:          #{}", task.issue_number);
    println!("status:         {}", task.status);
    println!("attempt:        {}/{}", task.attempt_count, task.max_attempts);
    println!("complexity:     {:?}", task.complexity);
    println!("effort:         {:?}", task.effort);
    println!("harness:        {}", task.requested_harness.as_deref().unwrap_or("-"));
    println!("branch:         {}", task.branch_name.as_deref().unwrap_or("-"));
    println!("worktree:       {}", task.worktree_path.as_deref().unwrap_or("-"));
    println!(
        "pr:             {}",
        task.pr_number
            .map(|n| format!("#{n} {}", task.pr_url.as_deref().unwrap_or("")))
            .unwrap_or_else(|| "-".to_string())
    );
    println!("last_error:     {}", task.last_error.as_deref().unwrap_or("-"));
    println!("root_cause:     {:?}", task.root_cause);
    println!("orchestrated:   {}", task.is_orchestrated);
    println!("created_at:     {}", task.created_at);
    println!("updated_at:     {}", task.updated_at);
    Ok(())
}

/// `orc tasks list [--status <status>]`: list tasks, optionally filtered.
pub async fn run_list(pool: &PgPool, status: Option<&str>) -> Result<()> {
    let tasks = match status {
        Some(s) => {
            let parsed: TaskStatus = s
                .parse()
                .map_err(|_| anyhow::anyhow!("unknown status: {s}"))?;
            task_db::list_tasks_by_status(pool, parsed).await?
        }
        None => task_db::list_active_tasks(pool).await?,
    };

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!("{:<36}  {:<30}  {:<20}  {:<8}", "ID", "REPO", "STATUS", "ATTEMPT");
    for t in &tasks {
        println!(
            "{:<36}  {:<30}  {:<20}  {}/{}",
            t.id,
            format!("{}#{}", t.repo, t.issue_number),
            t.status,
            t.attempt_count,
            t.max_attempts
        );
    }
    Ok(())
}
