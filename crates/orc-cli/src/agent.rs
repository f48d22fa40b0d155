//! Agent-mode CLI command implementations.
//!
//! When `ORC_AGENT_TOKEN` is set in the environment, the CLI restricts
//! its command surface to the four agent-mode commands: `task`, `check`,
//! `progress`, and `done`. This module contains the dispatch logic and
//! each command's implementation.
//!
//! All commands validate the scoped token before doing any work. The token
//! encodes a (task_id, attempt) pair that scopes the agent to exactly one
//! task.

use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use orc_core::token::guard::{self, GuardError};
use orc_core::token::{TokenClaims, TokenConfig};
use orc_db::models::Invariant;
use orc_db::queries::invariants as invariant_db;
use orc_db::queries::task_events::{self, NewTaskEvent};
use orc_db::queries::tasks as task_db;
use sqlx::PgPool;

use crate::Commands;

// -----------------------------------------------------------------------
// Public entry point
// -----------------------------------------------------------------------

/// Run the CLI in agent mode.
///
/// This is called when `ORC_AGENT_TOKEN` is detected in the environment.
/// It validates the token, restricts the command surface, and dispatches to
/// the appropriate agent-mode handler.
///
/// # Errors
///
/// Returns an error (and the process should exit non-zero) when:
/// - The token is missing or invalid
/// - An operator-only command was attempted
/// - A DB query fails
/// - An invariant check fails (for `orc check`)
pub async fn run_agent_mode(
    command: Commands,
    pool: Option<&PgPool>,
) -> Result<()> {
    // Validate the token first.
    let token_config = TokenConfig::from_env()
        .context("ORC_TOKEN_SECRET must be set for agent mode")?;
    let claims = guard::require_agent_mode(&token_config)
        .map_err(|e| match e {
            GuardError::InvalidToken(inner) => {
                anyhow::anyhow!("invalid agent token: {inner}")
            }
            other => anyhow::anyhow!("{other}"),
        })?;

    match command {
        Commands::Task => cmd_task(&claims, pool).await,
        Commands::Check => cmd_check(&claims, pool).await,
        Commands::Progress { message } => cmd_progress(&claims, pool, &message).await,
        Commands::Done => cmd_done(&claims, pool).await,
        // Any operator command is blocked in agent mode.
        _ => {
            bail!("Error: this command is not available in agent mode");
        }
    }
}

// -----------------------------------------------------------------------
// orc task
// -----------------------------------------------------------------------

/// `orc task` -- read the assigned task description.
///
/// Validates the token, looks up the task in the DB, and prints a clean
/// markdown description that the LLM agent can consume.
async fn cmd_task(claims: &TokenClaims, pool: Option<&PgPool>) -> Result<()> {
    let pool = require_db(pool)?;

    let task = task_db::get_task(pool, claims.task_id)
        .await
        .context("failed to query task")?
        .with_context(|| format!("task {} not found", claims.task_id))?;

    let invariants = invariant_db::get_invariants_for_task(pool, claims.task_id)
        .await
        .context("failed to query invariants for task")?;

    // Print as clean markdown.
    println!("# Task: {} #{}", task.repo, task.issue_number);
    println!();
    if !task.dod.is_empty() {
        println!("## Definition of done");
        println!();
        for item in &task.dod {
            println!("- {item}");
        }
        println!();
    }
    if !task.plan_steps.is_empty() {
        println!("## Plan");
        println!();
        for (i, step) in task.plan_steps.iter().enumerate() {
            println!("{}. {step}", i + 1);
        }
        println!();
    }
    if !task.target_files.is_empty() {
        println!("## Target files");
        println!();
        for f in &task.target_files {
            println!("- {f}");
        }
        println!();
    }
    println!("## Details");
    println!();
    println!("- **Attempt**: {}/{}", claims.attempt, task.max_attempts);
    println!("- **Status**: {}", task.status);
    if let Some(harness) = &task.requested_harness {
        println!("- **Harness**: {harness}");
    }
    println!();

    if !invariants.is_empty() {
        println!("## Invariant commands");
        println!();
        println!("Run `orc check` to execute all invariants, or run individually:");
        println!();
        for inv in &invariants {
            let args_str = if inv.args.is_empty() {
                String::new()
            } else {
                format!(" {}", inv.args.join(" "))
            };
            println!("- **{}**: `{}{}`", inv.name, inv.command, args_str);
        }
        println!();
    } else {
        println!("_No invariants linked to this task._");
        println!();
    }

    Ok(())
}

// -----------------------------------------------------------------------
// orc check
// -----------------------------------------------------------------------

/// Result of running a single invariant check.
struct InvariantCheckResult {
    name: String,
    passed: bool,
    exit_code: i32,
    stdout_snippet: String,
    stderr_snippet: String,
    duration_ms: u64,
}

/// `orc check` -- run all invariants linked to this task.
///
/// Looks up linked invariants, executes each in the current working
/// directory, prints results, and exits 0 only if ALL pass.
async fn cmd_check(claims: &TokenClaims, pool: Option<&PgPool>) -> Result<()> {
    let pool = require_db(pool)?;

    let invariants = invariant_db::get_invariants_for_task(pool, claims.task_id)
        .await
        .context("failed to query invariants for task")?;

    if invariants.is_empty() {
        println!("No invariants linked to this task. Nothing to check.");
        return Ok(());
    }

    let cwd = std::env::current_dir().context("failed to get current directory")?;
    let mut results = Vec::with_capacity(invariants.len());
    let mut all_passed = true;

    for inv in &invariants {
        let result = run_invariant_check(inv, &cwd)?;
        if !result.passed {
            all_passed = false;
        }
        results.push(result);
    }

    // Print results.
    println!("## Invariant check results");
    println!();

    for result in &results {
        let status_label = if result.passed { "PASS" } else { "FAIL" };
        println!(
            "- [{}] **{}** (exit {}, {}ms)",
            status_label, result.name, result.exit_code, result.duration_ms
        );
        if !result.passed {
            if !result.stderr_snippet.is_empty() {
                println!("  stderr: {}", result.stderr_snippet);
            }
            if !result.stdout_snippet.is_empty() {
                println!("  stdout: {}", result.stdout_snippet);
            }
        }
    }
    println!();

    // Record results as a task event. Best-effort: if the DB insert fails
    // we still report the invariant results.
    let check_metadata = serde_json::json!({
        "results": results.iter().map(|r| {
            serde_json::json!({
                "name": r.name,
                "passed": r.passed,
                "exit_code": r.exit_code,
                "duration_ms": r.duration_ms,
            })
        }).collect::<Vec<_>>(),
    });
    let _ = task_events::insert_task_event(
        pool,
        &NewTaskEvent {
            task_id: claims.task_id,
            event_type: "invariant_check".to_string(),
            agent: None,
            input_summary: None,
            output_summary: Some(format!("all_passed={all_passed}")),
            tokens: None,
            duration_ms: None,
            metadata: check_metadata,
        },
    )
    .await;

    if all_passed {
        println!("All invariants passed.");
        Ok(())
    } else {
        bail!("One or more invariants failed.");
    }
}

/// Execute a single invariant in the given working directory.
fn run_invariant_check(
    inv: &Invariant,
    cwd: &std::path::Path,
) -> Result<InvariantCheckResult> {
    let start = Instant::now();

    let output = std::process::Command::new(&inv.command)
        .args(&inv.args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("failed to execute invariant '{}': {}", inv.name, inv.command))?;

    let duration_ms = start.elapsed().as_millis() as u64;
    let exit_code = output.status.code().unwrap_or(-1);
    let passed = exit_code == inv.expected_exit_code;

    let stdout_full = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr_full = String::from_utf8_lossy(&output.stderr).to_string();

    // Truncate to a reasonable snippet length.
    let snippet_max = 500;
    let stdout_snippet = truncate_string(&stdout_full, snippet_max);
    let stderr_snippet = truncate_string(&stderr_full, snippet_max);

    Ok(InvariantCheckResult {
        name: inv.name.clone(),
        passed,
        exit_code,
        stdout_snippet,
        stderr_snippet,
        duration_ms,
    })
}

/// Truncate a string to at most `max_len` characters, appending "..." if
/// truncated.
fn truncate_string(s: &str, max_len: usize) -> String {
    let trimmed = s.trim();
    if trimmed.len() <= max_len {
        trimmed.to_string()
    } else {
        format!("{}...", &trimmed[..max_len])
    }
}

// -----------------------------------------------------------------------
// orc progress
// -----------------------------------------------------------------------

/// `orc progress "message"` -- record a progress event.
async fn cmd_progress(
    claims: &TokenClaims,
    pool: Option<&PgPool>,
    message: &str,
) -> Result<()> {
    let pool = require_db(pool)?;

    task_events::insert_task_event(
        pool,
        &NewTaskEvent {
            task_id: claims.task_id,
            event_type: "progress".to_string(),
            agent: None,
            input_summary: None,
            output_summary: Some(message.to_string()),
            tokens: None,
            duration_ms: None,
            metadata: serde_json::json!({ "attempt": claims.attempt }),
        },
    )
    .await
    .context("failed to record progress event")?;

    println!("Progress recorded for task {}.", claims.task_id);
    Ok(())
}

// -----------------------------------------------------------------------
// orc done
// -----------------------------------------------------------------------

/// `orc done` -- signal task completion.
///
/// Records a done_signal event but does NOT change the task status.
/// That is orc's (the orchestrator's) job.
async fn cmd_done(claims: &TokenClaims, pool: Option<&PgPool>) -> Result<()> {
    let pool = require_db(pool)?;

    task_events::insert_task_event(
        pool,
        &NewTaskEvent {
            task_id: claims.task_id,
            event_type: "done_signal".to_string(),
            agent: None,
            input_summary: None,
            output_summary: None,
            tokens: None,
            duration_ms: None,
            metadata: serde_json::json!({ "attempt": claims.attempt }),
        },
    )
    .await
    .context("failed to record done signal")?;

    println!("Completion signaled. orc will now run gate checks.");
    Ok(())
}

// -----------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------

/// Require that a database pool is available.
fn require_db(pool: Option<&PgPool>) -> Result<&PgPool> {
    pool.ok_or_else(|| {
        anyhow::anyhow!(
            "database connection required but not available; \
             set ORC_DATABASE_URL or run `orc init` first"
        )
    })
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use orc_core::token::guard::{self, AGENT_TOKEN_ENV};
    use orc_core::token::{TokenConfig, generate_token};
    use std::sync::Mutex;
    use uuid::Uuid;

    use crate::Commands;

    fn test_config() -> TokenConfig {
        TokenConfig::new(b"agent-mode-test-secret".to_vec())
    }

    // Mutex to serialize tests that modify environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn operator_commands_rejected_when_token_set() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let config = test_config();
        let task_id = Uuid::new_v4();
        let token = generate_token(&config, task_id, 0);

        // SAFETY: serialized by mutex, test-only code.
        unsafe { std::env::set_var(AGENT_TOKEN_ENV, &token) };

        // Verify the guard detects agent mode.
        let result = guard::require_operator_mode();
        assert!(result.is_err(), "operator mode should be blocked when token is set");

        unsafe { std::env::remove_var(AGENT_TOKEN_ENV) };
    }

    #[test]
    fn operator_commands_allowed_when_no_token() {
        let _lock = ENV_MUTEX.lock().unwrap();

        // SAFETY: serialized by mutex, test-only code.
        unsafe { std::env::remove_var(AGENT_TOKEN_ENV) };

        let result = guard::require_operator_mode();
        assert!(result.is_ok(), "operator mode should be allowed when no token");
    }

    #[test]
    fn invalid_token_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let config = test_config();

        // SAFETY: serialized by mutex, test-only code.
        unsafe { std::env::set_var(AGENT_TOKEN_ENV, "orc_at_bogus_token_value") };

        let result = guard::require_agent_mode(&config);
        assert!(result.is_err(), "invalid token should be rejected");

        unsafe { std::env::remove_var(AGENT_TOKEN_ENV) };
    }

    #[test]
    fn valid_token_accepted() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let config = test_config();
        let task_id = Uuid::new_v4();
        let attempt = 1;
        let token = generate_token(&config, task_id, attempt);

        // SAFETY: serialized by mutex, test-only code.
        unsafe { std::env::set_var(AGENT_TOKEN_ENV, &token) };
        unsafe { std::env::set_var("ORC_TOKEN_SECRET", "agent-mode-test-secret") };

        let result = guard::require_agent_mode(&config);
        assert!(result.is_ok(), "valid token should be accepted");

        let claims = result.unwrap();
        assert_eq!(claims.task_id, task_id);
        assert_eq!(claims.attempt, attempt);

        unsafe { std::env::remove_var(AGENT_TOKEN_ENV) };
        unsafe { std::env::remove_var("ORC_TOKEN_SECRET") };
    }

    #[test]
    fn tampered_token_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let config = test_config();
        let task_id = Uuid::new_v4();
        let mut token = generate_token(&config, task_id, 1);

        // Tamper with the last character.
        let last = token.pop().unwrap();
        token.push(if last == 'a' { 'b' } else { 'a' });

        // SAFETY: serialized by mutex, test-only code.
        unsafe { std::env::set_var(AGENT_TOKEN_ENV, &token) };

        let result = guard::require_agent_mode(&config);
        assert!(result.is_err(), "tampered token should be rejected");

        unsafe { std::env::remove_var(AGENT_TOKEN_ENV) };
    }

    #[tokio::test]
    async fn agent_mode_rejects_init_command() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let config = test_config();
        let task_id = Uuid::new_v4();
        let token = generate_token(&config, task_id, 0);

        // SAFETY: serialized by mutex, test-only code.
        unsafe { std::env::set_var(AGENT_TOKEN_ENV, &token) };
        unsafe { std::env::set_var("ORC_TOKEN_SECRET", "agent-mode-test-secret") };

        let result = super::run_agent_mode(
            Commands::Init {
                db_url: "postgresql://localhost:5432/orc".into(),
                force: false,
            },
            None,
        )
        .await;
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(
            err_msg.contains("not available in agent mode"),
            "expected agent mode rejection message, got: {err_msg}"
        );

        unsafe { std::env::remove_var(AGENT_TOKEN_ENV) };
        unsafe { std::env::remove_var("ORC_TOKEN_SECRET") };
    }

    #[tokio::test]
    async fn agent_mode_rejects_tasks_command() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let config = test_config();
        let task_id = Uuid::new_v4();
        let token = generate_token(&config, task_id, 0);

        // SAFETY: serialized by mutex, test-only code.
        unsafe { std::env::set_var(AGENT_TOKEN_ENV, &token) };
        unsafe { std::env::set_var("ORC_TOKEN_SECRET", "agent-mode-test-secret") };

        let result = super::run_agent_mode(
            Commands::Tasks {
                command: crate::TaskCommands::List { status: None },
            },
            None,
        )
        .await;
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(
            err_msg.contains("not available in agent mode"),
            "expected agent mode rejection message, got: {err_msg}"
        );

        unsafe { std::env::remove_var(AGENT_TOKEN_ENV) };
        unsafe { std::env::remove_var("ORC_TOKEN_SECRET") };
    }

    #[tokio::test]
    async fn agent_mode_rejects_invariant_command() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let config = test_config();
        let task_id = Uuid::new_v4();
        let token = generate_token(&config, task_id, 0);

        // SAFETY: serialized by mutex, test-only code.
        unsafe { std::env::set_var(AGENT_TOKEN_ENV, &token) };
        unsafe { std::env::set_var("ORC_TOKEN_SECRET", "agent-mode-test-secret") };

        let result = super::run_agent_mode(
            Commands::Invariant {
                command: crate::InvariantCommands::List { verbose: false },
            },
            None,
        )
        .await;
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(
            err_msg.contains("not available in agent mode"),
            "expected agent mode rejection message, got: {err_msg}"
        );

        unsafe { std::env::remove_var(AGENT_TOKEN_ENV) };
        unsafe { std::env::remove_var("ORC_TOKEN_SECRET") };
    }

    #[tokio::test]
    async fn agent_mode_task_requires_db() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let config = test_config();
        let task_id = Uuid::new_v4();
        let token = generate_token(&config, task_id, 0);

        // SAFETY: serialized by mutex, test-only code.
        unsafe { std::env::set_var(AGENT_TOKEN_ENV, &token) };
        unsafe { std::env::set_var("ORC_TOKEN_SECRET", "agent-mode-test-secret") };

        // Without a DB pool, the command should fail with a helpful message.
        let result = super::run_agent_mode(Commands::Task, None).await;
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(
            err_msg.contains("database connection required"),
            "expected DB required message, got: {err_msg}"
        );

        unsafe { std::env::remove_var(AGENT_TOKEN_ENV) };
        unsafe { std::env::remove_var("ORC_TOKEN_SECRET") };
    }

    #[tokio::test]
    async fn agent_mode_check_requires_db() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let config = test_config();
        let task_id = Uuid::new_v4();
        let token = generate_token(&config, task_id, 0);

        // SAFETY: serialized by mutex, test-only code.
        unsafe { std::env::set_var(AGENT_TOKEN_ENV, &token) };
        unsafe { std::env::set_var("ORC_TOKEN_SECRET", "agent-mode-test-secret") };

        let result = super::run_agent_mode(Commands::Check, None).await;
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(
            err_msg.contains("database connection required"),
            "expected DB required message, got: {err_msg}"
        );

        unsafe { std::env::remove_var(AGENT_TOKEN_ENV) };
        unsafe { std::env::remove_var("ORC_TOKEN_SECRET") };
    }

    #[tokio::test]
    async fn agent_mode_progress_requires_db() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let config = test_config();
        let task_id = Uuid::new_v4();
        let token = generate_token(&config, task_id, 0);

        // SAFETY: serialized by mutex, test-only code.
        unsafe { std::env::set_var(AGENT_TOKEN_ENV, &token) };
        unsafe { std::env::set_var("ORC_TOKEN_SECRET", "agent-mode-test-secret") };

        let result = super::run_agent_mode(
            Commands::Progress {
                message: "working on it".to_string(),
            },
            None,
        )
        .await;
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(
            err_msg.contains("database connection required"),
            "expected DB required message, got: {err_msg}"
        );

        unsafe { std::env::remove_var(AGENT_TOKEN_ENV) };
        unsafe { std::env::remove_var("ORC_TOKEN_SECRET") };
    }

    #[tokio::test]
    async fn agent_mode_done_requires_db() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let config = test_config();
        let task_id = Uuid::new_v4();
        let token = generate_token(&config, task_id, 0);

        // SAFETY: serialized by mutex, test-only code.
        unsafe { std::env::set_var(AGENT_TOKEN_ENV, &token) };
        unsafe { std::env::set_var("ORC_TOKEN_SECRET", "agent-mode-test-secret") };

        let result = super::run_agent_mode(Commands::Done, None).await;
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(
            err_msg.contains("database connection required"),
            "expected DB required message, got: {err_msg}"
        );

        unsafe { std::env::remove_var(AGENT_TOKEN_ENV) };
        unsafe { std::env::remove_var("ORC_TOKEN_SECRET") };
    }

    #[test]
    fn truncate_string_within_limit() {
        let s = "hello world";
        assert_eq!(super::truncate_string(s, 100), "hello world");
    }

    #[test]
    fn truncate_string_at_limit() {
        let s = "abcde";
        assert_eq!(super::truncate_string(s, 5), "abcde");
    }

    #[test]
    fn truncate_string_over_limit() {
        let s = "abcdefghij";
        assert_eq!(super::truncate_string(s, 5), "abcde...");
    }

    #[test]
    fn truncate_string_trims_whitespace() {
        let s = "  hello  ";
        assert_eq!(super::truncate_string(s, 100), "hello");
    }
}
