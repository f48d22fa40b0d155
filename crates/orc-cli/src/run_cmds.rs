//! `orc tick` / `orc run`: drive the scheduler against a live repo checkout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;

use orc_core::agent::claude_code::ClaudeCodeAgent;
use orc_core::config::OrcConfig;
use orc_core::orchestrator::{AgentSet, Orchestrator};
use orc_core::scheduler::TaskScheduler;
use orc_core::vcs::github::GithubVcsHost;
use orc_core::worktree::WorktreeManager;

/// `owner/repo=/local/checkout/path` pairs, as passed via repeated
/// `--repo-path` flags.
pub fn parse_repo_paths(pairs: &[String]) -> Result<HashMap<String, PathBuf>> {
    let mut map = HashMap::new();
    for pair in pairs {
        let (repo, path) = pair
            .split_once('=')
            .with_context(|| format!("--repo-path must be `owner/repo=/path`, got `{pair}`"))?;
        map.insert(repo.to_string(), PathBuf::from(path));
    }
    Ok(map)
}

fn resolve_github_token(cli_token: Option<&str>) -> Result<String> {
    if let Some(t) = cli_token {
        return Ok(t.to_string());
    }
    std::env::var("ORC_GITHUB_TOKEN")
        .or_else(|_| std::env::var("GITHUB_TOKEN"))
        .context("no GitHub token: pass --github-token or set ORC_GITHUB_TOKEN/GITHUB_TOKEN")
}

fn build_orchestrator(
    pool: PgPool,
    repo_paths: HashMap<String, PathBuf>,
    github_token: Option<&str>,
    model: &str,
) -> Result<(Orchestrator, Arc<OrcConfig>)> {
    let token = resolve_github_token(github_token)?;
    let vcs = Arc::new(GithubVcsHost::new(token, repo_paths.clone())?);

    let any_repo_path = repo_paths
        .values()
        .next()
        .context("at least one --repo-path is required")?
        .clone();
    let worktrees =
        WorktreeManager::new(any_repo_path, None).map_err(|e| anyhow::anyhow!("{e}"))?;

    let agents = AgentSet {
        planner: Arc::new(ClaudeCodeAgent::new(model)),
        coder: Arc::new(ClaudeCodeAgent::new(model)),
        coder_variants: Vec::new(),
        fixer: Arc::new(ClaudeCodeAgent::new(model)),
        reviewer: Arc::new(ClaudeCodeAgent::new(model)),
        breakdown: Arc::new(ClaudeCodeAgent::new(model)),
        reflector: Arc::new(ClaudeCodeAgent::new(model)),
    };

    let config = Arc::new(OrcConfig::from_env());
    let orchestrator = Orchestrator::new(pool, vcs, worktrees, agents, config.clone());
    Ok((orchestrator, config))
}

/// `orc tick`: advance every active task by exactly one scheduler tick.
pub async fn run_tick(
    pool: &PgPool,
    repo_paths: HashMap<String, PathBuf>,
    github_token: Option<&str>,
    model: &str,
) -> Result<()> {
    let (orchestrator, config) = build_orchestrator(pool.clone(), repo_paths, github_token, model)?;
    let scheduler = TaskScheduler::new(pool.clone(), orchestrator, config);
    let report = scheduler.tick().await?;
    println!(
        "considered={} advanced={} skipped_in_flight={} errored={} swept_stale={}",
        report.considered, report.advanced, report.skipped_in_flight, report.errored, report.swept_stale
    );
    Ok(())
}

/// `orc run`: drive the scheduler until it runs dry, bounded by `max_ticks`
/// and `max_duration_secs`.
pub async fn run_bounded(
    pool: &PgPool,
    repo_paths: HashMap<String, PathBuf>,
    github_token: Option<&str>,
    model: &str,
    max_ticks: usize,
    max_duration_secs: u64,
    tick_interval_secs: u64,
) -> Result<()> {
    let (orchestrator, config) = build_orchestrator(pool.clone(), repo_paths, github_token, model)?;
    let scheduler = TaskScheduler::new(pool.clone(), orchestrator, config);
    let report = scheduler
        .run_bounded(
            max_ticks,
            Duration::from_secs(max_duration_secs),
            Duration::from_secs(tick_interval_secs),
        )
        .await?;
    println!(
        "considered={} advanced={} skipped_in_flight={} errored={} swept_stale={}",
        report.considered, report.advanced, report.skipped_in_flight, report.errored, report.swept_stale
    );
    Ok(())
}
