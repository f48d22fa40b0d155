//! VCS host capability set (spec §6.1): the single external-system
//! abstraction the orchestrator drives to read issues/repo content and to
//! land a task's diff as a PR. One concrete adapter is implemented
//! ([`github::GithubVcsHost`]), matching spec §9's "define the interface,
//! implement one adapter" shape.

pub mod github;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::diff::parser::{self, DiffParseError, FileDiff};

/// A repo issue, the unit of work a [`crate::orchestrator`] task is scoped
/// to (spec §3 "repo + issue number").
#[derive(Debug, Clone)]
pub struct Issue {
    pub number: i32,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// Repo-level context the Planner reads before producing a plan.
#[derive(Debug, Clone)]
pub struct RepoContext {
    pub default_branch: String,
    pub file_tree: Vec<String>,
}

/// An opened or updated pull request's identity.
#[derive(Debug, Clone)]
pub struct PrHandle {
    pub number: i32,
    pub url: String,
}

/// The outcome of waiting on a PR's CI checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pending,
    Success,
    Failure,
}

/// The VCS host capability interface (spec §6.1's operation list). Every
/// operation is scoped to a `repo` identifier (e.g. `"acme/widgets"`); the
/// adapter owns mapping that to a concrete remote + local worktree.
#[async_trait]
pub trait VcsHost: Send + Sync {
    async fn get_issue(&self, repo: &str, issue_number: i32) -> Result<Issue>;

    async fn get_repo_context(&self, repo: &str) -> Result<RepoContext>;

    async fn get_files_content(
        &self,
        repo: &str,
        branch: &str,
        paths: &[String],
    ) -> Result<HashMap<String, String>>;

    async fn get_source_files(
        &self,
        repo: &str,
        branch: &str,
        extensions: &[String],
    ) -> Result<Vec<String>>;

    async fn create_branch(&self, repo: &str, branch: &str, from: &str) -> Result<()>;

    async fn create_branch_from_main(&self, repo: &str, branch: &str) -> Result<()>;

    /// Returns `true` if the branch already existed.
    async fn ensure_branch_exists(&self, repo: &str, branch: &str) -> Result<bool>;

    /// Apply `diff` to `branch` and commit it. Returns the post-apply
    /// content of every touched file, for [`crate::diff::validator::full_validate`].
    async fn apply_diff(
        &self,
        repo: &str,
        branch: &str,
        diff: &str,
        commit_message: &str,
    ) -> Result<HashMap<String, String>>;

    async fn create_pr(
        &self,
        repo: &str,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PrHandle>;

    async fn update_pr(
        &self,
        repo: &str,
        pr_number: i32,
        title: Option<&str>,
        body: Option<&str>,
    ) -> Result<()>;

    async fn add_comment(&self, repo: &str, pr_number: i32, body: &str) -> Result<()>;

    async fn add_labels(&self, repo: &str, pr_number: i32, labels: &[String]) -> Result<()>;

    /// Open PRs whose changed files overlap `target_files` (spec §4.9
    /// batch-membership check against PRs outside this orchestrator's own
    /// tracking, e.g. opened by a human).
    async fn detect_conflicting_prs(&self, repo: &str, target_files: &[String]) -> Result<Vec<i32>>;

    async fn wait_for_checks(
        &self,
        repo: &str,
        pr_number: i32,
        timeout: Duration,
    ) -> Result<CheckStatus>;
}

/// Parse a unified diff's text into its per-file structure (spec §6.1
/// `parseDiffToFiles`). A thin, host-agnostic wrapper over
/// [`crate::diff::parser::parse`]: every adapter needs the same parse, so
/// it is not part of the [`VcsHost`] trait itself.
pub fn parse_diff_to_files(diff: &str) -> Result<Vec<FileDiff>, DiffParseError> {
    parser::parse(diff)
}
