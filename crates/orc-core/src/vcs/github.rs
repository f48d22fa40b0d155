//! GitHub-flavored [`VcsHost`] adapter. Issue/PR/comment/label/check
//! operations go over the GitHub REST API via `reqwest`; branch creation
//! and diff application are local git operations delegated to
//! [`crate::worktree::WorktreeManager`], matching the split the teacher
//! draws between "talk to the forge" and "drive the local checkout".

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;

use crate::worktree::WorktreeManager;

use super::{CheckStatus, Issue, PrHandle, RepoContext, VcsHost};

const GITHUB_API: &str = "https://api.github.com";

/// A GitHub-backed [`VcsHost`]. One instance is shared across every repo
/// this process orchestrates; `worktrees` maps a `repo` identifier to the
/// [`WorktreeManager`] managing its local checkout.
pub struct GithubVcsHost {
    client: Client,
    token: String,
    worktrees: HashMap<String, WorktreeManager>,
}

impl GithubVcsHost {
    /// Build a host authenticating with `token` (a GitHub PAT or
    /// installation token), with one [`WorktreeManager`] per repo already
    /// cloned locally at the paths in `repo_paths` (keyed by `owner/repo`).
    pub fn new(token: String, repo_paths: HashMap<String, std::path::PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .user_agent("orc-orchestrator")
            .build()
            .context("failed to build reqwest client")?;

        let mut worktrees = HashMap::new();
        for (repo, path) in repo_paths {
            let manager = WorktreeManager::new(path, None)
                .with_context(|| format!("failed to open worktree manager for {repo}"))?;
            worktrees.insert(repo, manager);
        }

        Ok(Self {
            client,
            token,
            worktrees,
        })
    }

    fn worktree_for(&self, repo: &str) -> Result<&WorktreeManager> {
        self.worktrees
            .get(repo)
            .with_context(|| format!("no worktree manager configured for repo {repo}"))
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        self.client
            .get(format!("{GITHUB_API}{path}"))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        self.client
            .post(format!("{GITHUB_API}{path}"))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))
    }

    async fn patch(&self, path: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        self.client
            .patch(format!("{GITHUB_API}{path}"))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await
            .with_context(|| format!("PATCH {path} failed"))
    }
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: i32,
    title: String,
    body: Option<String>,
    labels: Vec<GhLabel>,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhRepo {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct GhTreeEntry {
    path: String,
    #[serde(rename = "type")]
    entry_type: String,
}

#[derive(Debug, Deserialize)]
struct GhTree {
    tree: Vec<GhTreeEntry>,
}

#[derive(Debug, Deserialize)]
struct GhPullRequest {
    number: i32,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct GhPrListItem {
    number: i32,
}

#[derive(Debug, Deserialize)]
struct GhCombinedStatus {
    state: String,
}

#[async_trait]
impl VcsHost for GithubVcsHost {
    async fn get_issue(&self, repo: &str, issue_number: i32) -> Result<Issue> {
        let response = self.get(&format!("/repos/{repo}/issues/{issue_number}")).await?;
        let body: GhIssue = response
            .error_for_status()
            .with_context(|| format!("failed to fetch issue {repo}#{issue_number}"))?
            .json()
            .await?;
        Ok(Issue {
            number: body.number,
            title: body.title,
            body: body.body.unwrap_or_default(),
            labels: body.labels.into_iter().map(|l| l.name).collect(),
        })
    }

    async fn get_repo_context(&self, repo: &str) -> Result<RepoContext> {
        let response = self.get(&format!("/repos/{repo}")).await?;
        let gh_repo: GhRepo = response
            .error_for_status()
            .with_context(|| format!("failed to fetch repo {repo}"))?
            .json()
            .await?;

        let tree_response = self
            .get(&format!(
                "/repos/{repo}/git/trees/{}?recursive=1",
                gh_repo.default_branch
            ))
            .await?;
        let tree: GhTree = tree_response
            .error_for_status()
            .with_context(|| format!("failed to fetch tree for {repo}"))?
            .json()
            .await?;

        let file_tree = tree
            .tree
            .into_iter()
            .filter(|e| e.entry_type == "blob")
            .map(|e| e.path)
            .collect();

        Ok(RepoContext {
            default_branch: gh_repo.default_branch,
            file_tree,
        })
    }

    async fn get_files_content(
        &self,
        repo: &str,
        branch: &str,
        paths: &[String],
    ) -> Result<HashMap<String, String>> {
        let manager = self.worktree_for(repo)?;
        let worktree_dir = manager.repo_path();
        manager
            .checkout(branch)
            .with_context(|| format!("failed to checkout {branch} in {repo}"))?;

        let mut out = HashMap::new();
        for path in paths {
            let full_path = worktree_dir.join(path);
            if let Ok(content) = tokio::fs::read_to_string(&full_path).await {
                out.insert(path.clone(), content);
            }
        }
        Ok(out)
    }

    async fn get_source_files(
        &self,
        repo: &str,
        _branch: &str,
        extensions: &[String],
    ) -> Result<Vec<String>> {
        let ctx = self.get_repo_context(repo).await?;
        Ok(ctx
            .file_tree
            .into_iter()
            .filter(|p| extensions.iter().any(|ext| p.ends_with(ext.as_str())))
            .collect())
    }

    async fn create_branch(&self, repo: &str, branch: &str, _from: &str) -> Result<()> {
        let manager = self.worktree_for(repo)?;
        manager
            .create_worktree(branch)
            .with_context(|| format!("failed to create branch {branch} in {repo}"))?;
        Ok(())
    }

    async fn create_branch_from_main(&self, repo: &str, branch: &str) -> Result<()> {
        let ctx = self.get_repo_context(repo).await?;
        self.create_branch(repo, branch, &ctx.default_branch).await
    }

    async fn ensure_branch_exists(&self, repo: &str, branch: &str) -> Result<bool> {
        let manager = self.worktree_for(repo)?;
        let exists = manager
            .branch_exists(branch)
            .with_context(|| format!("failed to check branch {branch} in {repo}"))?;
        if !exists {
            self.create_branch_from_main(repo, branch).await?;
        }
        Ok(exists)
    }

    async fn apply_diff(
        &self,
        repo: &str,
        branch: &str,
        diff: &str,
        commit_message: &str,
    ) -> Result<HashMap<String, String>> {
        let manager = self.worktree_for(repo)?;
        manager
            .checkout(branch)
            .with_context(|| format!("failed to checkout {branch} in {repo}"))?;

        let repo_path = manager.repo_path();
        apply_and_commit(repo_path, diff, commit_message).await?;

        let files = super::parse_diff_to_files(diff).unwrap_or_default();
        let mut contents = HashMap::new();
        for file in files {
            if file.deleted {
                continue;
            }
            let path = repo_path.join(&file.path);
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                contents.insert(file.path, content);
            }
        }
        Ok(contents)
    }

    async fn create_pr(
        &self,
        repo: &str,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PrHandle> {
        let response = self
            .post(
                &format!("/repos/{repo}/pulls"),
                json!({ "title": title, "body": body, "head": branch, "base": base }),
            )
            .await?;
        let pr: GhPullRequest = response
            .error_for_status()
            .with_context(|| format!("failed to create PR for {repo}:{branch}"))?
            .json()
            .await?;
        Ok(PrHandle {
            number: pr.number,
            url: pr.html_url,
        })
    }

    async fn update_pr(
        &self,
        repo: &str,
        pr_number: i32,
        title: Option<&str>,
        body: Option<&str>,
    ) -> Result<()> {
        let mut payload = serde_json::Map::new();
        if let Some(title) = title {
            payload.insert("title".to_owned(), json!(title));
        }
        if let Some(body) = body {
            payload.insert("body".to_owned(), json!(body));
        }
        self.patch(
            &format!("/repos/{repo}/pulls/{pr_number}"),
            serde_json::Value::Object(payload),
        )
        .await?
        .error_for_status()
        .with_context(|| format!("failed to update PR {repo}#{pr_number}"))?;
        Ok(())
    }

    async fn add_comment(&self, repo: &str, pr_number: i32, body: &str) -> Result<()> {
        self.post(
            &format!("/repos/{repo}/issues/{pr_number}/comments"),
            json!({ "body": body }),
        )
        .await?
        .error_for_status()
        .with_context(|| format!("failed to comment on {repo}#{pr_number}"))?;
        Ok(())
    }

    async fn add_labels(&self, repo: &str, pr_number: i32, labels: &[String]) -> Result<()> {
        self.post(
            &format!("/repos/{repo}/issues/{pr_number}/labels"),
            json!({ "labels": labels }),
        )
        .await?
        .error_for_status()
        .with_context(|| format!("failed to label {repo}#{pr_number}"))?;
        Ok(())
    }

    async fn detect_conflicting_prs(&self, repo: &str, target_files: &[String]) -> Result<Vec<i32>> {
        let response = self
            .get(&format!("/repos/{repo}/pulls?state=open&per_page=100"))
            .await?;
        let prs: Vec<GhPrListItem> = response
            .error_for_status()
            .with_context(|| format!("failed to list open PRs for {repo}"))?
            .json()
            .await?;

        let mut conflicting = Vec::new();
        for pr in prs {
            let files_response = self
                .get(&format!("/repos/{repo}/pulls/{}/files?per_page=100", pr.number))
                .await?;
            #[derive(Deserialize)]
            struct GhPrFile {
                filename: String,
            }
            let files: Vec<GhPrFile> = files_response
                .error_for_status()
                .with_context(|| format!("failed to list files for PR {repo}#{}", pr.number))?
                .json()
                .await?;
            if files.iter().any(|f| target_files.contains(&f.filename)) {
                conflicting.push(pr.number);
            }
        }
        Ok(conflicting)
    }

    async fn wait_for_checks(&self, repo: &str, pr_number: i32, timeout: Duration) -> Result<CheckStatus> {
        #[derive(Deserialize)]
        struct GhPr {
            head: GhPrHead,
        }
        #[derive(Deserialize)]
        struct GhPrHead {
            sha: String,
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let pr_response = self.get(&format!("/repos/{repo}/pulls/{pr_number}")).await?;
            let pr: GhPr = pr_response
                .error_for_status()
                .with_context(|| format!("failed to fetch PR {repo}#{pr_number}"))?
                .json()
                .await?;

            let status_response = self
                .get(&format!("/repos/{repo}/commits/{}/status", pr.head.sha))
                .await?;
            let status: GhCombinedStatus = status_response
                .error_for_status()
                .with_context(|| format!("failed to fetch combined status for {repo}#{pr_number}"))?
                .json()
                .await?;

            match status.state.as_str() {
                "success" => return Ok(CheckStatus::Success),
                "failure" | "error" => return Ok(CheckStatus::Failure),
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(CheckStatus::Pending);
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    }
}

/// Apply a unified diff to the working tree at `repo_path` via `git apply`
/// and commit it. Kept as a free function (rather than a `WorktreeManager`
/// method) since it is GitHub-adapter-specific: other hosts may apply diffs
/// through a different mechanism (e.g. a forge-side commit API).
async fn apply_and_commit(repo_path: &Path, diff: &str, commit_message: &str) -> Result<()> {
    use std::io::Write;

    let mut patch_file = tempfile::NamedTempFile::new().context("failed to create patch tempfile")?;
    patch_file
        .write_all(diff.as_bytes())
        .context("failed to write patch tempfile")?;

    let apply_output = Command::new("git")
        .args(["apply", "--whitespace=nowarn"])
        .arg(patch_file.path())
        .current_dir(repo_path)
        .output()
        .await
        .context("failed to run git apply")?;
    if !apply_output.status.success() {
        bail!(
            "git apply failed: {}",
            String::from_utf8_lossy(&apply_output.stderr)
        );
    }

    let add_output = Command::new("git")
        .args(["add", "-A"])
        .current_dir(repo_path)
        .output()
        .await
        .context("failed to run git add")?;
    if !add_output.status.success() {
        bail!("git add failed: {}", String::from_utf8_lossy(&add_output.stderr));
    }

    let commit_output = Command::new("git")
        .args(["commit", "-m", commit_message])
        .current_dir(repo_path)
        .output()
        .await
        .context("failed to run git commit")?;
    if !commit_output.status.success() {
        bail!(
            "git commit failed: {}",
            String::from_utf8_lossy(&commit_output.stderr)
        );
    }

    Ok(())
}
