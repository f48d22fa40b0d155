//! Claude Code-flavored [`Agent`] adapter: one `Run(input) -> output`
//! invocation per call, grounded on the teacher's
//! `harness::claude_code::ClaudeCodeAdapter` JSONL-parsing idiom but
//! adapted from a long-lived streaming harness to the single-shot shape
//! this crate's `Agent` trait requires (spec §9 "a capability interface
//! per agent family").

use std::process::Stdio;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::{Agent, AgentInput, AgentInvocation};

/// Runs `claude -p --output-format stream-json` as a one-shot subprocess,
/// feeding the prompt on stdin and concatenating every `assistant` text
/// block from the resulting JSONL stream into the invocation's raw output.
pub struct ClaudeCodeAgent {
    binary_path: String,
    model: String,
}

impl ClaudeCodeAgent {
    /// Build an agent that invokes `claude` on `$PATH` for `model`.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            binary_path: "claude".to_owned(),
            model: model.into(),
        }
    }

    /// Build an agent pointed at a non-default `claude` binary (testing,
    /// or a pinned install path).
    pub fn with_binary(binary_path: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Agent for ClaudeCodeAgent {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn run(&self, input: &AgentInput) -> Result<AgentInvocation> {
        let start = Instant::now();

        let model = if input.model.is_empty() {
            &self.model
        } else {
            &input.model
        };

        let mut child = Command::new(&self.binary_path)
            .args(["-p", "--output-format", "stream-json", "--model", model])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {} for model {}", self.binary_path, model))?;

        let mut stdin = child.stdin.take().context("child stdin was not piped")?;
        stdin
            .write_all(input.prompt.as_bytes())
            .await
            .context("failed to write prompt to claude stdin")?;
        drop(stdin);

        let stdout = child.stdout.take().context("child stdout was not piped")?;
        let mut lines = BufReader::new(stdout).lines();

        let mut text = String::new();
        let mut input_tokens: i64 = 0;
        let mut output_tokens: i64 = 0;

        while let Some(line) = lines.next_line().await.context("failed to read claude stdout")? {
            if line.trim().is_empty() {
                continue;
            }
            match parse_stream_json_line(&line) {
                Ok(parsed) => {
                    text.push_str(&parsed.text);
                    input_tokens += parsed.input_tokens;
                    output_tokens += parsed.output_tokens;
                }
                Err(err) => {
                    tracing::warn!(%err, line, "skipping malformed claude stream-json line");
                }
            }
        }

        let status = child.wait().await.context("failed to wait on claude process")?;
        if !status.success() {
            bail!("claude exited with status {status}");
        }

        let duration_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);
        Ok(AgentInvocation {
            raw_output: text,
            tokens: Some(input_tokens + output_tokens),
            duration_ms,
        })
    }
}

struct ParsedLine {
    text: String,
    input_tokens: i64,
    output_tokens: i64,
}

/// Parse a single JSONL line from Claude Code's `stream-json` output,
/// extracting assistant text and token usage. Mirrors the dispatch-on-
/// `"type"` idiom of `harness::claude_code::parse_stream_json_line`, but
/// collapses everything into one accumulator since this adapter has no
/// streaming consumer to forward individual events to.
fn parse_stream_json_line(line: &str) -> Result<ParsedLine> {
    let v: serde_json::Value =
        serde_json::from_str(line).context("malformed JSON in claude stream output")?;

    let mut text = String::new();
    let mut input_tokens = 0;
    let mut output_tokens = 0;

    if v.get("type").and_then(|t| t.as_str()) == Some("assistant") {
        if let Some(message) = v.get("message") {
            if let Some(blocks) = message.get("content").and_then(|c| c.as_array()) {
                for block in blocks {
                    if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                        if let Some(s) = block.get("text").and_then(|t| t.as_str()) {
                            text.push_str(s);
                        }
                    }
                }
            }
            if let Some(usage) = message.get("usage") {
                input_tokens = usage.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
                output_tokens = usage.get("output_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
            }
        }
    }

    Ok(ParsedLine {
        text,
        input_tokens,
        output_tokens,
    })
}
