//! The agent contract (spec §1, §9): the core consumes every LLM agent
//! (planner, coder, fixer, reviewer, breakdown, reflection) as a function
//! `Run(input) -> output` and is agnostic to how outputs are produced. This
//! module defines that capability interface plus the closed output record
//! types each family parses its raw text into.

pub mod claude_code;
pub mod json;
pub mod types;

use anyhow::Result;
use async_trait::async_trait;

pub use json::InvalidAgentOutput;
pub use types::{
    BreakdownOutput, CoderOutput, FixerOutput, PlannerOutput, ProposedSubtask, ReflectionOutput,
    ReviewVerdict, ReviewerOutput,
};

/// Input handed to a single agent invocation.
#[derive(Debug, Clone)]
pub struct AgentInput {
    pub prompt: String,
    pub model: String,
}

/// One invocation's raw outcome, before the per-family parser turns it
/// into a closed record type.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub raw_output: String,
    pub tokens: Option<i64>,
    pub duration_ms: i64,
}

/// Capability interface per agent family (spec §9: "a capability interface
/// `Run(ctx,input) -> (output,err)` per agent family"). Implementors wrap
/// a concrete LLM runtime (CLI subprocess, HTTP call, ...); the
/// `MultiAgentRunner` (§4.6) fans out over a list of configured variants.
///
/// This trait is object-safe so variants can be stored as
/// `Vec<Box<dyn Agent>>` for fan-out.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Human-readable model/variant name, surfaced in `ConsensusDecision`
    /// events and selector rationale strings.
    fn model_name(&self) -> &str;

    /// Run one invocation, returning raw text plus token/timing metadata.
    /// Parsing that text into a closed record type is the caller's job
    /// (see the `parse_*` functions below) — this trait never fails on
    /// malformed output, only on the invocation itself failing to run.
    async fn run(&self, input: &AgentInput) -> Result<AgentInvocation>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Agent) {}
};

/// Parse a planner invocation's raw output.
pub fn parse_planner_output(raw: &str) -> Result<PlannerOutput, InvalidAgentOutput> {
    json::parse_tolerant(raw)
}

/// Parse a coder (or fixer-as-coder) invocation's raw output.
pub fn parse_coder_output(raw: &str) -> Result<CoderOutput, InvalidAgentOutput> {
    json::parse_tolerant(raw)
}

/// Parse a fixer invocation's raw output.
pub fn parse_fixer_output(raw: &str) -> Result<FixerOutput, InvalidAgentOutput> {
    json::parse_tolerant(raw)
}

/// Parse a reviewer invocation's raw output, falling back to free-text
/// synonym normalization if the agent didn't return structured JSON.
pub fn parse_reviewer_output(raw: &str) -> Result<ReviewerOutput, InvalidAgentOutput> {
    if let Ok(structured) = json::parse_tolerant::<ReviewerOutput>(raw) {
        return Ok(structured);
    }
    json::normalize_review_verdict(raw)
        .map(|verdict| ReviewerOutput {
            verdict,
            comments: Vec::new(),
        })
        .ok_or_else(|| InvalidAgentOutput {
            reason: "reviewer output neither parsed as JSON nor matched a known verdict synonym"
                .to_owned(),
        })
}

/// Parse a breakdown invocation's raw output.
pub fn parse_breakdown_output(raw: &str) -> Result<BreakdownOutput, InvalidAgentOutput> {
    json::parse_tolerant(raw)
}

/// Parse a reflection invocation's raw output.
pub fn parse_reflection_output(raw: &str) -> Result<ReflectionOutput, InvalidAgentOutput> {
    json::parse_tolerant(raw)
}
