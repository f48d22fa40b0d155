//! MultiAgentRunner + Consensus (spec §4.6): fan out N agent variants over
//! equal inputs, score the candidates, and package the outcome as a
//! `ConsensusDecision` event.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::agent::{Agent, AgentInput};
use crate::diff::parser;
use crate::diff::validator::quick_validate;

/// One agent variant's result, or the error it failed with.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: usize,
    pub model: String,
    pub diff: Option<String>,
    pub tokens: Option<i64>,
    pub duration_ms: i64,
    pub error: Option<String>,
}

/// How the Consensus engine scores candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringStrategy {
    /// Weighted combination of validation pass/fail, syntactic validity,
    /// and diff size normalized against an expected line count.
    Heuristic,
    /// A separate judge-agent invocation ranks candidates (caller supplies
    /// the ranking via `consensus_with_judge_ranking`).
    ReviewerAsJudge,
}

/// The packaged outcome of one consensus round (spec §4.6, becomes a
/// `ConsensusDecision` event).
#[derive(Debug, Clone)]
pub struct ConsensusDecision {
    pub strategy: ScoringStrategy,
    pub winner: Option<Candidate>,
    pub losers: Vec<(Candidate, f32)>,
    pub reasoning: String,
    pub total_tokens: i64,
    pub total_duration_ms: i64,
}

/// Fan out `variants` in parallel against the same `input`, collecting
/// every candidate's result (success or error) before returning.
pub async fn run_variants(
    variants: &[Arc<dyn Agent>],
    input: &AgentInput,
) -> Vec<Candidate> {
    let (tx, mut rx) = mpsc::channel(variants.len().max(1));

    for (id, variant) in variants.iter().enumerate() {
        let tx = tx.clone();
        let variant = Arc::clone(variant);
        let input = input.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            let result = variant.run(&input).await;
            let duration_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);
            let candidate = match result {
                Ok(invocation) => match crate::agent::parse_coder_output(&invocation.raw_output) {
                    Ok(output) => Candidate {
                        id,
                        model: variant.model_name().to_owned(),
                        diff: Some(output.diff),
                        tokens: invocation.tokens,
                        duration_ms,
                        error: None,
                    },
                    Err(err) => Candidate {
                        id,
                        model: variant.model_name().to_owned(),
                        diff: None,
                        tokens: invocation.tokens,
                        duration_ms,
                        error: Some(err.to_string()),
                    },
                },
                Err(err) => Candidate {
                    id,
                    model: variant.model_name().to_owned(),
                    diff: None,
                    tokens: None,
                    duration_ms,
                    error: Some(err.to_string()),
                },
            };
            let _ = tx.send(candidate).await;
        });
    }
    drop(tx);

    let mut candidates = Vec::with_capacity(variants.len());
    while let Some(candidate) = rx.recv().await {
        candidates.push(candidate);
    }
    candidates.sort_by_key(|c| c.id);
    candidates
}

/// Score one candidate heuristically: failed candidates score `0`;
/// otherwise a weighted combination of quick-validation pass, structural
/// parse success, and closeness of line count to `expected_lines`.
fn heuristic_score(candidate: &Candidate, expected_lines: usize) -> f32 {
    let Some(diff) = candidate.diff.as_deref() else {
        return 0.0;
    };

    let (validation, _, _) = quick_validate(diff);
    if !validation.valid {
        return 0.0;
    }

    let parsed = parser::parse(diff).unwrap_or_default();
    let line_count = parsed
        .iter()
        .flat_map(|f| f.hunks.iter())
        .map(|h| h.lines.len())
        .sum::<usize>();

    let size_score = if expected_lines == 0 {
        1.0
    } else {
        let ratio = line_count as f32 / expected_lines as f32;
        // Peaks at ratio == 1.0, falls off on either side.
        (1.0 - (ratio - 1.0).abs()).max(0.0)
    };

    // validation pass (0.6 weight) + size closeness (0.4 weight).
    0.6 + 0.4 * size_score
}

/// Run the heuristic-scoring strategy: fan out, score, pick a winner.
/// Ties break by `(score desc, model name asc)` (spec §4.6). Candidates
/// that all fail to produce a usable diff yield `winner: None`.
pub async fn consensus_heuristic(
    variants: &[Arc<dyn Agent>],
    input: &AgentInput,
    expected_lines: usize,
) -> ConsensusDecision {
    let candidates = run_variants(variants, input).await;
    rank_by_scores(
        ScoringStrategy::Heuristic,
        candidates,
        expected_lines,
        heuristic_score,
    )
}

/// Run the reviewer-as-judge strategy: fan out, then apply an
/// externally-supplied ranking (produced by a separate judge-agent
/// invocation over the fanned-out candidates).
pub async fn consensus_with_judge_ranking(
    variants: &[Arc<dyn Agent>],
    input: &AgentInput,
    judge_scores: impl Fn(&Candidate) -> f32,
) -> ConsensusDecision {
    let candidates = run_variants(variants, input).await;
    rank_by_scores(ScoringStrategy::ReviewerAsJudge, candidates, 0, |c, _| {
        if c.diff.is_none() {
            0.0
        } else {
            judge_scores(c)
        }
    })
}

fn rank_by_scores(
    strategy: ScoringStrategy,
    candidates: Vec<Candidate>,
    expected_lines: usize,
    score_fn: impl Fn(&Candidate, usize) -> f32,
) -> ConsensusDecision {
    let total_tokens = candidates.iter().filter_map(|c| c.tokens).sum();
    let total_duration_ms = candidates.iter().map(|c| c.duration_ms).sum();

    let mut scored: Vec<(Candidate, f32)> = candidates
        .into_iter()
        .map(|c| {
            let score = score_fn(&c, expected_lines);
            (c, score)
        })
        .collect();

    scored.sort_by(|(a_candidate, a_score), (b_candidate, b_score)| {
        b_score
            .partial_cmp(a_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a_candidate.model.cmp(&b_candidate.model))
    });

    let winner = scored.first().and_then(|(candidate, score)| {
        if *score > 0.0 {
            Some(candidate.clone())
        } else {
            None
        }
    });

    let reasoning = match &winner {
        Some(w) => format!(
            "selected model={} via {:?} among {} candidates",
            w.model,
            strategy,
            scored.len()
        ),
        None => format!("no candidate scored above 0 among {} candidates", scored.len()),
    };

    let losers = if winner.is_some() {
        scored.into_iter().skip(1).collect()
    } else {
        scored
    };

    ConsensusDecision {
        strategy,
        winner,
        losers,
        reasoning,
        total_tokens,
        total_duration_ms,
    }
}
