//! Tolerant JSON extraction for untrusted agent text (spec §9).
//!
//! Agent responses are plain text that usually, but not reliably, contain
//! a JSON object: inside a fenced code block, preceded by prose, or with
//! unescaped newlines inside string values (a common LLM mistake). This
//! module strips the former and repairs the latter before handing the
//! candidate span to `serde_json`.

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Failure to recover a structured record from agent output.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("InvalidAgentOutput: {reason}")]
pub struct InvalidAgentOutput {
    pub reason: String,
}

/// Parse `text` as `T`, tolerating the common ways agent output deviates
/// from strict JSON: fenced code blocks, leading/trailing prose, and
/// unescaped literal newlines inside string values.
pub fn parse_tolerant<T: DeserializeOwned>(text: &str) -> Result<T, InvalidAgentOutput> {
    let candidate = extract_json_span(text).ok_or_else(|| InvalidAgentOutput {
        reason: "no brace-balanced JSON object found in agent output".to_owned(),
    })?;

    if let Ok(value) = serde_json::from_str::<T>(&candidate) {
        return Ok(value);
    }

    let repaired = escape_unescaped_newlines_in_strings(&candidate);
    serde_json::from_str::<T>(&repaired).map_err(|err| InvalidAgentOutput {
        reason: format!("JSON did not match expected shape after repair: {err}"),
    })
}

/// Strip Markdown code fences (``` or ```json) and find the outermost
/// brace-balanced `{...}` span in what remains.
fn extract_json_span(text: &str) -> Option<String> {
    let unfenced = strip_fences(text);
    let bytes = unfenced.as_bytes();

    let start = bytes.iter().position(|&b| b == b'{')?;

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    let mut end = None;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }

    let end = end?;
    Some(unfenced[start..=end].to_owned())
}

fn strip_fences(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_fence = false;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    // If fences were unbalanced (never closed), fall back to the whole
    // unfenced text rather than discarding content after the open fence.
    let _ = in_fence;
    out
}

/// Escape literal `\n` characters that occur inside an unterminated JSON
/// string value, a frequent malformation in LLM-generated JSON (e.g. a
/// diff field containing real newlines instead of `\n`).
fn escape_unescaped_newlines_in_strings(candidate: &str) -> String {
    let mut out = String::with_capacity(candidate.len());
    let mut in_string = false;
    let mut escaped = false;

    for ch in candidate.chars() {
        if in_string {
            if escaped {
                out.push(ch);
                escaped = false;
                continue;
            }
            match ch {
                '\\' => {
                    out.push(ch);
                    escaped = true;
                }
                '"' => {
                    out.push(ch);
                    in_string = false;
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                _ => out.push(ch),
            }
            continue;
        }

        if ch == '"' {
            in_string = true;
        }
        out.push(ch);
    }

    out
}

/// Normalize a reviewer's free-text verdict into the closed
/// [`super::types::ReviewVerdict`] set (spec §9: "normalize
/// APPROVE|APPROVED and similar synonyms during parse").
pub fn normalize_review_verdict(text: &str) -> Option<super::types::ReviewVerdict> {
    let lowered = text.trim().to_lowercase();
    if ["approve", "approved", "lgtm", "looks good to me"]
        .iter()
        .any(|s| lowered.contains(s))
    {
        return Some(super::types::ReviewVerdict::Approved);
    }
    if ["reject", "rejected", "changes requested", "request changes"]
        .iter()
        .any(|s| lowered.contains(s))
    {
        return Some(super::types::ReviewVerdict::Rejected);
    }
    None
}
