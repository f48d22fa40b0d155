//! Two-stage diff validation (spec §4.3).
//!
//! 1. **Quick** (no I/O): well-formed headers, balanced hunks, no stray
//!    diff-marker leaks outside hunk bodies.
//! 2. **Full** (given the post-apply file contents, produced by the VCS
//!    host's `parseDiffToFiles`/`getFilesContent` per §6.1): per-file syntax
//!    check, then typecheck via an invariant command.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use orc_db::models::Invariant;

use crate::error::CoreErrorCode;
use crate::invariant::runner::run_invariant;

use super::parser::{self, DiffParseError, FileDiff};
use super::sanitizer::{sanitize, SanitizerRewrite};

/// Outcome of either validation stage (spec §4.3 "Outputs"). `code` is
/// `None` when `valid`, otherwise the real error code a caller should use
/// instead of guessing one -- the first failing sub-check wins on `merge`.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub code: Option<CoreErrorCode>,
}

impl ValidationResult {
    fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            code: None,
        }
    }

    fn fail(code: CoreErrorCode, errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
            warnings: Vec::new(),
            code: Some(code),
        }
    }

    pub fn merge(mut self, other: ValidationResult) -> Self {
        self.valid = self.valid && other.valid;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        if self.code.is_none() {
            self.code = other.code;
        }
        self
    }
}

/// Quick, I/O-free validation: sanitize leaked markers, then parse. A
/// sanitizer rewrite is surfaced as a warning, never an error, since the
/// content itself may still be valid after the rewrite.
pub fn quick_validate(diff: &str) -> (ValidationResult, String, Vec<SanitizerRewrite>) {
    let (sanitized, rewrites) = sanitize(diff);

    let result = match parser::parse(&sanitized) {
        Ok(files) => {
            if files.is_empty() {
                ValidationResult::fail(
                    CoreErrorCode::InvalidDiff,
                    vec!["diff contains no file headers".to_owned()],
                )
            } else {
                let mut result = ValidationResult::ok();
                result.warnings.extend(
                    rewrites
                        .iter()
                        .map(|r| format!("sanitized leaked diff marker at line {}", r.line_number)),
                );
                result
            }
        }
        Err(err) => ValidationResult::fail(CoreErrorCode::InvalidDiff, vec![diff_error_message(&err)]),
    };

    (result, sanitized, rewrites)
}

fn diff_error_message(err: &DiffParseError) -> String {
    match err {
        DiffParseError::MalformedHeader { .. } => format!("InvalidDiff: {err}"),
        DiffParseError::MalformedHunkHeader { .. } => format!("InvalidDiff: {err}"),
        DiffParseError::UnbalancedHunk { .. } => format!("InvalidDiff: {err}"),
        DiffParseError::Empty => format!("InvalidDiff: {err}"),
    }
}

/// Per-file syntax check: balanced braces/brackets/parens and no unterminated
/// string literal, a conservative proxy for "no truncation" that does not
/// require a real language parser.
pub fn syntax_check(path: &str, content: &str) -> ValidationResult {
    let mut stack = Vec::new();
    let mut in_string: Option<char> = None;
    let mut escaped = false;

    for ch in content.chars() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == quote {
                in_string = None;
            }
            continue;
        }

        match ch {
            '"' | '\'' | '`' => in_string = Some(ch),
            '{' | '(' | '[' => stack.push(ch),
            '}' => {
                if stack.pop() != Some('{') {
                    return ValidationResult::fail(
                        CoreErrorCode::SyntaxError,
                        vec![format!("SyntaxError: unbalanced '}}' in {path}")],
                    );
                }
            }
            ')' => {
                if stack.pop() != Some('(') {
                    return ValidationResult::fail(
                        CoreErrorCode::SyntaxError,
                        vec![format!("SyntaxError: unbalanced ')' in {path}")],
                    );
                }
            }
            ']' => {
                if stack.pop() != Some('[') {
                    return ValidationResult::fail(
                        CoreErrorCode::SyntaxError,
                        vec![format!("SyntaxError: unbalanced ']' in {path}")],
                    );
                }
            }
            _ => {}
        }
    }

    if let Some(quote) = in_string {
        return ValidationResult::fail(
            CoreErrorCode::SyntaxError,
            vec![format!("SyntaxError: unterminated {quote} string in {path}")],
        );
    }
    if !stack.is_empty() {
        return ValidationResult::fail(
            CoreErrorCode::SyntaxError,
            vec![format!(
                "SyntaxError: unbalanced {:?} in {path} (possible truncation)",
                stack
            )],
        );
    }

    ValidationResult::ok()
}

/// Full validation: syntax-check the post-apply contents of every touched
/// file, then (if a typecheck invariant is configured) run it in
/// `working_dir`.
pub async fn full_validate(
    file_contents: &HashMap<String, String>,
    typecheck: Option<&Invariant>,
    working_dir: &Path,
    timeout: Duration,
) -> ValidationResult {
    let mut result = ValidationResult::ok();

    for (path, content) in file_contents {
        result = result.merge(syntax_check(path, content));
    }

    if !result.valid {
        return result;
    }

    if let Some(invariant) = typecheck {
        match run_invariant(invariant, working_dir).await {
            Ok(outcome) if outcome.passed => {}
            Ok(outcome) => {
                result.valid = false;
                result.code.get_or_insert(CoreErrorCode::TypecheckFailed);
                result.errors.push(format!(
                    "TypecheckFailed: {} exited {:?}: {}",
                    invariant.name,
                    outcome.exit_code,
                    truncate_tail(&outcome.stderr, 2000)
                ));
            }
            Err(err) => {
                result.valid = false;
                result.code.get_or_insert(CoreErrorCode::TypecheckFailed);
                result
                    .errors
                    .push(format!("TypecheckFailed: failed to run {}: {err}", invariant.name));
            }
        }
    }

    let _ = timeout; // timeout is enforced inside run_invariant via invariant.timeout_secs

    result
}

fn truncate_tail(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        s
    } else {
        &s[s.len() - max_len..]
    }
}

/// Count of lines a diff's hunks add/remove/keep combined, used by the
/// `CodingComplete` gate's `MAX_DIFF_LINES` check.
pub fn total_line_count(files: &[FileDiff]) -> usize {
    files
        .iter()
        .flat_map(|f| f.hunks.iter())
        .map(|h| h.lines.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quick_validate_accepts_well_formed_diff() {
        let diff = "--- a/f\n+++ b/f\n@@ -1,1 +1,1 @@\n-old\n+new\n";
        let (result, _, rewrites) = quick_validate(diff);
        assert!(result.valid, "{:?}", result.errors);
        assert!(rewrites.is_empty());
    }

    #[test]
    fn quick_validate_rejects_unbalanced_hunk() {
        let diff = "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n+only one\n";
        let (result, _, _) = quick_validate(diff);
        assert!(!result.valid);
        assert_eq!(result.code, Some(CoreErrorCode::InvalidDiff));
    }

    #[test]
    fn syntax_check_failure_carries_syntax_error_code() {
        let result = syntax_check("f.ts", "function f() { return 1;");
        assert_eq!(result.code, Some(CoreErrorCode::SyntaxError));
    }

    #[test]
    fn syntax_check_detects_unbalanced_braces() {
        let result = syntax_check("f.ts", "function f() { return 1;");
        assert!(!result.valid);
    }

    #[test]
    fn syntax_check_ignores_braces_in_strings() {
        let result = syntax_check("f.ts", "const s = \"{ not a brace\";");
        assert!(result.valid);
    }

    #[test]
    fn syntax_check_accepts_balanced_file() {
        let result = syntax_check("f.ts", "function f() { return [1, 2, (3)]; }");
        assert!(result.valid, "{:?}", result.errors);
    }
}
