//! Diff sanitizer (spec §4.3, §9 open question #1).
//!
//! Source generators sometimes leak literal diff-marker lines (`+++ b/`,
//! `--- a/`, `@@ ... @@`) into file content that is not itself a diff hunk.
//! The sanitizer rewrites only leaks it can prove are not legitimate diff
//! content: a stray marker line that appears *outside* any hunk body. Lines
//! already inside a parsed hunk are left untouched, per the decision
//! recorded in `SPEC_FULL.md`.

/// One rewrite the sanitizer performed, for the `DiffSanitized` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizerRewrite {
    pub line_number: usize,
    pub original: String,
    pub rewritten: String,
}

/// Rewrite stray diff-marker lines that fall outside any `@@ ... @@` hunk
/// body. Returns the sanitized text and the list of rewrites performed (for
/// logging / the `DiffSanitized` event).
pub fn sanitize(diff: &str) -> (String, Vec<SanitizerRewrite>) {
    let mut out_lines = Vec::new();
    let mut rewrites = Vec::new();
    let mut in_hunk = false;

    for (idx, line) in diff.lines().enumerate() {
        if line.starts_with("@@ ") && line[3..].find(" @@").is_some() {
            in_hunk = true;
            out_lines.push(line.to_owned());
            continue;
        }
        if line.starts_with("diff --git ") || line.starts_with("--- ") || line.starts_with("+++ ")
        {
            in_hunk = false;
            out_lines.push(line.to_owned());
            continue;
        }

        if in_hunk {
            // Inside a hunk body, a leading `+`/`-`/` ` is the diff marker
            // itself; a line that *also* happens to embed `+++ b/` etc.
            // further into its own content is legitimate payload and left
            // untouched (the open-question decision).
            if !(line.starts_with('+') || line.starts_with('-') || line.starts_with(' ')) {
                in_hunk = false;
            }
            out_lines.push(line.to_owned());
            continue;
        }

        if let Some(escaped) = escape_leaked_marker(line) {
            rewrites.push(SanitizerRewrite {
                line_number: idx + 1,
                original: line.to_owned(),
                rewritten: escaped.clone(),
            });
            out_lines.push(escaped);
        } else {
            out_lines.push(line.to_owned());
        }
    }

    let mut sanitized = out_lines.join("\n");
    if diff.ends_with('\n') {
        sanitized.push('\n');
    }
    (sanitized, rewrites)
}

/// A leaked marker outside any hunk is escaped with a leading backslash so
/// it can no longer be mistaken for a real header/hunk line by downstream
/// parsing, while remaining visually close to the original for debugging.
fn escape_leaked_marker(line: &str) -> Option<String> {
    let looks_like_hunk_header = line.starts_with("@@ ") && line[3..].contains(" @@");
    let looks_like_file_header =
        line.starts_with("+++ ") || line.starts_with("--- ") || line.starts_with("diff --git ");

    if looks_like_hunk_header || looks_like_file_header {
        Some(format!("\\{line}"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_legitimate_hunk_content_untouched() {
        let diff = "--- a/f\n+++ b/f\n@@ -1,1 +1,2 @@\n-old\n+prose mentioning +++ b/foo inline\n";
        let (sanitized, rewrites) = sanitize(diff);
        assert!(rewrites.is_empty());
        assert_eq!(sanitized, diff);
    }

    #[test]
    fn escapes_leaked_marker_outside_hunk() {
        let diff = "--- a/f\n+++ b/f\n@@ -1,1 +1,1 @@\n-old\n+new\nsome trailer text\n@@ -99,1 +99,1 @@ leaked\n";
        let (sanitized, rewrites) = sanitize(diff);
        assert_eq!(rewrites.len(), 1);
        assert!(sanitized.contains("\\@@ -99,1 +99,1 @@ leaked"));
    }

    #[test]
    fn idempotent_on_already_sanitized_input() {
        let diff = "--- a/f\n+++ b/f\n@@ -1,1 +1,1 @@\n-old\n+new\ntrailer\n@@ -9,1 +9,1 @@ leaked\n";
        let (first, _) = sanitize(diff);
        let (second, rewrites_second) = sanitize(&first);
        assert_eq!(first, second);
        assert!(rewrites_second.is_empty());
    }
}
