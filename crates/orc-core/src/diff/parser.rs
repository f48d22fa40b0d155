//! Explicit unified-diff parser (spec §9: "do not rely on regex slicing for
//! correctness across edge cases (binary markers, rename headers,
//! no-newline-at-eof)").
//!
//! Produces `[{path, hunks:[{oldStart,oldCount,newStart,newCount,lines[]}]}]`
//! by walking the diff text line by line and classifying each line by its
//! fixed-prefix shape, never by pattern matching against the whole text.

use thiserror::Error;

/// One `@@ -oldStart,oldCount +newStart,newCount @@` hunk and its body
/// lines, each still carrying its leading `+`/`-`/` ` marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffHunk {
    pub old_start: u32,
    pub old_count: u32,
    pub new_start: u32,
    pub new_count: u32,
    pub lines: Vec<String>,
}

impl DiffHunk {
    pub fn added_lines(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter(|l| l.starts_with('+'))
            .map(|l| l[1..].as_ref())
    }

    pub fn removed_lines(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter(|l| l.starts_with('-'))
            .map(|l| l[1..].as_ref())
    }

    /// Whether this hunk deletes at least one line (used by the batch
    /// conflict detector, spec §4.9).
    pub fn deletes_lines(&self) -> bool {
        self.lines.iter().any(|l| l.starts_with('-'))
    }

    pub fn old_end(&self) -> u32 {
        self.old_start + self.old_count
    }
}

/// One file's worth of hunks, plus the rename/delete bookkeeping a unified
/// diff header can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path: String,
    pub renamed_from: Option<String>,
    pub deleted: bool,
    pub is_binary: bool,
    pub no_newline_at_eof: bool,
    pub hunks: Vec<DiffHunk>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiffParseError {
    #[error("malformed file header at line {line}: {detail}")]
    MalformedHeader { line: usize, detail: String },
    #[error("malformed hunk header at line {line}: {detail}")]
    MalformedHunkHeader { line: usize, detail: String },
    #[error("unbalanced hunk at line {line}: expected {expected} more body lines")]
    UnbalancedHunk { line: usize, expected: i64 },
    #[error("empty diff")]
    Empty,
}

/// Parse a unified diff into its constituent file/hunk structure.
pub fn parse(diff: &str) -> Result<Vec<FileDiff>, DiffParseError> {
    let lines: Vec<&str> = diff.lines().collect();
    if lines.iter().all(|l| l.trim().is_empty()) {
        return Err(DiffParseError::Empty);
    }

    let mut files = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        if lines[i].starts_with("diff --git ") || lines[i].starts_with("--- ") {
            let (file, next) = parse_file(&lines, i)?;
            files.push(file);
            i = next;
        } else {
            i += 1;
        }
    }

    Ok(files)
}

fn parse_file(lines: &[&str], mut i: usize) -> Result<(FileDiff, usize), DiffParseError> {
    let start = i;
    let mut renamed_from = None;
    let mut deleted = false;
    let mut is_binary = false;
    let mut path = None;

    if lines[i].starts_with("diff --git ") {
        // "diff --git a/foo b/foo"
        let rest = &lines[i]["diff --git ".len()..];
        let mut parts = rest.splitn(2, " b/");
        let a = parts.next().unwrap_or("");
        let b = parts.next();
        if let Some(b) = b {
            path = Some(b.to_owned());
            let a_path = a.strip_prefix("a/").unwrap_or(a).to_owned();
            if a_path != *path.as_ref().unwrap() {
                renamed_from = Some(a_path);
            }
        }
        i += 1;
        while i < lines.len()
            && !lines[i].starts_with("--- ")
            && !lines[i].starts_with("diff --git ")
        {
            if lines[i].starts_with("deleted file mode") {
                deleted = true;
            }
            if lines[i].starts_with("rename from ") {
                renamed_from = Some(lines[i]["rename from ".len()..].to_owned());
            }
            if lines[i].starts_with("rename to ") {
                path = Some(lines[i]["rename to ".len()..].to_owned());
            }
            if lines[i].starts_with("Binary files ") || lines[i].starts_with("GIT binary patch") {
                is_binary = true;
            }
            i += 1;
        }
    }

    if i < lines.len() && lines[i].starts_with("--- ") {
        let old_path = lines[i][4..].trim();
        i += 1;
        if i >= lines.len() || !lines[i].starts_with("+++ ") {
            return Err(DiffParseError::MalformedHeader {
                line: start + 1,
                detail: "missing '+++' header after '---'".to_owned(),
            });
        }
        let new_path = lines[i][4..].trim();
        i += 1;
        if path.is_none() {
            if new_path == "/dev/null" {
                deleted = true;
                path = Some(strip_ab_prefix(old_path));
            } else {
                path = Some(strip_ab_prefix(new_path));
            }
        }
    }

    let path = path.ok_or_else(|| DiffParseError::MalformedHeader {
        line: start + 1,
        detail: "could not determine file path".to_owned(),
    })?;

    let mut hunks = Vec::new();
    let mut no_newline_at_eof = false;
    while i < lines.len() && lines[i].starts_with("@@ ") {
        let (hunk, next) = parse_hunk(lines, i)?;
        if hunk
            .lines
            .iter()
            .any(|l| l == "\\ No newline at end of file")
        {
            no_newline_at_eof = true;
        }
        hunks.push(hunk);
        i = next;
    }

    Ok((
        FileDiff {
            path,
            renamed_from,
            deleted,
            is_binary,
            no_newline_at_eof,
            hunks,
        },
        i,
    ))
}

fn strip_ab_prefix(p: &str) -> String {
    p.strip_prefix("a/")
        .or_else(|| p.strip_prefix("b/"))
        .unwrap_or(p)
        .to_owned()
}

fn parse_hunk(lines: &[&str], mut i: usize) -> Result<(DiffHunk, usize), DiffParseError> {
    let header_line = i;
    let header = lines[i];
    let (old_start, old_count, new_start, new_count) =
        parse_hunk_header(header, header_line)?;
    i += 1;

    let mut body = Vec::new();
    let mut old_seen = 0u32;
    let mut new_seen = 0u32;
    while i < lines.len()
        && (lines[i].starts_with('+')
            || lines[i].starts_with('-')
            || lines[i].starts_with(' ')
            || lines[i].starts_with("\\ No newline"))
    {
        let line = lines[i];
        if line.starts_with("\\ No newline") {
            body.push(line.to_owned());
            i += 1;
            continue;
        }
        if line.starts_with('+') {
            new_seen += 1;
        } else if line.starts_with('-') {
            old_seen += 1;
        } else {
            old_seen += 1;
            new_seen += 1;
        }
        body.push(line.to_owned());
        i += 1;
    }

    if old_seen != old_count || new_seen != new_count {
        return Err(DiffParseError::UnbalancedHunk {
            line: header_line + 1,
            expected: (old_count as i64 - old_seen as i64).max(new_count as i64 - new_seen as i64),
        });
    }

    Ok((
        DiffHunk {
            old_start,
            old_count,
            new_start,
            new_count,
            lines: body,
        },
        i,
    ))
}

fn parse_hunk_header(header: &str, line: usize) -> Result<(u32, u32, u32, u32), DiffParseError> {
    // "@@ -oldStart,oldCount +newStart,newCount @@ optional context"
    let body = header
        .strip_prefix("@@ ")
        .ok_or_else(|| DiffParseError::MalformedHunkHeader {
            line: line + 1,
            detail: "missing '@@ ' prefix".to_owned(),
        })?;
    let end = body
        .find(" @@")
        .ok_or_else(|| DiffParseError::MalformedHunkHeader {
            line: line + 1,
            detail: "missing closing '@@'".to_owned(),
        })?;
    let ranges = &body[..end];
    let mut parts = ranges.split_whitespace();
    let old_range = parts
        .next()
        .ok_or_else(|| DiffParseError::MalformedHunkHeader {
            line: line + 1,
            detail: "missing old range".to_owned(),
        })?;
    let new_range = parts
        .next()
        .ok_or_else(|| DiffParseError::MalformedHunkHeader {
            line: line + 1,
            detail: "missing new range".to_owned(),
        })?;

    let (old_start, old_count) = parse_range(old_range, '-', line)?;
    let (new_start, new_count) = parse_range(new_range, '+', line)?;
    Ok((old_start, old_count, new_start, new_count))
}

fn parse_range(range: &str, sigil: char, line: usize) -> Result<(u32, u32), DiffParseError> {
    let stripped = range.strip_prefix(sigil).ok_or_else(|| DiffParseError::MalformedHunkHeader {
        line: line + 1,
        detail: format!("range {range:?} missing '{sigil}' sigil"),
    })?;
    let mut parts = stripped.splitn(2, ',');
    let start: u32 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DiffParseError::MalformedHunkHeader {
            line: line + 1,
            detail: format!("range {range:?} has non-numeric start"),
        })?;
    let count: u32 = match parts.next() {
        Some(s) => s.parse().map_err(|_| DiffParseError::MalformedHunkHeader {
            line: line + 1,
            detail: format!("range {range:?} has non-numeric count"),
        })?,
        None => 1,
    };
    Ok((start, count))
}
