// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use similar::TextDiff;
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolContext, ToolError, ToolOutput};

/// Minimum similarity ratio (0–1) for a fuzzy hunk location to be accepted.
const FUZZY_THRESHOLD: f64 = 0.85;

// ── Hunk data structures ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum HunkLine {
    /// Unchanged line — must exist in the file, kept verbatim.
    Context(String),
    /// Line to remove from the file.
    Del(String),
    /// Line to insert into the file.
    Add(String),
}

#[derive(Debug, Clone)]
struct Hunk {
    /// 1-based old-file start line from `@@ -N,...` — an ambiguity-breaking
    /// hint only, never the primary location.
    old_start_hint: Option<usize>,
    lines: Vec<HunkLine>,
}

impl Hunk {
    /// Lines that must already be present in the file (Context + Del).
    fn search_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Del(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    /// The replacement block (Context + Add).
    fn replacement_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Add(s) => Some(s.as_str()),
                HunkLine::Del(_) => None,
            })
            .collect()
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Strip a leading ` ```diff ` / ` ``` ` markdown fence if present.
fn strip_markdown_fence(diff: &str) -> &str {
    let t = diff.trim_start();
    if t.starts_with("```") {
        if let Some(nl) = t.find('\n') {
            let body = &t[nl + 1..];
            if let Some(close) = body.rfind("\n```") {
                return &body[..close + 1];
            }
            return body;
        }
    }
    diff
}

fn parse_old_start(header: &str) -> Option<usize> {
    // "@@ -N,M +N,M @@" — take N after the '-'.
    let after = header.split('-').nth(1)?;
    let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Parse unified diff hunks.  Accepts standard `@@ -N,M +N,M @@` headers,
/// bare `@@ @@`, and diffs wrapped in markdown fences.
fn parse_hunks(diff: &str) -> Result<Vec<Hunk>, String> {
    let diff = strip_markdown_fence(diff);
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut current: Option<Hunk> = None;

    for line in diff.lines() {
        if line.starts_with("--- ") || line.starts_with("+++ ") || line.starts_with("\\ ") {
            continue;
        }
        if line.starts_with("@@") {
            if let Some(h) = current.take() {
                if !h.lines.is_empty() {
                    hunks.push(h);
                }
            }
            current = Some(Hunk {
                old_start_hint: parse_old_start(line),
                lines: Vec::new(),
            });
            continue;
        }
        let hunk = match current.as_mut() {
            Some(h) => h,
            None => {
                // Tolerate diffs without any @@ header: treat the whole body
                // as one hunk.
                current = Some(Hunk {
                    old_start_hint: None,
                    lines: Vec::new(),
                });
                current.as_mut().unwrap()
            }
        };
        if let Some(rest) = line.strip_prefix('+') {
            hunk.lines.push(HunkLine::Add(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix('-') {
            hunk.lines.push(HunkLine::Del(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix(' ') {
            hunk.lines.push(HunkLine::Context(rest.to_string()));
        } else if line.is_empty() {
            hunk.lines.push(HunkLine::Context(String::new()));
        } else {
            return Err(format!("unrecognized diff line: {line:?}"));
        }
    }
    if let Some(h) = current {
        if !h.lines.is_empty() {
            hunks.push(h);
        }
    }
    if hunks.is_empty() {
        return Err("diff contains no hunks".to_string());
    }
    Ok(hunks)
}

// ── Location & application ────────────────────────────────────────────────────

/// Find the line index where `hunk` applies: exact match of its search lines
/// first, fuzzy (trim-compared) windows above [`FUZZY_THRESHOLD`] second.
/// Ties are broken by distance to the header hint.
fn locate_hunk(file_lines: &[String], hunk: &Hunk) -> Result<usize, String> {
    let search = hunk.search_lines();
    if search.is_empty() {
        // Pure-insert hunk: honour the hint or append at the end.
        return Ok(hunk
            .old_start_hint
            .map(|n| (n.saturating_sub(1)).min(file_lines.len()))
            .unwrap_or(file_lines.len()));
    }
    if search.len() > file_lines.len() {
        return Err("hunk is larger than the file".to_string());
    }

    let mut exact: Vec<usize> = Vec::new();
    for start in 0..=(file_lines.len() - search.len()) {
        if file_lines[start..start + search.len()]
            .iter()
            .zip(&search)
            .all(|(a, b)| a == b)
        {
            exact.push(start);
        }
    }
    if let Some(best) = pick_by_hint(&exact, hunk.old_start_hint) {
        return Ok(best);
    }
    if exact.len() > 1 {
        return Err(format!("hunk is ambiguous ({} exact matches)", exact.len()));
    }

    // Fuzzy pass: compare trim()ed lines.
    let normalized_search: Vec<String> = search.iter().map(|l| l.trim().to_string()).collect();
    let mut best: Option<(usize, f64)> = None;
    for start in 0..=(file_lines.len() - search.len()) {
        let window: Vec<String> = file_lines[start..start + search.len()]
            .iter()
            .map(|l| l.trim().to_string())
            .collect();
        let normalized_search_refs: Vec<&str> = normalized_search.iter().map(|s| s.as_str()).collect();
        let window_refs: Vec<&str> = window.iter().map(|s| s.as_str()).collect();
        let ratio = TextDiff::from_slices(&normalized_search_refs, &window_refs).ratio() as f64;
        if ratio >= FUZZY_THRESHOLD && best.map(|(_, r)| ratio > r).unwrap_or(true) {
            best = Some((start, ratio));
        }
    }
    best.map(|(start, _)| start)
        .ok_or_else(|| "hunk context not found in file".to_string())
}

fn pick_by_hint(candidates: &[usize], hint: Option<usize>) -> Option<usize> {
    match (candidates.len(), hint) {
        (0, _) => None,
        (1, _) => Some(candidates[0]),
        (_, Some(h)) => {
            let target = h.saturating_sub(1);
            candidates
                .iter()
                .copied()
                .min_by_key(|c| c.abs_diff(target))
        }
        (_, None) => None,
    }
}

fn apply_hunks(content: &str, hunks: &[Hunk]) -> Result<String, String> {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    // Apply back-to-front so earlier hunk offsets stay valid.
    let mut located: Vec<(usize, &Hunk)> = Vec::new();
    for hunk in hunks {
        located.push((locate_hunk(&lines, hunk)?, hunk));
    }
    located.sort_by_key(|(start, _)| *start);
    for window in located.windows(2) {
        let (a_start, a_hunk) = &window[0];
        if a_start + a_hunk.search_lines().len() > window[1].0 {
            return Err("hunks overlap".to_string());
        }
    }
    for (start, hunk) in located.into_iter().rev() {
        let removed = hunk.search_lines().len();
        let replacement: Vec<String> = hunk
            .replacement_lines()
            .into_iter()
            .map(str::to_string)
            .collect();
        let _: Vec<String> = lines.splice(start..start + removed, replacement).collect();
    }
    let mut out = lines.join("\n");
    if content.ends_with('\n') || content.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

// ── Tool ──────────────────────────────────────────────────────────────────────

/// Applies a unified diff to one workspace file.
pub struct PatchTool;

#[async_trait]
impl Tool for PatchTool {
    fn name(&self) -> &str {
        "patch"
    }

    fn description(&self) -> &str {
        "Apply a unified diff to one workspace file. Accepts standard \
         '@@ -N,M +N,M @@' hunks, bare '@@ @@' hunks, and diffs wrapped in \
         markdown fences. Context lines are located exactly first, then by \
         whitespace-tolerant fuzzy matching. Use one patch call per file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root"
                },
                "diff": {
                    "type": "string",
                    "description": "Unified diff to apply"
                }
            },
            "required": ["path", "diff"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let path = call
            .arguments
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgument("missing required parameter 'path'".into()))?;
        let diff = call
            .arguments
            .get("diff")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgument("missing required parameter 'diff'".into()))?;

        let hunks = parse_hunks(diff).map_err(ToolError::InvalidArgument)?;

        let existing = match ctx.workspace.read_text_file(path).await {
            Ok(c) => c,
            Err(otto_workspace::WorkspaceError::Io(io))
                if io.kind() == std::io::ErrorKind::NotFound =>
            {
                // A brand-new file is acceptable only for pure-insert diffs.
                if hunks.iter().any(|h| !h.search_lines().is_empty()) {
                    return Err(ToolError::ExecutionError(format!("file not found: {path}")));
                }
                String::new()
            }
            Err(e) => return Err(e.into()),
        };

        let updated = apply_hunks(&existing, &hunks).map_err(ToolError::ExecutionError)?;

        let abs = ctx.workspace.resolve(path)?;
        ctx.rollback
            .capture_file(&abs)
            .await
            .map_err(|e| ToolError::ExecutionError(e.to_string()))?;
        ctx.workspace.write_text_file(path, &updated).await?;

        debug!(path = %path, hunks = hunks.len(), "patch applied");
        Ok(ToolOutput::ok(
            &call.id,
            format!("applied {} hunk(s) to {path}", hunks.len()),
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
