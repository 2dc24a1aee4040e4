//! Pure pattern matcher.
//!
//! Side-effect-free: given log lines and a set of patterns, emit matches with
//! line number, span, and pattern id. Applicability filtering happens in the
//! caller; the matcher applies every pattern it is given.

use std::sync::Arc;

use crate::storage::patterns::{CompiledExpr, Pattern};

/// One positive evaluation of a pattern against one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMatch {
    pub pattern_id: i64,
    /// Zero-based index into the log's lines.
    pub line_index: usize,
    /// The matched line with trailing whitespace stripped.
    pub line_text: String,
    /// Byte-offset span of the match within `line_text`.
    pub span_start: usize,
    pub span_end: usize,
}

/// Split a log into lines for scanning. `"a\nb\n"` yields two lines.
pub fn split_lines(text: &str) -> Vec<&str> {
    text.lines().collect()
}

/// Scan lines against patterns.
///
/// For each line, trailing whitespace is stripped before matching. Literal
/// patterns match at the first occurrence of the substring; regex patterns at
/// the first regex match, with the span of the overall match. Within one
/// (line, pattern) at most one match is emitted. Output is ordered by
/// (line_index ASC, pattern_id ASC).
pub fn scan_lines(lines: &[&str], patterns: &[Arc<Pattern>]) -> Vec<LineMatch> {
    let mut sorted: Vec<&Arc<Pattern>> = patterns.iter().collect();
    sorted.sort_by_key(|p| p.id);

    let total = lines.len();
    let mut matches = Vec::new();

    for (line_index, raw) in lines.iter().enumerate() {
        let line = raw.trim_end();

        for pattern in &sorted {
            // A lines_from_end window restricts the pattern to the log tail;
            // a window longer than the log covers the whole log.
            if let Some(n) = pattern.lines_from_end {
                let window_start = total.saturating_sub(n.max(0) as usize);
                if line_index < window_start {
                    continue;
                }
            }

            if let Some((span_start, span_end)) = find_span(pattern, line) {
                matches.push(LineMatch {
                    pattern_id: pattern.id,
                    line_index,
                    line_text: line.to_string(),
                    span_start,
                    span_end,
                });
            }
        }
    }

    matches
}

fn find_span(pattern: &Pattern, line: &str) -> Option<(usize, usize)> {
    match pattern.compiled() {
        CompiledExpr::Literal(needle) => {
            let start = line.find(needle.as_str())?;
            Some((start, start + needle.len()))
        }
        CompiledExpr::Regex(regex) => {
            let m = regex.find(line)?;
            Some((m.start(), m.end()))
        }
    }
}

/// Extract the first capture group of a regex pattern from a line of text.
///
/// Used by the test-failure extraction path to pull the failing test
/// identifier out of a matched line. Literal patterns have no groups.
pub fn first_capture_group(text: &str, pattern: &Pattern) -> Option<String> {
    match pattern.compiled() {
        CompiledExpr::Regex(regex) => {
            let captures = regex.captures(text)?;
            captures.get(1).map(|m| m.as_str().to_string())
        }
        CompiledExpr::Literal(_) => None,
    }
}
