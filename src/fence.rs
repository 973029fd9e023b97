//! Python code fence extraction from Markdown text.
//!
//! Fences follow CommonMark delimiters: three or more backticks or tildes,
//! indented at most three spaces, closed by a run of the same character at
//! least as long. Only fences whose info string names Python are yielded, but
//! every fence is consumed so that code inside other fences is never mistaken
//! for an opener.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Info-string words accepted as Python (compared case-insensitively)
const PYTHON_LANGUAGES: &[&str] = &["python", "py", "python3", "py3"];

static FENCE_OPENER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^( {0,3})(`{3,}|~{3,})(.*)$").expect("fence opener regex"));

/// A Python code block found in a Markdown document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeFence {
    /// Position among the document's Python fences (0-based)
    pub index: usize,
    /// 1-indexed document line of the opening delimiter
    pub line: usize,
    /// Language word as written in the info string
    pub language: String,
    pub source: String,
    /// False when the fence was never closed and runs to end of document
    pub terminated: bool,
}

impl CodeFence {
    /// 1-indexed document line of the first source line
    pub fn first_source_line(&self) -> usize {
        self.line + 1
    }
}

/// Lazy iterator over the Python fences of a document.
///
/// Holds no state beyond its position in the borrowed text. A clone continues
/// independently from the same point, and a fresh [`extract_fences`] over the
/// same text yields the same sequence.
#[derive(Debug, Clone)]
pub struct Fences<'a> {
    lines: std::iter::Enumerate<std::str::Lines<'a>>,
    next_index: usize,
}

/// Scan `text` for Python code fences in document order
pub fn extract_fences(text: &str) -> Fences<'_> {
    Fences {
        lines: text.lines().enumerate(),
        next_index: 0,
    }
}

/// Whether a fence info string declares Python
pub fn is_python_info(info: &str) -> bool {
    let language = info_language(info);
    PYTHON_LANGUAGES
        .iter()
        .any(|known| known.eq_ignore_ascii_case(language))
}

/// First word of an info string, with `{` `}` and `.` decoration removed
/// (`{.python}` and `{python}` both give `python`)
fn info_language(info: &str) -> &str {
    info.split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c| c == '{' || c == '}')
        .trim_start_matches('.')
        .trim_end_matches(',')
}

#[derive(Debug)]
struct Opener<'a> {
    indent: usize,
    marker: char,
    width: usize,
    info: &'a str,
}

impl<'a> Opener<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let caps = FENCE_OPENER.captures(line)?;
        let indent = caps.get(1).map_or(0, |m| m.len());
        let run = caps.get(2)?.as_str();
        let info = caps.get(3).map_or("", |m| m.as_str()).trim();
        let marker = run.chars().next()?;

        // Backtick fences may not carry backticks in their info string
        if marker == '`' && info.contains('`') {
            return None;
        }

        Some(Self {
            indent,
            marker,
            width: run.len(),
            info,
        })
    }

    fn is_closed_by(&self, line: &str) -> bool {
        let stripped = line.trim_start_matches(' ');
        if line.len() - stripped.len() > 3 {
            return false;
        }
        let run = stripped.chars().take_while(|&c| c == self.marker).count();
        run >= self.width && stripped[run..].trim().is_empty()
    }

    /// Remove up to the opener's indentation from a content line
    fn dedent<'l>(&self, line: &'l str) -> &'l str {
        let leading = line.len() - line.trim_start_matches(' ').len();
        &line[leading.min(self.indent)..]
    }
}

impl Iterator for Fences<'_> {
    type Item = CodeFence;

    fn next(&mut self) -> Option<CodeFence> {
        while let Some((number, line)) = self.lines.next() {
            let Some(opener) = Opener::parse(line) else {
                continue;
            };

            let mut body = Vec::new();
            let mut terminated = false;
            for (_, inner) in self.lines.by_ref() {
                if opener.is_closed_by(inner) {
                    terminated = true;
                    break;
                }
                body.push(opener.dedent(inner));
            }

            if !is_python_info(opener.info) {
                continue;
            }

            let fence = CodeFence {
                index: self.next_index,
                line: number + 1,
                language: info_language(opener.info).to_string(),
                source: body.join("\n"),
                terminated,
            };
            self.next_index += 1;
            return Some(fence);
        }
        None
    }
}
