// Snippet executor
//
// Runs the Python fences of one document as a single cumulative program and
// records a pass/fail outcome for each fence. Two session backends exist:
// `session` (one long-lived interpreter fed fence by fence, the default) and
// `replay` (a fresh process per fence, re-running earlier passing fences).

pub mod replay;
pub mod session;

pub use replay::ReplaySession;
pub use session::PersistentSession;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tracing::{debug, info};

use crate::fence::{extract_fences, CodeFence};
use crate::venv::ExecutionContext;

/// How a document's cumulative session is carried between fences
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// New interpreter per fence; the program is the preamble, every earlier
    /// passing fence, then the current fence. A failed fence is dropped from
    /// the program, so later fences see the last successful state. Earlier
    /// fences run again for each fence and must be safe to repeat.
    Replay,
    /// One interpreter per document, fences exec'd into `__main__` in turn.
    /// Each fence runs exactly once; a failed fence's partial side effects
    /// stay visible to later fences.
    #[default]
    Session,
}

/// Result of running one fence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "output", rename_all = "snake_case")]
pub enum FenceOutcome {
    Pass(String), // stdout
    Fail(String), // diagnostic
    Timeout(u64), // seconds
}

impl FenceOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, FenceOutcome::Pass(_))
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, FenceOutcome::Fail(_))
    }

    pub fn error_message(&self) -> String {
        match self {
            FenceOutcome::Pass(msg) => msg.clone(),
            FenceOutcome::Fail(msg) => msg.clone(),
            FenceOutcome::Timeout(secs) => format!("Fence execution timed out ({} seconds)", secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FenceResult {
    pub fence: CodeFence,
    pub outcome: FenceOutcome,
}

/// All fence results for one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileResult {
    pub path: PathBuf,
    pub results: Vec<FenceResult>,
    pub error_count: usize,
}

impl FileResult {
    pub fn new(path: PathBuf, results: Vec<FenceResult>) -> Self {
        let error_count = results.iter().filter(|r| !r.outcome.is_pass()).count();
        Self {
            path,
            results,
            error_count,
        }
    }
}

/// One document's cumulative execution session
pub trait FenceSession {
    /// Run `fence` on top of the state built by the fences before it
    fn run_fence(&mut self, fence: &CodeFence) -> Result<FenceOutcome>;
}

/// Drives a document's fences through a session and collects the results
#[derive(Debug, Clone, Default)]
pub struct SnippetExecutor {
    mode: ExecutionMode,
    timeout: Option<Duration>,
}

impl SnippetExecutor {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            timeout: None,
        }
    }

    /// Limit each fence to `secs` seconds (no limit by default)
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(Duration::from_secs(secs));
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    fn open_session(
        &self,
        document: &Path,
        context: &ExecutionContext,
    ) -> Result<Box<dyn FenceSession>> {
        Ok(match self.mode {
            ExecutionMode::Replay => {
                Box::new(ReplaySession::new(document, context, self.timeout))
            }
            ExecutionMode::Session => {
                Box::new(PersistentSession::open(document, context, self.timeout)?)
            }
        })
    }

    /// Read `document`, extract its Python fences and run them
    pub fn check_file(&self, document: &Path, context: &ExecutionContext) -> Result<FileResult> {
        let text = fs::read_to_string(document)
            .with_context(|| format!("Failed to read {}", document.display()))?;
        let fences: Vec<CodeFence> = extract_fences(&text).collect();
        self.run_file(document, context, &fences)
    }

    /// Run already-extracted fences, in order, as one cumulative session
    pub fn run_file(
        &self,
        document: &Path,
        context: &ExecutionContext,
        fences: &[CodeFence],
    ) -> Result<FileResult> {
        info!(
            "Checking {} ({} Python fences, {:?} mode)",
            document.display(),
            fences.len(),
            self.mode
        );

        if fences.is_empty() {
            return Ok(FileResult::new(document.to_path_buf(), Vec::new()));
        }

        let mut session = self.open_session(document, context)?;
        let mut results = Vec::with_capacity(fences.len());
        for fence in fences {
            let outcome = session.run_fence(fence).with_context(|| {
                format!(
                    "Failed to execute fence {} at {}:{}",
                    fence.index + 1,
                    document.display(),
                    fence.line
                )
            })?;
            debug!(
                "{}:{} {}",
                document.display(),
                fence.line,
                if outcome.is_pass() { "passed" } else { "failed" }
            );
            results.push(FenceResult {
                fence: fence.clone(),
                outcome,
            });
        }

        Ok(FileResult::new(document.to_path_buf(), results))
    }
}

/// Diagnostic text for a failed fence: stderr when there is any, else stdout,
/// else the exit status
pub(crate) fn failure_diagnostic(stdout: &str, stderr: &str, status: Option<ExitStatus>) -> String {
    if !stderr.trim().is_empty() {
        stderr.to_string()
    } else if !stdout.trim().is_empty() {
        stdout.to_string()
    } else {
        match status {
            Some(status) => format!("Interpreter exited with {}", status),
            None => "Fence failed without output".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fence(index: usize, line: usize) -> CodeFence {
        CodeFence {
            index,
            line,
            language: "python".to_string(),
            source: String::new(),
            terminated: true,
        }
    }

    #[test]
    fn test_outcome_predicates() {
        assert!(FenceOutcome::Pass("ok".into()).is_pass());
        assert!(FenceOutcome::Fail("err".into()).is_fail());
        let timeout = FenceOutcome::Timeout(3);
        assert!(!timeout.is_pass());
        assert!(!timeout.is_fail());
        assert_eq!(
            timeout.error_message(),
            "Fence execution timed out (3 seconds)"
        );
    }

    #[test]
    fn test_file_result_counts_non_passing() {
        let results = vec![
            FenceResult {
                fence: fence(0, 1),
                outcome: FenceOutcome::Pass(String::new()),
            },
            FenceResult {
                fence: fence(1, 5),
                outcome: FenceOutcome::Fail("boom".into()),
            },
            FenceResult {
                fence: fence(2, 9),
                outcome: FenceOutcome::Timeout(1),
            },
        ];
        let file = FileResult::new(PathBuf::from("a.md"), results);
        assert_eq!(file.error_count, 2);
    }

    #[test]
    fn test_empty_document_runs_nothing() {
        // The interpreter is never spawned when there is nothing to run
        let executor = SnippetExecutor::new(ExecutionMode::Session);
        let context = ExecutionContext::bare("/nonexistent/python");
        let file = executor
            .run_file(Path::new("empty.md"), &context, &[])
            .unwrap();
        assert!(file.results.is_empty());
        assert_eq!(file.error_count, 0);
    }

    #[test]
    fn test_failure_diagnostic_prefers_stderr() {
        assert_eq!(failure_diagnostic("out", "err", None), "err");
        assert_eq!(failure_diagnostic("out", "  \n", None), "out");
        assert_eq!(
            failure_diagnostic("", "", None),
            "Fence failed without output"
        );
    }

    #[test]
    fn test_default_mode_runs_each_fence_once() {
        assert_eq!(ExecutionMode::default(), ExecutionMode::Session);
        assert_eq!(SnippetExecutor::default().mode(), ExecutionMode::Session);
    }

    #[test]
    fn test_mode_serde_names() {
        assert_eq!(
            serde_json::to_string(&ExecutionMode::Session).unwrap(),
            "\"session\""
        );
        let mode: ExecutionMode = serde_json::from_str("\"replay\"").unwrap();
        assert_eq!(mode, ExecutionMode::Replay);
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(FenceOutcome::Fail("x".into())).unwrap();
        assert_eq!(json["status"], "fail");
        assert_eq!(json["output"], "x");
    }
}
