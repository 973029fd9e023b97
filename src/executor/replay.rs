use anyhow::Result;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

use super::{failure_diagnostic, FenceOutcome, FenceSession};
use crate::fence::CodeFence;
use crate::util::{run_cmd_with_timeout, CommandOutcome};
use crate::venv::{python_string_literal, ExecutionContext};

/// Written to stdout and stderr right before the fence under test, so its
/// output can be told apart from the replayed fences' output
const BOUNDARY: &str = "\u{1e}fencecheck-boundary\u{1e}\n";

/// Defined at the top of every program. Compiles one unit on its own, padded
/// so tracebacks carry document line numbers, and runs it in `__main__`.
/// A failing unit prints its traceback without the runner frame and exits 1.
const RUNNER: &str = r#"def __fencecheck_unit(code, filename, offset):
    import sys, traceback
    try:
        exec(compile("\n" * offset + code, filename, "exec"), sys.modules["__main__"].__dict__)
    except SystemExit:
        raise
    except BaseException:
        kind, value, tb = sys.exc_info()
        traceback.print_exception(kind, value, tb.tb_next if tb else None)
        sys.exit(1)
"#;

/// Process-per-fence session.
///
/// Every run feeds `python -` the activation preamble, then each earlier
/// passing fence, then a boundary marker, then the fence under test. A failed
/// fence is not kept, so state rolls back to the last successful fence.
/// Earlier fences run again for every later fence, so they must be safe to
/// repeat.
#[derive(Debug)]
pub struct ReplaySession {
    python_binary: String,
    filename: String,
    /// Runner, preamble and every passing fence so far
    program: String,
    timeout: Option<Duration>,
}

impl ReplaySession {
    pub fn new(document: &Path, context: &ExecutionContext, timeout: Option<Duration>) -> Self {
        let mut program = RUNNER.to_string();
        if let Some(prefix) = &context.code_prefix {
            program.push_str(&unit_statement(prefix, "<activation>", 0));
        }
        Self {
            python_binary: context.python_binary.clone(),
            filename: document.display().to_string(),
            program,
            timeout,
        }
    }

    fn fence_statement(&self, fence: &CodeFence) -> String {
        unit_statement(&fence.source, &self.filename, fence.line)
    }

    /// Program run for `fence`: the accumulated state, the boundary, the fence
    fn program_for(&self, fence: &CodeFence) -> String {
        let boundary = python_string_literal(BOUNDARY);
        let mut program = self.program.clone();
        program.push_str(&format!(
            "__import__('sys').stdout.write({b}); __import__('sys').stderr.write({b})\n",
            b = boundary
        ));
        program.push_str(&self.fence_statement(fence));
        program
    }
}

/// One runner call. `offset` blank lines precede `code` when it is compiled.
fn unit_statement(code: &str, filename: &str, offset: usize) -> String {
    format!(
        "__fencecheck_unit({}, {}, {})\n",
        python_string_literal(code),
        python_string_literal(filename),
        offset
    )
}

/// Text after the first boundary marker, or `None` if the marker never
/// appeared (the fence under test was never reached)
fn after_boundary(text: &str) -> Option<&str> {
    text.find(BOUNDARY).map(|at| &text[at + BOUNDARY.len()..])
}

impl FenceSession for ReplaySession {
    fn run_fence(&mut self, fence: &CodeFence) -> Result<FenceOutcome> {
        let program = self.program_for(fence);
        debug!(
            "Replaying {} bytes for fence {}",
            program.len(),
            fence.index + 1
        );

        let mut cmd = Command::new(&self.python_binary);
        cmd.arg("-").env("PYTHONIOENCODING", "utf-8");

        let output = match run_cmd_with_timeout(cmd, &program, self.timeout)? {
            CommandOutcome::Finished(output) => output,
            CommandOutcome::TimedOut => {
                let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                warn!("Fence {} timed out after {}s", fence.index + 1, secs);
                return Ok(FenceOutcome::Timeout(secs));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let fence_stdout = after_boundary(&stdout);
        let fence_stderr = after_boundary(&stderr);

        if output.status.success() {
            return Ok(match fence_stdout {
                Some(out) => {
                    let statement = self.fence_statement(fence);
                    self.program.push_str(&statement);
                    FenceOutcome::Pass(out.to_string())
                }
                None => FenceOutcome::Fail(
                    "Fence was never reached: an earlier fence ended the program".to_string(),
                ),
            });
        }

        if fence_stdout.is_none() && fence_stderr.is_none() {
            warn!(
                "Earlier fences failed on replay before fence {}",
                fence.index + 1
            );
            return Ok(FenceOutcome::Fail(format!(
                "Fence was never reached: replaying the earlier fences failed\n{}",
                failure_diagnostic(&stdout, &stderr, Some(output.status))
            )));
        }

        Ok(FenceOutcome::Fail(failure_diagnostic(
            fence_stdout.unwrap_or(""),
            fence_stderr.unwrap_or(""),
            Some(output.status),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fence(source: &str) -> CodeFence {
        CodeFence {
            index: 0,
            line: 7,
            language: "python".to_string(),
            source: source.to_string(),
            terminated: true,
        }
    }

    #[test]
    fn test_program_starts_with_runner_then_prefix() {
        let mut context = ExecutionContext::bare("python3");
        context.code_prefix = Some("import site\n".to_string());
        let session = ReplaySession::new(Path::new("docs/a.md"), &context, None);
        let program = session.program_for(&fence("x = 1"));
        assert!(program.starts_with(RUNNER));
        assert!(program.contains("__fencecheck_unit(\"import site\\n\", \"<activation>\", 0)\n"));
        assert!(program.ends_with("__fencecheck_unit(\"x = 1\", \"docs/a.md\", 7)\n"));
    }

    #[test]
    fn test_fence_source_is_quoted_not_inlined() {
        let session = ReplaySession::new(Path::new("a.md"), &ExecutionContext::bare("python3"), None);
        let program = session.program_for(&fence("from __future__ import annotations\nx: int = 1"));
        assert!(!program.contains("\nfrom __future__"));
        assert!(program.contains("\"from __future__ import annotations\\nx: int = 1\""));
    }

    #[test]
    fn test_boundary_statement_is_valid_python_literal() {
        let session = ReplaySession::new(Path::new("a.md"), &ExecutionContext::bare("python3"), None);
        let program = session.program_for(&fence(""));
        assert!(program.contains("stdout.write(\"\\u001efencecheck-boundary\\u001e\\n\")"));
    }

    #[test]
    fn test_after_boundary() {
        let text = format!("earlier\n{}current\n", BOUNDARY);
        assert_eq!(after_boundary(&text), Some("current\n"));
        assert_eq!(after_boundary("no marker"), None);
    }
}
