use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{failure_diagnostic, FenceOutcome, FenceSession};
use crate::fence::CodeFence;
use crate::venv::{ExecutionContext, ResolveError};

/// Driver run by the long-lived interpreter.
///
/// Reads one JSON unit per line from stdin and execs it into the globals of
/// `__main__` (emptied of the driver's own names), with stdout/stderr
/// redirected to buffers. Replies with
/// one JSON line per unit on a private copy of the original stdout; fd 1 is
/// pointed at stderr so output from child processes cannot corrupt the
/// channel. Source is padded with blank lines so tracebacks carry document
/// line numbers.
const DRIVER: &str = r#"
def _fencecheck_main():
    import io
    import json
    import os
    import sys
    import traceback

    namespace = sys.modules["__main__"].__dict__
    for name in [n for n in namespace if not n.startswith("__")]:
        del namespace[name]

    channel = os.fdopen(os.dup(1), "w", encoding="utf-8")
    os.dup2(2, 1)
    requests = sys.stdin
    sys.stdin = io.StringIO()
    real_stdout, real_stderr = sys.stdout, sys.stderr

    while True:
        raw = requests.readline()
        if not raw:
            break
        unit = json.loads(raw)
        source = "\n" * unit["offset"] + unit["code"]
        out, err = io.StringIO(), io.StringIO()
        sys.stdout, sys.stderr = out, err
        ok = True
        try:
            exec(compile(source, unit["filename"], "exec"), namespace)
        except SystemExit as exc:
            if exc.code not in (None, 0):
                ok = False
                err.write("SystemExit: %s\n" % (exc.code,))
        except BaseException:
            ok = False
            kind, value, tb = sys.exc_info()
            traceback.print_exception(kind, value, tb.tb_next if tb else None)
        finally:
            sys.stdout, sys.stderr = real_stdout, real_stderr

        reply = {"ok": ok, "stdout": out.getvalue(), "stderr": err.getvalue()}
        channel.write(json.dumps(reply) + "\n")
        channel.flush()


_fencecheck_main()
"#;

/// One program unit sent to the driver
#[derive(Debug, Clone, Serialize)]
struct Unit {
    code: String,
    filename: String,
    /// Blank lines prepended so line 1 of `code` reports as line `offset + 1`
    offset: usize,
}

#[derive(Debug, Deserialize)]
struct Reply {
    ok: bool,
    stdout: String,
    stderr: String,
}

enum Exchange {
    Replied(Reply),
    TimedOut,
    /// The driver exited; carries whatever it wrote to stderr
    Died(String),
}

struct Driver {
    child: Child,
    stdin: Option<ChildStdin>,
    replies: Receiver<String>,
    stderr: Option<JoinHandle<String>>,
}

impl Driver {
    fn spawn(python_binary: &str) -> Result<Self> {
        let mut child = Command::new(python_binary)
            .arg("-u")
            .arg("-c")
            .arg(DRIVER)
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", python_binary))?;

        let stdin = child.stdin.take().context("Driver stdin was not piped")?;
        let stdout = child.stdout.take().context("Driver stdout was not piped")?;
        let mut stderr = child.stderr.take().context("Driver stderr was not piped")?;

        let (sender, replies) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if sender.send(line).is_err() {
                    break;
                }
            }
        });

        // Drained continuously so a chatty child cannot fill the pipe
        let stderr = thread::spawn(move || {
            let mut collected = String::new();
            let _ = stderr.read_to_string(&mut collected);
            collected
        });

        Ok(Self {
            child,
            stdin: Some(stdin),
            replies,
            stderr: Some(stderr),
        })
    }

    fn exchange(&mut self, unit: &Unit, timeout: Option<Duration>) -> Result<Exchange> {
        let mut line = serde_json::to_string(unit).context("Failed to encode fence")?;
        line.push('\n');

        let written = match self.stdin.as_mut() {
            Some(stdin) => stdin
                .write_all(line.as_bytes())
                .and_then(|_| stdin.flush())
                .is_ok(),
            None => false,
        };
        if !written {
            return Ok(Exchange::Died(self.shutdown()));
        }

        let received = match timeout {
            Some(limit) => self.replies.recv_timeout(limit),
            None => self
                .replies
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(raw) => {
                let reply: Reply = serde_json::from_str(&raw)
                    .with_context(|| format!("Malformed reply from driver: {}", raw))?;
                Ok(Exchange::Replied(reply))
            }
            Err(RecvTimeoutError::Timeout) => {
                self.shutdown();
                Ok(Exchange::TimedOut)
            }
            Err(RecvTimeoutError::Disconnected) => Ok(Exchange::Died(self.shutdown())),
        }
    }

    /// Stop the interpreter and return what it wrote to stderr
    fn shutdown(&mut self) -> String {
        self.stdin = None;
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if self.stderr.is_some() {
            self.shutdown();
        }
    }
}

/// Long-lived interpreter session for one document.
///
/// Fences exec into `__main__` one after another, so a failing fence keeps
/// whatever it did before raising. If a fence hangs past the timeout or kills the
/// interpreter, a fresh interpreter silently replays the preamble and every
/// passing fence, and the session continues from there.
pub struct PersistentSession {
    python_binary: String,
    document: PathBuf,
    venv: Option<PathBuf>,
    timeout: Option<Duration>,
    driver: Driver,
    /// Preamble and passing fences, replayed after a restart
    history: Vec<Unit>,
}

impl PersistentSession {
    /// Start the interpreter and run the activation preamble, if any.
    /// A failing preamble is a fatal activation error.
    pub fn open(
        document: &Path,
        context: &ExecutionContext,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let driver = Driver::spawn(&context.python_binary)?;
        let mut session = Self {
            python_binary: context.python_binary.clone(),
            document: document.to_path_buf(),
            venv: context.venv.clone(),
            timeout,
            driver,
            history: Vec::new(),
        };

        if let Some(prefix) = &context.code_prefix {
            let unit = Unit {
                code: prefix.clone(),
                filename: "<activation>".to_string(),
                offset: 0,
            };
            session.activate(unit)?;
        }

        Ok(session)
    }

    fn activate(&mut self, unit: Unit) -> Result<()> {
        let venv = self.venv.clone().unwrap_or_default();
        let diagnostic = match self.driver.exchange(&unit, self.timeout)? {
            Exchange::Replied(reply) if reply.ok => {
                debug!("Activated {}", venv.display());
                self.history.push(unit);
                return Ok(());
            }
            Exchange::Replied(reply) => failure_diagnostic(&reply.stdout, &reply.stderr, None),
            Exchange::TimedOut => "activation timed out".to_string(),
            Exchange::Died(stderr) => failure_diagnostic("", &stderr, None),
        };
        Err(ResolveError::ActivationFailed { venv, diagnostic }.into())
    }

    fn unit_for(&self, fence: &CodeFence) -> Unit {
        Unit {
            code: fence.source.clone(),
            filename: self.document.display().to_string(),
            offset: fence.line,
        }
    }

    /// Replace a dead interpreter and rebuild state from history
    fn restart(&mut self) -> Result<()> {
        info!(
            "Restarting interpreter for {} ({} units to replay)",
            self.document.display(),
            self.history.len()
        );
        self.driver = Driver::spawn(&self.python_binary)?;
        for unit in &self.history {
            match self.driver.exchange(unit, self.timeout)? {
                Exchange::Replied(reply) if reply.ok => {}
                Exchange::Replied(_) => warn!("Replayed unit {} failed", unit.filename),
                Exchange::TimedOut | Exchange::Died(_) => {
                    bail!("Interpreter did not survive replay of {}", unit.filename)
                }
            }
        }
        Ok(())
    }
}

impl FenceSession for PersistentSession {
    fn run_fence(&mut self, fence: &CodeFence) -> Result<FenceOutcome> {
        let unit = self.unit_for(fence);
        match self.driver.exchange(&unit, self.timeout)? {
            Exchange::Replied(reply) => {
                if reply.ok {
                    self.history.push(unit);
                    Ok(FenceOutcome::Pass(reply.stdout))
                } else {
                    Ok(FenceOutcome::Fail(failure_diagnostic(
                        &reply.stdout,
                        &reply.stderr,
                        None,
                    )))
                }
            }
            Exchange::TimedOut => {
                let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                warn!("Fence {} timed out after {}s", fence.index + 1, secs);
                self.restart()?;
                Ok(FenceOutcome::Timeout(secs))
            }
            Exchange::Died(stderr) => {
                warn!("Interpreter exited during fence {}", fence.index + 1);
                self.restart()?;
                let diagnostic = failure_diagnostic("", &stderr, None);
                Ok(FenceOutcome::Fail(format!(
                    "Interpreter exited while running this fence\n{}",
                    diagnostic
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_encoding() {
        let unit = Unit {
            code: "print(\"hi\")".to_string(),
            filename: "docs/a.md".to_string(),
            offset: 4,
        };
        let json = serde_json::to_string(&unit).unwrap();
        assert_eq!(
            json,
            r#"{"code":"print(\"hi\")","filename":"docs/a.md","offset":4}"#
        );
        assert!(!json.contains('\n'));
    }

    #[test]
    fn test_reply_decoding() {
        let reply: Reply =
            serde_json::from_str(r#"{"ok": false, "stdout": "", "stderr": "NameError"}"#).unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.stderr, "NameError");
    }

    #[test]
    fn test_open_with_missing_binary_fails() {
        let context = ExecutionContext::bare("/nonexistent/fencecheck-python");
        let result = PersistentSession::open(Path::new("a.md"), &context, None);
        assert!(result.is_err());
    }
}
