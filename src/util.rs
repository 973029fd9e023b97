//! Shared utilities: child-process execution and input path expansion

use anyhow::{bail, Context, Result};
use ignore::WalkBuilder;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// File extensions collected when a directory is given as input
const MARKDOWN_EXTENSIONS: &[&str] = &["md", "markdown"];

/// How a child process ended
#[derive(Debug)]
pub enum CommandOutcome {
    Finished(Output),
    TimedOut,
}

/// Kill a process by PID. Uses SIGKILL on Unix (Linux, macOS, WSL).
#[cfg(unix)]
pub(crate) fn kill_process(pid: u32) {
    let _ = Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(unix))]
pub(crate) fn kill_process(pid: u32) {
    let _ = Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

/// Run a command with `input` on its stdin, capturing stdout and stderr.
///
/// With a timeout, the child is killed once it expires and
/// [`CommandOutcome::TimedOut`] is returned. Without one, this waits for as
/// long as the child runs.
pub fn run_cmd_with_timeout(
    mut cmd: Command,
    input: &str,
    timeout: Option<Duration>,
) -> Result<CommandOutcome> {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to spawn command")?;

    // Feed stdin from its own thread so a child that writes a lot before
    // reading cannot deadlock against us.
    let mut stdin = child.stdin.take().context("Child stdin was not piped")?;
    let input = input.to_owned();
    let writer = thread::spawn(move || stdin.write_all(input.as_bytes()));

    let pid = child.id();
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let _ = sender.send(child.wait_with_output());
    });

    let result = match timeout {
        Some(limit) => match receiver.recv_timeout(limit) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!("Command timed out after {:?}, killing pid {}", limit, pid);
                kill_process(pid);
                let _ = writer.join();
                return Ok(CommandOutcome::TimedOut);
            }
            Err(RecvTimeoutError::Disconnected) => bail!("Command wait thread exited early"),
        },
        None => receiver.recv().context("Command wait thread exited early")?,
    };

    // A child that exits without reading all of stdin closes the pipe on us
    match writer.join() {
        Ok(Err(e)) if e.kind() != ErrorKind::BrokenPipe => {
            debug!("Failed writing child stdin: {}", e);
        }
        _ => {}
    }

    Ok(CommandOutcome::Finished(
        result.context("Failed to execute command")?,
    ))
}

/// Expand input paths into the Markdown documents to check.
///
/// Files are kept as given, in order. Directories are walked (honouring
/// `.gitignore`) and contribute their Markdown files sorted by path.
pub fn collect_documents(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut documents = Vec::new();

    for path in paths {
        if path.is_file() {
            documents.push(path.clone());
        } else if path.is_dir() {
            let mut found = markdown_files_under(path)?;
            debug!("Found {} Markdown files in {}", found.len(), path.display());
            found.sort();
            documents.extend(found);
        } else {
            bail!("File not found: {}", path.display());
        }
    }

    Ok(documents)
}

fn markdown_files_under(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkBuilder::new(dir).build() {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        let is_file = entry.file_type().is_some_and(|t| t.is_file());
        let is_markdown = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                MARKDOWN_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            });
        if is_file && is_markdown {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}
