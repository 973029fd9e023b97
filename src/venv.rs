//! Execution context resolution: which interpreter runs a document's fences,
//! and which activation preamble (if any) runs before them.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info};

/// File whose presence marks a directory as a virtual environment
const VENV_MARKER: &str = "pyvenv.cfg";

const ACTIVATION_SCRIPT: &str = "activate_this.py";

/// Fatal errors raised while resolving an execution context
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(
        "could not autodiscover a virtual environment for {} (searched upward from {})",
        .document.display(),
        .searched_from.display()
    )]
    NoVenvDiscovered {
        document: PathBuf,
        searched_from: PathBuf,
    },

    #[error("virtual environment not found: {}", .0.display())]
    VenvNotFound(PathBuf),

    #[error(
        "activation script not found: {} (virtual environment {})",
        .path.display(),
        .venv.display()
    )]
    MissingActivationScript { venv: PathBuf, path: PathBuf },

    #[error("activation script is not readable: {}: {source}", .path.display())]
    UnreadableActivationScript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("activation preamble for {} failed:\n{diagnostic}", .venv.display())]
    ActivationFailed { venv: PathBuf, diagnostic: String },

    #[error("python interpreter `{binary}` is not usable: {reason}")]
    InterpreterUnavailable { binary: String, reason: String },
}

/// Interpreter plus optional activation, resolved for one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionContext {
    pub python_binary: String,
    pub venv: Option<PathBuf>,
    pub activation_script: Option<PathBuf>,
    /// Python source that activates `venv` when run first in a session
    pub code_prefix: Option<String>,
}

impl ExecutionContext {
    /// Context that runs the interpreter as-is, with no environment
    pub fn bare(python_binary: impl Into<String>) -> Self {
        Self {
            python_binary: python_binary.into(),
            venv: None,
            activation_script: None,
            code_prefix: None,
        }
    }

    /// Context activating the environment at `venv`.
    /// Fails if the environment's activation script is missing or unreadable.
    pub fn activated(python_binary: impl Into<String>, venv: &Path) -> Result<Self, ResolveError> {
        if !venv.is_dir() {
            return Err(ResolveError::VenvNotFound(venv.to_path_buf()));
        }

        let script = activation_script_path(venv);
        validate_activation_script(venv, &script)?;

        Ok(Self {
            python_binary: python_binary.into(),
            venv: Some(venv.to_path_buf()),
            code_prefix: Some(code_prefix(&script)),
            activation_script: Some(script),
        })
    }
}

/// Inputs the resolver needs, taken from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverSettings {
    pub python_binary: String,
    pub autodiscover_venv: bool,
    pub venv_path: Option<PathBuf>,
    /// Child directory names checked at each ancestor during autodiscovery
    pub venv_dir_names: Vec<String>,
}

/// Resolves one [`ExecutionContext`] per document.
///
/// An explicit `venv_path` is resolved once, in [`Resolver::new`], and reused
/// for every document; autodiscovery is then never consulted.
#[derive(Debug)]
pub struct Resolver {
    settings: ResolverSettings,
    explicit: Option<ExecutionContext>,
}

impl Resolver {
    pub fn new(settings: ResolverSettings) -> Result<Self, ResolveError> {
        let explicit = match &settings.venv_path {
            Some(venv) => {
                info!("Using virtual environment {}", venv.display());
                Some(ExecutionContext::activated(&settings.python_binary, venv)?)
            }
            None => None,
        };

        Ok(Self { settings, explicit })
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// Resolve the execution context for `document`
    pub fn resolve(&self, document: &Path) -> Result<ExecutionContext, ResolveError> {
        if let Some(context) = &self.explicit {
            return Ok(context.clone());
        }

        if !self.settings.autodiscover_venv {
            return Ok(ExecutionContext::bare(&self.settings.python_binary));
        }

        let searched_from = search_root(document);
        let venv = discover_venv(&searched_from, &self.settings.venv_dir_names).ok_or_else(|| {
            ResolveError::NoVenvDiscovered {
                document: document.to_path_buf(),
                searched_from: searched_from.clone(),
            }
        })?;

        debug!(
            "Discovered virtual environment {} for {}",
            venv.display(),
            document.display()
        );
        ExecutionContext::activated(&self.settings.python_binary, &venv)
    }

    /// Check that the configured interpreter can be spawned.
    /// Returns its reported version.
    pub fn check_interpreter(&self) -> Result<String, ResolveError> {
        probe_interpreter(&self.settings.python_binary)
    }
}

/// Run `<binary> --version`, returning the version line
pub fn probe_interpreter(binary: &str) -> Result<String, ResolveError> {
    let unavailable = |reason: String| ResolveError::InterpreterUnavailable {
        binary: binary.to_string(),
        reason,
    };

    let output = Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| unavailable(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(unavailable(format!(
            "`--version` exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    // Python 2 prints its version to stderr
    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = if stdout.trim().is_empty() {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    } else {
        stdout.trim().to_string()
    };
    debug!("Interpreter {} reports {}", binary, version);
    Ok(version)
}

/// Directory autodiscovery starts from: the document's absolute parent
fn search_root(document: &Path) -> PathBuf {
    let absolute = fs::canonicalize(document)
        .or_else(|_| std::path::absolute(document))
        .unwrap_or_else(|_| document.to_path_buf());
    absolute
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or(absolute)
}

/// Walk from `start` through its ancestors looking for a virtual environment.
///
/// At each directory the directory itself is checked first, then each of
/// `child_names` beneath it. The nearest match wins.
pub fn discover_venv(start: &Path, child_names: &[String]) -> Option<PathBuf> {
    for dir in start.ancestors() {
        if is_venv(dir) {
            return Some(dir.to_path_buf());
        }
        for name in child_names {
            let candidate = dir.join(name);
            if is_venv(&candidate) {
                return Some(candidate);
            }
        }
    }
    None
}

pub fn is_venv(dir: &Path) -> bool {
    dir.join(VENV_MARKER).is_file()
}

/// Location of a virtual environment's `activate_this.py`
pub fn activation_script_path(venv: &Path) -> PathBuf {
    let scripts = if cfg!(windows) { "Scripts" } else { "bin" };
    venv.join(scripts).join(ACTIVATION_SCRIPT)
}

fn validate_activation_script(venv: &Path, script: &Path) -> Result<(), ResolveError> {
    if !script.is_file() {
        return Err(ResolveError::MissingActivationScript {
            venv: venv.to_path_buf(),
            path: script.to_path_buf(),
        });
    }

    fs::File::open(script).map_err(|source| ResolveError::UnreadableActivationScript {
        path: script.to_path_buf(),
        source,
    })?;

    Ok(())
}

/// Python source that runs the activation script in the current interpreter
pub fn code_prefix(script: &Path) -> String {
    let path = python_string_literal(&script.to_string_lossy());
    format!("exec(open({path}).read(), {{'__file__': {path}}})\n")
}

/// Quote `s` as a Python string literal. JSON string escapes are a subset of
/// Python's, so the JSON encoding is used directly.
pub(crate) fn python_string_literal(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}
