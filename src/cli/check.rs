use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::executor::SnippetExecutor;
use crate::report::{OutputFormat, Reporter};
use crate::util::collect_documents;
use crate::venv::{ExecutionContext, Resolver};

/// Exit code for a run aborted by a fatal error
pub const FATAL_EXIT_CODE: u8 = 255;

/// Outcome of a completed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSummary {
    pub documents: usize,
    pub fences: usize,
    pub total_errors: usize,
}

/// Process exit code for a finished run: the error count, capped below
/// [`FATAL_EXIT_CODE`]
pub fn exit_code(total_errors: usize) -> u8 {
    total_errors.min(FATAL_EXIT_CODE as usize - 1) as u8
}

/// Check every document under `paths`, writing the report to `out`.
///
/// Execution contexts for all documents are resolved before any fence runs,
/// so a discovery or activation failure aborts the run with nothing executed.
pub fn run<W: Write>(
    paths: &[PathBuf],
    config: &Config,
    format: OutputFormat,
    out: &mut W,
) -> Result<CheckSummary> {
    let documents = collect_documents(paths)?;
    let resolver = Resolver::new(config.resolver_settings())?;

    let mut planned: Vec<(PathBuf, ExecutionContext)> = Vec::with_capacity(documents.len());
    for document in documents {
        let context = resolver.resolve(&document)?;
        planned.push((document, context));
    }

    let version = resolver.check_interpreter()?;
    info!("Using {} ({})", config.python_binary, version);

    let mut executor = SnippetExecutor::new(config.mode);
    if let Some(secs) = config.timeout_secs {
        executor = executor.with_timeout(secs);
    }
    let reporter = Reporter::new(format, config.only_report_errors);

    let mut summary = CheckSummary {
        documents: planned.len(),
        fences: 0,
        total_errors: 0,
    };

    for (document, context) in &planned {
        let file = executor.check_file(document, context)?;
        summary.fences += file.results.len();
        summary.total_errors += file.error_count;
        reporter
            .report_file(out, &file)
            .context("Failed to write report")?;
    }

    reporter
        .report_total(out, summary.total_errors)
        .context("Failed to write report")?;

    info!(
        "Checked {} fences in {} documents: {} errors",
        summary.fences, summary.documents, summary.total_errors
    );
    Ok(summary)
}
