use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};

use crate::executor::{FenceOutcome, FenceResult, FileResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    /// One JSON object per document, then a totals line
    Json,
}

/// Renders file results for the terminal or for machines
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    format: OutputFormat,
    only_report_errors: bool,
}

impl Reporter {
    pub fn new(format: OutputFormat, only_report_errors: bool) -> Self {
        Self {
            format,
            only_report_errors,
        }
    }

    pub fn report_file<W: Write>(&self, out: &mut W, file: &FileResult) -> io::Result<()> {
        match self.format {
            OutputFormat::Text => self.write_text(out, file),
            OutputFormat::Json => {
                let results: Vec<&FenceResult> = file
                    .results
                    .iter()
                    .filter(|r| !self.only_report_errors || !r.outcome.is_pass())
                    .collect();
                let value = serde_json::json!({
                    "path": file.path,
                    "results": results,
                    "error_count": file.error_count,
                });
                writeln!(out, "{}", value)
            }
        }
    }

    pub fn report_total<W: Write>(&self, out: &mut W, total_errors: usize) -> io::Result<()> {
        match self.format {
            OutputFormat::Text => writeln!(out, "\nTotal Errors: {}", total_errors),
            OutputFormat::Json => writeln!(
                out,
                "{}",
                serde_json::json!({ "total_errors": total_errors })
            ),
        }
    }

    fn write_text<W: Write>(&self, out: &mut W, file: &FileResult) -> io::Result<()> {
        let path = file.path.display();
        writeln!(out, "{}", path)?;

        for result in &file.results {
            let fence = &result.fence;
            let location = format!("{}:{} (fence {})", path, fence.line, fence.index + 1);

            match &result.outcome {
                FenceOutcome::Pass(_) if self.only_report_errors => {}
                FenceOutcome::Pass(_) => writeln!(out, "  ✓ {}", location)?,
                outcome => {
                    writeln!(out, "  ✗ {}", location)?;
                    for line in outcome.error_message().trim_end().lines() {
                        writeln!(out, "      {}", line)?;
                    }
                }
            }

            if !fence.terminated {
                writeln!(
                    out,
                    "  ! {} is never closed; it runs to the end of the document",
                    location
                )?;
            }
        }

        if file.results.is_empty() && !self.only_report_errors {
            writeln!(out, "  (no Python fences)")?;
        }
        writeln!(out, "  Errors: {}", file.error_count)
    }
}
