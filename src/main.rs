use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Arg, ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use fencecheck::cli::check;
use fencecheck::config::Config;
use fencecheck::executor::ExecutionMode;
use fencecheck::report::OutputFormat;

/// Check Python fenced code blocks in Markdown files.
#[derive(Parser, Debug)]
#[command(name = "fencecheck", version, disable_version_flag = true)]
#[command(arg = Arg::new("version")
    .short('v')
    .long("version")
    .action(ArgAction::Version)
    .help("Print version info and exit"))]
#[command(about = "Check Python fenced code blocks in Markdown files", long_about = None)]
struct Cli {
    /// Check these Markdown files (directories are searched for *.md)
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Autodiscover and activate a virtual environment (default)
    #[arg(long, overrides_with = "no_autodiscover_venv")]
    autodiscover_venv: bool,

    /// Do not look for a virtual environment
    #[arg(long)]
    no_autodiscover_venv: bool,

    /// Only include errors when reporting
    #[arg(short = 'e', long)]
    only_report_errors: bool,

    /// Use this Python binary to execute code
    #[arg(short = 'p', long)]
    python_binary: Option<String>,

    /// Operate within this virtual environment
    #[arg(short = 'V', long)]
    venv_path: Option<PathBuf>,

    /// How fences share state: session (one interpreter per document) or replay
    #[arg(long, value_enum)]
    mode: Option<ExecutionMode>,

    /// Per-fence timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Report format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Path to config file (defaults to ./fencecheck.toml or ~/.config/fencecheck/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    /// Layer command-line flags over file configuration
    fn apply_to(&self, config: &mut Config) {
        if self.no_autodiscover_venv {
            config.autodiscover_venv = false;
        } else if self.autodiscover_venv {
            config.autodiscover_venv = true;
        }
        if self.only_report_errors {
            config.only_report_errors = true;
        }
        if let Some(binary) = &self.python_binary {
            config.python_binary = binary.clone();
        }
        if let Some(venv) = &self.venv_path {
            config.venv_path = Some(venv.clone());
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(secs) = self.timeout {
            config.timeout_secs = Some(secs);
        }
    }
}

fn run(cli: &Cli) -> Result<usize> {
    let mut config = Config::load_with_path(cli.config.as_deref())?;
    cli.apply_to(&mut config);

    let mut stdout = std::io::stdout().lock();
    let summary = check::run(&cli.paths, &config, cli.format, &mut stdout)?;
    Ok(summary.total_errors)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(&cli) {
        Ok(total_errors) => ExitCode::from(check::exit_code(total_errors)),
        Err(e) => {
            eprintln!("✘ Error: {:#}", e);
            ExitCode::from(check::FATAL_EXIT_CODE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::try_parse_from(["fencecheck", "README.md"]).unwrap();
        assert_eq!(cli.paths, vec![PathBuf::from("README.md")]);
        assert!(!cli.autodiscover_venv);
        assert!(!cli.no_autodiscover_venv);
        assert!(!cli.only_report_errors);
        assert!(cli.python_binary.is_none());
        assert!(cli.venv_path.is_none());
        assert_eq!(cli.format, OutputFormat::Text);

        let mut config = Config::default();
        cli.apply_to(&mut config);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_short_flags() {
        let cli = Cli::try_parse_from([
            "fencecheck",
            "a.md",
            "b.md",
            "-e",
            "-p",
            "/usr/bin/python3.12",
            "-V",
            ".venv",
        ])
        .unwrap();
        assert_eq!(cli.paths.len(), 2);
        assert!(cli.only_report_errors);
        assert_eq!(cli.python_binary.as_deref(), Some("/usr/bin/python3.12"));
        assert_eq!(cli.venv_path, Some(PathBuf::from(".venv")));
    }

    #[test]
    fn test_no_autodiscover_overrides_config() {
        let cli = Cli::try_parse_from(["fencecheck", "a.md", "--no-autodiscover-venv"]).unwrap();
        let mut config = Config::default();
        cli.apply_to(&mut config);
        assert!(!config.autodiscover_venv);
    }

    #[test]
    fn test_autodiscover_flags_last_one_wins() {
        let cli = Cli::try_parse_from([
            "fencecheck",
            "a.md",
            "--no-autodiscover-venv",
            "--autodiscover-venv",
        ])
        .unwrap();
        let mut config = Config::default();
        config.autodiscover_venv = false;
        cli.apply_to(&mut config);
        assert!(config.autodiscover_venv);
    }

    #[test]
    fn test_parse_mode_timeout_format() {
        let cli = Cli::try_parse_from([
            "fencecheck",
            "a.md",
            "--mode",
            "replay",
            "--timeout",
            "10",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.mode, Some(ExecutionMode::Replay));
        assert_eq!(cli.timeout, Some(10));
        assert_eq!(cli.format, OutputFormat::Json);

        let mut config = Config::default();
        cli.apply_to(&mut config);
        assert_eq!(config.mode, ExecutionMode::Replay);
        assert_eq!(config.timeout_secs, Some(10));
    }

    #[test]
    fn test_parse_missing_paths() {
        let result = Cli::try_parse_from(["fencecheck"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_short_v_is_version() {
        let err = Cli::try_parse_from(["fencecheck", "-v"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_parse_unknown_mode() {
        let result = Cli::try_parse_from(["fencecheck", "a.md", "--mode", "parallel"]);
        assert!(result.is_err());
    }
}
