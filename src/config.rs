use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::executor::ExecutionMode;
use crate::venv::ResolverSettings;

/// Name of the per-project config file looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "fencecheck.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Interpreter used to run fences, with or without an activated venv
    #[serde(default = "default_python_binary")]
    pub python_binary: String,

    /// Search ancestor directories of each document for a virtual environment
    #[serde(default = "default_true")]
    pub autodiscover_venv: bool,

    /// Activate this virtual environment for every document (disables autodiscovery)
    #[serde(default)]
    pub venv_path: Option<PathBuf>,

    /// Directory names checked for a venv at each ancestor (default: ".venv", "venv")
    #[serde(default = "default_venv_dir_names")]
    pub venv_dir_names: Vec<String>,

    /// Only report failing fences
    #[serde(default)]
    pub only_report_errors: bool,

    /// Session backend: "session" (default) or "replay"
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Per-fence timeout in seconds. No timeout when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

pub fn default_python_binary() -> String {
    if cfg!(windows) {
        "python".to_string()
    } else {
        "python3".to_string()
    }
}

fn default_venv_dir_names() -> Vec<String> {
    vec![".venv".to_string(), "venv".to_string()]
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            python_binary: default_python_binary(),
            autodiscover_venv: true,
            venv_path: None,
            venv_dir_names: default_venv_dir_names(),
            only_report_errors: false,
            mode: ExecutionMode::default(),
            timeout_secs: None,
        }
    }
}

impl Config {
    /// Load config from the working directory or user config directory
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    /// Load configuration from a specific path, or use default search paths.
    /// An explicit path must exist and parse; the default locations are
    /// skipped when missing.
    pub fn load_with_path(path: Option<&Path>) -> Result<Self> {
        if let Some(config_path) = path {
            debug!("Loading config from explicit path: {}", config_path.display());
            return Self::load_from_path(config_path);
        }

        let local = Path::new(CONFIG_FILE_NAME);
        if local.is_file() {
            debug!("Loaded config from ./{}", CONFIG_FILE_NAME);
            return Self::load_from_path(local);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("fencecheck").join("config.toml");
            if config_path.is_file() {
                debug!("Loaded config from {:?}", config_path);
                return Self::load_from_path(&config_path);
            }
        }

        debug!("Using default config");
        Ok(Self::default())
    }

    fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// The subset of configuration the environment resolver consumes
    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            python_binary: self.python_binary.clone(),
            autodiscover_venv: self.autodiscover_venv,
            venv_path: self.venv_path.clone(),
            venv_dir_names: self.venv_dir_names.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.autodiscover_venv);
        assert!(config.venv_path.is_none());
        assert!(!config.only_report_errors);
        assert_eq!(config.mode, ExecutionMode::Session);
        assert_eq!(config.timeout_secs, None);
        assert_eq!(config.venv_dir_names, vec![".venv", "venv"]);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
python_binary = "/usr/bin/python3.12"
autodiscover_venv = false
mode = "replay"
timeout_secs = 30
"#,
        )
        .unwrap();
        assert_eq!(config.python_binary, "/usr/bin/python3.12");
        assert!(!config.autodiscover_venv);
        assert_eq!(config.mode, ExecutionMode::Replay);
        assert_eq!(config.timeout_secs, Some(30));
        assert_eq!(config.venv_dir_names, vec![".venv", "venv"]);
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let result: Result<Config, _> = toml::from_str("mode = \"parallel\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.python_binary = "python3.11".to_string();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("python_binary = \"python3.11\""));
        assert!(toml_str.contains("mode = \"session\""));
    }

    #[test]
    fn test_resolver_settings_mirror_config() {
        let mut config = Config::default();
        config.venv_path = Some(PathBuf::from("/srv/venv"));
        let settings = config.resolver_settings();
        assert_eq!(settings.python_binary, config.python_binary);
        assert_eq!(settings.venv_path, Some(PathBuf::from("/srv/venv")));
        assert!(settings.autodiscover_venv);
    }
}
