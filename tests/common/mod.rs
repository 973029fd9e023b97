//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub const PYTHON: &str = "python3";

/// Whether a usable `python3` is on PATH. Tests that execute fences return
/// early without one.
pub fn python_available() -> bool {
    Command::new(PYTHON)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Markdown document whose Python fences are `fences`, separated by prose
pub fn markdown(fences: &[&str]) -> String {
    let mut doc = String::from("# Example\n\n");
    for (i, source) in fences.iter().enumerate() {
        doc.push_str(&format!("Step {}:\n\n```python\n{}\n```\n\n", i + 1, source));
    }
    doc
}

pub fn write_doc(dir: &Path, name: &str, text: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, text).unwrap();
    path
}

/// Minimal virtual environment: a `pyvenv.cfg` marker plus an
/// `activate_this.py` that puts `<venv>/lib/site-packages` on `sys.path`.
/// `site-packages` holds `fc_demo_pkg` with `VALUE = 42`.
pub fn make_venv(venv: &Path) -> PathBuf {
    let scripts = if cfg!(windows) { "Scripts" } else { "bin" };
    let site = venv.join("lib").join("site-packages");
    fs::create_dir_all(venv.join(scripts)).unwrap();
    fs::create_dir_all(&site).unwrap();
    fs::write(venv.join("pyvenv.cfg"), "home = /usr/bin\n").unwrap();
    fs::write(
        venv.join(scripts).join("activate_this.py"),
        "import os, sys\n\
         base = os.path.dirname(os.path.dirname(os.path.abspath(__file__)))\n\
         sys.path.insert(0, os.path.join(base, 'lib', 'site-packages'))\n",
    )
    .unwrap();
    fs::write(site.join("fc_demo_pkg.py"), "VALUE = 42\n").unwrap();
    venv.to_path_buf()
}
