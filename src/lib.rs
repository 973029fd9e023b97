//! fencecheck - Check that Python fenced code blocks in Markdown files run
//!
//! Extracts the Python fences of each document, resolves the interpreter and
//! (optionally) the virtual environment to run them in, executes them as one
//! cumulative program per document and reports which fences fail.

pub mod cli;
pub mod config;
pub mod executor;
pub mod fence;
pub mod report;
pub mod util;
pub mod venv;
