// src/lib.rs

use regex::escape;

pub mod aggregate; // Replicate aggregation (mean ± 95% CI)
pub mod collect; // Results normalization into one CSV
pub mod config;
pub mod constants;
pub mod error;
pub mod lifecycle; // Remote start/stop/initialize of database clusters
pub mod loadgen; // BenchBase configuration and invocation
pub mod pgconf;
pub mod reconfigure; // Index and clustering changes
pub mod remote;
pub mod results_dir;
pub mod runner;
pub mod scheduler;
pub mod setup; // Variant builds and BenchBase install
pub mod size_parser;
pub mod state_cache;
pub mod sweep;
pub mod trial;
pub mod variant;

#[cfg(test)]
mod test_support;

/// Converts a simple glob (with `*`) into a fully-anchored regex string.
pub fn glob_to_regex(glob: &str) -> String {
    format!("^{}$", escape(glob).replace(r"\*", ".*"))
}
