// src/config.rs
//! Harness configuration.
//!
//! One immutable [`HarnessConfig`] is loaded from YAML at startup and handed to every
//! component at construction. Nothing reads configuration from globals.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// PostgreSQL server the benchmarks run against
    pub database: DatabaseConfig,

    /// Filesystem layout on the build host, the database host and the client
    pub paths: PathsConfig,

    /// Storage block sizes (KiB) every branch is built with
    #[serde(default = "default_block_sizes")]
    pub block_sizes: Vec<u32>,

    /// Branch table. Exactly one entry must be named `base`.
    pub branches: Vec<BranchSpec>,

    /// Source repositories for the database engine and the load generator
    #[serde(default)]
    pub sources: SourcesConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub ssh: SshConfig,

    /// psql client used for DDL statements
    #[serde(default = "default_psql")]
    pub psql_bin: String,

    /// Java runtime used to launch BenchBase
    #[serde(default = "default_java")]
    pub java_bin: String,

    /// Results directories (glob patterns) excluded from collection, typically
    /// runs that completed but are known to be bad and were re-run separately.
    #[serde(default)]
    pub ignore_results: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    /// Falls back to $PGEXP_PG_PASSWORD, then to an empty password
    #[serde(default)]
    pub password: Option<String>,
}

impl DatabaseConfig {
    pub fn password(&self) -> String {
        self.password
            .clone()
            .or_else(|| std::env::var(constants::PG_PASSWORD_ENV).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Where sources are cloned and variants are built and installed
    pub build_root: PathBuf,

    /// Parent of every DataSet directory on the database host
    pub data_root: PathBuf,

    /// Directory holding `index/<name>/{create,drop}.sql`, `cluster/<name>.sql`
    /// and `create-tables-noindex.sql`
    #[serde(default = "default_ddl_root")]
    pub ddl_root: PathBuf,

    /// Parent of all timestamped results directories
    pub results_root: PathBuf,

    /// BenchBase sample configuration the per-trial XML is derived from
    #[serde(default = "default_benchbase_template")]
    pub benchbase_template: PathBuf,

    /// Directory holding the index/cluster state caches
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

/// One source branch of the database engine
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Hash)]
#[serde(deny_unknown_fields)]
pub struct BranchSpec {
    /// Short name used in directory names (e.g. "base", "pbm2")
    pub name: String,

    /// Git branch checked out for this variant
    pub git_branch: String,

    #[serde(default)]
    pub capabilities: BranchCapabilities,
}

/// Static capabilities of a branch; they govern which runtime parameters are legal.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(deny_unknown_fields)]
pub struct BranchCapabilities {
    /// Accepts `pbm_evict_num_samples` / `pbm_evict_num_victims`
    #[serde(default)]
    pub sampling: bool,

    /// Accepts the remaining `pbm_*` tuning parameters
    #[serde(default)]
    pub pbm_tuning: bool,

    /// Sweeps include the single-sample case for this branch
    #[serde(default)]
    pub sample_one: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct SourcesConfig {
    #[serde(default)]
    pub postgres_git_url: Option<String>,

    #[serde(default)]
    pub benchbase_git_url: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(default = "default_start_timeout", with = "humantime_serde")]
    pub start: Duration,

    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop: Duration,

    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            start: default_start_timeout(),
            stop: default_stop_timeout(),
            command: default_command_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    /// Remote user (defaults to $USER)
    #[serde(default)]
    pub user: Option<String>,

    /// Private key (defaults to ~/.ssh/id_rsa)
    #[serde(default)]
    pub key_path: Option<String>,

    /// Connect timeout in seconds
    #[serde(default = "default_ssh_timeout")]
    pub timeout: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: None,
            key_path: None,
            timeout: default_ssh_timeout(),
        }
    }
}

fn default_block_sizes() -> Vec<u32> {
    constants::DEFAULT_BLOCK_SIZES.to_vec()
}

fn default_port() -> u16 {
    constants::DEFAULT_PG_PORT
}

fn default_user() -> String {
    constants::DEFAULT_PG_USER.to_string()
}

fn default_psql() -> String {
    "psql".to_string()
}

fn default_java() -> String {
    "java".to_string()
}

fn default_ddl_root() -> PathBuf {
    PathBuf::from("ddl")
}

fn default_benchbase_template() -> PathBuf {
    PathBuf::from("bbase_config/sample_tpch_config.xml")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_start_timeout() -> Duration {
    constants::DEFAULT_START_TIMEOUT
}

fn default_stop_timeout() -> Duration {
    constants::DEFAULT_STOP_TIMEOUT
}

fn default_command_timeout() -> Duration {
    constants::DEFAULT_COMMAND_TIMEOUT
}

fn default_ssh_timeout() -> u64 {
    constants::DEFAULT_SSH_TIMEOUT_SECS
}

impl HarnessConfig {
    /// Read, parse and validate a YAML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let buf = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: HarnessConfig =
            serde_yaml::from_slice(&buf).with_context(|| format!("parse {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_sizes.is_empty() {
            bail!("block_sizes must not be empty");
        }
        for &blk in &self.block_sizes {
            // PostgreSQL's --with-blocksize accepts powers of two from 1 to 32 KiB
            if !blk.is_power_of_two() || blk > 32 {
                bail!("invalid block size {} KiB (must be a power of two <= 32)", blk);
            }
        }

        let mut seen = HashSet::new();
        for b in &self.branches {
            if b.name.is_empty() || b.name.contains('/') {
                bail!("invalid branch name '{}'", b.name);
            }
            if !seen.insert(b.name.as_str()) {
                bail!("duplicate branch name '{}'", b.name);
            }
        }
        if !seen.contains(constants::BASE_BRANCH_NAME) {
            bail!("branch table must contain a '{}' entry", constants::BASE_BRANCH_NAME);
        }
        Ok(())
    }
}
