//! Per-trial results directory.
//!
//! Each trial gets its own directory under the results root:
//! - `test_config.json`  (experiment-level configuration record)
//! - `bbase_config.xml`  (load generator configuration used for the run)
//! - `metadata.json`     (host, version, timing)
//! - `{branch}_blksz{block_size}/`  (load generator output)
//!
//! Directory format: TPCH_{YYYY-MM-DD}_{HH-MM-SS}/. Directory names carry no
//! trial identity; the configuration record is the only source of truth.

use anyhow::{bail, Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants;
use crate::trial::{RuntimeConfig, TrialSpec};

/// Contents of `test_config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialConfigRecord {
    pub experiment: String,
    pub clustering: Option<String>,
    pub indexes: Option<String>,
    pub scalefactor: u32,
    /// Trial duration in seconds
    pub time: u64,
    pub workload: String,
    pub parallelism: u32,
    pub seed: Option<u64>,
    pub selectivity: Option<f64>,
    pub count_multiplier: Option<u32>,
    pub prewarm: bool,
    pub query_order_randomized: bool,
    #[serde(flatten)]
    pub runtime: RuntimeConfig,
}

impl TrialConfigRecord {
    pub fn new(experiment: &str, trial: &TrialSpec) -> Self {
        let wl = trial.workload();
        Self {
            experiment: experiment.to_string(),
            clustering: trial.setup().clustering.clone(),
            indexes: trial.setup().indexes.clone(),
            scalefactor: trial.dataset().scale_factor,
            time: wl.duration.as_secs(),
            workload: wl.workload.name().to_string(),
            parallelism: wl.terminals,
            seed: wl.seed,
            selectivity: wl.selectivity,
            count_multiplier: wl.count_multiplier,
            prewarm: wl.prewarm,
            query_order_randomized: wl.query_order_randomized,
            runtime: trial.runtime().clone(),
        }
    }
}

/// Metadata about one trial run
#[derive(Debug, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: String,
    pub experiment: String,
    pub trial: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_secs: Option<f64>,
    pub hostname: String,
}

impl RunMetadata {
    pub fn new(experiment: &str, trial: &TrialSpec) -> Self {
        let hostname = hostname::get()
            .unwrap_or_else(|_| "unknown".into())
            .to_string_lossy()
            .to_string();

        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            experiment: experiment.to_string(),
            trial: trial.identity(),
            start_time: Local::now().to_rfc3339(),
            end_time: None,
            duration_secs: None,
            hostname,
        }
    }

    pub fn finalize(&mut self, duration_secs: f64) {
        self.end_time = Some(Local::now().to_rfc3339());
        self.duration_secs = Some(duration_secs);
    }
}

pub struct TrialResultsDir {
    path: PathBuf,
    metadata: RunMetadata,
}

impl TrialResultsDir {
    /// Create a fresh timestamped directory under `base` and write the
    /// configuration record into it.
    pub fn create(base: &Path, experiment: &str, trial: &TrialSpec) -> Result<Self> {
        fs::create_dir_all(base)
            .with_context(|| format!("Failed to create results root: {}", base.display()))?;

        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        let path = unique_dir(base, &format!("{}_{}", constants::RESULTS_DIR_PREFIX, stamp))?;

        let record = TrialConfigRecord::new(experiment, trial);
        let mut json = serde_json::to_string_pretty(&record)
            .context("Failed to serialize trial configuration")?;
        json.push('\n');
        fs::write(path.join(constants::TRIAL_CONFIG_FILE), json)
            .with_context(|| format!("Failed to write {}", constants::TRIAL_CONFIG_FILE))?;

        tracing::info!("Created results directory: {}", path.display());

        Ok(Self {
            path,
            metadata: RunMetadata::new(experiment, trial),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn loadgen_config_path(&self) -> PathBuf {
        self.path.join("bbase_config.xml")
    }

    /// Output directory for one variant; created on demand
    pub fn variant_dir(&self, trial: &TrialSpec) -> Result<PathBuf> {
        let dir = self.path.join(trial.variant().results_subdir());
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    pub fn write_metadata(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.metadata)
            .context("Failed to serialize metadata")?;
        fs::write(self.path.join("metadata.json"), json)
            .context("Failed to write metadata.json")?;
        Ok(())
    }

    pub fn finalize(&mut self, duration_secs: f64) -> Result<()> {
        self.metadata.finalize(duration_secs);
        self.write_metadata()?;
        tracing::info!("Results saved to: {}", self.path.display());
        Ok(())
    }
}

/// Create `base/name`, appending `-1`, `-2`, ... when a trial in the same
/// second already claimed the name.
fn unique_dir(base: &Path, name: &str) -> Result<PathBuf> {
    for n in 0..1000 {
        let candidate = if n == 0 {
            base.join(name)
        } else {
            base.join(format!("{}-{}", name, n))
        };
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to create results directory: {}", candidate.display())
                })
            }
        }
    }
    bail!("could not find a free results directory name for {}", name)
}
