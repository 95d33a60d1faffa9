// src/trial.rs
//! Trial value types: runtime parameters, workload parameters and the closed-over
//! identity of one benchmark run.
//!
//! All of these are immutable once built. Runtime parameters are checked against
//! the target variant's capabilities exactly once, when the trial is constructed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::BranchCapabilities;
use crate::constants;
use crate::error::HarnessError;
use crate::size_parser::parse_pg_memory;
use crate::state_cache::DbSetup;
use crate::variant::{DataSet, Variant};

// -----------------------------------------------------------------------------
// Runtime (postgresql.conf) parameters
// -----------------------------------------------------------------------------

/// Live-tunable server parameters pushed into postgresql.conf before each start.
/// Field names match the server's GUC names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub shared_buffers: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_mem: Option<String>,
    pub synchronize_seqscans: bool,
    pub pbm_evict_num_samples: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pbm_evict_num_victims: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pbm_bg_naest_max_age: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pbm_evict_use_freq: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pbm_evict_use_idx_scan: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pbm_idx_scan_num_counts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pbm_lru_if_not_requested: Option<bool>,
}

fn on_off(b: bool) -> String {
    if b { "on" } else { "off" }.to_string()
}

impl RuntimeConfig {
    pub fn builder(shared_buffers: impl Into<String>) -> RuntimeConfigBuilder {
        RuntimeConfigBuilder {
            cfg: RuntimeConfig {
                shared_buffers: shared_buffers.into(),
                work_mem: None,
                synchronize_seqscans: true,
                pbm_evict_num_samples: None,
                pbm_evict_num_victims: None,
                pbm_bg_naest_max_age: None,
                pbm_evict_use_freq: None,
                pbm_evict_use_idx_scan: None,
                pbm_idx_scan_num_counts: None,
                pbm_lru_if_not_requested: None,
            },
        }
    }

    /// Every runtime GUC this harness manages, in a stable order. `None` means
    /// the parameter must not be set, so a value left behind by an earlier trial
    /// gets commented out instead of leaking into this one.
    pub fn settings(&self) -> Vec<(&'static str, Option<String>)> {
        let num = |v: Option<u32>| v.map(|n| n.to_string());
        let flag = |v: Option<bool>| v.map(on_off);
        vec![
            ("shared_buffers", Some(self.shared_buffers.clone())),
            ("synchronize_seqscans", Some(on_off(self.synchronize_seqscans))),
            ("work_mem", self.work_mem.clone()),
            ("pbm_evict_num_samples", num(self.pbm_evict_num_samples)),
            ("pbm_evict_num_victims", num(self.pbm_evict_num_victims)),
            ("pbm_bg_naest_max_age", self.pbm_bg_naest_max_age.map(|v| v.to_string())),
            ("pbm_evict_use_freq", flag(self.pbm_evict_use_freq)),
            ("pbm_evict_use_idx_scan", flag(self.pbm_evict_use_idx_scan)),
            ("pbm_idx_scan_num_counts", num(self.pbm_idx_scan_num_counts)),
            ("pbm_lru_if_not_requested", flag(self.pbm_lru_if_not_requested)),
        ]
    }

    fn uses_sampling(&self) -> bool {
        self.pbm_evict_num_samples.is_some() || self.pbm_evict_num_victims.is_some()
    }

    fn uses_pbm_tuning(&self) -> bool {
        self.pbm_bg_naest_max_age.is_some()
            || self.pbm_evict_use_freq.is_some()
            || self.pbm_evict_use_idx_scan.is_some()
            || self.pbm_idx_scan_num_counts.is_some()
            || self.pbm_lru_if_not_requested.is_some()
    }

    /// Fail if a parameter is set that the branch does not understand
    pub fn check_capabilities(
        &self,
        branch: &str,
        caps: BranchCapabilities,
    ) -> Result<(), HarnessError> {
        if self.uses_sampling() && !caps.sampling {
            return Err(HarnessError::Configuration(format!(
                "branch '{}' does not accept sampling parameters",
                branch
            )));
        }
        if self.uses_pbm_tuning() && !caps.pbm_tuning {
            return Err(HarnessError::Configuration(format!(
                "branch '{}' does not accept pbm tuning parameters",
                branch
            )));
        }
        Ok(())
    }

    /// The large memory budget used while (re)building indexes and clustering
    pub fn for_reconfiguration() -> Self {
        RuntimeConfig::builder(constants::RECONFIGURE_SHARED_BUFFERS).cfg
    }
}

pub struct RuntimeConfigBuilder {
    cfg: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn work_mem(mut self, v: impl Into<String>) -> Self {
        self.cfg.work_mem = Some(v.into());
        self
    }

    pub fn synchronize_seqscans(mut self, on: bool) -> Self {
        self.cfg.synchronize_seqscans = on;
        self
    }

    pub fn evict_num_samples(mut self, n: Option<u32>) -> Self {
        self.cfg.pbm_evict_num_samples = n;
        self
    }

    pub fn evict_num_victims(mut self, n: Option<u32>) -> Self {
        self.cfg.pbm_evict_num_victims = n;
        self
    }

    pub fn bg_naest_max_age(mut self, age: Option<f64>) -> Self {
        self.cfg.pbm_bg_naest_max_age = age;
        self
    }

    pub fn evict_use_freq(mut self, v: Option<bool>) -> Self {
        self.cfg.pbm_evict_use_freq = v;
        self
    }

    pub fn evict_use_idx_scan(mut self, v: Option<bool>) -> Self {
        self.cfg.pbm_evict_use_idx_scan = v;
        self
    }

    pub fn idx_scan_num_counts(mut self, n: Option<u32>) -> Self {
        self.cfg.pbm_idx_scan_num_counts = n;
        self
    }

    pub fn lru_if_not_requested(mut self, v: Option<bool>) -> Self {
        self.cfg.pbm_lru_if_not_requested = v;
        self
    }

    /// Validate value formats and the variant's capabilities.
    pub fn build_for(self, variant: &Variant) -> Result<RuntimeConfig, HarnessError> {
        let cfg = self.build()?;
        cfg.check_capabilities(variant.branch(), variant.capabilities())?;
        Ok(cfg)
    }

    /// Validate value formats only (capabilities are checked by [`TrialSpec::new`]).
    pub fn build(self) -> Result<RuntimeConfig, HarnessError> {
        let cfg = self.cfg;
        parse_pg_memory(&cfg.shared_buffers).map_err(|e| {
            HarnessError::Configuration(format!("shared_buffers: {}", e))
        })?;
        if let Some(wm) = &cfg.work_mem {
            parse_pg_memory(wm)
                .map_err(|e| HarnessError::Configuration(format!("work_mem: {}", e)))?;
        }
        if cfg.pbm_evict_num_samples == Some(0) {
            return Err(HarnessError::Configuration(
                "pbm_evict_num_samples must be at least 1".into(),
            ));
        }
        Ok(cfg)
    }
}

// -----------------------------------------------------------------------------
// Workload (load generator) parameters
// -----------------------------------------------------------------------------

/// Named operation mixes. The load generator knows 24 procedures: the 22 TPC-H
/// queries followed by two micro-benchmark queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Workload {
    Tpch,
    Micro,
}

impl Workload {
    pub fn weights(&self) -> &'static str {
        match self {
            Workload::Tpch => "1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,0,0",
            Workload::Micro => "0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,1,1",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Workload::Tpch => "tpch",
            Workload::Micro => "micro",
        }
    }

    pub fn parse(name: &str) -> Result<Self, HarnessError> {
        match name {
            "tpch" => Ok(Workload::Tpch),
            "micro" => Ok(Workload::Micro),
            other => Err(HarnessError::Configuration(format!(
                "Unknown workload type {} (expected tpch or micro)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub workload: Workload,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Concurrent load-generator terminals (query streams)
    pub terminals: u32,
    pub seed: Option<u64>,
    pub selectivity: Option<f64>,
    /// Repeats each stream's query list this many times
    pub count_multiplier: Option<u32>,
    #[serde(default)]
    pub prewarm: bool,
    #[serde(default)]
    pub query_order_randomized: bool,
}

impl WorkloadConfig {
    pub fn new(workload: Workload, terminals: u32) -> Self {
        Self {
            workload,
            duration: constants::DEFAULT_TRIAL_DURATION,
            terminals,
            seed: None,
            selectivity: None,
            count_multiplier: None,
            prewarm: false,
            query_order_randomized: false,
        }
    }

    pub fn with_multiplier(mut self, m: u32) -> Self {
        self.count_multiplier = Some(m);
        self
    }

    pub fn with_selectivity(mut self, s: Option<f64>) -> Self {
        self.selectivity = s;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_duration(mut self, d: Duration) -> Self {
        self.duration = d;
        self
    }

    pub fn with_prewarm(mut self, prewarm: bool) -> Self {
        self.prewarm = prewarm;
        self
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.terminals == 0 {
            return Err(HarnessError::Configuration("terminals must be at least 1".into()));
        }
        if let Some(s) = self.selectivity {
            if !(0.0..=1.0).contains(&s) {
                return Err(HarnessError::Configuration(format!(
                    "selectivity {} is outside [0, 1]",
                    s
                )));
            }
        }
        if self.count_multiplier == Some(0) {
            return Err(HarnessError::Configuration("count multiplier must be at least 1".into()));
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Trial
// -----------------------------------------------------------------------------

/// Full identity of one benchmark run
#[derive(Debug, Clone, PartialEq)]
pub struct TrialSpec {
    variant: Variant,
    dataset: DataSet,
    runtime: RuntimeConfig,
    workload: WorkloadConfig,
    setup: DbSetup,
}

impl TrialSpec {
    pub fn new(
        variant: Variant,
        dataset: DataSet,
        runtime: RuntimeConfig,
        workload: WorkloadConfig,
        setup: DbSetup,
    ) -> Result<Self, HarnessError> {
        if variant.block_size() != dataset.block_size {
            return Err(HarnessError::Configuration(format!(
                "variant {} cannot open a {} KiB data set",
                variant, dataset.block_size
            )));
        }
        runtime.check_capabilities(variant.branch(), variant.capabilities())?;
        workload.validate()?;
        Ok(Self {
            variant,
            dataset,
            runtime,
            workload,
            setup,
        })
    }

    pub fn variant(&self) -> &Variant {
        &self.variant
    }

    pub fn dataset(&self) -> &DataSet {
        &self.dataset
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn workload(&self) -> &WorkloadConfig {
        &self.workload
    }

    pub fn setup(&self) -> &DbSetup {
        &self.setup
    }

    /// Same trial against a different index/cluster state
    pub fn with_setup(mut self, setup: DbSetup) -> Self {
        self.setup = setup;
        self
    }

    /// One-line description used for dry runs and log banners
    pub fn identity(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TrialSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.variant, self.dataset)?;
        for (k, v) in self.runtime.settings() {
            if let Some(v) = v {
                write!(f, " {}={}", k, v)?;
            }
        }
        write!(
            f,
            " | {} terminals={}",
            self.workload.workload.name(),
            self.workload.terminals
        )?;
        if let Some(seed) = self.workload.seed {
            write!(f, " seed={}", seed)?;
        }
        if let Some(sel) = self.workload.selectivity {
            write!(f, " selectivity={}", sel)?;
        }
        if let Some(cm) = self.workload.count_multiplier {
            write!(f, " count_multiplier={}", cm)?;
        }
        if self.workload.prewarm {
            write!(f, " prewarm")?;
        }
        write!(
            f,
            " | indexes={} clustering={}",
            self.setup.indexes.as_deref().unwrap_or("-"),
            self.setup.clustering.as_deref().unwrap_or("-")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_config;
    use crate::variant::VariantRegistry;

    #[test]
    fn test_sampling_rejected_for_base() {
        let reg = VariantRegistry::new(&sample_config());
        let base = reg.variant("base", 8).unwrap();
        let res = RuntimeConfig::builder("1GB")
            .evict_num_samples(Some(10))
            .build_for(&base);
        assert!(matches!(res, Err(HarnessError::Configuration(_))));

        let pbm = reg.variant("pbm2", 8).unwrap();
        let cfg = RuntimeConfig::builder("1GB")
            .evict_num_samples(Some(10))
            .build_for(&pbm)
            .unwrap();
        assert_eq!(cfg.pbm_evict_num_samples, Some(10));
    }

    #[test]
    fn test_bad_memory_rejected() {
        assert!(RuntimeConfig::builder("lots").build().is_err());
        assert!(RuntimeConfig::builder("1GB").work_mem("4 MB").build().is_ok());
        assert!(RuntimeConfig::builder("1GB").work_mem("4XB").build().is_err());
    }

    #[test]
    fn test_settings_order_and_format() {
        let cfg = RuntimeConfig::builder("2GB")
            .synchronize_seqscans(false)
            .evict_num_samples(Some(5))
            .build()
            .unwrap();
        let s = cfg.settings();
        assert_eq!(s[0], ("shared_buffers", Some("2GB".to_string())));
        assert_eq!(s[1], ("synchronize_seqscans", Some("off".to_string())));
        assert_eq!(s[2], ("work_mem", None));
        assert_eq!(s[3], ("pbm_evict_num_samples", Some("5".to_string())));
        // unset knobs are still listed so they can be cleared
        assert_eq!(s.len(), 10);
        assert_eq!(s.iter().filter(|(_, v)| v.is_some()).count(), 3);
    }

    #[test]
    fn test_trial_requires_matching_block_size() {
        let reg = VariantRegistry::new(&sample_config());
        let v = reg.variant("base", 8).unwrap();
        let rt = RuntimeConfig::builder("1GB").build().unwrap();
        let wl = WorkloadConfig::new(Workload::Micro, 4);
        let err = TrialSpec::new(v.clone(), DataSet::new(32, 10), rt.clone(), wl.clone(), DbSetup::default());
        assert!(err.is_err());
        let ok = TrialSpec::new(v, DataSet::new(8, 10), rt, wl, DbSetup::default()).unwrap();
        assert!(ok.identity().starts_with("base_8 sf10_blksz8 shared_buffers=1GB"));
    }

    #[test]
    fn test_equivalent_trials_compare_equal() {
        let reg = VariantRegistry::new(&sample_config());
        let mk = || {
            TrialSpec::new(
                reg.variant("pbm2", 8).unwrap(),
                DataSet::new(8, 10),
                RuntimeConfig::builder("2GB").evict_num_samples(Some(10)).build().unwrap(),
                WorkloadConfig::new(Workload::Micro, 8).with_seed(Some(12345)),
                DbSetup::new(Some("lineitem_brinonly"), Some("dates")),
            )
            .unwrap()
        };
        assert_eq!(mk(), mk());
    }

    #[test]
    fn test_workload_validation() {
        assert!(WorkloadConfig::new(Workload::Tpch, 0).validate().is_err());
        assert!(WorkloadConfig::new(Workload::Tpch, 1)
            .with_selectivity(Some(1.5))
            .validate()
            .is_err());
        assert_eq!(Workload::parse("micro").unwrap(), Workload::Micro);
        assert!(Workload::parse("ycsb").is_err());
        assert_eq!(Workload::Tpch.weights().split(',').count(), 24);
    }
}
