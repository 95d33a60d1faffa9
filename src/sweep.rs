// src/sweep.rs
//! Declarative sweeps.
//!
//! A sweep file lists candidate values per dimension; [`SweepDefinition::expand`]
//! turns it into the Cartesian product of trials in a fixed order, outermost first:
//! block size, shared buffers, terminals, seed, prewarm, branch, sampling, scan sync.
//!
//! ```yaml
//! name: micro_parallelism
//! scale_factor: 10
//! indexes: lineitem_brinonly
//! clustering: dates
//! workload: micro
//! shared_buffers: [2GB]
//! terminals: [1, 2, 4, 8]
//! sampling: [1, 5, 10]
//! count_multiplier: 8
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::constants;
use crate::state_cache::DbSetup;
use crate::trial::{RuntimeConfig, TrialSpec, Workload, WorkloadConfig};
use crate::variant::{DataSet, Variant, VariantRegistry};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SweepDefinition {
    /// Experiment name recorded with every trial
    pub name: String,

    pub scale_factor: u32,

    /// Index set to install; omitted keeps the recorded one
    #[serde(default)]
    pub indexes: Option<String>,

    /// Clustering to apply; omitted keeps the recorded one
    #[serde(default)]
    pub clustering: Option<String>,

    pub workload: Workload,

    #[serde(default = "default_duration", with = "humantime_serde")]
    pub duration: Duration,

    /// Branch names; all configured branches when empty
    #[serde(default)]
    pub branches: Vec<String>,

    /// Block sizes; all configured block sizes when empty
    #[serde(default)]
    pub block_sizes: Vec<u32>,

    pub shared_buffers: Vec<String>,

    #[serde(default)]
    pub work_mem: Option<String>,

    /// Candidate eviction sample counts, filtered per branch by [`sampling_values`]
    #[serde(default)]
    pub sampling: Vec<u32>,

    #[serde(default = "default_scan_sync")]
    pub synchronize_seqscans: Vec<bool>,

    #[serde(default = "default_terminals")]
    pub terminals: Vec<u32>,

    /// Random seeds; one unseeded run when empty
    #[serde(default)]
    pub seeds: Vec<u64>,

    #[serde(default)]
    pub selectivity: Option<f64>,

    #[serde(default)]
    pub count_multiplier: Option<u32>,

    /// Keep the total query count constant across terminal counts:
    /// multiplier = total / terminals. Overrides `count_multiplier`.
    #[serde(default)]
    pub count_multiplier_total: Option<u32>,

    #[serde(default = "default_prewarm")]
    pub prewarm: Vec<bool>,
}

fn default_duration() -> Duration {
    constants::DEFAULT_TRIAL_DURATION
}

fn default_scan_sync() -> Vec<bool> {
    vec![true]
}

fn default_terminals() -> Vec<u32> {
    vec![constants::DEFAULT_TERMINALS]
}

fn default_prewarm() -> Vec<bool> {
    vec![false]
}

/// Sample counts to try on one branch. Branches without the sampling capability
/// get a single "unset" value; a single sample is purely random eviction, so it
/// only runs on the branch flagged `sample_one`.
pub fn sampling_values(variant: &Variant, candidates: &[u32]) -> Vec<Option<u32>> {
    if !variant.accepts_sampling_param() || candidates.is_empty() {
        return vec![None];
    }
    if variant.capabilities().sample_one {
        candidates.iter().copied().map(Some).collect()
    } else {
        candidates.iter().copied().filter(|&n| n > 1).map(Some).collect()
    }
}

impl SweepDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let buf = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        serde_yaml::from_slice(&buf).with_context(|| format!("parse {}", path.display()))
    }

    fn multiplier_for(&self, terminals: u32) -> Result<Option<u32>> {
        match self.count_multiplier_total {
            Some(total) => {
                let m = total / terminals;
                if m == 0 {
                    bail!(
                        "count_multiplier_total {} is smaller than {} terminals",
                        total,
                        terminals
                    );
                }
                Ok(Some(m))
            }
            None => Ok(self.count_multiplier),
        }
    }

    /// Every trial of the sweep, in execution order
    pub fn expand(&self, registry: &VariantRegistry) -> Result<Vec<TrialSpec>> {
        if self.shared_buffers.is_empty() {
            bail!("sweep '{}' lists no shared_buffers values", self.name);
        }
        if self.terminals.is_empty() {
            bail!("sweep '{}' lists no terminal counts", self.name);
        }

        let block_sizes: Vec<u32> = if self.block_sizes.is_empty() {
            registry.block_sizes().to_vec()
        } else {
            self.block_sizes.clone()
        };
        let branches: Vec<String> = if self.branches.is_empty() {
            registry.branch_names().map(str::to_string).collect()
        } else {
            self.branches.clone()
        };
        let seeds: Vec<Option<u64>> = if self.seeds.is_empty() {
            vec![None]
        } else {
            self.seeds.iter().copied().map(Some).collect()
        };
        let setup = DbSetup::new(self.indexes.as_deref(), self.clustering.as_deref());

        let mut trials = Vec::new();
        for &blk in &block_sizes {
            let data = DataSet::new(blk, self.scale_factor);
            for shmem in &self.shared_buffers {
                for &terminals in &self.terminals {
                    let multiplier = self.multiplier_for(terminals)?;
                    for &seed in &seeds {
                        for &prewarm in &self.prewarm {
                            let mut workload = WorkloadConfig::new(self.workload, terminals)
                                .with_duration(self.duration)
                                .with_seed(seed)
                                .with_selectivity(self.selectivity)
                                .with_prewarm(prewarm);
                            if let Some(m) = multiplier {
                                workload = workload.with_multiplier(m);
                            }

                            for branch in &branches {
                                let variant = registry.variant(branch, blk)?;
                                for samples in sampling_values(&variant, &self.sampling) {
                                    for &sync in &self.synchronize_seqscans {
                                        let mut rt = RuntimeConfig::builder(shmem.as_str())
                                            .synchronize_seqscans(sync)
                                            .evict_num_samples(samples);
                                        if let Some(wm) = &self.work_mem {
                                            rt = rt.work_mem(wm.as_str());
                                        }
                                        trials.push(TrialSpec::new(
                                            variant.clone(),
                                            data,
                                            rt.build_for(&variant)?,
                                            workload.clone(),
                                            setup.clone(),
                                        )?);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(trials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BranchCapabilities, BranchSpec};
    use crate::test_support::sample_config;

    fn registry_with_pbm1() -> VariantRegistry {
        let mut cfg = sample_config();
        cfg.branches.push(BranchSpec {
            name: "pbm1".into(),
            git_branch: "pbm_part1".into(),
            capabilities: BranchCapabilities {
                sampling: true,
                pbm_tuning: false,
                sample_one: false,
            },
        });
        VariantRegistry::new(&cfg)
    }

    #[test]
    fn test_sampling_values_rule() {
        let reg = registry_with_pbm1();
        let ns = [1, 2, 5, 10];
        assert_eq!(sampling_values(&reg.variant("base", 8).unwrap(), &ns), vec![None]);
        assert_eq!(
            sampling_values(&reg.variant("pbm2", 8).unwrap(), &ns),
            vec![Some(1), Some(2), Some(5), Some(10)]
        );
        assert_eq!(
            sampling_values(&reg.variant("pbm1", 8).unwrap(), &ns),
            vec![Some(2), Some(5), Some(10)]
        );
    }

    #[test]
    fn test_expand_order_and_count() {
        let yaml = r#"
name: shared_memory
scale_factor: 10
indexes: lineitem_brinonly
clustering: dates
workload: micro
branches: [base, pbm2]
block_sizes: [8]
shared_buffers: [1GB, 2GB]
sampling: [1, 10]
seeds: [12345]
count_multiplier: 8
"#;
        let sweep: SweepDefinition = serde_yaml::from_str(yaml).unwrap();
        let trials = sweep.expand(&VariantRegistry::new(&sample_config())).unwrap();
        // per shared_buffers: base x1 + pbm2 x2
        assert_eq!(trials.len(), 6);
        assert_eq!(trials[0].variant().branch(), "base");
        assert_eq!(trials[0].runtime().shared_buffers, "1GB");
        assert_eq!(trials[1].runtime().pbm_evict_num_samples, Some(1));
        assert_eq!(trials[2].runtime().pbm_evict_num_samples, Some(10));
        assert_eq!(trials[3].runtime().shared_buffers, "2GB");
        assert!(trials.iter().all(|t| t.workload().count_multiplier == Some(8)));
        assert!(trials.iter().all(|t| t.setup().clustering.as_deref() == Some("dates")));
    }

    #[test]
    fn test_constant_total_queries() {
        let yaml = r#"
name: parallelism
scale_factor: 10
workload: micro
branches: [base]
block_sizes: [8]
shared_buffers: [2GB]
terminals: [1, 2, 4, 8, 16, 32]
synchronize_seqscans: [true, false]
count_multiplier_total: 64
"#;
        let sweep: SweepDefinition = serde_yaml::from_str(yaml).unwrap();
        let trials = sweep.expand(&VariantRegistry::new(&sample_config())).unwrap();
        assert_eq!(trials.len(), 12);
        for t in &trials {
            let w = t.workload();
            assert_eq!(w.terminals * w.count_multiplier.unwrap(), 64);
        }
        assert!(!trials[1].runtime().synchronize_seqscans);
    }

    #[test]
    fn test_unknown_branch_rejected() {
        let yaml = "name: x\nscale_factor: 1\nworkload: tpch\nbranches: [nope]\nshared_buffers: [1GB]\n";
        let sweep: SweepDefinition = serde_yaml::from_str(yaml).unwrap();
        assert!(sweep.expand(&VariantRegistry::new(&sample_config())).is_err());
    }
}
