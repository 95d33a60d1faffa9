// src/variant.rs
//! Build variants and data sets.
//!
//! A [`Variant`] is one compiled database build: (branch, block size). A [`DataSet`]
//! is one on-disk database instance: (block size, scale factor). Every variant with
//! the same block size runs against the same data directory.
//!
//! [`VariantRegistry`] maps both to filesystem paths. Resolution is pure: no I/O.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::{BranchCapabilities, BranchSpec, HarnessConfig};
use crate::constants;
use crate::error::HarnessError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Variant {
    branch: BranchSpec,
    block_size: u32,
}

impl Variant {
    pub fn branch(&self) -> &str {
        &self.branch.name
    }

    pub fn git_branch(&self) -> &str {
        &self.branch.git_branch
    }

    /// Block size in KiB
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn capabilities(&self) -> BranchCapabilities {
        self.branch.capabilities
    }

    pub fn accepts_sampling_param(&self) -> bool {
        self.branch.capabilities.sampling
    }

    pub fn is_base(&self) -> bool {
        self.branch.name == constants::BASE_BRANCH_NAME
    }

    /// Name of the per-variant results subdirectory: `{branch}_blksz{block_size}`
    pub fn results_subdir(&self) -> String {
        format!("{}_blksz{}", self.branch.name, self.block_size)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.branch.name, self.block_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataSet {
    /// Block size in KiB
    pub block_size: u32,
    pub scale_factor: u32,
}

impl DataSet {
    pub fn new(block_size: u32, scale_factor: u32) -> Self {
        Self { block_size, scale_factor }
    }

    /// Database name inside the cluster
    pub fn database(&self) -> String {
        format!("{}{}", constants::DATABASE_PREFIX, self.scale_factor)
    }
}

impl fmt::Display for DataSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sf{}_blksz{}", self.scale_factor, self.block_size)
    }
}

/// Paths derived from a variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantPaths {
    pub source_path: PathBuf,
    pub build_path: PathBuf,
    pub install_path: PathBuf,
}

impl VariantPaths {
    /// Binary inside the variant's installation (`pg_ctl`, `initdb`, `createdb`, ...)
    pub fn bin(&self, name: &str) -> PathBuf {
        self.install_path.join("bin").join(name)
    }
}

#[derive(Debug, Clone)]
pub struct VariantRegistry {
    branches: Vec<BranchSpec>,
    block_sizes: Vec<u32>,
    build_root: PathBuf,
    data_root: PathBuf,
}

impl VariantRegistry {
    pub fn new(cfg: &HarnessConfig) -> Self {
        Self {
            branches: cfg.branches.clone(),
            block_sizes: cfg.block_sizes.clone(),
            build_root: cfg.paths.build_root.clone(),
            data_root: cfg.paths.data_root.clone(),
        }
    }

    /// Look up a variant by branch name. Unknown branches are a configuration error.
    pub fn variant(&self, branch: &str, block_size: u32) -> Result<Variant, HarnessError> {
        let spec = self
            .branches
            .iter()
            .find(|b| b.name == branch)
            .ok_or_else(|| HarnessError::Configuration(format!("unknown branch '{}'", branch)))?;
        if !self.block_sizes.contains(&block_size) {
            return Err(HarnessError::Configuration(format!(
                "block size {} KiB is not built (configured: {:?})",
                block_size, self.block_sizes
            )));
        }
        Ok(Variant {
            branch: spec.clone(),
            block_size,
        })
    }

    /// The unmodified upstream build for a block size
    pub fn base(&self, block_size: u32) -> Result<Variant, HarnessError> {
        self.variant(constants::BASE_BRANCH_NAME, block_size)
    }

    /// Every configured (branch, block size) pair, block size outermost
    pub fn all(&self) -> Vec<Variant> {
        self.block_sizes
            .iter()
            .flat_map(|&blk| {
                self.branches.iter().map(move |b| Variant {
                    branch: b.clone(),
                    block_size: blk,
                })
            })
            .collect()
    }

    pub fn block_sizes(&self) -> &[u32] {
        &self.block_sizes
    }

    pub fn branch_names(&self) -> impl Iterator<Item = &str> {
        self.branches.iter().map(|b| b.name.as_str())
    }

    pub fn accepts_sampling_param(&self, variant: &Variant) -> bool {
        variant.accepts_sampling_param()
    }

    pub fn resolve(&self, variant: &Variant) -> VariantPaths {
        let tag = variant.to_string();
        VariantPaths {
            source_path: self.source_root().join(variant.branch()),
            build_path: self.build_root.join("pg_build").join(&tag),
            install_path: self.build_root.join("pg_install").join(&tag),
        }
    }

    /// Data directory of a data set on the database host
    pub fn data_path(&self, data: &DataSet) -> PathBuf {
        self.data_root.join(format!(
            "pg_tpch_sf{}_blksz{}",
            data.scale_factor, data.block_size
        ))
    }

    /// Parent of all source worktrees; the base branch is the primary clone
    pub fn source_root(&self) -> PathBuf {
        self.build_root.join("pg_src")
    }

    pub fn benchbase_source(&self) -> PathBuf {
        self.build_root.join("benchbase_src")
    }

    pub fn benchbase_install(&self) -> PathBuf {
        self.build_root.join("benchbase_install")
    }

    /// Directory containing `benchbase.jar`
    pub fn benchbase_home(&self) -> PathBuf {
        self.benchbase_install().join("benchbase-postgres")
    }

    pub fn build_root(&self) -> &Path {
        &self.build_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_config;

    #[test]
    fn test_resolve_paths() {
        let reg = VariantRegistry::new(&sample_config());
        let v = reg.variant("pbm2", 32).unwrap();
        let paths = reg.resolve(&v);
        assert_eq!(paths.build_path, PathBuf::from("/build/pg_build/pbm2_32"));
        assert_eq!(paths.install_path, PathBuf::from("/build/pg_install/pbm2_32"));
        assert_eq!(paths.source_path, PathBuf::from("/build/pg_src/pbm2"));
        assert_eq!(paths.bin("pg_ctl"), PathBuf::from("/build/pg_install/pbm2_32/bin/pg_ctl"));
        // pure: resolving twice gives the same answer
        assert_eq!(reg.resolve(&v), paths);
    }

    #[test]
    fn test_data_path_shared_across_branches() {
        let reg = VariantRegistry::new(&sample_config());
        let ds = DataSet::new(8, 10);
        assert_eq!(reg.data_path(&ds), PathBuf::from("/data/pg_tpch_sf10_blksz8"));
        assert_eq!(ds.database(), "TPCH_10");
    }

    #[test]
    fn test_unknown_branch_is_configuration_error() {
        let reg = VariantRegistry::new(&sample_config());
        match reg.variant("nope", 8) {
            Err(HarnessError::Configuration(msg)) => assert!(msg.contains("nope")),
            other => panic!("expected configuration error, got {:?}", other),
        }
        assert!(matches!(reg.variant("base", 16), Err(HarnessError::Configuration(_))));
    }

    #[test]
    fn test_capability_is_per_branch() {
        let reg = VariantRegistry::new(&sample_config());
        assert!(reg.accepts_sampling_param(&reg.variant("pbm2", 8).unwrap()));
        assert!(reg.accepts_sampling_param(&reg.variant("pbm2", 32).unwrap()));
        assert!(!reg.accepts_sampling_param(&reg.variant("base", 8).unwrap()));
    }

    #[test]
    fn test_all_variants_order() {
        let reg = VariantRegistry::new(&sample_config());
        let names: Vec<String> = reg.all().iter().map(|v| v.to_string()).collect();
        assert_eq!(names, vec!["base_8", "pbm2_8", "base_32", "pbm2_32"]);
        assert_eq!(reg.all()[1].results_subdir(), "pbm2_blksz8");
    }
}
