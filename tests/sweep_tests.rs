// tests/sweep_tests.rs
use pgexp_bench::config::HarnessConfig;
use pgexp_bench::results_dir::{TrialConfigRecord, TrialResultsDir};
use pgexp_bench::sweep::SweepDefinition;
use pgexp_bench::trial::Workload;
use pgexp_bench::variant::VariantRegistry;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const HARNESS: &str = r#"
database:
  host: tem112
  user: bench
paths:
  build_root: /home/bench/PG_TESTS
  data_root: /hdd1/pgdata
  results_root: /home/bench/PG_TESTS/results
block_sizes: [8, 32]
branches:
  - name: base
    git_branch: REL_14_STABLE
  - name: pbm1
    git_branch: pbm_part1
    capabilities:
      sampling: true
  - name: pbm2
    git_branch: pbm_part2
    capabilities:
      sampling: true
      pbm_tuning: true
      sample_one: true
"#;

fn registry() -> VariantRegistry {
    let cfg: HarnessConfig = serde_yaml::from_str(HARNESS).unwrap();
    cfg.validate().unwrap();
    VariantRegistry::new(&cfg)
}

#[test]
fn test_sweep_file_expansion() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sampling.yaml");
    fs::write(
        &path,
        r#"
name: sampling
scale_factor: 10
indexes: lineitem_brinonly
clustering: dates
workload: micro
duration: 5m
shared_buffers: [2GB]
sampling: [1, 10]
seeds: [1, 2]
"#,
    )
    .unwrap();

    let sweep = SweepDefinition::load(&path).unwrap();
    assert_eq!(sweep.duration, Duration::from_secs(300));
    let trials = sweep.expand(&registry()).unwrap();

    // per (block size, seed): base x1, pbm1 x1 (n > 1 only), pbm2 x2
    assert_eq!(trials.len(), 2 * 2 * 4);
    assert!(trials[..8].iter().all(|t| t.variant().block_size() == 8));
    assert!(trials[8..].iter().all(|t| t.variant().block_size() == 32));
    assert_eq!(trials[0].workload().seed, Some(1));
    assert_eq!(trials[4].workload().seed, Some(2));
    let branches: Vec<&str> = trials[..4].iter().map(|t| t.variant().branch()).collect();
    assert_eq!(branches, vec!["base", "pbm1", "pbm2", "pbm2"]);
    assert_eq!(trials[1].runtime().pbm_evict_num_samples, Some(10));
    assert!(trials.iter().all(|t| t.workload().workload == Workload::Micro));
}

#[test]
fn test_unknown_sweep_field_rejected() {
    let yaml = "name: x\nscale_factor: 1\nworkload: tpch\nshared_buffers: [1GB]\nshmem: 2GB\n";
    assert!(serde_yaml::from_str::<SweepDefinition>(yaml).is_err());
}

#[test]
fn test_bad_shared_buffers_rejected() {
    let yaml = "name: x\nscale_factor: 1\nworkload: tpch\nshared_buffers: [lots]\n";
    let sweep: SweepDefinition = serde_yaml::from_str(yaml).unwrap();
    assert!(sweep.expand(&registry()).is_err());
}

#[test]
fn test_results_directory_record_matches_trial() {
    let yaml = r#"
name: prewarm
scale_factor: 10
workload: tpch
branches: [pbm2]
block_sizes: [8]
shared_buffers: [4GB]
terminals: [4]
prewarm: [false, true]
count_multiplier_total: 16
"#;
    let sweep: SweepDefinition = serde_yaml::from_str(yaml).unwrap();
    let trials = sweep.expand(&registry()).unwrap();
    assert_eq!(trials.len(), 2);
    assert!(trials[1].workload().prewarm);

    let root = TempDir::new().unwrap();
    let a = TrialResultsDir::create(root.path(), "prewarm", &trials[0]).unwrap();
    let b = TrialResultsDir::create(root.path(), "prewarm", &trials[1]).unwrap();
    assert_ne!(a.path(), b.path());

    let text = fs::read_to_string(b.path().join("test_config.json")).unwrap();
    let record: TrialConfigRecord = serde_json::from_str(&text).unwrap();
    assert_eq!(record, TrialConfigRecord::new("prewarm", &trials[1]));
    assert_eq!(record.count_multiplier, Some(4));
    assert_eq!(record.parallelism, 4);
    assert!(record.prewarm);
    assert_eq!(record.runtime.shared_buffers, "4GB");
}
