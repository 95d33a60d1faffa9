// -----------------------------------------------------------------------------
// pgexp-bench - PostgreSQL buffer-manager experiment harness
// -----------------------------------------------------------------------------

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use pgexp_bench::aggregate::{self, AggregateSpec};
use pgexp_bench::collect::{self, ResultsNormalizer};
use pgexp_bench::config::HarnessConfig;
use pgexp_bench::constants;
use pgexp_bench::loadgen::BenchBase;
use pgexp_bench::reconfigure::PsqlConnector;
use pgexp_bench::remote::{LocalShell, SshRemote};
use pgexp_bench::runner::TrialRunner;
use pgexp_bench::scheduler::ExperimentScheduler;
use pgexp_bench::setup::BuildManager;
use pgexp_bench::state_cache::DbSetup;
use pgexp_bench::sweep::SweepDefinition;
use pgexp_bench::trial::{RuntimeConfig, TrialSpec, Workload, WorkloadConfig};
use pgexp_bench::variant::{DataSet, VariantRegistry};

// -----------------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------------
#[derive(Parser)]
#[command(name = "pgexp-bench", version, about = "PostgreSQL buffer-manager experiment harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Harness configuration (YAML)
    #[arg(short, long, default_value = "pgexp.yaml", global = true)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone, configure, build and install every PostgreSQL variant
    PgSetup,
    /// Pull every source tree and rebuild
    PgUpdate,
    /// `make clean` the variant builds
    PgClean {
        /// Also clean the base branch builds
        #[arg(long)]
        include_base: bool,
    },
    /// Clone, build and unpack BenchBase
    BenchbaseSetup,
    /// Recreate and load the data set of every block size at a scale factor
    GenTestData {
        #[arg(long)]
        sf: u32,
    },
    /// Drop an index set from every data set at a scale factor
    DropIndexes {
        #[arg(long)]
        sf: u32,
        #[arg(long = "index-type")]
        index_type: String,
    },
    /// Re-cluster every data set at a scale factor
    Recluster {
        #[arg(long)]
        sf: u32,
        #[arg(long)]
        cluster: String,
        /// Index set to build first (defaults to the recorded one)
        #[arg(long = "index-type")]
        index_type: Option<String>,
    },
    /// One ad-hoc trial per configured block size and branch
    ///
    /// Example:
    ///   pgexp-bench bench --sf 10 --workload micro --index-type btree --shmem 2GB
    Bench {
        #[arg(long, default_value_t = 10)]
        sf: u32,
        #[arg(long, default_value = "tpch")]
        workload: String,
        /// Index set (default: keep the recorded one)
        #[arg(long = "index-type")]
        index_type: Option<String>,
        /// Clustering (default: keep the recorded one)
        #[arg(long)]
        cluster: Option<String>,
        #[arg(long, default_value = "2GB")]
        shmem: String,
        #[arg(long, default_value_t = constants::DEFAULT_TERMINALS)]
        parallelism: u32,
        /// Run time per trial in seconds
        #[arg(long, default_value_t = constants::DEFAULT_TRIAL_DURATION.as_secs())]
        time: u64,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        count_multiplier: Option<u32>,
        #[arg(long)]
        selectivity: Option<f64>,
        /// Restrict to these branches (default: all)
        #[arg(long, value_delimiter = ',')]
        branches: Vec<String>,
        #[arg(long)]
        no_syncscans: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Run a sweep declared in YAML
    ///
    /// Examples:
    ///   pgexp-bench sweep sweeps/parallelism.yaml --dry-run
    ///   pgexp-bench sweep sweeps/parallelism.yaml --resume-from 12
    Sweep {
        file: PathBuf,
        #[arg(long)]
        dry_run: bool,
        /// Skip the first N trials (they completed in an earlier run)
        #[arg(long)]
        resume_from: Option<usize>,
    },
    /// Normalize every results directory into one CSV
    Collect {
        /// Results root (default: paths.results_root)
        root: Option<PathBuf>,
        #[arg(default_value = "results.csv")]
        out: PathBuf,
        /// Keep directory traversal order instead of sorting by name
        #[arg(long)]
        no_sort: bool,
    },
    /// Replicate mean and 95% confidence interval of a metric
    Aggregate {
        csv: PathBuf,
        #[arg(long)]
        metric: String,
        #[arg(long)]
        x: String,
        #[arg(long, default_value = "seed")]
        replicate: String,
        #[arg(long, default_value = "aggregate.csv")]
        out: PathBuf,
    },
}

// -----------------------------------------------------------------------------
// main
// -----------------------------------------------------------------------------
fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::new(format!("pgexp_bench={}", level));
    fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Collect { root, out, no_sort } => {
            // Runs without a harness config when a root is given
            let (root, ignore) = match root {
                Some(r) => {
                    let ignore = load_config(&cli.config)
                        .map(|c| c.ignore_results)
                        .unwrap_or_default();
                    (r, ignore)
                }
                None => {
                    let cfg = load_config(&cli.config)?;
                    (cfg.paths.results_root, cfg.ignore_results)
                }
            };
            collect_cmd(&root, &out, &ignore, !no_sort)
        }
        Commands::Aggregate { csv, metric, x, replicate, out } => {
            aggregate_cmd(&csv, AggregateSpec { metric, x, replicate }, &out)
        }
        command => {
            let cfg = load_config(&cli.config)?;
            run_host_command(&cfg, command)
        }
    }
}

fn load_config(path: &Path) -> Result<HarnessConfig> {
    HarnessConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))
}

type SshRunner = TrialRunner<SshRemote, BenchBase, PsqlConnector>;

fn connect_runner(cfg: &HarnessConfig) -> Result<SshRunner> {
    let remote = SshRemote::connect(&cfg.database.host, &cfg.ssh)
        .with_context(|| format!("Failed to connect to {}", cfg.database.host))?;
    Ok(TrialRunner::new(
        cfg,
        remote,
        BenchBase::new(cfg),
        PsqlConnector::new(cfg, &cfg.database.host),
    ))
}

/// Local runner for actions executed on the database host itself
fn local_runner(cfg: &HarnessConfig) -> TrialRunner<LocalShell, BenchBase, PsqlConnector> {
    TrialRunner::new(cfg, LocalShell, BenchBase::new(cfg), PsqlConnector::new(cfg, "localhost"))
}

fn run_host_command(cfg: &HarnessConfig, command: Commands) -> Result<()> {
    match command {
        Commands::PgSetup => BuildManager::new(LocalShell, cfg).setup_all(),
        Commands::PgUpdate => BuildManager::new(LocalShell, cfg).update_all(),
        Commands::PgClean { include_base } => BuildManager::new(LocalShell, cfg).clean_all(include_base),
        Commands::BenchbaseSetup => BuildManager::new(LocalShell, cfg).setup_benchbase(),
        Commands::GenTestData { sf } => {
            let scratch = tempfile::TempDir::new().context("Failed to create scratch directory")?;
            local_runner(cfg).generate_test_data(sf, scratch.path())
        }
        Commands::DropIndexes { sf, index_type } => connect_runner(cfg)?.drop_indexes(sf, &index_type),
        Commands::Recluster { sf, cluster, index_type } => {
            connect_runner(cfg)?.recluster(sf, &cluster, index_type.as_deref())
        }
        Commands::Bench {
            sf,
            workload,
            index_type,
            cluster,
            shmem,
            parallelism,
            time,
            seed,
            count_multiplier,
            selectivity,
            branches,
            no_syncscans,
            dry_run,
        } => {
            let mut workload = WorkloadConfig::new(Workload::parse(&workload)?, parallelism)
                .with_duration(Duration::from_secs(time))
                .with_seed(seed)
                .with_selectivity(selectivity);
            if let Some(m) = count_multiplier {
                workload = workload.with_multiplier(m);
            }
            let setup = DbSetup::new(index_type.as_deref(), cluster.as_deref());
            let trials = bench_trials(cfg, &branches, sf, &shmem, !no_syncscans, &workload, &setup)?;
            let name = format!("bench_sf{}", sf);
            if dry_run {
                ExperimentScheduler::new(DryRun).run(&name, &trials, true)?;
                return Ok(());
            }
            let report = ExperimentScheduler::new(connect_runner(cfg)?).run(&name, &trials, false)?;
            info!("{} trials completed", report.trials.len());
            Ok(())
        }
        Commands::Sweep { file, dry_run, resume_from } => {
            let sweep = SweepDefinition::load(&file)?;
            let trials = sweep.expand(&VariantRegistry::new(cfg))?;
            info!("Sweep {} expands to {} trials", sweep.name, trials.len());
            let done = resume_from.unwrap_or(0);
            if dry_run {
                ExperimentScheduler::new(DryRun).resume(&sweep.name, done, trials, true)?;
                return Ok(());
            }
            let mut scheduler = ExperimentScheduler::new(connect_runner(cfg)?);
            if let Err(e) = scheduler.resume(&sweep.name, done, trials, false) {
                warn!(
                    "Sweep stopped after {} successful trials in this run; resume with --resume-from {}",
                    scheduler.run_counter(),
                    done + scheduler.run_counter() as usize
                );
                return Err(e);
            }
            Ok(())
        }
        Commands::Collect { .. } | Commands::Aggregate { .. } => {
            bail!("command does not need a database host")
        }
    }
}

/// Executor for dry runs; the scheduler never calls it
struct DryRun;

impl pgexp_bench::scheduler::TrialExecutor for DryRun {
    fn execute(&mut self, _experiment: &str, trial: &TrialSpec) -> Result<()> {
        bail!("dry run must not execute {}", trial)
    }
}

fn bench_trials(
    cfg: &HarnessConfig,
    branches: &[String],
    sf: u32,
    shmem: &str,
    synchronize_seqscans: bool,
    workload: &WorkloadConfig,
    setup: &DbSetup,
) -> Result<Vec<TrialSpec>> {
    let registry = VariantRegistry::new(cfg);
    let branches: Vec<String> = if branches.is_empty() {
        registry.branch_names().map(str::to_string).collect()
    } else {
        branches.to_vec()
    };
    let mut trials = Vec::new();
    for &blk in registry.block_sizes() {
        for branch in &branches {
            let variant = registry.variant(branch, blk)?;
            let runtime = RuntimeConfig::builder(shmem)
                .synchronize_seqscans(synchronize_seqscans)
                .build_for(&variant)?;
            trials.push(TrialSpec::new(
                variant,
                DataSet::new(blk, sf),
                runtime,
                workload.clone(),
                setup.clone(),
            )?);
        }
    }
    Ok(trials)
}

fn collect_cmd(root: &Path, out: &Path, ignore: &[String], sort: bool) -> Result<()> {
    let rows = ResultsNormalizer::new(root, ignore)?.with_sorting(sort).collect()?;
    collect::write_csv(&rows, out)?;
    println!("{} rows written to {}", rows.len(), out.display());
    Ok(())
}

fn aggregate_cmd(csv: &Path, spec: AggregateSpec, out: &Path) -> Result<()> {
    let rows = aggregate::read_rows(csv)?;
    let points = aggregate::aggregate(&rows, &spec)?;
    aggregate::write_points(&points, &spec, out)?;
    println!("{} points written to {}", points.len(), out.display());
    Ok(())
}
