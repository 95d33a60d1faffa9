// src/runner.rs
//! One trial, end to end.
//!
//! 1. Bring every data set of the trial's scale factor to the requested index and
//!    clustering state (base build, large memory budget), then record it.
//! 2. Create the results directory and the load generator configuration.
//! 3. Push the trial's runtime configuration, start, run the load, stop.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;

use crate::config::HarnessConfig;
use crate::constants;
use crate::lifecycle::ClusterController;
use crate::loadgen::LoadGenerator;
use crate::reconfigure::{DdlLibrary, ReconfigurationEngine, SqlConnect};
use crate::remote::{shell_quote, RemoteExec};
use crate::results_dir::TrialResultsDir;
use crate::scheduler::TrialExecutor;
use crate::state_cache::{DbSetup, DbStateStore};
use crate::trial::{RuntimeConfig, TrialSpec};
use crate::variant::{DataSet, VariantRegistry};

pub struct TrialRunner<R: RemoteExec, L: LoadGenerator, C: SqlConnect> {
    controller: ClusterController<R>,
    registry: VariantRegistry,
    engine: ReconfigurationEngine,
    state: DbStateStore,
    loadgen: L,
    sql: C,
    results_root: PathBuf,
    command_timeout: Duration,
}

impl<R: RemoteExec, L: LoadGenerator, C: SqlConnect> TrialRunner<R, L, C> {
    pub fn new(cfg: &HarnessConfig, remote: R, loadgen: L, sql: C) -> Self {
        Self {
            controller: ClusterController::new(remote, cfg),
            registry: VariantRegistry::new(cfg),
            engine: ReconfigurationEngine::new(DdlLibrary::new(&cfg.paths.ddl_root)),
            state: DbStateStore::new(&cfg.paths.state_dir),
            loadgen,
            sql,
            results_root: cfg.paths.results_root.clone(),
            command_timeout: cfg.timeouts.command,
        }
    }

    pub fn controller(&self) -> &ClusterController<R> {
        &self.controller
    }

    pub fn state(&self) -> &DbStateStore {
        &self.state
    }

    /// Bring all data sets at `sf` from the recorded state to `target`.
    /// The caches are updated only after every block size succeeded.
    pub fn prepare_state(&mut self, sf: u32, target: &DbSetup) -> Result<bool> {
        let current = self.state.current(sf)?;
        if current == *target {
            info!(
                "sf {} already has indexes={:?} clustering={:?}",
                sf, target.indexes, target.clustering
            );
            return Ok(false);
        }

        let block_sizes = self.registry.block_sizes().to_vec();
        for blk in block_sizes {
            let data = DataSet::new(blk, sf);
            let base = self.registry.base(blk)?;
            info!(
                "~~~~~~~~~~ Setup indexes={:?}, clustering={:?} for blk_sz={}, sf={} ~~~~~~~~~~",
                target.indexes, target.clustering, blk, sf
            );

            self.controller
                .configure(&data, &RuntimeConfig::for_reconfiguration())?;
            let engine = &self.engine;
            let sql = &self.sql;
            self.controller.with_started(&base, &data, || {
                let mut exec = sql.connect(&data);
                engine.apply(exec.as_mut(), sf, &current, target)
            })?;
        }

        self.state.record(sf, target)?;
        Ok(true)
    }

    /// Drop index set `name` from every data set at `sf`, then record "no indexes".
    /// Used to clean up after a failed reconfiguration.
    pub fn drop_indexes(&mut self, sf: u32, name: &str) -> Result<()> {
        let block_sizes = self.registry.block_sizes().to_vec();
        for blk in block_sizes {
            let data = DataSet::new(blk, sf);
            let base = self.registry.base(blk)?;
            info!(
                "~~~~~~~~~~ Dropping indexes from index/{}/ for blk_sz={}, sf={} ~~~~~~~~~~",
                name, blk, sf
            );
            let engine = &self.engine;
            let sql = &self.sql;
            self.controller.with_started(&base, &data, || {
                let mut exec = sql.connect(&data);
                engine.drop_indexes(exec.as_mut(), Some(name))
            })?;
        }
        self.state.indexes.set(sf, None)?;
        info!("~~~~~~~~~~ Specified indexes have been dropped ~~~~~~~~~~");
        Ok(())
    }

    /// `requested` with every unspecified field taken from the recorded state,
    /// so leaving out an index set or clustering keeps what is installed.
    pub fn effective_setup(&self, sf: u32, requested: &DbSetup) -> Result<DbSetup> {
        let current = self.state.current(sf)?;
        Ok(DbSetup {
            indexes: requested.indexes.clone().or(current.indexes),
            clustering: requested.clustering.clone().or(current.clustering),
        })
    }

    /// Re-cluster every data set at `sf`. Indexes default to the recorded set.
    pub fn recluster(&mut self, sf: u32, clustering: &str, indexes: Option<&str>) -> Result<()> {
        let target = self.effective_setup(sf, &DbSetup::new(indexes, Some(clustering)))?;
        self.prepare_state(sf, &target)?;
        Ok(())
    }

    /// Recreate the data set of every block size at `sf` from scratch with the
    /// base build and load it: tables without indexes, autovacuum suspended on the
    /// bulk-loaded tables while loading, statistics refreshed afterwards. The
    /// caches then record "no indexes, no clustering".
    pub fn generate_test_data(&mut self, sf: u32, scratch: &Path) -> Result<()> {
        let block_sizes = self.registry.block_sizes().to_vec();
        for blk in block_sizes {
            let data = DataSet::new(blk, sf);
            let base = self.registry.base(blk)?;
            let data_dir = self.registry.data_path(&data);
            info!("~~~~~~~~~~ Generating test data for blk_sz={}, sf={} ~~~~~~~~~~", blk, sf);

            self.controller.remote().run_checked(
                &format!("rm -rf {}", shell_quote(data_dir.to_string_lossy())),
                self.command_timeout,
            )?;
            self.controller.initialize(&base, &data)?;
            self.controller
                .configure(&data, &RuntimeConfig::for_reconfiguration())?;

            let ddl = self.engine.ddl();
            let sql = &self.sql;
            let loadgen = &self.loadgen;
            self.controller.with_started(&base, &data, || {
                sql.connect_admin(&data)
                    .execute(&format!("CREATE DATABASE \"{}\";", data.database()))?;
                let mut exec = sql.connect(&data);
                exec.execute(&ddl.create_tables()?)?;
                for table in constants::BULK_LOADED_TABLES {
                    exec.execute(&format!("ALTER TABLE {} SET (autovacuum_enabled = false);", table))?;
                }
                loadgen.load_data(&data, scratch)?;
                for table in constants::BULK_LOADED_TABLES {
                    exec.execute(&format!("ALTER TABLE {} SET (autovacuum_enabled = true);", table))?;
                }
                for table in constants::BULK_LOADED_TABLES {
                    exec.execute(&format!("ANALYZE {};", table))?;
                }
                Ok(())
            })?;
        }

        self.state.record(sf, &DbSetup::default())?;
        info!("~~~~~~~~~~ Test data generated for sf={} ~~~~~~~~~~", sf);
        Ok(())
    }

    /// Run one trial into a fresh results directory and return its path
    pub fn run(&mut self, experiment: &str, trial: &TrialSpec) -> Result<PathBuf> {
        let started = Instant::now();
        let sf = trial.dataset().scale_factor;
        let setup = self.effective_setup(sf, trial.setup())?;
        self.prepare_state(sf, &setup)?;
        let trial = trial.clone().with_setup(setup);

        let mut dir = TrialResultsDir::create(&self.results_root, experiment, &trial)?;
        dir.write_metadata()?;
        self.run_one(&trial, &dir)?;
        dir.finalize(started.elapsed().as_secs_f64())?;
        Ok(dir.path().to_path_buf())
    }

    fn run_one(&mut self, trial: &TrialSpec, dir: &TrialResultsDir) -> Result<()> {
        let config_path = dir.loadgen_config_path();
        self.loadgen.write_config(trial, &config_path)?;
        let out = dir.variant_dir(trial)?;

        self.controller.configure(trial.dataset(), trial.runtime())?;
        let loadgen = &self.loadgen;
        self.controller
            .with_started(trial.variant(), trial.dataset(), || {
                loadgen.run_trial(trial, &config_path, &out)
            })
    }

    pub fn results_root(&self) -> &Path {
        &self.results_root
    }
}

impl<R: RemoteExec, L: LoadGenerator, C: SqlConnect> TrialExecutor for TrialRunner<R, L, C> {
    fn execute(&mut self, experiment: &str, trial: &TrialSpec) -> Result<()> {
        self.run(experiment, trial).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{is_kind, HarnessError};
    use crate::reconfigure::SqlExecutor;
    use crate::test_support::{sample_config, FakeRemote};
    use crate::trial::{Workload, WorkloadConfig};
    use anyhow::bail;
    use std::cell::RefCell;
    use std::fs;
    use std::rc::Rc;
    use tempfile::TempDir;

    type Log = Rc<RefCell<Vec<String>>>;

    struct SharedSql {
        log: Log,
        db: String,
    }

    impl SqlExecutor for SharedSql {
        fn execute(&mut self, sql: &str) -> Result<()> {
            self.log.borrow_mut().push(format!("{}: {}", self.db, sql));
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct SharedConnector {
        log: Log,
    }

    impl SqlConnect for SharedConnector {
        fn connect(&self, data: &DataSet) -> Box<dyn SqlExecutor> {
            Box::new(SharedSql {
                log: self.log.clone(),
                db: data.to_string(),
            })
        }

        fn connect_admin(&self, _data: &DataSet) -> Box<dyn SqlExecutor> {
            Box::new(SharedSql {
                log: self.log.clone(),
                db: "postgres".into(),
            })
        }
    }

    #[derive(Clone, Default)]
    struct FakeLoad {
        runs: Log,
        fail: bool,
    }

    impl LoadGenerator for FakeLoad {
        fn write_config(&self, _trial: &TrialSpec, path: &Path) -> Result<()> {
            fs::write(path, "<parameters/>")?;
            Ok(())
        }

        fn run_trial(&self, trial: &TrialSpec, _config: &Path, out: &Path) -> Result<()> {
            self.runs.borrow_mut().push(trial.variant().to_string());
            if self.fail {
                bail!("BenchBase exited with 1");
            }
            fs::write(out.join("summary.json"), "{}")?;
            Ok(())
        }

        fn load_data(&self, data: &DataSet, _scratch: &Path) -> Result<()> {
            self.runs.borrow_mut().push(format!("load {}", data));
            Ok(())
        }
    }

    struct Fixture {
        _tmp: TempDir,
        cfg: HarnessConfig,
        remote: FakeRemote,
        sql: SharedConnector,
        load: FakeLoad,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let ddl = tmp.path().join("ddl");
        fs::create_dir_all(ddl.join("index/btree")).unwrap();
        fs::write(ddl.join("index/btree/create.sql"), "CREATE INDEX b;").unwrap();
        fs::write(ddl.join("index/btree/drop.sql"), "DROP INDEX b;").unwrap();
        fs::create_dir_all(ddl.join("cluster")).unwrap();
        fs::write(ddl.join("cluster/dates.sql"), "CLUSTER lineitem;").unwrap();

        let mut cfg = sample_config();
        cfg.paths.ddl_root = ddl;
        cfg.paths.results_root = tmp.path().join("results");
        cfg.paths.state_dir = tmp.path().join("state");

        let remote = FakeRemote::default()
            .with_file("/data/pg_tpch_sf10_blksz8/postgresql.conf", "")
            .with_file("/data/pg_tpch_sf10_blksz32/postgresql.conf", "");
        Fixture {
            _tmp: tmp,
            cfg,
            remote,
            sql: SharedConnector::default(),
            load: FakeLoad::default(),
        }
    }

    fn trial(cfg: &HarnessConfig, setup: DbSetup) -> TrialSpec {
        let reg = VariantRegistry::new(cfg);
        TrialSpec::new(
            reg.variant("pbm2", 8).unwrap(),
            DataSet::new(8, 10),
            RuntimeConfig::builder("2GB").build().unwrap(),
            WorkloadConfig::new(Workload::Micro, 8),
            setup,
        )
        .unwrap()
    }

    #[test]
    fn test_reconfigures_every_block_size_then_records() {
        let f = fixture();
        let mut runner = TrialRunner::new(&f.cfg, f.remote.clone(), f.load.clone(), f.sql.clone());
        let setup = DbSetup::new(Some("btree"), Some("dates"));
        runner.execute("e", &trial(&f.cfg, setup.clone())).unwrap();

        let log = f.sql.log.borrow().clone();
        assert_eq!(
            log,
            vec![
                "sf10_blksz8: CREATE INDEX b;",
                "sf10_blksz8: CLUSTER lineitem;",
                "sf10_blksz32: CREATE INDEX b;",
                "sf10_blksz32: CLUSTER lineitem;",
            ]
        );
        assert_eq!(runner.state().current(10).unwrap(), setup);

        // reconfiguration ran on the base build with the large memory budget
        let cmds = f.remote.commands();
        assert!(cmds.iter().any(|c| c.contains("pg_install/base_32/bin/pg_ctl")));
        assert_eq!(*f.load.runs.borrow(), vec!["pbm2_8".to_string()]);
    }

    #[test]
    fn test_unchanged_state_skips_reconfiguration() {
        let f = fixture();
        let mut runner = TrialRunner::new(&f.cfg, f.remote.clone(), f.load.clone(), f.sql.clone());
        let t = trial(&f.cfg, DbSetup::default());
        runner.execute("e", &t).unwrap();
        runner.execute("e", &t).unwrap();
        assert!(f.sql.log.borrow().is_empty());
        // one start and one stop per trial, nothing else
        let starts = f.remote.commands().iter().filter(|c| c.contains("pg_ctl") && c.contains(" start ")).count();
        assert_eq!(starts, 2);
    }

    #[test]
    fn test_results_layout() {
        let f = fixture();
        let mut runner = TrialRunner::new(&f.cfg, f.remote.clone(), f.load.clone(), f.sql.clone());
        let dir = runner.run("e", &trial(&f.cfg, DbSetup::default())).unwrap();
        assert!(dir.join("test_config.json").exists());
        assert!(dir.join("bbase_config.xml").exists());
        assert!(dir.join("metadata.json").exists());
        assert!(dir.join("pbm2_blksz8/summary.json").exists());
        let conf = f.remote.file("/data/pg_tpch_sf10_blksz8/postgresql.conf").unwrap();
        assert!(conf.contains("shared_buffers = '2GB'"));
    }

    #[test]
    fn test_failed_start_leaves_cache_and_skips_load() {
        let f = fixture();
        f.remote.fail_when(" start ");
        let mut runner = TrialRunner::new(&f.cfg, f.remote.clone(), f.load.clone(), f.sql.clone());
        let err = runner
            .execute("e", &trial(&f.cfg, DbSetup::new(Some("btree"), None)))
            .unwrap_err();
        assert!(is_kind(&err, |e| matches!(e, HarnessError::ServiceStart { .. })));
        assert_eq!(runner.state().current(10).unwrap(), DbSetup::default());
        assert!(f.load.runs.borrow().is_empty());
    }

    #[test]
    fn test_load_failure_still_stops_server() {
        let mut f = fixture();
        f.load.fail = true;
        let mut runner = TrialRunner::new(&f.cfg, f.remote.clone(), f.load.clone(), f.sql.clone());
        assert!(runner.execute("e", &trial(&f.cfg, DbSetup::default())).is_err());
        assert!(f.remote.commands().last().unwrap().contains(" stop "));
        assert!(runner.controller().active().is_none());
    }

    #[test]
    fn test_recluster_keeps_recorded_indexes_then_drop() {
        let f = fixture();
        let mut runner = TrialRunner::new(&f.cfg, f.remote.clone(), f.load.clone(), f.sql.clone());
        runner.state().indexes.set(10, Some("btree")).unwrap();

        runner.recluster(10, "dates", None).unwrap();
        assert_eq!(runner.state().current(10).unwrap(), DbSetup::new(Some("btree"), Some("dates")));
        assert_eq!(f.sql.log.borrow().len(), 2);

        runner.drop_indexes(10, "btree").unwrap();
        assert_eq!(runner.state().current(10).unwrap(), DbSetup::new(None, Some("dates")));
        assert!(f.sql.log.borrow().last().unwrap().ends_with("DROP INDEX b;"));
    }

    #[test]
    fn test_generate_test_data() {
        let f = fixture();
        fs::write(f.cfg.paths.ddl_root.join("create-tables-noindex.sql"), "CREATE TABLE lineitem ();").unwrap();
        f.remote.fail_when("PG_VERSION");
        let remote = f
            .remote
            .clone()
            .with_file("/data/pg_tpch_sf10_blksz8/pg_hba.conf", "")
            .with_file("/data/pg_tpch_sf10_blksz32/pg_hba.conf", "");
        let mut runner = TrialRunner::new(&f.cfg, remote, f.load.clone(), f.sql.clone());
        runner.state().indexes.set(10, Some("btree")).unwrap();

        let scratch = TempDir::new().unwrap();
        runner.generate_test_data(10, scratch.path()).unwrap();

        let log = f.sql.log.borrow().clone();
        assert_eq!(log.len(), 2 * 11);
        assert_eq!(log[0], "postgres: CREATE DATABASE \"TPCH_10\";");
        assert_eq!(log[1], "sf10_blksz8: CREATE TABLE lineitem ();");
        assert_eq!(log[10], "sf10_blksz8: ANALYZE partsupp;");
        assert_eq!(*f.load.runs.borrow(), vec!["load sf10_blksz8", "load sf10_blksz32"]);
        assert_eq!(runner.state().current(10).unwrap(), DbSetup::default());

        let cmds = f.remote.commands();
        assert!(cmds[0].starts_with("rm -rf /data/pg_tpch_sf10_blksz8"));
        assert!(cmds.iter().any(|c| c.contains("pg_install/base_8/bin/initdb")));
    }

    #[test]
    fn test_unspecified_setup_keeps_recorded_state() {
        let f = fixture();
        let mut runner = TrialRunner::new(&f.cfg, f.remote.clone(), f.load.clone(), f.sql.clone());
        let recorded = DbSetup::new(Some("btree"), Some("dates"));
        runner.state().record(10, &recorded).unwrap();

        let dir = runner.run("e", &trial(&f.cfg, DbSetup::default())).unwrap();
        assert!(f.sql.log.borrow().is_empty());
        assert_eq!(runner.state().current(10).unwrap(), recorded);

        let record: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join("test_config.json")).unwrap()).unwrap();
        assert_eq!(record["indexes"], "btree");
        assert_eq!(record["clustering"], "dates");

        // naming only the clustering keeps the recorded indexes
        runner.execute("e", &trial(&f.cfg, DbSetup::new(None, Some("dates")))).unwrap();
        assert_eq!(runner.state().current(10).unwrap(), recorded);
    }
}
