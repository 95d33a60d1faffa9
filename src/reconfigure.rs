// src/reconfigure.rs
//! Structural changes to a data set: index sets and table clustering.
//!
//! DDL lives on disk under the DDL root:
//! - `index/<name>/create.sql` and `index/<name>/drop.sql`
//! - `cluster/<name>.sql`
//! - `create-tables-noindex.sql`
//!
//! Work is skipped whenever the requested state equals the recorded one. The
//! caller must have the server running, and records the new state only after
//! [`ReconfigurationEngine::apply`] returns `Ok`.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};

use crate::config::HarnessConfig;
use crate::constants;
use crate::error::HarnessError;
use crate::state_cache::DbSetup;
use crate::variant::DataSet;

/// Executes a batch of SQL statements against one database
pub trait SqlExecutor {
    fn execute(&mut self, sql: &str) -> Result<()>;
}

/// Runs SQL through the `psql` client with ON_ERROR_STOP, one batch per call
pub struct PsqlExecutor {
    psql: String,
    host: String,
    port: u16,
    user: String,
    password: String,
    database: String,
}

impl PsqlExecutor {
    pub fn new(cfg: &HarnessConfig, host: &str, database: &str) -> Self {
        Self {
            psql: cfg.psql_bin.clone(),
            host: host.to_string(),
            port: cfg.database.port,
            user: cfg.database.user.clone(),
            password: cfg.database.password(),
            database: database.to_string(),
        }
    }
}

impl SqlExecutor for PsqlExecutor {
    fn execute(&mut self, sql: &str) -> Result<()> {
        debug!("psql {}@{}/{}: {} bytes of SQL", self.user, self.host, self.database, sql.len());
        let mut child = Command::new(&self.psql)
            .args(["-X", "-q", "-v", "ON_ERROR_STOP=1"])
            .arg("-h")
            .arg(&self.host)
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-U")
            .arg(&self.user)
            .arg("-d")
            .arg(&self.database)
            .args(["-f", "-"])
            .env("PGPASSWORD", &self.password)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute {}. Is it installed?", self.psql))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(sql.as_bytes()).context("Failed to write SQL to psql")?;
        }

        let output = child.wait_with_output().context("Failed to wait for psql")?;
        if !output.status.success() {
            bail!(
                "psql exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Opens an executor bound to one data set's database
pub trait SqlConnect {
    fn connect(&self, data: &DataSet) -> Box<dyn SqlExecutor>;

    /// Maintenance connection on the same server (database creation)
    fn connect_admin(&self, data: &DataSet) -> Box<dyn SqlExecutor>;
}

/// Connects through psql to `host`
pub struct PsqlConnector {
    cfg: HarnessConfig,
    host: String,
}

impl PsqlConnector {
    pub fn new(cfg: &HarnessConfig, host: &str) -> Self {
        Self {
            cfg: cfg.clone(),
            host: host.to_string(),
        }
    }
}

impl SqlConnect for PsqlConnector {
    fn connect(&self, data: &DataSet) -> Box<dyn SqlExecutor> {
        Box::new(PsqlExecutor::new(&self.cfg, &self.host, &data.database()))
    }

    fn connect_admin(&self, _data: &DataSet) -> Box<dyn SqlExecutor> {
        Box::new(PsqlExecutor::new(&self.cfg, &self.host, "postgres"))
    }
}

/// BRIN pages per range for a scale factor
pub fn pages_per_range(scale_factor: u32) -> f64 {
    constants::BASE_PAGES_PER_RANGE as f64 / scale_factor as f64
}

/// DDL scripts on disk
#[derive(Debug, Clone)]
pub struct DdlLibrary {
    root: PathBuf,
}

impl DdlLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, rel: &Path) -> Result<String, HarnessError> {
        let path = self.root.join(rel);
        std::fs::read_to_string(&path).map_err(|e| {
            HarnessError::Configuration(format!("cannot read DDL script {}: {}", path.display(), e))
        })
    }

    pub fn index_create(&self, name: &str, scale_factor: u32) -> Result<String, HarnessError> {
        let sql = self.read(&Path::new("index").join(name).join("create.sql"))?;
        Ok(sql.replace(
            constants::PAGES_PER_RANGE_PLACEHOLDER,
            &pages_per_range(scale_factor).to_string(),
        ))
    }

    pub fn index_drop(&self, name: &str) -> Result<String, HarnessError> {
        self.read(&Path::new("index").join(name).join("drop.sql"))
    }

    pub fn cluster(&self, name: &str) -> Result<String, HarnessError> {
        self.read(&Path::new("cluster").join(format!("{}.sql", name)))
    }

    pub fn create_tables(&self) -> Result<String, HarnessError> {
        self.read(Path::new("create-tables-noindex.sql"))
    }
}

pub struct ReconfigurationEngine {
    ddl: DdlLibrary,
}

impl ReconfigurationEngine {
    pub fn new(ddl: DdlLibrary) -> Self {
        Self { ddl }
    }

    pub fn ddl(&self) -> &DdlLibrary {
        &self.ddl
    }

    fn run(sql: &mut dyn SqlExecutor, step: String, stmts: &str) -> Result<()> {
        sql.execute(stmts)
            .map_err(|e| HarnessError::reconfig(step, format!("{:#}", e)).into())
    }

    /// Drop an index set (if any)
    pub fn drop_indexes(&self, sql: &mut dyn SqlExecutor, name: Option<&str>) -> Result<()> {
        if let Some(name) = name {
            let stmts = self.ddl.index_drop(name)?;
            Self::run(sql, format!("drop indexes {}", name), &stmts)?;
        }
        Ok(())
    }

    /// Replace index set `prev` by `new`. Returns whether anything was executed.
    pub fn reconfigure_indexes(
        &self,
        sql: &mut dyn SqlExecutor,
        scale_factor: u32,
        prev: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool> {
        if prev == new {
            info!("Using the same indexes as previously ({:?}), skipping...", prev);
            return Ok(false);
        }

        // Load both scripts before touching the database
        let create = new
            .map(|n| self.ddl.index_create(n, scale_factor).map(|s| (n, s)))
            .transpose()?;

        info!("Dropping indexes {:?} first if they exist...", prev);
        self.drop_indexes(sql, prev)?;

        if let Some((name, stmts)) = create {
            info!("Creating indexes: {}", name);
            Self::run(sql, format!("create indexes {}", name), &stmts)?;
        }
        Ok(true)
    }

    /// Re-cluster tables with script `new` unless it was the last one applied.
    pub fn reconfigure_clustering(
        &self,
        sql: &mut dyn SqlExecutor,
        prev: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool> {
        if prev == new {
            info!("Using the same clustering as previously ({:?}), skipping...", prev);
            return Ok(false);
        }

        if let Some(name) = new {
            let stmts = self.ddl.cluster(name)?;
            info!("Clustering tables: {}", name);
            Self::run(sql, format!("cluster {}", name), &stmts)?;
        }
        Ok(true)
    }

    /// Bring a data set from `current` to `target`: indexes first, then clustering.
    /// Stops at the first failing step.
    pub fn apply(
        &self,
        sql: &mut dyn SqlExecutor,
        scale_factor: u32,
        current: &DbSetup,
        target: &DbSetup,
    ) -> Result<bool> {
        let idx = self.reconfigure_indexes(
            sql,
            scale_factor,
            current.indexes.as_deref(),
            target.indexes.as_deref(),
        )?;
        let clu = self.reconfigure_clustering(
            sql,
            current.clustering.as_deref(),
            target.clustering.as_deref(),
        )?;
        Ok(idx || clu)
    }
}
