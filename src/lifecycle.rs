// src/lifecycle.rs
//! Database service lifecycle on the database host.
//!
//! push config → start → (work) → stop, plus one-time initialization of a data
//! directory. At most one instance is active per controller; [`ClusterController::with_started`]
//! guarantees the stop after a start even when the work in between fails.

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::{HarnessConfig, TimeoutConfig};
use crate::constants;
use crate::error::HarnessError;
use crate::pgconf;
use crate::remote::{shell_quote, RemoteExec};
use crate::trial::RuntimeConfig;
use crate::variant::{DataSet, Variant, VariantRegistry};

/// Slack added to the transport deadline on top of pg_ctl's own wait
const CONTROL_SLACK: Duration = Duration::from_secs(15);

pub struct ClusterController<R: RemoteExec> {
    remote: R,
    registry: VariantRegistry,
    port: u16,
    timeouts: TimeoutConfig,
    active: Option<(Variant, DataSet)>,
}

impl<R: RemoteExec> ClusterController<R> {
    pub fn new(remote: R, cfg: &HarnessConfig) -> Self {
        Self {
            remote,
            registry: VariantRegistry::new(cfg),
            port: cfg.database.port,
            timeouts: cfg.timeouts.clone(),
            active: None,
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Variant and data set of the running instance, if any
    pub fn active(&self) -> Option<&(Variant, DataSet)> {
        self.active.as_ref()
    }

    fn data_dir(&self, data: &DataSet) -> PathBuf {
        self.registry.data_path(data)
    }

    /// Fetch postgresql.conf, set listen address, port and every runtime field, push it back.
    pub fn configure(&self, data: &DataSet, runtime: &RuntimeConfig) -> Result<()> {
        let conf_path = self.data_dir(data).join("postgresql.conf");
        info!(
            "Configuring PostgreSQL on {}, config file at: {}",
            self.remote.host(),
            conf_path.display()
        );

        let text = self.remote.read_file(&conf_path).map_err(|e| {
            HarnessError::remote(self.remote.host(), format!("fetch {}: {:#}", conf_path.display(), e))
        })?;
        debug!(
            "previous shared_buffers = {:?}",
            pgconf::get_setting(&text, "shared_buffers")?
        );

        let mut settings: Vec<(&str, Option<String>)> = vec![
            ("listen_addresses", Some(constants::LISTEN_ADDRESSES.to_string())),
            ("port", Some(self.port.to_string())),
        ];
        settings.extend(runtime.settings());
        let settings: Vec<(&str, Option<&str>)> =
            settings.iter().map(|(k, v)| (*k, v.as_deref())).collect();

        let updated = pgconf::update_settings(&text, &settings)?;
        self.remote.write_file(&conf_path, &updated).map_err(|e| {
            HarnessError::remote(self.remote.host(), format!("store {}: {:#}", conf_path.display(), e))
        })?;
        Ok(())
    }

    /// Start the server and wait until it accepts connections.
    pub fn start(&mut self, variant: &Variant, data: &DataSet) -> Result<()> {
        let data_dir = self.data_dir(data);
        if let Some((v, d)) = &self.active {
            return Err(HarnessError::ServiceStart {
                data_dir: data_dir.display().to_string(),
                message: format!("an instance is already active ({} on {})", v, d),
            }
            .into());
        }

        let pg_ctl = self.registry.resolve(variant).bin("pg_ctl");
        let logfile = data_dir.join("logfile");
        info!("Starting {} on {} ({})", variant, data, self.remote.host());

        self.remote.run_checked(
            &format!("truncate --size=0 {}", shell_quote(logfile.to_string_lossy())),
            self.timeouts.command,
        )?;

        let cmd = format!(
            "{} start -D {} -l {} -w -t {}",
            shell_quote(pg_ctl.to_string_lossy()),
            shell_quote(data_dir.to_string_lossy()),
            shell_quote(logfile.to_string_lossy()),
            self.timeouts.start.as_secs().max(1)
        );
        let out = self.remote.run(&cmd, self.timeouts.start + CONTROL_SLACK)?;
        if !out.success() {
            return Err(HarnessError::ServiceStart {
                data_dir: data_dir.display().to_string(),
                message: out.failure_reason(&cmd),
            }
            .into());
        }

        self.active = Some((variant.clone(), *data));
        Ok(())
    }

    /// Stop the server and wait for shutdown to complete.
    pub fn stop(&mut self, variant: &Variant, data: &DataSet) -> Result<()> {
        let data_dir = self.data_dir(data);
        let pg_ctl = self.registry.resolve(variant).bin("pg_ctl");
        info!("Stopping {} on {} ({})", variant, data, self.remote.host());

        let cmd = format!(
            "{} stop -D {} -m fast -w -t {}",
            shell_quote(pg_ctl.to_string_lossy()),
            shell_quote(data_dir.to_string_lossy()),
            self.timeouts.stop.as_secs().max(1)
        );
        let out = self.remote.run(&cmd, self.timeouts.stop + CONTROL_SLACK)?;
        if !out.success() {
            return Err(HarnessError::ServiceStop {
                data_dir: data_dir.display().to_string(),
                message: out.failure_reason(&cmd),
            }
            .into());
        }

        self.active = None;
        Ok(())
    }

    /// Start, run `work`, and always stop. The error from `work` wins over a stop error.
    pub fn with_started<T>(
        &mut self,
        variant: &Variant,
        data: &DataSet,
        work: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        self.start(variant, data)?;
        let result = work();
        let stopped = self.stop(variant, data);
        match (result, stopped) {
            (Ok(v), Ok(())) => Ok(v),
            (Ok(_), Err(stop_err)) => Err(stop_err),
            (Err(work_err), Ok(())) => Err(work_err),
            (Err(work_err), Err(stop_err)) => {
                error!("Failed to stop {} after error: {:#}", variant, stop_err);
                Err(work_err)
            }
        }
    }

    /// Create and configure a data directory unless it already holds a cluster.
    /// The settings are permissive (trust auth from anywhere) and only fit an
    /// isolated benchmarking host.
    pub fn initialize(&self, variant: &Variant, data: &DataSet) -> Result<bool> {
        let data_dir = self.data_dir(data);
        let quoted_dir = shell_quote(data_dir.to_string_lossy());

        let existing = self.remote.run(
            &format!("test -f {}/PG_VERSION", quoted_dir),
            self.timeouts.command,
        )?;
        if existing.success() {
            info!("{} already initialized, nothing to do", data_dir.display());
            return Ok(false);
        }

        info!("Initializing database cluster at {}", data_dir.display());
        let initdb = self.registry.resolve(variant).bin("initdb");
        self.remote.run_checked(
            &format!(
                "mkdir -p {dir} && {initdb} -D {dir}",
                dir = quoted_dir,
                initdb = shell_quote(initdb.to_string_lossy())
            ),
            self.timeouts.start,
        )?;

        let hba_path = data_dir.join("pg_hba.conf");
        let mut hba = self.remote.read_file(&hba_path)?;
        if !hba.ends_with('\n') && !hba.is_empty() {
            hba.push('\n');
        }
        hba.push_str(constants::TRUST_ALL_HBA_LINE);
        hba.push('\n');
        self.remote.write_file(&hba_path, &hba)?;

        let conf_path = data_dir.join("postgresql.conf");
        let conf = self.remote.read_file(&conf_path)?;
        let port = self.port.to_string();
        let updated = pgconf::apply_settings(
            &conf,
            &[
                ("listen_addresses", constants::LISTEN_ADDRESSES),
                ("port", port.as_str()),
                ("shared_buffers", constants::INITIAL_SHARED_BUFFERS),
            ],
        )?;
        self.remote.write_file(&conf_path, &updated)?;
        Ok(true)
    }
}
