// src/loadgen.rs
//! Load-generator collaborator (BenchBase).
//!
//! The per-trial XML is derived from a sample configuration: connection target,
//! credentials, scale factor and terminal count are replaced, and the `<works>`
//! block is rewritten with a single parallel workload. BenchBase itself is run
//! as a child process and is trusted to return after its configured duration.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::config::HarnessConfig;
use crate::trial::{TrialSpec, WorkloadConfig};
use crate::variant::{DataSet, VariantRegistry};

/// Runs one trial's workload and leaves its artifacts in `out_dir`
pub trait LoadGenerator {
    fn run_trial(&self, trial: &TrialSpec, config_path: &Path, out_dir: &Path) -> Result<()>;

    /// Write the declarative configuration for a trial
    fn write_config(&self, trial: &TrialSpec, path: &Path) -> Result<()>;

    /// Populate a freshly created database, using `scratch` for temporary files
    fn load_data(&self, data: &DataSet, scratch: &Path) -> Result<()>;
}

pub struct BenchBase {
    java: String,
    home: PathBuf,
    template: PathBuf,
    host: String,
    port: u16,
    user: String,
    password: String,
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Replace the text of `<tag>...</tag>`, inserting the element before
/// `</parameters>` when the template does not have it.
fn set_element(xml: &str, tag: &str, value: &str) -> Result<String> {
    let re = Regex::new(&format!(r"(?s)<{tag}>.*?</{tag}>", tag = regex::escape(tag)))?;
    let element = format!("<{tag}>{}</{tag}>", xml_escape(value), tag = tag);
    if re.is_match(xml) {
        Ok(re.replacen(xml, 1, regex::NoExpand(&element)).into_owned())
    } else if let Some(pos) = xml.rfind("</parameters>") {
        Ok(format!("{}    {}\n{}", &xml[..pos], element, &xml[pos..]))
    } else {
        bail!("load generator template has no <parameters> root");
    }
}

impl BenchBase {
    pub fn new(cfg: &HarnessConfig) -> Self {
        let registry = VariantRegistry::new(cfg);
        Self {
            java: cfg.java_bin.clone(),
            home: registry.benchbase_home(),
            template: cfg.paths.benchbase_template.clone(),
            host: cfg.database.host.clone(),
            port: cfg.database.port,
            user: cfg.database.user.clone(),
            password: cfg.database.password(),
        }
    }

    /// Render a configuration from the template text.
    /// `local` points the connection at localhost (data loading on the database host).
    pub fn render(
        &self,
        template: &str,
        data: &DataSet,
        workload: Option<&WorkloadConfig>,
        local: bool,
    ) -> Result<String> {
        let host = if local { "localhost" } else { self.host.as_str() };
        let url = format!(
            "jdbc:postgresql://{}:{}/{}?sslmode=disable&ApplicationName=tpch&reWriteBatchedInserts=true",
            host,
            self.port,
            data.database()
        );

        let mut xml = set_element(template, "url", &url)?;
        xml = set_element(&xml, "username", &self.user)?;
        xml = set_element(&xml, "password", &self.password)?;
        xml = set_element(&xml, "scalefactor", &data.scale_factor.to_string())?;

        let Some(w) = workload else {
            return set_element(&xml, "terminals", "1");
        };

        xml = set_element(&xml, "terminals", &w.terminals.to_string())?;
        if let Some(seed) = w.seed {
            xml = set_element(&xml, "randomSeed", &seed.to_string())?;
        }
        if let Some(sel) = w.selectivity {
            xml = set_element(&xml, "selectivity", &sel.to_string())?;
        }
        if let Some(cm) = w.count_multiplier {
            xml = set_element(&xml, "countMultiplier", &cm.to_string())?;
        }
        xml = set_element(&xml, "prewarm", if w.prewarm { "true" } else { "false" })?;
        xml = set_element(
            &xml,
            "randomizeQueryOrder",
            if w.query_order_randomized { "true" } else { "false" },
        )?;

        let works = format!(
            "<works>\n        <work>\n            <serial>false</serial>\n            <rate>unlimited</rate>\n            <weights>{}</weights>\n            <arrival>regular</arrival>\n            <time>{}</time>\n        </work>\n    </works>",
            w.workload.weights(),
            w.duration.as_secs()
        );
        let re = Regex::new(r"(?s)<works>.*?</works>")?;
        if re.is_match(&xml) {
            xml = re.replacen(&xml, 1, regex::NoExpand(&works)).into_owned();
        } else {
            xml = set_element(&xml, "works", "")?;
            xml = re.replacen(&xml, 1, regex::NoExpand(&works)).into_owned();
        }
        Ok(xml)
    }

    fn read_template(&self) -> Result<String> {
        fs::read_to_string(&self.template)
            .with_context(|| format!("read load generator template {}", self.template.display()))
    }

    /// Configuration used to populate a fresh data set from the database host
    pub fn write_load_config(&self, data: &DataSet, path: &Path) -> Result<()> {
        let xml = self.render(&self.read_template()?, data, None, true)?;
        fs::write(path, xml).with_context(|| format!("write {}", path.display()))
    }

    fn java(&self, config: &Path, mode: &[&str]) -> Result<()> {
        let jar = self.home.join("benchbase.jar");
        let mut cmd = Command::new(&self.java);
        cmd.arg("-jar")
            .arg(&jar)
            .args(["-b", "tpch", "-c"])
            .arg(config)
            .args(mode)
            .current_dir(&self.home);
        debug!("Running {:?}", cmd);
        let status = cmd
            .status()
            .with_context(|| format!("Failed to execute {}. Is it installed?", self.java))?;
        if !status.success() {
            bail!("BenchBase exited with {}", status);
        }
        Ok(())
    }
}

impl LoadGenerator for BenchBase {
    fn write_config(&self, trial: &TrialSpec, path: &Path) -> Result<()> {
        let xml = self.render(
            &self.read_template()?,
            trial.dataset(),
            Some(trial.workload()),
            false,
        )?;
        fs::write(path, xml).with_context(|| format!("write {}", path.display()))
    }

    fn run_trial(&self, trial: &TrialSpec, config_path: &Path, out_dir: &Path) -> Result<()> {
        info!("BenchBase: running {} against {}", trial.workload().workload.name(), self.host);
        let out = out_dir.to_string_lossy().to_string();
        self.java(config_path, &["--execute=true", "-d", &out])?;
        strip_result_prefix(out_dir)
    }

    fn load_data(&self, data: &DataSet, scratch: &Path) -> Result<()> {
        let config = scratch.join("load_config.xml");
        self.write_load_config(data, &config)?;
        info!("BenchBase: loading test data...");
        self.java(&config, &["--load=true"])
    }
}

/// BenchBase prefixes every output file with the same timestamp
/// (`2023-06-19_10-16-21.summary.json`). The results directory already carries
/// a timestamp, so drop the prefix.
pub fn strip_result_prefix(dir: &Path) -> Result<()> {
    let mut prefix: Option<String> = None;
    let mut renames = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let name = entry?.file_name().to_string_lossy().to_string();
        let Some(dot) = name.find('.') else {
            bail!("result file {} has no prefix", name);
        };
        let (pre, rest) = name.split_at(dot + 1);
        match &prefix {
            None => prefix = Some(pre.to_string()),
            Some(p) if p != pre => bail!("result files didn't all have the same prefix ({} vs {})", p, pre),
            _ => {}
        }
        renames.push((name.clone(), rest.to_string()));
    }
    for (src, dst) in renames {
        fs::rename(dir.join(&src), dir.join(&dst))
            .with_context(|| format!("rename {} to {}", src, dst))?;
    }
    Ok(())
}
