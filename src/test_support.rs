// src/test_support.rs
//! Shared fixtures and recording fakes for unit tests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::config::{BranchCapabilities, BranchSpec, DatabaseConfig, HarnessConfig, PathsConfig};
use crate::remote::{CommandOutput, RemoteExec};
use crate::reconfigure::SqlExecutor;

pub fn sample_config() -> HarnessConfig {
    HarnessConfig {
        database: DatabaseConfig {
            host: "dbhost".into(),
            port: 5432,
            user: "bench".into(),
            password: None,
        },
        paths: PathsConfig {
            build_root: "/build".into(),
            data_root: "/data".into(),
            ddl_root: "ddl".into(),
            results_root: "/results".into(),
            benchbase_template: "bbase_config/sample_tpch_config.xml".into(),
            state_dir: ".".into(),
        },
        block_sizes: vec![8, 32],
        branches: vec![
            BranchSpec {
                name: "base".into(),
                git_branch: "REL_14_STABLE".into(),
                capabilities: BranchCapabilities::default(),
            },
            BranchSpec {
                name: "pbm2".into(),
                git_branch: "pbm_part2".into(),
                capabilities: BranchCapabilities {
                    sampling: true,
                    pbm_tuning: true,
                    sample_one: true,
                },
            },
        ],
        sources: Default::default(),
        timeouts: Default::default(),
        ssh: Default::default(),
        psql_bin: "psql".into(),
        java_bin: "java".into(),
        ignore_results: vec![],
    }
}

/// Remote host double: records every command, serves files from memory and fails
/// commands containing any configured substring.
#[derive(Default, Clone)]
pub struct FakeRemote {
    pub commands: Rc<RefCell<Vec<String>>>,
    pub files: Rc<RefCell<HashMap<PathBuf, String>>>,
    pub fail_on: Rc<RefCell<Vec<String>>>,
}

impl FakeRemote {
    pub fn with_file(self, path: &str, contents: &str) -> Self {
        self.files.borrow_mut().insert(PathBuf::from(path), contents.to_string());
        self
    }

    pub fn fail_when(&self, needle: &str) {
        self.fail_on.borrow_mut().push(needle.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.borrow().get(Path::new(path)).cloned()
    }
}

impl RemoteExec for FakeRemote {
    fn host(&self) -> &str {
        "fakehost"
    }

    fn run(&self, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        self.commands.borrow_mut().push(command.to_string());
        let failing = self.fail_on.borrow().iter().any(|n| command.contains(n.as_str()));
        Ok(CommandOutput {
            status: if failing { 1 } else { 0 },
            stdout: String::new(),
            stderr: if failing { "injected failure".into() } else { String::new() },
            timed_out: false,
        })
    }

    fn read_file(&self, remote: &Path) -> Result<String> {
        match self.files.borrow().get(remote) {
            Some(c) => Ok(c.clone()),
            None => bail!("no such remote file {}", remote.display()),
        }
    }

    fn write_file(&self, remote: &Path, contents: &str) -> Result<()> {
        self.files.borrow_mut().insert(remote.to_path_buf(), contents.to_string());
        Ok(())
    }
}

/// SQL executor double that records statements in order
#[derive(Default)]
pub struct RecordingSql {
    pub statements: Vec<String>,
    pub fail_on: Option<String>,
}

impl SqlExecutor for RecordingSql {
    fn execute(&mut self, sql: &str) -> Result<()> {
        if let Some(needle) = &self.fail_on {
            if sql.contains(needle.as_str()) {
                bail!("ERROR: injected failure in: {}", sql);
            }
        }
        self.statements.push(sql.to_string());
        Ok(())
    }
}
