// src/error.rs
//! Error taxonomy for the experiment harness.
//!
//! Orchestration code propagates these through `anyhow::Result`; callers that need
//! to tell a failed service start from a failed reconfiguration use
//! `err.downcast_ref::<HarnessError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// Unknown branch, illegal runtime parameter for a variant, malformed config value
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Non-zero exit from a clone/configure/build/install/clean step
    #[error("build step `{step}` failed with exit status {status}")]
    Build { step: String, status: i32 },

    /// Remote command or file transfer failed
    #[error("remote I/O error on {host}: {message}")]
    RemoteIo { host: String, message: String },

    #[error("database service failed to start ({data_dir}): {message}")]
    ServiceStart { data_dir: String, message: String },

    #[error("database service failed to stop ({data_dir}): {message}")]
    ServiceStop { data_dir: String, message: String },

    /// A statement run while changing indexes or clustering failed
    #[error("reconfiguration failed during {step}: {message}")]
    Reconfiguration { step: String, message: String },

    /// State cache file present but unreadable or malformed
    #[error("state cache {path} is corrupt: {message}")]
    StateCache { path: String, message: String },

    /// Missing or unparseable results artifact
    #[error("artifact {path}: {message}")]
    Artifact { path: String, message: String },
}

impl HarnessError {
    pub fn remote(host: impl Into<String>, message: impl std::fmt::Display) -> Self {
        HarnessError::RemoteIo {
            host: host.into(),
            message: message.to_string(),
        }
    }

    pub fn reconfig(step: impl Into<String>, message: impl std::fmt::Display) -> Self {
        HarnessError::Reconfiguration {
            step: step.into(),
            message: message.to_string(),
        }
    }
}

/// True if `err` (or anything in its chain) is the given harness error kind.
pub fn is_kind(err: &anyhow::Error, pred: impl Fn(&HarnessError) -> bool) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<HarnessError>())
        .any(pred)
}
