//! Error taxonomy
//!
//! Probe-level failures never surface as `Err`; they are folded into
//! [`crate::types::ProbeResult`]. Only setup-time problems and service
//! operations return these errors to the caller.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    /// Probe did not complete in time
    #[error("timed out after {0} ms")]
    NetworkTimeout(u64),

    /// Interception binary missing, crashed or never became ready
    #[error("engine launch failed: {message}")]
    ProcessLaunch {
        message: String,
        /// stderr captured before the engine died
        stderr: String,
    },

    /// Service operation attempted without elevation
    #[error("administrator/root privileges are required to {0}")]
    PermissionDenied(String),

    /// Malformed catalog, preset or settings entry
    #[error("config error: {0}")]
    Config(String),

    /// Required file absent at setup time
    #[error("required file not found: '{}'", .0.display())]
    MissingFile(PathBuf),

    /// OS service manager rejected a request
    #[error("service command `{command}` failed ({code}): {output}")]
    ServiceCommand { command: String, code: i32, output: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ManagerError> = std::result::Result<T, E>;

impl ManagerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn launch(msg: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::ProcessLaunch { message: msg.into(), stderr: stderr.into() }
    }
}
