//! OS command seam
//!
//! `sc.exe`, `systemctl` and `iptables` all go through [`CommandRunner`] so
//! tests can answer in their place.

use std::time::Duration;

use async_trait::async_trait;
use tokio::{process::Command, time::timeout};
use tracing::debug;

use crate::error::{ManagerError, Result};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self { code: 0, stdout: stdout.into(), stderr: String::new() }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// stdout followed by stderr
    pub fn text(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;

    /// Administrator on Windows, root elsewhere
    async fn is_elevated(&self) -> bool;
}

/// Runs real OS commands
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!("⚙️ {} {}", program, args.join(" "));
        let output = timeout(
            COMMAND_TIMEOUT,
            Command::new(program).args(args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| ManagerError::ServiceCommand {
            command: program.to_string(),
            code: -1,
            output: "timed out".to_string(),
        })??;

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    #[cfg(unix)]
    async fn is_elevated(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    #[cfg(not(unix))]
    async fn is_elevated(&self) -> bool {
        // `net session` only succeeds from an elevated prompt
        Command::new("net")
            .arg("session")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}
