//! Interception engine lifecycle
//!
//! Starts winws/nfqws with an argument list, waits until it reports that
//! capture is running, and tears it down again. The Coordinator owns the one
//! [`EngineSlot`]; nothing else starts engines during a run.
//!
//! winws picks its traffic with WinDivert filter flags. nfqws only sees what
//! an iptables NFQUEUE rule sends it, so the slot adds that rule before the
//! launch and deletes it after the stop.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use metrics::increment_counter;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::EngineSettings,
    error::{ManagerError, Result},
    shell::{CommandRunner, SystemRunner},
    types::{Protocol, StrategyId},
};

/// A running engine instance
#[async_trait]
pub trait EngineHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Terminate, wait for the stop timeout, then kill
    async fn stop(self: Box<Self>) -> Result<()>;
}

/// Starts engine instances
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Resolves once the engine is capturing, or fails with
    /// [`ManagerError::ProcessLaunch`] carrying its stderr
    async fn launch(&self, args: &[String]) -> Result<Box<dyn EngineHandle>>;
}

// ── Process launcher ───────────────────────────────────────────────────────

enum StartupSignal {
    Ready,
    Stderr(String),
}

/// Launches the real binary with `tokio::process`
pub struct ProcessLauncher {
    executable: PathBuf,
    working_dir: PathBuf,
    ready_marker: Option<String>,
    startup_timeout: Duration,
    startup_grace: Duration,
    stop_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(executable: impl Into<PathBuf>, working_dir: impl Into<PathBuf>, settings: &EngineSettings) -> Self {
        Self {
            executable: executable.into(),
            working_dir: working_dir.into(),
            ready_marker: settings.ready_marker.clone().filter(|m| !m.is_empty()),
            startup_timeout: Duration::from_millis(settings.startup_timeout_ms),
            startup_grace: Duration::from_millis(settings.startup_grace_ms),
            stop_timeout: Duration::from_millis(settings.stop_timeout_ms),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.working_dir.is_dir() {
            cmd.current_dir(&self.working_dir);
        }
        #[cfg(windows)]
        {
            // CREATE_NO_WINDOW
            cmd.creation_flags(0x0800_0000);
        }
        cmd
    }
}

#[async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn launch(&self, args: &[String]) -> Result<Box<dyn EngineHandle>> {
        if !self.executable.exists() {
            return Err(ManagerError::launch(
                format!("{} not found", self.executable.display()),
                "",
            ));
        }

        debug!("🚀 {} {}", self.executable.display(), args.join(" "));
        let mut child = self
            .command(args)
            .spawn()
            .map_err(|e| ManagerError::launch("failed to start engine", e.to_string()))?;
        increment_counter!("zapret_engine_launches_total");

        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            let marker = self.ready_marker.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut announced = false;
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("engine: {}", line);
                    if !announced && marker.as_deref().map(|m| line.contains(m)).unwrap_or(false) {
                        announced = true;
                        let _ = tx.send(StartupSignal::Ready);
                    }
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            let buf = stderr_buf.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    {
                        let mut b = buf.lock().unwrap_or_else(|e| e.into_inner());
                        b.push_str(&line);
                        b.push('\n');
                    }
                    let _ = tx.send(StartupSignal::Stderr(line));
                }
            });
        }
        drop(tx);

        let wait_for = if self.ready_marker.is_some() { self.startup_timeout } else { self.startup_grace };
        let outcome = timeout(wait_for, async {
            let mut signals_open = true;
            loop {
                tokio::select! {
                    signal = rx.recv(), if signals_open => match signal {
                        Some(StartupSignal::Ready) => return Ok(()),
                        Some(StartupSignal::Stderr(line)) => return Err(format!("engine wrote to stderr: {}", line)),
                        None => signals_open = false,
                    },
                    status = child.wait() => {
                        return Err(match status {
                            Ok(s) => format!("engine exited before ready ({})", s),
                            Err(e) => format!("engine wait failed: {}", e),
                        });
                    }
                }
            }
        })
        .await;

        let stderr_text = || stderr_buf.lock().unwrap_or_else(|e| e.into_inner()).trim().to_string();

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(message)) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(ManagerError::launch(message, stderr_text()));
            }
            Err(_) if self.ready_marker.is_some() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(ManagerError::launch(
                    format!("engine not ready within {} ms", wait_for.as_millis()),
                    stderr_text(),
                ));
            }
            // no marker: still alive after the grace period
            Err(_) => {}
        }

        debug!("✅ Engine ready (pid {:?})", child.id());
        Ok(Box::new(ProcessHandle { child, stop_timeout: self.stop_timeout }))
    }
}

/// Child process of a ready engine
pub struct ProcessHandle {
    child: Child,
    stop_timeout: Duration,
}

impl ProcessHandle {
    fn terminate(&mut self) -> Result<()> {
        #[cfg(unix)]
        {
            use nix::{sys::signal, unistd::Pid};
            if let Some(pid) = self.child.id() {
                if signal::kill(Pid::from_raw(pid as i32), signal::Signal::SIGTERM).is_ok() {
                    return Ok(());
                }
            }
        }
        self.child.start_kill()?;
        Ok(())
    }
}

#[async_trait]
impl EngineHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn stop(mut self: Box<Self>) -> Result<()> {
        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(());
        }
        self.terminate()?;
        if timeout(self.stop_timeout, self.child.wait()).await.is_err() {
            warn!("⚠️ Engine ignored terminate, killing");
            self.child.kill().await?;
        }
        Ok(())
    }
}

// ── Traffic diversion ──────────────────────────────────────────────────────

/// How captured traffic reaches the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diversion {
    /// winws: WinDivert filter on the command line
    WinDivert,
    /// nfqws: an iptables rule hands packets to this queue
    Nfqueue { qnum: u16 },
}

impl Diversion {
    /// `winws*` binaries use WinDivert, everything else is nfqws
    pub fn for_engine(executable: &Path, settings: &EngineSettings) -> Self {
        let name = executable
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_ascii_lowercase())
            .unwrap_or_default();
        if name.starts_with("winws") {
            Self::WinDivert
        } else {
            Self::Nfqueue { qnum: settings.qnum }
        }
    }

    /// Leading engine args that select `protocol`'s traffic
    pub fn capture_args(self, protocol: Protocol) -> Vec<String> {
        match self {
            Self::WinDivert => vec![
                "--wf-l3=ipv4".to_string(),
                format!("--wf-{}={}", protocol.transport(), protocol.port()),
            ],
            Self::Nfqueue { qnum } => vec![format!("--qnum={}", qnum)],
        }
    }

    /// `iptables` args adding (`-I`) or deleting (`-D`) the queue rule
    fn rule(self, action: &str, protocol: Protocol) -> Option<Vec<String>> {
        let Self::Nfqueue { qnum } = self else {
            return None;
        };
        let port = protocol.port().to_string();
        let qnum = qnum.to_string();
        let args: [&str; 13] = [
            "-t", "mangle", action, "OUTPUT", "-p", protocol.transport(), "--dport", &port,
            "-j", "NFQUEUE", "--queue-num", &qnum, "--queue-bypass",
        ];
        Some(args.iter().map(|s| s.to_string()).collect())
    }
}

// ── Engine slot ────────────────────────────────────────────────────────────

struct ActiveEngine {
    id: StrategyId,
    protocol: Protocol,
    handle: Box<dyn EngineHandle>,
}

/// The single live engine configuration. Activating a strategy always stops
/// the previous instance first.
pub struct EngineSlot {
    launcher: Arc<dyn EngineLauncher>,
    diversion: Diversion,
    runner: Arc<dyn CommandRunner>,
    active: Option<ActiveEngine>,
}

impl EngineSlot {
    /// WinDivert engine, no firewall rules involved
    pub fn new(launcher: Arc<dyn EngineLauncher>) -> Self {
        Self::with_diversion(launcher, Diversion::WinDivert, Arc::new(SystemRunner))
    }

    pub fn with_diversion(
        launcher: Arc<dyn EngineLauncher>,
        diversion: Diversion,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self { launcher, diversion, runner, active: None }
    }

    pub fn diversion(&self) -> Diversion {
        self.diversion
    }

    /// Start `args` as the only live engine, with its queue rule in place
    pub async fn activate(&mut self, id: StrategyId, protocol: Protocol, args: &[String]) -> Result<()> {
        self.release().await;
        self.queue_rule("-I", protocol).await?;
        match self.launcher.launch(args).await {
            Ok(handle) => {
                self.active = Some(ActiveEngine { id, protocol, handle });
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = self.queue_rule("-D", protocol).await {
                    warn!("⚠️ Failed to remove NFQUEUE rule: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    /// Stop the live engine, if any, and drop its queue rule. Errors are
    /// logged, never returned.
    pub async fn release(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err(e) = active.handle.stop().await {
                warn!("⚠️ Failed to stop engine for strategy {}: {}", active.id, e);
            }
            if let Err(e) = self.queue_rule("-D", active.protocol).await {
                warn!("⚠️ Failed to remove NFQUEUE rule for strategy {}: {}", active.id, e);
            }
        }
    }

    pub fn active(&self) -> Option<StrategyId> {
        self.active.as_ref().map(|a| a.id)
    }

    async fn queue_rule(&self, action: &str, protocol: Protocol) -> Result<()> {
        let Some(args) = self.diversion.rule(action, protocol) else {
            return Ok(());
        };
        let out = self.runner.run("iptables", &args).await?;
        if !out.success() {
            return Err(ManagerError::ServiceCommand {
                command: format!("iptables {}", args.join(" ")),
                code: out.code,
                output: out.text().trim().to_string(),
            });
        }
        debug!("🧱 iptables {}", args.join(" "));
        Ok(())
    }
}

/// True when a process with the engine's image name is already running
pub async fn is_engine_running(image_name: &str) -> bool {
    let output = if cfg!(windows) {
        Command::new("tasklist")
            .args(["/FI", &format!("IMAGENAME eq {}", image_name), "/NH"])
            .output()
            .await
    } else {
        Command::new("pgrep").args(["-x", image_name]).output().await
    };
    match output {
        Ok(out) if cfg!(windows) => String::from_utf8_lossy(&out.stdout)
            .to_ascii_lowercase()
            .contains(&image_name.to_ascii_lowercase()),
        Ok(out) => out.status.success(),
        Err(e) => {
            debug!("process lookup failed: {}", e);
            false
        }
    }
}

/// Other bypass tools that interfere with probe results
const CONFLICTING: &[&str] = if cfg!(windows) { &["goodbyedpi.exe"] } else { &[] };

/// Warn when an engine is already capturing; probes would be meaningless.
/// Returns true when something was found.
pub async fn warn_if_engine_running(executable: &Path) -> bool {
    let own = executable.file_name().and_then(|n| n.to_str());
    let mut found = false;
    for name in own.into_iter().chain(CONFLICTING.iter().copied()) {
        if is_engine_running(name).await {
            warn!("⚠️ {} is already running and may interfere with results", name);
            found = true;
        }
    }
    if !found {
        info!("🧹 No running DPI bypass process found");
    }
    found
}
