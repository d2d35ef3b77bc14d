//! Service Registrar
//!
//! ثبت engine به عنوان سرویس سیستم: `sc.exe` روی ویندوز، systemd روی لینوکس.
//! Every OS command goes through [`CommandRunner`].

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    config::{ServiceBackendKind, ServiceSettings},
    error::{ManagerError, Result},
    preset::Preset,
    shell::{CommandOutput, CommandRunner, SystemRunner},
};

/// Exit code `sc.exe` uses for "service does not exist"
const SC_NOT_FOUND: i32 = 1060;

// ── Status ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Running,
    Stopped,
    NotRegistered,
    Other(String),
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => f.write_str("RUNNING"),
            Self::Stopped => f.write_str("STOPPED"),
            Self::NotRegistered => f.write_str("NOT INSTALLED"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub status: ServiceStatus,
    /// Preset file the service was created from
    pub preset: Option<String>,
}

pub fn display_name(preset_file: &str) -> String {
    format!("Zapret DPI Bypass ({})", preset_file)
}

/// Preset file name from a display name like `Zapret DPI Bypass (general.bat)`
pub fn preset_from_display_name(display: &str) -> Option<String> {
    let display = display.trim();
    if display.is_empty() {
        return None;
    }
    match (display.find('('), display.rfind(')')) {
        (Some(open), Some(close)) if open < close => Some(display[open + 1..close].to_string()),
        _ => Some(display.to_string()),
    }
}

/// Value after `:` on the first line whose key is one of `keys`
fn field<'a>(text: &'a str, keys: &[&str]) -> Option<&'a str> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        keys.iter()
            .any(|k| key.trim().eq_ignore_ascii_case(k))
            .then(|| value.trim())
    })
}

/// `ERROR_SERVICE_DOES_NOT_EXIST`, by exit code or by the `FAILED 1060` line
fn sc_not_found(output: &CommandOutput) -> bool {
    output.code == SC_NOT_FOUND || output.text().contains(&format!("FAILED {}", SC_NOT_FOUND))
}

/// `sc query` output → status
pub fn parse_sc_state(output: &CommandOutput) -> ServiceStatus {
    if sc_not_found(output) {
        return ServiceStatus::NotRegistered;
    }
    if !output.success() {
        return ServiceStatus::Other("ERROR".to_string());
    }
    // "4  RUNNING"
    match field(&output.stdout, &["STATE", "Состояние"]).and_then(|v| v.split_whitespace().nth(1)) {
        Some(s) if s.eq_ignore_ascii_case("RUNNING") => ServiceStatus::Running,
        Some(s) if s.eq_ignore_ascii_case("STOPPED") => ServiceStatus::Stopped,
        Some(s) => ServiceStatus::Other(s.to_ascii_uppercase()),
        None => ServiceStatus::Other("UNKNOWN".to_string()),
    }
}

/// Quote one argument for a command line string
fn quote_arg(arg: &str) -> String {
    if !arg.contains(char::is_whitespace) {
        return arg.to_string();
    }
    match arg.split_once('=') {
        Some((key, value)) if key.starts_with("--") => format!("{}=\"{}\"", key, value),
        _ => format!("\"{}\"", arg),
    }
}

/// `"<exe>" <args>` as stored in the service definition
pub fn command_line(exe: &Path, args: &[String]) -> String {
    let mut line = format!("\"{}\"", exe.display());
    for arg in args {
        line.push(' ');
        line.push_str(&quote_arg(arg));
    }
    line
}

// ── Registrar ──────────────────────────────────────────────────────────────

pub struct ServiceRegistrar {
    runner: Arc<dyn CommandRunner>,
    backend: ServiceBackendKind,
    legacy_names: Vec<String>,
    unit_dir: PathBuf,
}

impl ServiceRegistrar {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: &ServiceSettings) -> Self {
        Self {
            runner,
            backend: settings.backend.resolve(),
            legacy_names: settings.legacy_names.clone(),
            unit_dir: settings.unit_dir.clone(),
        }
    }

    pub fn system(settings: &ServiceSettings) -> Self {
        Self::new(Arc::new(SystemRunner), settings)
    }

    async fn require_elevation(&self, operation: &str) -> Result<()> {
        if self.runner.is_elevated().await {
            Ok(())
        } else {
            Err(ManagerError::PermissionDenied(operation.to_string()))
        }
    }

    /// Register `name` to run `preset_path`, or repoint an existing
    /// registration at it, then start it
    pub async fn create_or_update(&self, name: &str, preset_path: &Path) -> Result<ServiceInfo> {
        self.require_elevation("create or update a service").await?;

        let preset = Preset::load(preset_path)?;
        let exe = preset.resolved_executable();
        if !exe.exists() {
            return Err(ManagerError::MissingFile(exe));
        }
        let args = preset.full_args();
        let file = preset.name();
        info!("📦 Service '{}' → {} ({} args)", name, file, args.len());

        for legacy in self.legacy_names.iter().filter(|l| l.as_str() != name) {
            self.remove(legacy).await?;
        }

        match self.backend {
            ServiceBackendKind::Systemd => self.systemd_install(name, &exe, &args, &file).await?,
            _ => self.sc_install(name, &exe, &args, &file).await?,
        }
        self.status(name).await
    }

    /// Stop and remove `name` and any legacy names; true if something was removed
    pub async fn delete(&self, name: &str) -> Result<bool> {
        self.require_elevation("delete a service").await?;

        let mut removed = self.remove(name).await?;
        for legacy in self.legacy_names.iter().filter(|l| l.as_str() != name) {
            removed |= self.remove(legacy).await?;
        }
        if removed {
            info!("🗑️ Service '{}' deleted", name);
        } else {
            warn!("⚠️ No known services were found");
        }
        Ok(removed)
    }

    pub async fn status(&self, name: &str) -> Result<ServiceInfo> {
        let (status, preset) = match self.backend {
            ServiceBackendKind::Systemd => self.systemd_query(name).await?,
            _ => self.sc_query(name).await?,
        };
        Ok(ServiceInfo { name: name.to_string(), status, preset })
    }

    /// `name` plus every legacy name still registered
    pub async fn status_all(&self, name: &str) -> Result<Vec<ServiceInfo>> {
        let mut names = vec![name.to_string()];
        names.extend(self.legacy_names.iter().filter(|l| l.as_str() != name).cloned());

        let infos = join_all(names.iter().map(|n| self.status(n))).await;
        let mut out = Vec::with_capacity(infos.len());
        for (i, info) in infos.into_iter().enumerate() {
            let info = info?;
            if i == 0 || info.status != ServiceStatus::NotRegistered {
                out.push(info);
            }
        }
        Ok(out)
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        match self.backend {
            ServiceBackendKind::Systemd => self.systemd_remove(name).await,
            _ => self.sc_remove(name).await,
        }
    }

    // ── sc.exe ──

    async fn sc(&self, args: &[&str]) -> Result<CommandOutput> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.runner.run("sc.exe", &args).await
    }

    async fn sc_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let out = self.sc(args).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(ManagerError::ServiceCommand {
                command: format!("sc {}", args.join(" ")),
                code: out.code,
                output: out.text().trim().to_string(),
            })
        }
    }

    async fn sc_query(&self, name: &str) -> Result<(ServiceStatus, Option<String>)> {
        let status = parse_sc_state(&self.sc(&["query", name]).await?);
        if status == ServiceStatus::NotRegistered {
            return Ok((status, None));
        }
        let qc = self.sc(&["qc", name]).await?;
        let preset = if qc.success() {
            field(&qc.stdout, &["DISPLAY_NAME", "Выводимое_имя"]).and_then(preset_from_display_name)
        } else {
            None
        };
        Ok((status, preset))
    }

    async fn sc_install(&self, name: &str, exe: &Path, args: &[String], file: &str) -> Result<()> {
        let bin_path = command_line(exe, args);
        let display = display_name(file);
        let (status, _) = self.sc_query(name).await?;

        if status == ServiceStatus::NotRegistered {
            info!("🆕 Creating service '{}'", name);
            self.sc_checked(&["create", name, "binPath=", &bin_path, "DisplayName=", &display, "start=", "auto"])
                .await?;
        } else {
            info!("🔄 Updating service '{}' in place", name);
            if status == ServiceStatus::Running {
                self.sc(&["stop", name]).await?;
            }
            self.sc_checked(&["config", name, "binPath=", &bin_path, "DisplayName=", &display, "start=", "auto"])
                .await?;
        }

        let description = format!("Zapret DPI bypass based on '{}'", file);
        if let Err(e) = self.sc_checked(&["description", name, &description]).await {
            warn!("⚠️ Could not set description: {}", e);
        }
        self.sc_checked(&["start", name]).await?;
        info!("✅ Service '{}' started", name);
        Ok(())
    }

    async fn sc_remove(&self, name: &str) -> Result<bool> {
        if parse_sc_state(&self.sc(&["query", name]).await?) == ServiceStatus::NotRegistered {
            return Ok(false);
        }
        self.sc(&["stop", name]).await?;
        let out = self.sc(&["delete", name]).await?;
        if sc_not_found(&out) {
            return Ok(false);
        }
        if !out.success() {
            return Err(ManagerError::ServiceCommand {
                command: format!("sc delete {}", name),
                code: out.code,
                output: out.text().trim().to_string(),
            });
        }
        Ok(true)
    }

    // ── systemd ──

    fn unit_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(format!("{}.service", name))
    }

    async fn systemctl(&self, args: &[&str]) -> Result<CommandOutput> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.runner.run("systemctl", &args).await
    }

    async fn systemctl_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let out = self.systemctl(args).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(ManagerError::ServiceCommand {
                command: format!("systemctl {}", args.join(" ")),
                code: out.code,
                output: out.text().trim().to_string(),
            })
        }
    }

    async fn systemd_query(&self, name: &str) -> Result<(ServiceStatus, Option<String>)> {
        let unit = format!("{}.service", name);
        let show = self
            .systemctl(&["show", &unit, "--property=LoadState,ActiveState,Description"])
            .await?;
        let load = field_eq(&show.stdout, "LoadState");
        if load.is_none() || load == Some("not-found") {
            return Ok((ServiceStatus::NotRegistered, None));
        }
        let status = match field_eq(&show.stdout, "ActiveState") {
            Some("active") => ServiceStatus::Running,
            Some("inactive") | Some("failed") => ServiceStatus::Stopped,
            Some(other) => ServiceStatus::Other(other.to_ascii_uppercase()),
            None => ServiceStatus::Other("UNKNOWN".to_string()),
        };
        let preset = field_eq(&show.stdout, "Description").and_then(preset_from_display_name);
        Ok((status, preset))
    }

    async fn systemd_install(&self, name: &str, exe: &Path, args: &[String], file: &str) -> Result<()> {
        let unit = format!("{}.service", name);
        let (status, _) = self.systemd_query(name).await?;
        let path = self.unit_path(name);

        tokio::fs::create_dir_all(&self.unit_dir).await?;
        tokio::fs::write(&path, unit_file(exe, args, file)).await?;
        self.systemctl_checked(&["daemon-reload"]).await?;

        if status == ServiceStatus::NotRegistered {
            info!("🆕 Creating unit {}", path.display());
            self.systemctl_checked(&["enable", "--now", &unit]).await?;
        } else {
            info!("🔄 Updating unit {} in place", path.display());
            self.systemctl_checked(&["enable", &unit]).await?;
            self.systemctl_checked(&["restart", &unit]).await?;
        }
        info!("✅ Service '{}' started", name);
        Ok(())
    }

    async fn systemd_remove(&self, name: &str) -> Result<bool> {
        let (status, _) = self.systemd_query(name).await?;
        let path = self.unit_path(name);
        if status == ServiceStatus::NotRegistered && !path.exists() {
            return Ok(false);
        }
        let unit = format!("{}.service", name);
        self.systemctl(&["disable", "--now", &unit]).await?;
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        self.systemctl_checked(&["daemon-reload"]).await?;
        Ok(true)
    }
}

/// `Key=value` lines of `systemctl show`
fn field_eq<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines().find_map(|l| l.strip_prefix(key)?.strip_prefix('=')).map(str::trim)
}

/// `%` is a specifier in unit files
fn systemd_escape(s: &str) -> String {
    s.replace('%', "%%")
}

pub fn unit_file(exe: &Path, args: &[String], preset_file: &str) -> String {
    format!(
        "[Unit]\n\
         Description={}\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={}\n\
         Restart=on-failure\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        display_name(preset_file),
        systemd_escape(&command_line(exe, args)),
    )
}
