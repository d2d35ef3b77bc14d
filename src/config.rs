//! Configuration Management
//!
//! Layered settings: built-in defaults, then an optional TOML file, then
//! `ZAPRET__SECTION__KEY` environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ManagerError, Result},
    selector::TieBreak,
    types::{CheckKind, DEFAULT_DOMAIN, DEFAULT_READY_MARKER, LEGACY_SERVICE_NAME},
};

/// Name of the settings file looked up in the base directory
pub const DEFAULT_CONFIG_FILE: &str = "zapret-manager.toml";

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "ZAPRET";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub paths: PathSettings,
    pub blockcheck: BlockcheckSettings,
    pub engine: EngineSettings,
    pub service: ServiceSettings,
}

/// File layout of an installation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Directory holding the presets, `bin/` and `lists/`
    pub base_dir: PathBuf,
    pub bin_dir: Option<PathBuf>,
    pub lists_dir: Option<PathBuf>,
    /// Interception binary, defaults to `bin/winws.exe` or `bin/nfqws`
    pub engine: Option<PathBuf>,
    pub strategies: Option<PathBuf>,
    pub domain_presets: Option<PathBuf>,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            bin_dir: None,
            lists_dir: None,
            engine: None,
            strategies: None,
            domain_presets: None,
        }
    }
}

impl PathSettings {
    pub fn bin_dir(&self) -> PathBuf {
        self.bin_dir.clone().unwrap_or_else(|| self.base_dir.join("bin"))
    }

    pub fn lists_dir(&self) -> PathBuf {
        self.lists_dir.clone().unwrap_or_else(|| self.base_dir.join("lists"))
    }

    pub fn engine_path(&self) -> PathBuf {
        self.engine.clone().unwrap_or_else(|| self.bin_dir().join(default_engine_name()))
    }

    pub fn strategies_path(&self) -> PathBuf {
        self.strategies
            .clone()
            .unwrap_or_else(|| self.base_dir.join("config").join("strategies.txt"))
    }

    pub fn domain_presets_path(&self) -> PathBuf {
        self.domain_presets
            .clone()
            .unwrap_or_else(|| self.base_dir.join("config").join("domain_presets.txt"))
    }

    /// `ipset*.txt` files in the lists directory, sorted by name
    pub fn ipsets(&self) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = std::fs::read_dir(self.lists_dir())
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok().map(|e| e.path()))
                    .filter(|p| {
                        p.file_name()
                            .and_then(|n| n.to_str())
                            .map(|n| n.starts_with("ipset") && n.ends_with(".txt"))
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        found.sort();
        found
    }
}

fn default_engine_name() -> &'static str {
    if cfg!(windows) {
        "winws.exe"
    } else {
        "nfqws"
    }
}

/// Probe and search tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockcheckSettings {
    /// Per-request timeout
    pub timeout_ms: u64,
    /// Concurrent endpoint probes under one strategy
    pub max_workers: usize,
    /// Repeats per endpoint, fastest success is kept
    pub repeats: u32,
    pub user_agent: String,
    /// Token bucket size
    pub rate_capacity: u32,
    /// Tokens added per second
    pub rate_refill_per_sec: f64,
    pub dns_ttl_secs: u64,
    /// Test strategies only against endpoints blocked without bypass
    pub only_blocked: bool,
    /// Failures after which a strategy is abandoned
    pub failure_threshold: u32,
    pub tie_break: TieBreak,
    pub checks: Vec<CheckKind>,
    pub domains: Vec<String>,
}

impl Default for BlockcheckSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 1500,
            max_workers: 10,
            repeats: 1,
            user_agent: "Mozilla".to_string(),
            rate_capacity: 20,
            rate_refill_per_sec: 15.0,
            dns_ttl_secs: 300,
            only_blocked: false,
            failure_threshold: 1,
            tie_break: TieBreak::Earliest,
            checks: vec![CheckKind::Http, CheckKind::HttpsTls13, CheckKind::Http3],
            domains: vec![DEFAULT_DOMAIN.to_string()],
        }
    }
}

/// Interception binary lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// stdout line signalling readiness; unset means "alive after grace period"
    pub ready_marker: Option<String>,
    pub startup_timeout_ms: u64,
    pub startup_grace_ms: u64,
    pub stop_timeout_ms: u64,
    /// NFQUEUE number nfqws reads from
    pub qnum: u16,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ready_marker: if cfg!(windows) { Some(DEFAULT_READY_MARKER.to_string()) } else { None },
            startup_timeout_ms: 5000,
            startup_grace_ms: 500,
            stop_timeout_ms: 2000,
            qnum: 200,
        }
    }
}

/// OS service manager flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceBackendKind {
    /// `sc.exe` on Windows, systemd elsewhere
    Auto,
    Sc,
    Systemd,
}

impl ServiceBackendKind {
    pub fn resolve(self) -> Self {
        match self {
            Self::Auto if cfg!(windows) => Self::Sc,
            Self::Auto => Self::Systemd,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub name: String,
    /// Names from older releases removed on create/delete
    pub legacy_names: Vec<String>,
    pub backend: ServiceBackendKind,
    /// Where systemd unit files are written
    pub unit_dir: PathBuf,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "winws".to_string(),
            legacy_names: vec![LEGACY_SERVICE_NAME.to_string()],
            backend: ServiceBackendKind::Auto,
            unit_dir: PathBuf::from("/etc/systemd/system"),
        }
    }
}

impl Settings {
    /// Load defaults, then `file` (or `./zapret-manager.toml`), then env
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let defaults = ::config::Config::try_from(&Settings::default())
            .map_err(|e| ManagerError::config(e.to_string()))?;

        let path = file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        if file.is_some() && !path.exists() {
            return Err(ManagerError::MissingFile(path));
        }

        ::config::Config::builder()
            .add_source(defaults)
            .add_source(
                ::config::File::from(path.as_path())
                    .format(::config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Settings>())
            .map_err(|e| ManagerError::config(format!("{}: {}", path.display(), e)))
    }

    /// Defaults rendered as TOML for `init-config`
    pub fn default_toml() -> Result<String> {
        toml::to_string_pretty(&Settings::default()).map_err(|e| ManagerError::config(e.to_string()))
    }
}
