//! zapret-manager
//!
//! Service registration, blockcheck and preset auto-adjust for the winws
//! (Windows) / nfqws (Linux) DPI bypass engine.
//! مدیریت سرویس، تست استراتژی‌ها و تنظیم خودکار preset.

// ── Core ────────────────────────────────────────────────────────────────────
pub mod types;
pub mod error;
pub mod config;
pub mod logging;

// ── Data files ───────────────────────────────────────────────────────────────
pub mod catalog;
pub mod preset;
pub mod targets;

// ── Probing ──────────────────────────────────────────────────────────────────
pub mod engine;
pub mod probe;
pub mod circuit_breaker;
pub mod coordinator;
pub mod selector;

// ── Flows ────────────────────────────────────────────────────────────────────
pub mod blockcheck;
pub mod adjust;
pub mod report;
pub mod shell;
pub mod service;
pub mod app;

// ── Re-exports ────────────────────────────────────────────────────────────────

pub use types::{CheckKind, Endpoint, ProbeResult, Protocol, StrategyId};
pub use error::{ManagerError, Result};
pub use config::Settings;

pub use catalog::{Catalog, Strategy};
pub use preset::{Dialect, Preset};
pub use coordinator::Coordinator;
pub use probe::ProbeRunner;
pub use selector::{select, TieBreak};
pub use service::{ServiceRegistrar, ServiceStatus};
