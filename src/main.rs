//! zapret-manager: service registration, blockcheck and preset auto-adjust
//! for the winws/nfqws DPI bypass engine

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{error, info};

use zapret_manager::{
    app::{self, BlockcheckArgs},
    catalog::Catalog,
    config::Settings,
    logging,
    service::{ServiceRegistrar, ServiceStatus},
    targets::{DomainPresets, TargetMode},
    types::CheckKind,
    ManagerError,
};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "zapret-manager",
    version,
    about = "🛡️ Service manager, blockcheck and preset auto-adjuster for winws/nfqws"
)]
struct Cli {
    /// Settings file (default: zapret-manager.toml in the working directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Installation directory holding presets, bin/ and lists/
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Log as JSON lines
    #[arg(long, global = true, action)]
    log_json: bool,

    /// Print results as JSON
    #[arg(long, global = true, action)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage the background service
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },
    /// Find strategies that unblock the given endpoints
    Blockcheck(BlockcheckArgs),
    /// Re-test a preset and write `<name>_adjusted.<ext>` if something broke
    Adjust {
        /// Preset script (.bat, .cmd or .sh)
        preset: PathBuf,
        /// Endpoints every rule must unblock
        #[arg(short, long, value_delimiter = ',')]
        domains: Vec<String>,
    },
    /// List the validated strategy catalog
    Strategies {
        #[arg(long, value_enum)]
        check: Option<CheckKind>,
    },
    /// List domain presets
    Presets,
    /// Print default settings as TOML
    InitConfig {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
enum ServiceAction {
    /// Create the service from a preset, or repoint it
    Create {
        preset: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Stop and remove the service
    Delete {
        #[arg(long)]
        name: Option<String>,
    },
    /// Show service state and preset
    Status {
        #[arg(long)]
        name: Option<String>,
    },
}

// ── Entry Point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_json);

    if let Err(e) = run(cli).await {
        error!("🚨 {:#}", e);
        if matches!(e.downcast_ref::<ManagerError>(), Some(ManagerError::PermissionDenied(_))) {
            eprintln!("{}", "Run again as administrator/root.".yellow());
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    if let Some(base) = &cli.base_dir {
        settings.paths.base_dir = base.clone();
    }

    match cli.command {
        Commands::Service { action } => run_service(&settings, action, cli.json).await,
        Commands::Blockcheck(args) => app::run_blockcheck(&settings, &args, cli.json).await.map(|_| ()),
        Commands::Adjust { preset, domains } => {
            app::run_adjust(&settings, &preset, &domains, cli.json).await.map(|_| ())
        }
        Commands::Strategies { check } => list_strategies(&settings, check, cli.json),
        Commands::Presets => list_presets(&settings, cli.json),
        Commands::InitConfig { output } => init_config(output).await,
    }
}

// ── Command Handlers ─────────────────────────────────────────────────────────

async fn run_service(settings: &Settings, action: ServiceAction, json: bool) -> Result<()> {
    let registrar = ServiceRegistrar::system(&settings.service);
    let default_name = settings.service.name.clone();

    match action {
        ServiceAction::Create { preset, name } => {
            let name = name.unwrap_or(default_name);
            let preset = if preset.is_relative() && !preset.exists() {
                settings.paths.base_dir.join(preset)
            } else {
                preset
            };
            let info = registrar
                .create_or_update(&name, &preset)
                .await
                .with_context(|| format!("registering service '{}'", name))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("  ✅ Service '{}' is {}", info.name.cyan(), info.status.to_string().green());
            }
        }
        ServiceAction::Delete { name } => {
            let name = name.unwrap_or(default_name);
            let removed = registrar.delete(&name).await?;
            if json {
                println!("{}", serde_json::json!({ "service": name, "removed": removed }));
            } else if removed {
                println!("  🗑️  Service(s) deleted.");
            } else {
                println!("  {}", "No known services were found.".yellow());
            }
        }
        ServiceAction::Status { name } => {
            let name = name.unwrap_or(default_name);
            let infos = registrar.status_all(&name).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&infos)?);
                return Ok(());
            }
            for info in infos {
                let status = match info.status {
                    ServiceStatus::Running => info.status.to_string().green(),
                    _ => info.status.to_string().red(),
                };
                println!("  Service '{}': {}", info.name.cyan(), status);
                if info.status != ServiceStatus::NotRegistered {
                    println!("  └── Preset: {}", info.preset.as_deref().unwrap_or("Unknown").bright_white());
                }
            }
        }
    }
    Ok(())
}

fn list_strategies(settings: &Settings, check: Option<CheckKind>, json: bool) -> Result<()> {
    let catalog = Catalog::load(&settings.paths.strategies_path())?;
    let strategies: Vec<_> = match check {
        Some(c) => catalog.for_check(c),
        None => catalog.iter().collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&strategies)?);
        return Ok(());
    }
    for s in &strategies {
        println!("  {:>4}  {:<6} {}", s.id.to_string().dimmed(), s.protocol.as_str().cyan(), s.name());
    }
    info!("📚 {} strategies, {} skipped", strategies.len(), catalog.skipped());
    Ok(())
}

fn list_presets(settings: &Settings, json: bool) -> Result<()> {
    let presets = DomainPresets::load(&settings.paths.domain_presets_path())?;
    let ipsets = settings.paths.ipsets();

    if json {
        let value = serde_json::json!({
            "domain": presets.for_mode(TargetMode::Domain).collect::<Vec<_>>(),
            "ipset": presets.for_mode(TargetMode::Ipset).collect::<Vec<_>>(),
            "ipset_files": ipsets,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    for mode in [TargetMode::Domain, TargetMode::Ipset] {
        println!("\n  {}", format!("[{:?}]", mode).to_lowercase().cyan().bold());
        for p in presets.for_mode(mode) {
            let hosts: Vec<String> = p.endpoints.iter().map(|e| e.to_string()).collect();
            println!("  ├── {} {}", p.name.bright_white(), hosts.join(", ").dimmed());
        }
    }
    if !ipsets.is_empty() {
        println!("\n  {}", "ipset files".cyan().bold());
        for path in ipsets {
            println!("  ├── {}", path.display());
        }
    }
    Ok(())
}

async fn init_config(output: Option<PathBuf>) -> Result<()> {
    let text = Settings::default_toml()?;
    match output {
        Some(path) => {
            tokio::fs::write(&path, text).await?;
            info!("💾 Default settings written to {}", path.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}
