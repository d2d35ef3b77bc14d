//! Command flows shared by the `zapret-manager` and `blockcheck` binaries

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use tracing::{info, warn};

use crate::{
    adjust::{self, AdjustOutcome, AdjustReport, CategoryVerdict},
    blockcheck::{self, BlockcheckPlan, BlockcheckReport, TargetSpec},
    catalog::Catalog,
    config::{BlockcheckSettings, Settings},
    coordinator::Coordinator,
    engine::{warn_if_engine_running, Diversion, EngineSlot, ProcessLauncher},
    error::ManagerError,
    probe::default_runner,
    report,
    selector::TieBreak,
    shell::{CommandRunner, SystemRunner},
    targets::{parse_endpoints, DomainPresets, TargetMode},
    types::{CheckKind, Endpoint, DEFAULT_IPSET_DOMAIN},
};

/// Blockcheck options common to both binaries
#[derive(Debug, Clone, Default, Args)]
pub struct BlockcheckArgs {
    /// Endpoints to test, e.g. `rutracker.org/forum/index.php`
    #[arg(short, long, value_delimiter = ',')]
    pub domains: Vec<String>,

    /// Named preset from domain_presets.txt
    #[arg(short, long)]
    pub preset: Option<String>,

    /// Target an ipset list (file name in lists/ or a path) instead of domains
    #[arg(long)]
    pub ipset: Option<String>,

    /// Checks to run (http, https-tls12, https-tls13, http3)
    #[arg(short, long, value_enum, value_delimiter = ',')]
    pub checks: Vec<CheckKind>,

    #[arg(short, long)]
    pub repeats: Option<u32>,

    #[arg(long)]
    pub max_workers: Option<usize>,

    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Only test strategies against endpoints blocked without bypass
    #[arg(long, action)]
    pub only_blocked: bool,

    #[arg(long, value_enum)]
    pub tie_break: Option<TieBreak>,

    /// Do not write result.txt
    #[arg(long, action)]
    pub no_save: bool,
}

impl BlockcheckArgs {
    /// Settings with the command line applied on top
    pub fn apply(&self, base: &BlockcheckSettings) -> BlockcheckSettings {
        let mut s = base.clone();
        if !self.checks.is_empty() {
            s.checks = self.checks.clone();
        }
        if let Some(r) = self.repeats {
            s.repeats = r.max(1);
        }
        if let Some(w) = self.max_workers {
            s.max_workers = w.max(1);
        }
        if let Some(t) = self.timeout_ms {
            s.timeout_ms = t;
        }
        if self.only_blocked {
            s.only_blocked = true;
        }
        if let Some(t) = self.tie_break {
            s.tie_break = t;
        }
        s
    }
}

// ── Setup ──────────────────────────────────────────────────────────────────

/// Engine present, catalog loadable; warns about a competing engine
pub async fn prerequisites(settings: &Settings) -> Result<(PathBuf, Catalog)> {
    let engine = settings.paths.engine_path();
    if !engine.exists() {
        return Err(ManagerError::MissingFile(engine)).context("engine binary is required");
    }
    if let Diversion::Nfqueue { qnum } = Diversion::for_engine(&engine, &settings.engine) {
        if !SystemRunner.is_elevated().await {
            return Err(ManagerError::PermissionDenied(format!("route traffic into NFQUEUE {} for nfqws", qnum)))
                .context("nfqws needs an iptables rule");
        }
    }
    let catalog = Catalog::load(&settings.paths.strategies_path()).context("loading strategy catalog")?;
    if catalog.is_empty() {
        bail!("strategy catalog has no usable entries");
    }
    if warn_if_engine_running(&engine).await {
        warn!("⚠️ Results may be unreliable while another engine is capturing traffic");
    }
    Ok((engine, catalog))
}

pub fn coordinator(settings: &Settings, engine: &Path, bc: &BlockcheckSettings) -> Result<Coordinator> {
    let launcher = Arc::new(ProcessLauncher::new(engine, &settings.paths.base_dir, &settings.engine));
    let diversion = Diversion::for_engine(engine, &settings.engine);
    info!("🧭 Engine {} captures via {:?}", engine.display(), diversion);
    let slot = EngineSlot::with_diversion(launcher, diversion, Arc::new(SystemRunner));
    let runner = Arc::new(default_runner(bc)?);
    Ok(Coordinator::with_slot(slot, runner, settings.paths.clone(), bc))
}

fn resolve_ipset(settings: &Settings, name: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(name);
    if direct.exists() {
        return Ok(direct);
    }
    let in_lists = settings.paths.lists_dir().join(name);
    if in_lists.exists() {
        return Ok(in_lists);
    }
    let available: Vec<String> = settings
        .paths
        .ipsets()
        .iter()
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .collect();
    Err(ManagerError::MissingFile(in_lists))
        .with_context(|| format!("unknown ipset '{}', available: {}", name, available.join(", ")))
}

/// Turn command line choices into a plan
pub fn build_plan(settings: &Settings, args: &BlockcheckArgs, bc: &BlockcheckSettings) -> Result<BlockcheckPlan> {
    let mode = if args.ipset.is_some() { TargetMode::Ipset } else { TargetMode::Domain };

    let endpoints: Vec<Endpoint> = if !args.domains.is_empty() {
        parse_endpoints(&args.domains)?
    } else if let Some(name) = &args.preset {
        let presets = DomainPresets::load(&settings.paths.domain_presets_path())?;
        presets
            .by_name(mode, name)
            .map(|p| p.endpoints.clone())
            .with_context(|| format!("no {:?} preset named '{}'", mode, name))?
    } else if mode == TargetMode::Ipset {
        parse_endpoints(&[DEFAULT_IPSET_DOMAIN])?
    } else {
        parse_endpoints(&bc.domains)?
    };
    if endpoints.is_empty() {
        bail!("no endpoints to test");
    }

    let target = match &args.ipset {
        Some(name) => TargetSpec::Ipset(resolve_ipset(settings, name)?),
        None => TargetSpec::Domains,
    };

    Ok(BlockcheckPlan {
        endpoints,
        target,
        checks: bc.checks.clone(),
        only_blocked: bc.only_blocked,
        tie_break: bc.tie_break,
    })
}

// ── Flows ──────────────────────────────────────────────────────────────────

pub async fn run_blockcheck(settings: &Settings, args: &BlockcheckArgs, json: bool) -> Result<BlockcheckReport> {
    let bc = args.apply(&settings.blockcheck);
    let (engine, catalog) = prerequisites(settings).await?;
    let plan = build_plan(settings, args, &bc)?;
    let mut coordinator = coordinator(settings, &engine, &bc)?;

    info!(
        "🚀 Blockcheck: {} | {} checks | {} strategies",
        blockcheck::describe(&plan),
        plan.checks.len(),
        catalog.len()
    );

    let finished = tokio::select! {
        r = blockcheck::run_blockcheck(&mut coordinator, &catalog, &plan, bc.repeats) => Some(r),
        _ = tokio::signal::ctrl_c() => None,
    };
    let Some(report) = finished else {
        warn!("🛑 Interrupted, stopping engine");
        coordinator.shutdown().await;
        bail!("interrupted");
    };

    if json {
        println!("{}", report::to_json(&report)?);
    } else {
        report::print_summary(&report);
    }
    if !args.no_save && report.has_viable() {
        let path = report::write_result_file(&report, &settings.paths.base_dir)?;
        if !json {
            println!("  💾 {}", path.display().to_string().green());
        }
    }
    Ok(report)
}

pub async fn run_adjust(
    settings: &Settings,
    preset: &Path,
    domains: &[String],
    json: bool,
) -> Result<AdjustReport> {
    let bc = settings.blockcheck.clone();
    let (engine, catalog) = prerequisites(settings).await?;
    let endpoints = if domains.is_empty() {
        parse_endpoints(&bc.domains)?
    } else {
        parse_endpoints(domains)?
    };
    let mut coordinator = coordinator(settings, &engine, &bc)?;

    let finished = tokio::select! {
        r = adjust::adjust_file(&mut coordinator, &catalog, preset, &endpoints, bc.tie_break) => Some(r),
        _ = tokio::signal::ctrl_c() => None,
    };
    let Some(result) = finished else {
        warn!("🛑 Interrupted, stopping engine");
        coordinator.shutdown().await;
        bail!("interrupted");
    };
    let report = result.with_context(|| format!("adjusting {}", preset.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_adjust(&report);
    }
    Ok(report)
}

fn print_adjust(report: &AdjustReport) {
    println!("\n{}", "═".repeat(60).cyan());
    println!("  {} {}", "🛠️  Auto-adjust".cyan().bold(), report.preset.display());
    println!("{}", "═".repeat(60).cyan());

    for d in &report.decisions {
        let label = match (&d.check, &d.desync) {
            (Some(c), Some(k)) => format!("{} / {}", c.title(), k),
            _ => "untested".to_string(),
        };
        let verdict = match &d.verdict {
            None => "kept".dimmed().to_string(),
            Some(CategoryVerdict::OriginalWorks) => "working".green().to_string(),
            Some(CategoryVerdict::Replaced { .. }) if d.new_args.is_some() => "replaced".yellow().to_string(),
            Some(CategoryVerdict::Replaced { .. }) => "working".green().to_string(),
            Some(CategoryVerdict::NoCandidates) => "no similar strategies".red().to_string(),
            Some(CategoryVerdict::NoViable) => "no working replacement".red().to_string(),
            Some(CategoryVerdict::Untestable { reason }) => format!("untestable: {}", reason).red().to_string(),
        };
        println!("  rule {:2} | {} | {}", d.rule + 1, label, verdict);
        if let Some(args) = &d.new_args {
            println!("          └── {}", args.join(" ").bright_white());
        }
    }

    match &report.outcome {
        AdjustOutcome::Unchanged => {
            println!("\n  ✅ {}", "All strategies work, no changes needed.".green())
        }
        AdjustOutcome::Written { path, .. } => {
            println!("\n  💾 {}", format!("Adjusted preset written: {}", path.display()).green())
        }
        AdjustOutcome::NoViable { .. } => {
            println!("\n  ❌ {}", "No viable strategy found.".red())
        }
    }
    println!("{}", "═".repeat(60).cyan());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathSettings;

    fn settings(base: &Path) -> Settings {
        Settings {
            paths: PathSettings { base_dir: base.to_path_buf(), ..Default::default() },
            ..Default::default()
        }
    }

    #[test]
    fn test_args_override_settings() {
        let args = BlockcheckArgs {
            checks: vec![CheckKind::Http3],
            repeats: Some(0),
            only_blocked: true,
            tie_break: Some(TieBreak::Fastest),
            ..Default::default()
        };
        let s = args.apply(&BlockcheckSettings::default());
        assert_eq!(s.checks, vec![CheckKind::Http3]);
        assert_eq!(s.repeats, 1);
        assert!(s.only_blocked);
        assert_eq!(s.tie_break, TieBreak::Fastest);
        assert_eq!(s.max_workers, BlockcheckSettings::default().max_workers);
    }

    #[test]
    fn test_plan_from_domain_preset_and_ipset() {
        let dir = std::env::temp_dir().join(format!("zm-app-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("config")).unwrap();
        std::fs::create_dir_all(dir.join("lists")).unwrap();
        std::fs::write(dir.join("lists").join("ipset-all.txt"), "1.1.1.1\n").unwrap();
        std::fs::write(
            dir.join("config").join("domain_presets.txt"),
            "[domain]\nYouTube\nwww.youtube.com/manifest.webmanifest\ni.ytimg.com\n\n[ipset]\nDelta\nwww.delta.com\n",
        )
        .unwrap();
        let s = settings(&dir);
        let bc = BlockcheckSettings::default();

        let args = BlockcheckArgs { preset: Some("youtube".into()), ..Default::default() };
        let plan = build_plan(&s, &args, &bc).unwrap();
        assert_eq!(plan.endpoints.len(), 2);
        assert_eq!(plan.target, TargetSpec::Domains);

        let args = BlockcheckArgs { ipset: Some("ipset-all.txt".into()), ..Default::default() };
        let plan = build_plan(&s, &args, &bc).unwrap();
        assert_eq!(plan.target, TargetSpec::Ipset(dir.join("lists").join("ipset-all.txt")));
        assert_eq!(plan.endpoints[0].host, "www.delta.com");

        let args = BlockcheckArgs { ipset: Some("ipset-nope.txt".into()), ..Default::default() };
        assert!(build_plan(&s, &args, &bc).is_err());

        let plan = build_plan(&s, &BlockcheckArgs::default(), &bc).unwrap();
        assert_eq!(plan.endpoints[0].host, "rutracker.org");
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_missing_engine_aborts_setup() {
        let dir = std::env::temp_dir().join(format!("zm-app-{}", uuid::Uuid::new_v4()));
        let err = prerequisites(&settings(&dir)).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<ManagerError>(), Some(ManagerError::MissingFile(_))));
    }
}
