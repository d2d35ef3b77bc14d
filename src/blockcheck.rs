//! Blockcheck flow
//!
//! For each requested check: probe the endpoints without bypass, then run
//! every catalog strategy for that protocol and collect which ones unblock
//! the endpoints.

use std::{path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    catalog::Catalog,
    coordinator::{Coordinator, StrategyRun},
    probe::DnsStats,
    selector::{self, StrategyScore, TieBreak},
    targets::Targeting,
    types::{CheckKind, Endpoint, ProbeResult, StrategyId},
};

/// What the engine is pointed at while strategies are tested
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "mode", content = "ipset")]
pub enum TargetSpec {
    /// `--hostlist-domains` built from the endpoints
    Domains,
    /// `--ipset=<file>`; the endpoints only serve as probes
    Ipset(PathBuf),
}

#[derive(Debug, Clone)]
pub struct BlockcheckPlan {
    pub endpoints: Vec<Endpoint>,
    pub target: TargetSpec,
    pub checks: Vec<CheckKind>,
    pub only_blocked: bool,
    pub tie_break: TieBreak,
}

/// One strategy's verdict for a check
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub strategy: StrategyId,
    pub name: String,
    /// Mean of the fastest per-endpoint times, seconds
    pub time_secs: Option<f64>,
    pub error: Option<String>,
    pub engine_crashed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub check: CheckKind,
    /// Accessibility without bypass, empty in ipset mode
    pub baseline: Vec<ProbeResult>,
    /// Why strategies were not tested
    pub skipped: Option<String>,
    /// Endpoints strategies were tested against
    pub tested: Vec<Endpoint>,
    /// Sorted by time
    pub viable: Vec<Verdict>,
    pub non_viable: Vec<Verdict>,
    pub selected: Option<StrategyScore>,
    /// Every probe of this check, append-only
    #[serde(skip)]
    pub results: Vec<ProbeResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockcheckReport {
    pub run_id: uuid::Uuid,
    pub target: TargetSpec,
    pub endpoints: Vec<Endpoint>,
    pub repeats: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checks: Vec<CheckReport>,
    pub dns: DnsStats,
}

impl BlockcheckReport {
    pub fn has_viable(&self) -> bool {
        self.checks.iter().any(|c| !c.viable.is_empty())
    }
}

fn secs(d: Option<Duration>) -> Option<f64> {
    d.map(|d| d.as_secs_f64())
}

fn verdict(run: &StrategyRun, name: String) -> Verdict {
    Verdict {
        strategy: run.strategy,
        name,
        time_secs: secs(run.mean_latency()),
        error: run.launch_error.clone().or_else(|| run.first_error().map(str::to_string)),
        engine_crashed: run.launch_error.is_some(),
    }
}

/// Run the whole plan; the engine slot is released before returning
pub async fn run_blockcheck(
    coordinator: &mut Coordinator,
    catalog: &Catalog,
    plan: &BlockcheckPlan,
    repeats: u32,
) -> BlockcheckReport {
    let started_at = Utc::now();
    let mut checks = Vec::with_capacity(plan.checks.len());

    for &check in &plan.checks {
        checks.push(run_check(coordinator, catalog, plan, check).await);
    }
    coordinator.shutdown().await;

    BlockcheckReport {
        run_id: uuid::Uuid::new_v4(),
        target: plan.target.clone(),
        endpoints: plan.endpoints.clone(),
        repeats,
        started_at,
        finished_at: Utc::now(),
        checks,
        dns: coordinator.runner().dns().stats(),
    }
}

async fn run_check(
    coordinator: &mut Coordinator,
    catalog: &Catalog,
    plan: &BlockcheckPlan,
    check: CheckKind,
) -> CheckReport {
    info!("🔎 Testing {} for {}", check, describe(plan));
    let mut report = CheckReport {
        check,
        baseline: Vec::new(),
        skipped: None,
        tested: plan.endpoints.clone(),
        viable: Vec::new(),
        non_viable: Vec::new(),
        selected: None,
        results: Vec::new(),
    };

    let strategies = catalog.for_check(check);
    if strategies.is_empty() {
        warn!("⚠️ No {} strategies in the catalog", check.protocol());
        report.skipped = Some(format!("no {} strategies in the catalog", check.protocol()));
        return report;
    }

    if plan.target == TargetSpec::Domains {
        report.baseline = coordinator.baseline(&plan.endpoints, check).await;
        for r in &report.baseline {
            info!("  {} {}", if r.success { "🟢 accessible" } else { "🔴 blocked" }, r.endpoint);
        }
        if report.baseline.iter().all(|r| r.success) {
            info!("✅ All endpoints accessible without bypass, skipping {}", check);
            report.skipped = Some("all endpoints accessible without bypass".to_string());
            return report;
        }
        if plan.only_blocked {
            report.tested = report
                .baseline
                .iter()
                .filter(|r| !r.success)
                .map(|r| r.endpoint.clone())
                .collect();
        }
    }

    let targeting = match &plan.target {
        TargetSpec::Domains => Targeting::Hostlist(report.tested.clone()),
        TargetSpec::Ipset(path) => Targeting::Ipset(path.clone()),
    };

    info!("🧪 {} strategies to test", strategies.len());
    let runs = coordinator.run_all(&strategies, &targeting, &report.tested, check).await;

    for (run, strategy) in runs.iter().zip(strategies.iter()) {
        report.results.extend(run.results.iter().cloned());
        let v = verdict(run, strategy.name());
        if run.passed(report.tested.len()) {
            info!("  ✅ {} ({:.3}s)", v.name, v.time_secs.unwrap_or_default());
            report.viable.push(v);
        } else {
            info!("  ❌ {}: {}", v.name, v.error.as_deref().unwrap_or("failed"));
            report.non_viable.push(v);
        }
    }
    report.viable.sort_by(|a, b| {
        a.time_secs
            .unwrap_or(f64::MAX)
            .total_cmp(&b.time_secs.unwrap_or(f64::MAX))
    });
    report.selected = selector::select(&report.results, check, &report.tested, plan.tie_break);
    report
}

pub fn describe(plan: &BlockcheckPlan) -> String {
    match &plan.target {
        TargetSpec::Domains => plan
            .endpoints
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(", "),
        TargetSpec::Ipset(path) => format!(
            "IPSet {}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{BlockcheckSettings, PathSettings},
        engine::{EngineHandle, EngineLauncher},
        error::Result,
        probe::{ProbeRunner, Transport, TransportOutcome},
    };
    use async_trait::async_trait;
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::{Arc, Mutex},
    };

    struct Handle;

    #[async_trait]
    impl EngineHandle for Handle {
        fn pid(&self) -> Option<u32> {
            None
        }
        async fn stop(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    /// Remembers the desync of the live engine so the transport can react
    struct Launcher(Arc<Mutex<Option<String>>>);

    #[async_trait]
    impl EngineLauncher for Launcher {
        async fn launch(&self, args: &[String]) -> Result<Box<dyn EngineHandle>> {
            *self.0.lock().unwrap() = args.iter().find(|a| a.starts_with("--dpi-desync=")).cloned();
            Ok(Box::new(Handle))
        }
    }

    /// `blocked.com` only opens with `--dpi-desync=fake,split2`;
    /// `youtube.com` opens with any engine
    struct Dpi(Arc<Mutex<Option<String>>>);

    #[async_trait]
    impl Transport for Dpi {
        async fn request(&self, ep: &Endpoint, _: CheckKind, _: IpAddr, _: Duration) -> TransportOutcome {
            let live = self.0.lock().unwrap().clone();
            let open = match ep.host.as_str() {
                "blocked.com" => live.as_deref() == Some("--dpi-desync=fake,split2"),
                "youtube.com" => live.is_some(),
                _ => true,
            };
            if open {
                TransportOutcome::Response { status: 200, location: None }
            } else {
                TransportOutcome::Failed("connection reset by peer".into())
            }
        }
    }

    const CATALOG: &str = "\
https : --dpi-desync=fake --dpi-desync-ttl=3
https : --dpi-desync=fake,split2 --dpi-desync-split-pos=1
http : --dpi-desync=split2
";

    fn coordinator(hosts: &[&str], only_blocked: bool) -> (Coordinator, BlockcheckSettings) {
        let state = Arc::new(Mutex::new(None));
        let settings = BlockcheckSettings {
            rate_refill_per_sec: 0.0,
            only_blocked,
            ..Default::default()
        };
        let runner = ProbeRunner::new(Arc::new(Dpi(state.clone())), &settings);
        for h in hosts {
            runner.dns().seed(h, IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        let c = Coordinator::new(Arc::new(Launcher(state)), Arc::new(runner), PathSettings::default(), &settings);
        (c, settings)
    }

    fn plan(hosts: &[&str], checks: Vec<CheckKind>, only_blocked: bool) -> BlockcheckPlan {
        BlockcheckPlan {
            endpoints: hosts.iter().map(|h| h.parse().unwrap()).collect(),
            target: TargetSpec::Domains,
            checks,
            only_blocked,
            tie_break: TieBreak::Earliest,
        }
    }

    #[tokio::test]
    async fn test_finds_working_strategy() {
        let hosts = ["blocked.com", "youtube.com"];
        let (mut c, _) = coordinator(&hosts, false);
        let catalog = Catalog::parse(CATALOG);
        let report = run_blockcheck(&mut c, &catalog, &plan(&hosts, vec![CheckKind::HttpsTls13], false), 1).await;

        let check = &report.checks[0];
        assert_eq!(check.baseline.len(), 2);
        assert_eq!(check.viable.len(), 1);
        assert_eq!(check.viable[0].strategy, StrategyId::Catalog(1));
        assert_eq!(check.non_viable.len(), 1);
        assert_eq!(check.selected.as_ref().unwrap().strategy, StrategyId::Catalog(1));
        assert!(report.has_viable());
        assert!(report.dns.hits > 0);
    }

    #[tokio::test]
    async fn test_skips_check_when_all_accessible() {
        let hosts = ["open.com"];
        let (mut c, _) = coordinator(&hosts, false);
        let catalog = Catalog::parse(CATALOG);
        let report = run_blockcheck(&mut c, &catalog, &plan(&hosts, vec![CheckKind::HttpsTls13], false), 1).await;
        assert!(report.checks[0].skipped.is_some());
        assert!(report.checks[0].results.is_empty());
    }

    #[tokio::test]
    async fn test_only_blocked_narrows_endpoints() {
        let hosts = ["blocked.com", "open.com"];
        let (mut c, _) = coordinator(&hosts, true);
        let catalog = Catalog::parse(CATALOG);
        let report = run_blockcheck(&mut c, &catalog, &plan(&hosts, vec![CheckKind::HttpsTls13], true), 1).await;
        assert_eq!(report.checks[0].tested, vec!["blocked.com".parse::<Endpoint>().unwrap()]);
    }

    #[tokio::test]
    async fn test_no_strategies_for_protocol() {
        let hosts = ["blocked.com"];
        let (mut c, _) = coordinator(&hosts, false);
        let catalog = Catalog::parse(CATALOG);
        let report = run_blockcheck(&mut c, &catalog, &plan(&hosts, vec![CheckKind::Http3], false), 1).await;
        assert!(report.checks[0].skipped.as_deref().unwrap().contains("http3"));
        assert!(!report.has_viable());
    }
}
