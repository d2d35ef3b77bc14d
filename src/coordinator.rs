//! Concurrency Coordinator
//!
//! Activates strategies one at a time through the engine slot and fans the
//! endpoint probes of the live strategy out over a bounded worker pool.

use std::sync::Arc;

use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info, warn};

use crate::{
    catalog::Strategy,
    circuit_breaker::CircuitBreaker,
    config::{BlockcheckSettings, PathSettings},
    engine::{EngineLauncher, EngineSlot},
    error::ManagerError,
    probe::ProbeRunner,
    targets::Targeting,
    types::{CheckKind, Endpoint, ProbeResult, StrategyId},
};

/// Results of one strategy activation
#[derive(Debug, Clone)]
pub struct StrategyRun {
    pub strategy: StrategyId,
    pub check: CheckKind,
    /// In endpoint order; endpoints skipped after an abort have no entry
    pub results: Vec<ProbeResult>,
    /// Breaker opened before every endpoint was scheduled
    pub aborted: bool,
    /// Engine stderr when the strategy could not be started
    pub launch_error: Option<String>,
}

impl StrategyRun {
    /// Every scheduled endpoint passed and none were skipped
    pub fn passed(&self, endpoint_count: usize) -> bool {
        self.launch_error.is_none()
            && !self.aborted
            && self.results.len() == endpoint_count
            && self.results.iter().all(|r| r.success)
    }

    /// Mean latency over the successful probes
    pub fn mean_latency(&self) -> Option<std::time::Duration> {
        let lat: Vec<_> = self.results.iter().filter_map(|r| r.latency).collect();
        if lat.is_empty() {
            None
        } else {
            Some(lat.iter().sum::<std::time::Duration>() / lat.len() as u32)
        }
    }

    pub fn first_error(&self) -> Option<&str> {
        self.results.iter().find_map(|r| r.error.as_deref())
    }
}

pub struct Coordinator {
    slot: EngineSlot,
    runner: Arc<ProbeRunner>,
    paths: PathSettings,
    max_workers: usize,
    failure_threshold: u32,
}

impl Coordinator {
    pub fn new(
        launcher: Arc<dyn EngineLauncher>,
        runner: Arc<ProbeRunner>,
        paths: PathSettings,
        settings: &BlockcheckSettings,
    ) -> Self {
        Self::with_slot(EngineSlot::new(launcher), runner, paths, settings)
    }

    pub fn with_slot(
        slot: EngineSlot,
        runner: Arc<ProbeRunner>,
        paths: PathSettings,
        settings: &BlockcheckSettings,
    ) -> Self {
        Self {
            slot,
            runner,
            paths,
            max_workers: settings.max_workers.max(1),
            failure_threshold: settings.failure_threshold,
        }
    }

    pub fn runner(&self) -> &ProbeRunner {
        &self.runner
    }

    pub fn paths(&self) -> &PathSettings {
        &self.paths
    }

    /// Probe every endpoint with no engine running
    pub async fn baseline(&mut self, endpoints: &[Endpoint], check: CheckKind) -> Vec<ProbeResult> {
        self.slot.release().await;
        let (results, _) = self.fan_out(None, endpoints, check, None).await;
        results
    }

    /// Start `strategy`, probe `endpoints` under it, stop it again
    pub async fn run_strategy(
        &mut self,
        strategy: &Strategy,
        targeting: &Targeting,
        endpoints: &[Endpoint],
        check: CheckKind,
    ) -> StrategyRun {
        let args = strategy.build_command(self.slot.diversion(), targeting, &self.paths);

        if let Err(e) = self.slot.activate(strategy.id, strategy.protocol, &args).await {
            let detail = match &e {
                ManagerError::ProcessLaunch { message, stderr } if !stderr.is_empty() => {
                    format!("{}: {}", message, stderr)
                }
                other => other.to_string(),
            };
            warn!("💥 Strategy {} could not start: {}", strategy.id, detail);
            let results = endpoints
                .iter()
                .map(|ep| ProbeResult::failed(Some(strategy.id), ep.clone(), check, detail.clone()))
                .collect();
            return StrategyRun {
                strategy: strategy.id,
                check,
                results,
                aborted: true,
                launch_error: Some(detail),
            };
        }

        let breaker = Arc::new(CircuitBreaker::new(self.failure_threshold));
        let (results, aborted) = self.fan_out(Some(strategy.id), endpoints, check, Some(breaker)).await;
        self.slot.release().await;

        StrategyRun { strategy: strategy.id, check, results, aborted, launch_error: None }
    }

    /// Run strategies strictly one after another
    pub async fn run_all(
        &mut self,
        strategies: &[&Strategy],
        targeting: &Targeting,
        endpoints: &[Endpoint],
        check: CheckKind,
    ) -> Vec<StrategyRun> {
        let mut runs = Vec::with_capacity(strategies.len());
        for (i, strategy) in strategies.iter().enumerate() {
            info!("🧪 [{}/{}] {}", i + 1, strategies.len(), strategy.name());
            runs.push(self.run_strategy(strategy, targeting, endpoints, check).await);
        }
        runs
    }

    /// Stop whatever is still running
    pub async fn shutdown(&mut self) {
        self.slot.release().await;
    }

    async fn fan_out(
        &self,
        strategy: Option<StrategyId>,
        endpoints: &[Endpoint],
        check: CheckKind,
        breaker: Option<Arc<CircuitBreaker>>,
    ) -> (Vec<ProbeResult>, bool) {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();
        let mut aborted = false;

        for (idx, endpoint) in endpoints.iter().enumerate() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            if breaker.as_ref().map(|b| b.is_open()).unwrap_or(false) {
                debug!("⛔ Breaker open, {} endpoints not scheduled", endpoints.len() - idx);
                aborted = true;
                break;
            }

            let runner = self.runner.clone();
            let breaker = breaker.clone();
            let endpoint = endpoint.clone();
            tasks.spawn(async move {
                let result = runner.probe(strategy, &endpoint, check).await;
                if let Some(b) = &breaker {
                    if result.success {
                        b.record_success();
                    } else if b.record_failure() {
                        debug!("🔌 Breaker opened on {}", endpoint);
                    }
                }
                drop(permit);
                (idx, result)
            });
        }

        let mut collected = Vec::with_capacity(endpoints.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(pair) => collected.push(pair),
                Err(e) => warn!("⚠️ Probe task failed: {}", e),
            }
        }
        collected.sort_by_key(|(idx, _)| *idx);
        (collected.into_iter().map(|(_, r)| r).collect(), aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::EngineHandle,
        error::Result,
        probe::{Transport, TransportOutcome},
        types::Protocol,
    };
    use async_trait::async_trait;
    use std::{
        collections::HashSet,
        net::{IpAddr, Ipv4Addr},
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    struct NoopHandle;

    #[async_trait]
    impl EngineHandle for NoopHandle {
        fn pid(&self) -> Option<u32> {
            None
        }
        async fn stop(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    /// Fails for argument lists containing `--dpi-desync=rst`
    struct FakeLauncher {
        launches: AtomicUsize,
    }

    #[async_trait]
    impl EngineLauncher for FakeLauncher {
        async fn launch(&self, args: &[String]) -> Result<Box<dyn EngineHandle>> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if args.iter().any(|a| a == "--dpi-desync=rst") {
                return Err(ManagerError::launch("engine wrote to stderr", "error: bad filter"));
            }
            Ok(Box::new(NoopHandle))
        }
    }

    /// Counts in-flight requests; hosts in `blocked` are reset
    struct CountingTransport {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        blocked: HashSet<String>,
    }

    impl CountingTransport {
        fn new(blocked: &[&str]) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                blocked: blocked.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn request(&self, endpoint: &Endpoint, _: CheckKind, _: IpAddr, _: Duration) -> TransportOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.blocked.contains(&endpoint.host) {
                TransportOutcome::Failed("connection reset by peer".into())
            } else {
                TransportOutcome::Response { status: 200, location: None }
            }
        }
    }

    fn endpoints(n: usize) -> Vec<Endpoint> {
        (0..n).map(|i| format!("host{}.example", i).parse().unwrap()).collect()
    }

    fn setup(
        transport: Arc<CountingTransport>,
        eps: &[Endpoint],
        max_workers: usize,
        failure_threshold: u32,
    ) -> (Coordinator, Arc<FakeLauncher>) {
        let settings = BlockcheckSettings {
            max_workers,
            failure_threshold,
            rate_refill_per_sec: 0.0,
            timeout_ms: 1000,
            ..Default::default()
        };
        let runner = ProbeRunner::new(transport, &settings);
        for ep in eps {
            runner.dns().seed(&ep.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        let launcher = Arc::new(FakeLauncher { launches: AtomicUsize::new(0) });
        let coordinator = Coordinator::new(launcher.clone(), Arc::new(runner), PathSettings::default(), &settings);
        (coordinator, launcher)
    }

    fn strategy(idx: usize, desync: &str) -> Strategy {
        Strategy::new(StrategyId::Catalog(idx), Protocol::Https, vec![format!("--dpi-desync={}", desync)]).unwrap()
    }

    #[tokio::test]
    async fn test_never_exceeds_max_workers() {
        let transport = Arc::new(CountingTransport::new(&[]));
        let eps = endpoints(12);
        let (mut coordinator, _) = setup(transport.clone(), &eps, 3, 1);

        let run = coordinator
            .run_strategy(&strategy(0, "fake"), &Targeting::Hostlist(eps.clone()), &eps, CheckKind::HttpsTls13)
            .await;

        assert!(run.passed(eps.len()));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 12);
        assert!(transport.peak.load(Ordering::SeqCst) <= 3);
        assert!(transport.peak.load(Ordering::SeqCst) >= 2);
        // attributed in endpoint order
        let hosts: Vec<_> = run.results.iter().map(|r| r.endpoint.clone()).collect();
        assert_eq!(hosts, eps);
    }

    #[tokio::test]
    async fn test_early_abort_stops_scheduling() {
        let eps = endpoints(5);
        let blocked: Vec<&str> = eps.iter().map(|e| e.host.as_str()).collect();
        let transport = Arc::new(CountingTransport::new(&blocked));
        let (mut coordinator, _) = setup(transport.clone(), &eps, 1, 1);

        let run = coordinator
            .run_strategy(&strategy(0, "fake"), &Targeting::Hostlist(eps.clone()), &eps, CheckKind::HttpsTls13)
            .await;

        assert!(run.aborted);
        assert_eq!(run.results.len(), 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_threshold_allows_more_failures() {
        let eps = endpoints(5);
        let blocked: Vec<&str> = eps.iter().map(|e| e.host.as_str()).collect();
        let transport = Arc::new(CountingTransport::new(&blocked));
        let (mut coordinator, _) = setup(transport.clone(), &eps, 1, 3);

        let run = coordinator
            .run_strategy(&strategy(0, "fake"), &Targeting::Hostlist(eps.clone()), &eps, CheckKind::HttpsTls13)
            .await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(run.results.iter().filter(|r| !r.success).count(), 3);
    }

    #[tokio::test]
    async fn test_launch_failure_marks_strategy_non_viable() {
        let transport = Arc::new(CountingTransport::new(&[]));
        let eps = endpoints(2);
        let (mut coordinator, launcher) = setup(transport.clone(), &eps, 4, 1);
        let strategies = [strategy(0, "rst"), strategy(1, "fake")];
        let refs: Vec<&Strategy> = strategies.iter().collect();

        let runs = coordinator
            .run_all(&refs, &Targeting::Hostlist(eps.clone()), &eps, CheckKind::HttpsTls13)
            .await;

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        assert!(runs[0].launch_error.as_deref().unwrap().contains("bad filter"));
        assert_eq!(runs[0].results.len(), 2);
        assert!(runs[0].results.iter().all(|r| !r.success));
        assert!(runs[1].passed(2));
        // only the viable strategy reached the network
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    /// Records every argument list it is asked to start
    #[derive(Default)]
    struct RecordingLauncher {
        launched: std::sync::Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl EngineLauncher for RecordingLauncher {
        async fn launch(&self, args: &[String]) -> Result<Box<dyn EngineHandle>> {
            self.launched.lock().unwrap().push(args.to_vec());
            Ok(Box::new(NoopHandle))
        }
    }

    /// Accepts every command and keeps its program + args
    #[derive(Default)]
    struct RecordingShell {
        commands: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl crate::shell::CommandRunner for RecordingShell {
        async fn run(&self, program: &str, args: &[String]) -> Result<crate::shell::CommandOutput> {
            self.commands.lock().unwrap().push(format!("{} {}", program, args.join(" ")));
            Ok(crate::shell::CommandOutput::ok(""))
        }

        async fn is_elevated(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_nfqws_gets_queue_args_and_rule() {
        let eps = endpoints(2);
        let settings = BlockcheckSettings { rate_refill_per_sec: 0.0, ..Default::default() };
        let runner = ProbeRunner::new(Arc::new(CountingTransport::new(&[])), &settings);
        for ep in &eps {
            runner.dns().seed(&ep.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        let launcher = Arc::new(RecordingLauncher::default());
        let shell = Arc::new(RecordingShell::default());
        let slot = EngineSlot::with_diversion(
            launcher.clone(),
            crate::engine::Diversion::Nfqueue { qnum: 300 },
            shell.clone(),
        );
        let mut coordinator = Coordinator::with_slot(slot, Arc::new(runner), PathSettings::default(), &settings);

        let run = coordinator
            .run_strategy(&strategy(0, "fake"), &Targeting::Hostlist(eps.clone()), &eps, CheckKind::HttpsTls13)
            .await;
        assert!(run.passed(2));

        let launched = launcher.launched.lock().unwrap().clone();
        assert_eq!(launched[0][0], "--qnum=300");
        assert!(launched[0].iter().all(|a| !a.starts_with("--wf-")));
        let commands = shell.commands.lock().unwrap().clone();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].starts_with("iptables -t mangle -I OUTPUT -p tcp --dport 443 -j NFQUEUE --queue-num 300"));
        assert!(commands[1].starts_with("iptables -t mangle -D OUTPUT"));
    }

    #[tokio::test]
    async fn test_baseline_has_no_strategy() {
        let eps = endpoints(3);
        let transport = Arc::new(CountingTransport::new(&[eps[1].host.as_str()]));
        let (mut coordinator, launcher) = setup(transport, &eps, 10, 1);
        let results = coordinator.baseline(&eps, CheckKind::Http).await;
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.strategy.is_none()));
        assert!(!results[1].success);
    }
}
