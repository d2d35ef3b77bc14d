//! Strategy selection over collected probe results
//!
//! Everything here is pure: the same results always give the same choice.

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    config::PathSettings,
    preset::{Dialect, Preset},
    types::{CheckKind, Endpoint, ProbeResult, StrategyId},
};

/// Policy applied among strategies with the same success count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TieBreak {
    /// Lowest catalog position
    #[default]
    Earliest,
    /// Lowest mean latency, then catalog position
    Fastest,
}

/// Aggregate of one strategy's results for one check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyScore {
    pub strategy: StrategyId,
    pub check: CheckKind,
    pub passed: usize,
    pub failed: usize,
    pub mean_latency: Option<Duration>,
    /// Passed every mandatory endpoint
    pub eligible: bool,
}

/// Score every strategy that has results for `check`, ordered by id.
///
/// With an empty `mandatory` list a strategy is eligible when it has at
/// least one success and no failures.
pub fn score(results: &[ProbeResult], check: CheckKind, mandatory: &[Endpoint]) -> Vec<StrategyScore> {
    let mut grouped: BTreeMap<StrategyId, Vec<&ProbeResult>> = BTreeMap::new();
    for r in results.iter().filter(|r| r.check == check) {
        if let Some(id) = r.strategy {
            grouped.entry(id).or_default().push(r);
        }
    }

    grouped
        .into_iter()
        .map(|(strategy, rs)| {
            let passed = rs.iter().filter(|r| r.success).count();
            let failed = rs.len() - passed;
            let latencies: Vec<Duration> =
                rs.iter().filter(|r| r.success).filter_map(|r| r.latency).collect();
            let mean_latency = if latencies.is_empty() {
                None
            } else {
                Some(latencies.iter().sum::<Duration>() / latencies.len() as u32)
            };

            let eligible = if mandatory.is_empty() {
                passed > 0 && failed == 0
            } else {
                let ok: HashSet<&Endpoint> =
                    rs.iter().filter(|r| r.success).map(|r| &r.endpoint).collect();
                let bad: HashSet<&Endpoint> =
                    rs.iter().filter(|r| !r.success).map(|r| &r.endpoint).collect();
                mandatory.iter().all(|e| ok.contains(e) && !bad.contains(e))
            };

            StrategyScore { strategy, check, passed, failed, mean_latency, eligible }
        })
        .collect()
}

/// Best eligible strategy for `check`, or `None` when nothing qualifies
pub fn select(
    results: &[ProbeResult],
    check: CheckKind,
    mandatory: &[Endpoint],
    policy: TieBreak,
) -> Option<StrategyScore> {
    let eligible: Vec<StrategyScore> =
        score(results, check, mandatory).into_iter().filter(|s| s.eligible).collect();
    let best = eligible.iter().map(|s| s.passed).max()?;

    eligible.into_iter().filter(|s| s.passed == best).min_by(|a, b| match policy {
        TieBreak::Earliest => a.strategy.cmp(&b.strategy),
        TieBreak::Fastest => a
            .mean_latency
            .unwrap_or(Duration::MAX)
            .cmp(&b.mean_latency.unwrap_or(Duration::MAX))
            .then(a.strategy.cmp(&b.strategy)),
    })
}

/// Copy of `original` with the chosen strategy args swapped into the rules
/// named in `choices` (rule index → args). Rules without a choice keep their
/// own strategy; rule order, prefix args and global args are untouched.
///
/// Absolute paths under the bin or lists directory (the preset's own or the
/// configured one) are written back through the preset's `BIN`/`LISTS`
/// variables so the adjusted script stays relocatable.
pub fn assemble(original: &Preset, choices: &BTreeMap<usize, Vec<String>>, paths: &PathSettings) -> Preset {
    let folder = PathFolder::new(original, paths);
    let mut preset = original.clone();
    for (idx, rule) in preset.rules.iter_mut().enumerate() {
        if let Some(args) = choices.get(&idx) {
            rule.strategy_args = args.iter().map(|a| folder.fold(&localize(a, original.dialect))).collect();
        }
    }
    preset
}

/// Directory roots that map back to a script variable
struct PathFolder {
    dialect: Dialect,
    /// (directory, reference such as `%BIN%` or `${BIN}`)
    roots: Vec<(PathBuf, String)>,
}

impl PathFolder {
    fn new(preset: &Preset, paths: &PathSettings) -> Self {
        let mut roots = Vec::new();
        for (var, configured) in [("BIN", paths.bin_dir()), ("LISTS", paths.lists_dir())] {
            // only variables the script itself defines can be referenced
            let Some(raw) = preset.variable(var) else { continue };
            let mut reference = match preset.dialect {
                Dialect::Batch => format!("%{}%", var),
                Dialect::Shell => format!("${{{}}}", var),
            };
            if !raw.ends_with(|c: char| c == '\\' || c == '/') {
                reference.push(separator(preset.dialect));
            }
            roots.push((PathBuf::from(preset.expand(raw)), reference.clone()));
            roots.push((configured, reference));
        }
        Self { dialect: preset.dialect, roots }
    }

    /// `--flag=/abs/bin/x.bin` → `--flag=%BIN%x.bin`
    fn fold(&self, arg: &str) -> String {
        let Some((key, value)) = arg.split_once('=') else {
            return arg.to_string();
        };
        let path = Path::new(value.trim_matches('"'));
        if !path.is_absolute() {
            return arg.to_string();
        }
        for (root, reference) in &self.roots {
            if let Ok(rest) = path.strip_prefix(root) {
                let parts: Vec<String> =
                    rest.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
                let sep = separator(self.dialect).to_string();
                return format!("{}={}{}", key, reference, parts.join(&sep));
            }
        }
        arg.to_string()
    }
}

fn separator(dialect: Dialect) -> char {
    match dialect {
        Dialect::Batch => '\\',
        Dialect::Shell => '/',
    }
}

/// Rewrite catalog placeholders into the target script dialect
fn localize(arg: &str, dialect: Dialect) -> String {
    match dialect {
        Dialect::Batch => arg.to_string(),
        Dialect::Shell => {
            let replaced = arg
                .replace("%~dp0", "${SCRIPT_DIR}/")
                .replace("%BIN%", "${BIN}")
                .replace("%LISTS%", "${LISTS}");
            if replaced != arg {
                replaced.replace('\\', "/")
            } else {
                replaced
            }
        }
    }
}
