//! Preset auto-adjust
//!
//! Re-tests every rule of a preset and swaps broken strategies for working
//! catalog entries that use the same `--dpi-desync` technique. Rules sharing
//! a `(check, desync)` category are tested once.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    catalog::{find_value, Catalog},
    coordinator::Coordinator,
    error::Result,
    preset::Preset,
    selector::{self, TieBreak},
    targets::Targeting,
    types::{CheckKind, Endpoint, StrategyId},
};

const REPEATS_FLAG: &str = "--dpi-desync-repeats";

/// Verdict for one `(check, desync)` category
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "verdict")]
pub enum CategoryVerdict {
    /// The preset's own strategy still works
    OriginalWorks,
    /// Replaced by this catalog entry
    Replaced { strategy: StrategyId, args: Vec<String> },
    /// No catalog entry with the same desync value
    NoCandidates,
    /// Candidates exist but none passed every endpoint
    NoViable,
    /// The rule's own args could not be tested
    Untestable { reason: String },
}

/// What happened to one preset rule
#[derive(Debug, Clone, Serialize)]
pub struct RuleDecision {
    pub rule: usize,
    pub check: Option<CheckKind>,
    pub desync: Option<String>,
    pub verdict: Option<CategoryVerdict>,
    /// New strategy args when the rule changed
    pub new_args: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AdjustOutcome {
    /// Every rule works as written, no file written
    Unchanged,
    Written { path: PathBuf, changed_rules: Vec<usize> },
    /// Something is broken and nothing in the catalog fixes it
    NoViable { rules: Vec<usize> },
}

#[derive(Debug, Clone, Serialize)]
pub struct AdjustReport {
    pub preset: PathBuf,
    pub endpoints: Vec<Endpoint>,
    pub decisions: Vec<RuleDecision>,
    pub outcome: AdjustOutcome,
}

/// `winner` plus the original rule's repeats flag when the winner has none
pub fn with_original_repeats(winner: &[String], original: &[String]) -> Vec<String> {
    let mut args = winner.to_vec();
    if find_value(winner, REPEATS_FLAG).is_none() {
        if let Some(repeats) = original.iter().find(|a| a.starts_with(REPEATS_FLAG)) {
            info!("🔁 Re-applied original {}", repeats);
            args.push(repeats.clone());
        }
    }
    args
}

/// Test one category: the original rule first, then same-desync candidates
#[allow(clippy::too_many_arguments)]
async fn resolve_category(
    coordinator: &mut Coordinator,
    catalog: &Catalog,
    preset: &Preset,
    rule: usize,
    check: CheckKind,
    desync: &str,
    endpoints: &[Endpoint],
    tie_break: TieBreak,
) -> CategoryVerdict {
    let targeting = Targeting::Hostlist(endpoints.to_vec());

    info!("🔎 Verifying original {} strategy ({})", check, desync);
    match preset.rule_strategy(rule) {
        Ok(original) => {
            let run = coordinator.run_strategy(&original, &targeting, endpoints, check).await;
            if run.passed(endpoints.len()) {
                info!(
                    "✅ Original strategy works ({:.3}s)",
                    run.mean_latency().unwrap_or_default().as_secs_f64()
                );
                return CategoryVerdict::OriginalWorks;
            }
            info!("❌ Original strategy failed: {}", run.first_error().unwrap_or("unknown"));
        }
        Err(e) => {
            warn!("⚠️ Rule {} cannot be tested: {}", rule + 1, e);
            return CategoryVerdict::Untestable { reason: e.to_string() };
        }
    }

    let candidates = catalog.candidates(check.protocol(), desync);
    if candidates.is_empty() {
        warn!("⚠️ No catalog strategies with --dpi-desync={} for {}", desync, check.protocol());
        return CategoryVerdict::NoCandidates;
    }

    info!("🧪 Testing {} alternatives for ({}, {})", candidates.len(), check, desync);
    let runs = coordinator.run_all(&candidates, &targeting, endpoints, check).await;
    let results: Vec<_> = runs.into_iter().flat_map(|r| r.results).collect();

    match selector::select(&results, check, endpoints, tie_break)
        .and_then(|best| catalog.get(best.strategy).map(|s| (best, s)))
    {
        Some((best, strategy)) => {
            info!(
                "🏆 Replacement found: {} ({:.3}s)",
                strategy.name(),
                best.mean_latency.unwrap_or_default().as_secs_f64()
            );
            CategoryVerdict::Replaced { strategy: strategy.id, args: strategy.args.clone() }
        }
        None => {
            warn!("⚠️ No working replacement for ({}, {})", check, desync);
            CategoryVerdict::NoViable
        }
    }
}

/// Adjust `preset` in place of the user: returns what was decided and, when
/// something changed, writes `<stem>_adjusted.<ext>` next to it
pub async fn adjust_preset(
    coordinator: &mut Coordinator,
    catalog: &Catalog,
    preset: &Preset,
    endpoints: &[Endpoint],
    tie_break: TieBreak,
) -> Result<AdjustReport> {
    let mut cache: IndexMap<(CheckKind, String), CategoryVerdict> = IndexMap::new();
    let mut decisions = Vec::with_capacity(preset.rules.len());
    let mut choices: BTreeMap<usize, Vec<String>> = BTreeMap::new();

    for (idx, rule) in preset.rules.iter().enumerate() {
        let Some((check, desync)) = rule.category() else {
            info!("⏭️ Rule {} has no testable filter or desync, kept", idx + 1);
            decisions.push(RuleDecision { rule: idx, check: rule.check(), desync: None, verdict: None, new_args: None });
            continue;
        };

        let key = (check, desync.clone());
        let verdict = match cache.get(&key) {
            Some(v) => {
                info!("♻️ Using cached result for ({}, {})", check, desync);
                v.clone()
            }
            None => {
                let v = resolve_category(coordinator, catalog, preset, idx, check, &desync, endpoints, tie_break).await;
                cache.insert(key, v.clone());
                v
            }
        };

        let new_args = match &verdict {
            CategoryVerdict::Replaced { args, .. } => {
                let args = with_original_repeats(args, &rule.strategy_args);
                (args != rule.strategy_args).then_some(args)
            }
            _ => None,
        };
        if let Some(args) = &new_args {
            choices.insert(idx, args.clone());
        }
        decisions.push(RuleDecision { rule: idx, check: Some(check), desync: Some(desync), verdict: Some(verdict), new_args });
    }
    coordinator.shutdown().await;

    let outcome = if choices.is_empty() {
        let broken: Vec<usize> = decisions
            .iter()
            .filter(|d| matches!(d.verdict, Some(CategoryVerdict::NoCandidates | CategoryVerdict::NoViable)))
            .map(|d| d.rule)
            .collect();
        if broken.is_empty() {
            info!("✅ All strategies in the preset work, no new file written");
            AdjustOutcome::Unchanged
        } else {
            warn!("⚠️ No viable strategy found for rules {:?}", broken.iter().map(|r| r + 1).collect::<Vec<_>>());
            AdjustOutcome::NoViable { rules: broken }
        }
    } else {
        let adjusted = selector::assemble(preset, &choices, coordinator.paths());
        let path = preset.adjusted_path();
        adjusted.write_to(&path)?;
        AdjustOutcome::Written { path, changed_rules: choices.keys().copied().collect() }
    };

    Ok(AdjustReport {
        preset: preset.path.clone(),
        endpoints: endpoints.to_vec(),
        decisions,
        outcome,
    })
}

/// Load `path` and adjust it
pub async fn adjust_file(
    coordinator: &mut Coordinator,
    catalog: &Catalog,
    path: &Path,
    endpoints: &[Endpoint],
    tie_break: TieBreak,
) -> Result<AdjustReport> {
    let preset = Preset::load(path)?;
    if preset.rules.is_empty() {
        return Err(crate::error::ManagerError::config(format!(
            "{}: no testable rules",
            path.display()
        )));
    }
    adjust_preset(coordinator, catalog, &preset, endpoints, tie_break).await
}
