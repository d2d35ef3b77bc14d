//! Blockcheck summary: `result.txt`, terminal output and JSON

use std::path::{Path, PathBuf};

use colored::Colorize;
use tracing::info;

use crate::{
    blockcheck::{BlockcheckReport, TargetSpec},
    error::Result,
};

pub const RESULT_FILE: &str = "result.txt";

pub fn title(report: &BlockcheckReport) -> String {
    match &report.target {
        TargetSpec::Domains => format!(
            "SUMMARY for {}",
            report
                .endpoints
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        TargetSpec::Ipset(path) => format!(
            "SUMMARY for IPSet: {}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
        ),
    }
}

/// "Avg Time" when the figure is a mean over several endpoints or repeats
fn time_label(report: &BlockcheckReport) -> &'static str {
    let many_domains = report.target == TargetSpec::Domains && report.endpoints.len() > 1;
    if many_domains || report.repeats > 1 {
        "Avg Time"
    } else {
        "Time"
    }
}

/// Plain-text summary as saved to `result.txt`
pub fn summary_text(report: &BlockcheckReport) -> String {
    let title = title(report);
    let label = time_label(report);
    let mut lines = vec![title.clone(), format!("{}\n", "=".repeat(title.chars().count()))];

    for check in report.checks.iter().filter(|c| !c.viable.is_empty()) {
        lines.push(format!("# Successful {} strategies (sorted by speed):", check.check.title()));
        for v in &check.viable {
            lines.push(format!("  ({}: {:.3}s) {}", label, v.time_secs.unwrap_or_default(), v.name));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Write the summary into `<base_dir>/result.txt`
pub fn write_result_file(report: &BlockcheckReport, base_dir: &Path) -> Result<PathBuf> {
    let path = base_dir.join(RESULT_FILE);
    std::fs::write(&path, summary_text(report))?;
    info!("💾 Summary saved to {}", path.display());
    Ok(path)
}

pub fn to_json(report: &BlockcheckReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}

/// Colored summary for the terminal
pub fn print_summary(report: &BlockcheckReport) {
    let title = title(report);
    println!("\n{}", "═".repeat(60).cyan());
    println!("  {}", title.cyan().bold());
    println!("{}", "═".repeat(60).cyan());

    for check in &report.checks {
        if let Some(reason) = &check.skipped {
            println!("\n  ⏭️  {}: {}", check.check.title().bright_white(), reason.yellow());
            continue;
        }
        if check.viable.is_empty() {
            println!("\n  ❌ {}: {}", check.check.title().bright_white(), "no working strategy".red());
            continue;
        }
        println!(
            "\n  {} {}",
            format!("# Successful {} strategies", check.check.title()).green().bold(),
            "(sorted by speed):"
        );
        let label = time_label(report);
        for v in &check.viable {
            let t = v.time_secs.unwrap_or_default();
            let time = format!("({}: {:.3}s)", label, t);
            let time = if t < 0.3 {
                time.green()
            } else if t < 1.0 {
                time.yellow()
            } else {
                time.red()
            };
            println!("    {} {}", time, v.name);
        }
        if let Some(best) = &check.selected {
            println!("    🏆 selected: {}", best.strategy.to_string().cyan());
        }
        println!("    {} {} non-viable", "└──".dimmed(), check.non_viable.len());
    }

    if !report.has_viable() {
        println!("\n  ⚠️  {}", "No working strategies found.".yellow());
    }

    let dns = report.dns;
    if dns.hits + dns.misses > 0 {
        println!(
            "\n  🔍 DNS Cache Stats: {} hits, {} misses ({:.1}% hit rate)",
            dns.hits,
            dns.misses,
            dns.hit_rate()
        );
    }
    println!("{}", "═".repeat(60).cyan());
}
