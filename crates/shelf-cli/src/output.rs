//! Terminal output formatting.

use colored::{ColoredString, Colorize};
use shelf_core::{DocumentCounts, GraphCounts, RunOutcome, RunReport};

fn outcome_label(outcome: &RunOutcome) -> ColoredString {
    match outcome {
        RunOutcome::Completed => "completed".green().bold(),
        RunOutcome::CompletedWithSkips => "completed, records skipped".yellow().bold(),
        RunOutcome::Aborted { .. } => "aborted".red().bold(),
        RunOutcome::Cancelled => "cancelled".dimmed().bold(),
    }
}

/// Print the run summary table and every issue.
pub fn print_report(report: &RunReport) {
    println!();
    println!(
        "{} {} {}",
        "Sync run".bold(),
        report.run_id.to_string().dimmed(),
        outcome_label(&report.outcome)
    );
    if let RunOutcome::Aborted { reason } = &report.outcome {
        println!("  {} {}", "Reason:".bold(), reason.red());
    }
    if !report.graph_enabled {
        println!("  {}", "Graph phase was disabled; affected documents stay pending.".yellow());
    }
    println!();

    println!(
        "{:<14} {:>8} {:>8} {:>8} {:>9} {:>8} {:>8} {:>7}",
        "Collection", "Received", "Created", "Updated", "Unchanged", "Deleted", "Skipped", "Graph"
    );
    println!("{}", "─".repeat(78));
    for (collection, stats) in &report.collections {
        println!(
            "{:<14} {:>8} {:>8} {:>8} {:>9} {:>8} {:>8} {:>7}",
            collection.as_str(),
            stats.received,
            stats.created,
            stats.updated,
            stats.unchanged,
            stats.deleted,
            if stats.skipped > 0 {
                stats.skipped.to_string().yellow()
            } else {
                stats.skipped.to_string().normal()
            },
            stats.graph_synced
        );
    }
    if report.recovered > 0 {
        println!("{} {}", "Recovered pending documents:".bold(), report.recovered);
    }

    if report.issues.is_empty() {
        return;
    }
    println!();
    println!("{} ({})", "Issues".bold(), report.issues.len());
    for issue in &report.issues {
        let scope = match (&issue.collection, &issue.key) {
            (Some(collection), Some(key)) => format!("{}/{}", collection, key),
            (Some(collection), None) => collection.to_string(),
            (None, _) => "run".to_string(),
        };
        println!(
            "  {} {} {} {}",
            format!("[{}]", issue.phase.as_str()).dimmed(),
            format!("{:?}", issue.kind).cyan(),
            scope.bold(),
            issue.cause
        );
    }
}

pub fn print_document_counts(counts: &DocumentCounts) {
    println!("{}", "Documents".bold());
    println!("{:<14} {:>8} {:>9}", "Collection", "Active", "Inactive");
    println!("{}", "─".repeat(33));
    for collection in shelf_core::Collection::ALL {
        let active = counts.active.get(&collection).copied().unwrap_or(0);
        let inactive = counts.inactive.get(&collection).copied().unwrap_or(0);
        println!("{:<14} {:>8} {:>9}", collection.as_str(), active, inactive);
    }
    let pending = if counts.pending > 0 {
        counts.pending.to_string().yellow()
    } else {
        counts.pending.to_string().green()
    };
    println!("{} {}", "Pending graph sync:".bold(), pending);
}

pub fn print_graph_counts(counts: &GraphCounts) {
    println!("{}", "Graph".bold());
    if counts.nodes.is_empty() && counts.relationships.is_empty() {
        println!("{}", "Graph is empty.".dimmed());
        return;
    }
    for (label, count) in &counts.nodes {
        println!("  {:<16} {:>8}", label.cyan(), count);
    }
    for (rel_type, count) in &counts.relationships {
        println!("  {:<16} {:>8}", rel_type.magenta(), count);
    }
}
