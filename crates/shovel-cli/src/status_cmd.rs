//! `shovel status` command: summarize an output file and its failure log.

use std::path::Path;

use anyhow::{Context, Result};

use shovel_core::checkpoint::{
    Outcome, OutputSummary, failures_path_for, load_failures, load_results,
};

/// Run the status command.
pub fn run_status(output: &Path) -> Result<()> {
    let results = load_results(output)
        .with_context(|| format!("failed to read {}", output.display()))?;
    let summary = OutputSummary::from_results(&results);

    println!("Output: {}", output.display());
    println!("  Results: {}", summary.total);
    println!("  With OMNIGRIL_EXIT_CODE: {}", summary.with_exit_marker);
    println!("  With setup_repo.sh: {}", summary.with_setup_repo);

    let failures_path = failures_path_for(output);
    let failures = load_failures(&failures_path)
        .with_context(|| format!("failed to read {}", failures_path.display()))?;
    // A later success supersedes an earlier failure of the same instance.
    let outstanding: Vec<_> = failures
        .iter()
        .filter(|r| !results.contains_key(&r.instance_id))
        .collect();

    println!();
    if outstanding.is_empty() {
        println!("No outstanding failures.");
        return Ok(());
    }

    println!("Failures ({}):", outstanding.len());
    for record in outstanding {
        let kind = record
            .failure_kind()
            .map(|k| k.to_string())
            .unwrap_or_default();
        let message = match &record.outcome {
            Outcome::Failed { message, .. } => message.as_str(),
            Outcome::Succeeded { .. } => "",
        };
        let first_line = message.lines().next().unwrap_or_default();
        println!("  [!] {:<40} {:<20} {}", record.instance_id, kind, first_line);
    }

    Ok(())
}
