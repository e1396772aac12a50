//! Dry planning: `debris plan`.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::process::ExitCode;
use std::sync::Arc;

use super::super::{Cli, SelectionArgs};

/// Plan against the checkout as it is now. No refresh, no lock, no builds.
pub async fn cmd_plan(cli: &Cli, selection: &SelectionArgs, json: bool) -> Result<ExitCode> {
    use debris::config::{DebrisConfig, Settings};
    use debris::errors::RunError;
    use debris::history::{HistoryDb, HistoryHandle};
    use debris::process::SystemRunner;
    use debris::source::{GitVcs, SourceRepoManager};

    let settings = Settings::load(cli.config.as_deref()).map_err(RunError::from)?;
    let config = DebrisConfig::from_settings(&settings).map_err(RunError::from)?;
    let history = HistoryHandle::new(HistoryDb::open(&config.db_file).map_err(RunError::from)?);

    let source = SourceRepoManager::new(
        Arc::new(GitVcs::new(Arc::new(SystemRunner))),
        config.repo.local.clone(),
        config.repo.url.clone(),
        config.repo.aux_branch.clone(),
    );
    let exclude: BTreeSet<String> = selection.exclude.iter().cloned().collect();
    let plan = source
        .plan(&history, selection.package.as_deref(), &exclude)
        .await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&plan).context("Failed to serialize plan")?
        );
        return Ok(ExitCode::SUCCESS);
    }

    println!();
    if plan.to_build.is_empty() {
        println!("Nothing to build.");
    } else {
        println!("{}", console::style("Needs build:").bold());
        for entry in &plan.to_build {
            let previous = entry
                .previous
                .as_ref()
                .map(|v| format!("(built: {})", v))
                .unwrap_or_else(|| "(never built)".to_string());
            println!(
                "  {} {} {}",
                entry.package.name,
                console::style(&entry.package.version).green(),
                console::style(previous).dim()
            );
        }
    }
    if !plan.skipped.is_empty() {
        println!();
        println!("{}", console::style("Skipped:").bold());
        for skipped in &plan.skipped {
            println!(
                "  {} {} {}",
                skipped.name,
                skipped.version,
                console::style(format!("({})", skipped.reason)).dim()
            );
        }
    }
    println!();
    Ok(ExitCode::SUCCESS)
}
