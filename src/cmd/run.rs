//! Full build run: `debris run`.

use anyhow::Result;
use std::collections::BTreeSet;
use std::process::ExitCode;
use std::sync::Arc;

use super::super::{Cli, SelectionArgs};

pub async fn cmd_run(
    cli: &Cli,
    selection: &SelectionArgs,
    no_pull: bool,
    update_only: bool,
    skip_prepare: bool,
) -> Result<ExitCode> {
    use debris::config::{DebrisConfig, Settings};
    use debris::errors::RunError;
    use debris::history::{HistoryDb, HistoryHandle};
    use debris::lock::RunLock;
    use debris::orchestrator::{Orchestrator, RunOptions};
    use debris::process::{CommandRunner, SystemRunner};
    use tokio_util::sync::CancellationToken;

    // Configuration errors abort before anything is touched.
    let settings = Settings::load(cli.config.as_deref()).map_err(RunError::from)?;
    let config = DebrisConfig::from_settings(&settings).map_err(RunError::from)?;
    if !update_only {
        config.require_output_dir().map_err(RunError::from)?;
    }

    let lock = RunLock::acquire(&config.lock_file)?;
    tracing::info!(run_id = %lock.run_id(), lock = %lock.path().display(), "run started");

    let history = HistoryHandle::new(HistoryDb::open(&config.db_file).map_err(RunError::from)?);
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, finishing in-flight builds");
                token.cancel();
            }
        });
    }

    let mut orchestrator =
        Orchestrator::from_config(&config, runner, history).with_cancellation(token);

    if update_only {
        println!();
        println!("{}", console::style("Updating build chroots").bold().cyan());
        for (target, result) in orchestrator.update_environments().await {
            match result {
                Ok(()) => println!("  {} {}", console::style("✓").green(), target),
                Err(e) => println!("  {} {}: {}", console::style("✗").red(), target, e),
            }
        }
        println!();
        return Ok(ExitCode::SUCCESS);
    }

    let options = RunOptions {
        only: selection.package.clone(),
        exclude: selection.exclude.iter().cloned().collect::<BTreeSet<_>>(),
        pull: config.repo.pull && !no_pull,
        skip_prepare,
    };
    let summary = orchestrator.run(&options).await?;
    print_summary(&summary);
    drop(lock);

    if summary.cancelled {
        return Ok(ExitCode::from(RunError::Cancelled.exit_code()));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_summary(summary: &debris::orchestrator::RunSummary) {
    println!();
    println!("{}", console::style("Run Summary").bold().cyan());
    println!("===========");

    if !summary.prepare_failures.is_empty() {
        println!();
        println!("{}", console::style("Unready chroots:").yellow().bold());
        for failure in &summary.prepare_failures {
            println!("  {} {}: {}", console::style("⚠").yellow(), failure.target, failure.error);
        }
    }

    if !summary.results.is_empty() {
        println!();
        for result in &summary.results {
            let mark = if result.outcome.is_success() {
                console::style("✓").green()
            } else {
                console::style("✗").red()
            };
            println!(
                "  {} {} {} on {}: {}",
                mark, result.package, result.version, result.target, result.outcome
            );
        }
    }

    if !summary.not_attempted.is_empty() {
        println!();
        println!("{}", console::style("Not attempted:").yellow());
        for pair in &summary.not_attempted {
            println!("  - {} on {}", pair.package, pair.target);
        }
    }

    if !summary.skipped.is_empty() {
        println!();
        for skipped in &summary.skipped {
            println!(
                "  {} {} {} ({})",
                console::style("-").dim(),
                skipped.name,
                skipped.version,
                console::style(skipped.reason).dim()
            );
        }
    }

    println!();
    println!(
        "{} built, {} failed, {} skipped",
        console::style(summary.built().count()).green(),
        console::style(summary.failed().count()).red(),
        summary.skipped.len()
    );
    if summary.cancelled {
        println!("{}", console::style("Run interrupted.").yellow());
    }
    println!();
}
