//! Build history queries: `debris history`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::ExitCode;

use super::super::Cli;

pub fn cmd_history(
    cli: &Cli,
    package: Option<&str>,
    limit: usize,
    built: bool,
    json: bool,
) -> Result<ExitCode> {
    use debris::config::{ConfigKey, Settings};
    use debris::history::HistoryDb;

    // Only the database location is needed here, not a full configuration.
    let settings = Settings::load(cli.config.as_deref())?;
    let db_file = PathBuf::from(settings.get(ConfigKey::DbFile)?);
    let db = HistoryDb::open(&db_file)
        .with_context(|| format!("Failed to open history at {}", db_file.display()))?;

    if built {
        let mut packages = db.list_built()?;
        if let Some(name) = package {
            packages.retain(|p| p.name == name);
        }
        if json {
            println!("{}", serde_json::to_string_pretty(&packages)?);
            return Ok(ExitCode::SUCCESS);
        }
        if packages.is_empty() {
            println!("No packages built yet.");
        }
        for p in &packages {
            println!(
                "{:<32} {:<24} {}",
                p.name,
                p.version.as_str(),
                console::style(p.built_at.format("%Y-%m-%d %H:%M:%S")).dim()
            );
        }
        return Ok(ExitCode::SUCCESS);
    }

    let attempts = db.list_attempts(package, limit)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&attempts)?);
        return Ok(ExitCode::SUCCESS);
    }
    if attempts.is_empty() {
        println!("No build attempts recorded.");
        return Ok(ExitCode::SUCCESS);
    }

    for record in &attempts {
        let attempt = &record.attempt;
        let outcome = if attempt.outcome.is_success() {
            console::style(attempt.outcome.to_string()).green()
        } else {
            console::style(attempt.outcome.to_string()).red()
        };
        println!(
            "#{:<6} {} {:<24} {:<16} {:<24} {}",
            record.id,
            console::style(attempt.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
            attempt.package,
            attempt.version.as_str(),
            attempt.target,
            outcome
        );
    }
    Ok(ExitCode::SUCCESS)
}
