//! Configuration view: `debris config`.

use anyhow::Result;
use std::process::ExitCode;

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<ExitCode> {
    use debris::config::{ConfigKey, Settings};

    let settings = Settings::load(cli.config.as_deref())?;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Debris Configuration");
            println!("====================");
            println!();
            match settings.file_path() {
                Some(path) => println!("Config file: {}", path.display()),
                None => println!("Config file: (none, using environment and defaults)"),
            }
            println!();

            for key in ConfigKey::ALL {
                match settings.resolve_optional(key)? {
                    Some((value, source)) => println!(
                        "  {:<30} = {:<40} {}",
                        key.env_name(),
                        value.to_string(),
                        console::style(format!("[{}]", source)).dim()
                    ),
                    None => println!(
                        "  {:<30}   {}",
                        key.env_name(),
                        console::style("(unset)").yellow()
                    ),
                }
            }

            let packages = settings.package_targets()?;
            if !packages.is_empty() {
                println!();
                println!("[packages]");
                for (name, targets) in &packages {
                    let arches = targets
                        .arches
                        .as_ref()
                        .map(|a| a.join(","))
                        .unwrap_or_else(|| "*".to_string());
                    let suites = targets
                        .suites
                        .as_ref()
                        .map(|s| s.join(","))
                        .unwrap_or_else(|| "*".to_string());
                    println!("  {:<30} arches={} suites={}", name, arches, suites);
                }
            }
            println!();
        }
        Some(ConfigCommands::Get { key }) => {
            println!("{}", settings.lookup(&key)?);
        }
    }
    Ok(ExitCode::SUCCESS)
}
