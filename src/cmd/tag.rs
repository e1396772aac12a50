//! Version inspection: `debris tag`.

use anyhow::Result;
use std::process::ExitCode;

pub fn cmd_tag(version: &str) -> Result<ExitCode> {
    use debris::version::VersionString;

    let version = VersionString::parse(version)?;
    println!("version:      {}", version);
    println!("epoch:        {}", version.epoch());
    println!("upstream:     {}", version.upstream());
    println!("revision:     {}", version.revision().unwrap_or("-"));
    println!("native:       {}", if version.is_native() { "yes" } else { "no" });
    println!("upstream tag: {}", version.upstream_tag());
    Ok(ExitCode::SUCCESS)
}
