//! Configuration display.

use anyhow::{Result, bail};
use tandem_config::TandemConfig;

/// Show the effective configuration.
pub fn show(config: &TandemConfig, format: &str) -> Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(config)?),
        "toml" => print!("{}", toml::to_string_pretty(config)?),
        other => bail!("unknown format {other}, expected toml or json"),
    }
    Ok(())
}
