//! Local HA status.

use anyhow::{Result, bail};
use comfy_table::{Table, presets::UTF8_FULL};
use tandem_config::TandemConfig;
use tandem_peer::{Reply, Request};

pub fn run(config: &TandemConfig, format: &str) -> Result<()> {
    let client = super::local_client(config)?;
    let status = client.status()?;
    let reasons = client.disabled_reasons()?;
    let view = match client.call(Request::Config)? {
        Reply::Config(view) => view,
        other => bail!("unexpected reply to failover.config: {}", other.kind()),
    };
    let reasons: Vec<&str> = reasons.iter().map(|r| r.as_str()).collect();

    match format {
        "json" => {
            let value = serde_json::json!({
                "status": status,
                "disabled_reasons": reasons,
                "config": view,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        "text" => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Setting", "Value"]);
            table.add_row(vec!["Status".to_string(), status.to_string()]);
            table.add_row(vec!["Master".to_string(), view.master.to_string()]);
            table.add_row(vec!["Disabled".to_string(), view.disabled.to_string()]);
            table.add_row(vec!["Timeout".to_string(), format!("{}s", view.timeout)]);
            let reasons = if reasons.is_empty() {
                "-".to_string()
            } else {
                reasons.join("\n")
            };
            table.add_row(vec!["Disabled reasons".to_string(), reasons]);
            println!("{table}");
        }
        other => bail!("unknown format {other}, expected text or json"),
    }
    Ok(())
}
