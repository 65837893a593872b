use anyhow::Result;
use console::style;
use serde_json::{json, Value};

use crate::admin_client::AdminClient;
use crate::ui;

fn field<'a>(value: &'a Value, key: &str) -> &'a str {
    value[key].as_str().unwrap_or("never")
}

pub async fn run(json: bool) -> Result<()> {
    let client = AdminClient::new();

    if !client.is_daemon_running() {
        if json {
            println!("{}", serde_json::to_string_pretty(&json!({ "daemon": "stopped" }))?);
            return Ok(());
        }
        println!();
        ui::error("Daemon not running.");
        println!();
        ui::info("Start it with:");
        println!("    lineout-daemon");
        println!();
        return Ok(());
    }

    let status = match client.get_status().await {
        Ok(s) => s,
        Err(e) => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({ "daemon": "error", "error": e.to_string() }))?
                );
                return Ok(());
            }
            ui::error(&format!("Cannot connect to daemon: {}", e));
            return Ok(());
        }
    };

    if json {
        let payload = json!({
            "daemon": if status.ready { "running" } else { "starting" },
            "version": status.version,
            "sync": status.sync,
            "channels": status.channels,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!();
    let daemon_display = if status.ready {
        style("running").green().to_string()
    } else {
        style("starting...").yellow().to_string()
    };
    println!("  {:<14} {}", style("daemon").bold(), daemon_display);
    ui::row("version", &format!("v{}", status.version));

    let Some(sync) = status.sync else {
        println!();
        return Ok(());
    };

    ui::header("DOCUMENTS");
    ui::row("stored", &sync["documents"].to_string());
    ui::row("indexed", &sync["indexed"].to_string());
    ui::row("folders", &sync["folders"].to_string());

    ui::header("SYNC");
    ui::row("full sync", field(&sync, "last_full_sync_at"));
    ui::row("last poll", field(&sync, "last_poll_at"));
    ui::row("page token", field(&sync, "page_token"));

    ui::header("CHANNELS");
    if status.channels.is_empty() {
        println!("  {}", ui::dim("No watch channels (polling only)"));
    }
    for channel in &status.channels {
        let target = channel["file_id"].as_str().unwrap_or("changes");
        println!(
            "  {:<14} {:<24} {}",
            target,
            channel["id"].as_str().unwrap_or(""),
            ui::dim(&format!("expires {}", field(channel, "expiration")))
        );
    }
    println!();

    Ok(())
}
