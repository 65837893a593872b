use anyhow::Result;
use serde_json::json;

use crate::commands::ready_client;
use crate::ui;

pub async fn start(file: Option<String>) -> Result<()> {
    let Some(client) = ready_client().await? else {
        return Ok(());
    };
    let params = file.as_ref().map(|id| json!({ "file_id": id }));
    let channel = client.call("watch_start", params).await?;

    let target = file.as_deref().unwrap_or("Drive changes");
    ui::success(&format!(
        "Watching {} on channel {}",
        target,
        channel["id"].as_str().unwrap_or("?")
    ));
    if let Some(expiration) = channel["expiration"].as_str() {
        ui::info(&ui::dim(&format!("expires {}", expiration)));
    }
    Ok(())
}

pub async fn stop(channel: Option<String>) -> Result<()> {
    let Some(client) = ready_client().await? else {
        return Ok(());
    };
    let params = channel.as_ref().map(|id| json!({ "channel_id": id }));
    let result = client.call("watch_stop", params).await?;

    if result["stopped"].as_bool().unwrap_or(false) {
        ui::success("Channel stopped. Polling keeps the index current.");
    } else {
        ui::info("No matching channel was active.");
    }
    Ok(())
}
