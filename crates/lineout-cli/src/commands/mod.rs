pub mod ask;
pub mod auth;
pub mod search;
pub mod status;
pub mod sync;
pub mod upload;
pub mod watch;

use anyhow::Result;

use crate::admin_client::AdminClient;
use crate::ui;

/// A client for a daemon that is up and ready, or `None` after telling the
/// user why not.
pub async fn ready_client() -> Result<Option<AdminClient>> {
    let client = AdminClient::new();
    if !client.is_daemon_running() {
        ui::error("Daemon not running.");
        ui::info("Start it with:");
        println!("    lineout-daemon");
        return Ok(None);
    }
    let status = client.get_status().await?;
    if !status.ready {
        ui::background_notice(
            "Daemon is still connecting to MongoDB and Elasticsearch.",
            "Run `lineout status` to check when ready.",
        );
        return Ok(None);
    }
    Ok(Some(client))
}
