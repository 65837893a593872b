use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde_json::json;

use crate::commands::ready_client;
use crate::ui;

pub async fn run(
    path: &Path,
    name: Option<String>,
    folder: Option<String>,
    file_id: Option<String>,
) -> Result<()> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = match name {
        Some(n) => n,
        None => path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Cannot derive a file name from {}", path.display()))?,
    };

    let Some(client) = ready_client().await? else {
        return Ok(());
    };
    let spinner = ui::spinner(&format!("Uploading {}...", name));
    let result = client
        .call(
            "upload",
            Some(json!({
                "name": name,
                "body": body,
                "folder_id": folder,
                "file_id": file_id,
            })),
        )
        .await;
    spinner.finish_and_clear();
    let uploaded = result?;

    ui::success(&format!(
        "{} {} ({})",
        name,
        uploaded["outcome"].as_str().unwrap_or("uploaded"),
        uploaded["file"]["id"].as_str().unwrap_or("?")
    ));
    if let Some(link) = uploaded["file"]["webViewLink"].as_str() {
        ui::info(&ui::dim(link));
    }
    Ok(())
}
