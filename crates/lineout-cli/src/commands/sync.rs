use anyhow::Result;
use serde_json::Value;

use crate::commands::ready_client;
use crate::ui;

fn count(value: &Value, key: &str) -> u64 {
    value[key].as_u64().unwrap_or(0)
}

pub async fn run(changes: bool) -> Result<()> {
    let Some(client) = ready_client().await? else {
        return Ok(());
    };

    if changes {
        let spinner = ui::spinner("Draining Drive changes...");
        let result = client.call("poll_now", None).await;
        spinner.finish_and_clear();
        let summary = result?;
        let processed = count(&summary, "processed");
        if processed == 0 {
            ui::success("Up to date");
        } else {
            ui::success(&format!(
                "{} changes applied ({} received, {} failed)",
                processed,
                count(&summary, "received"),
                count(&summary, "failed")
            ));
        }
        return Ok(());
    }

    let spinner = ui::spinner("Running full sync...");
    let result = client.call("full_sync", None).await;
    spinner.finish_and_clear();
    let summary = result?;
    let indexing = &summary["indexing"];
    ui::success(&format!(
        "{} files in {} folders synced in {}ms",
        count(&summary, "files_discovered"),
        count(&summary, "folders"),
        count(&summary, "duration_ms")
    ));
    ui::row("inserted", &count(indexing, "inserted").to_string());
    ui::row("updated", &count(indexing, "updated").to_string());
    ui::row("moved", &count(indexing, "moved").to_string());
    ui::row("unchanged", &count(indexing, "unchanged").to_string());
    ui::row("skipped", &count(indexing, "skipped").to_string());
    ui::row("removed", &count(&summary, "removed").to_string());
    ui::row("folders removed", &count(&summary, "folders_removed").to_string());
    let failed = count(indexing, "failed") + count(indexing, "index_failures");
    if failed > 0 {
        ui::error(&format!("{} documents failed, see daemon logs", failed));
    }
    Ok(())
}

pub async fn discover() -> Result<()> {
    let Some(client) = ready_client().await? else {
        return Ok(());
    };
    let spinner = ui::spinner("Walking Drive tree...");
    let result = client.call("discover", None).await;
    spinner.finish_and_clear();
    let found = result?;

    ui::success(&format!(
        "{} files in {} folders",
        count(&found, "files"),
        count(&found, "folders")
    ));
    let skipped = count(&found, "skipped_folders");
    if skipped > 0 {
        ui::info(&format!("{} folders skipped (revisited or past max depth)", skipped));
    }
    if let Some(tree) = found.get("tree") {
        print_tree(tree, 1);
    }
    Ok(())
}

fn print_tree(node: &Value, depth: usize) {
    let name = node["name"].as_str().unwrap_or("?");
    println!("{}{}", "  ".repeat(depth), name);
    for child in node["children"].as_array().into_iter().flatten() {
        print_tree(child, depth + 1);
    }
}

pub async fn reindex() -> Result<()> {
    let Some(client) = ready_client().await? else {
        return Ok(());
    };
    let spinner = ui::spinner("Rebuilding search index...");
    let result = client.call("reindex", None).await;
    spinner.finish_and_clear();
    let summary = result?;
    ui::success(&format!("{} documents indexed", count(&summary, "indexed")));
    let failed = count(&summary, "failed");
    if failed > 0 {
        ui::error(&format!("{} documents rejected by the index", failed));
    }
    Ok(())
}
