use anyhow::Result;
use serde_json::json;

use crate::commands::ready_client;
use crate::ui;

pub async fn run(text: &str, conversation: Option<String>) -> Result<()> {
    let Some(client) = ready_client().await? else {
        return Ok(());
    };
    let mut params = json!({ "text": text, "user": "cli" });
    if let Some(id) = conversation {
        params["conversation_id"] = json!(id);
    }

    let spinner = ui::spinner("Thinking...");
    let result = client.call("ask", Some(params)).await;
    spinner.finish_and_clear();
    let reply = result?;

    println!();
    for line in reply["text"].as_str().unwrap_or_default().lines() {
        ui::info(line);
    }
    println!();
    if let Some(id) = reply["conversation_id"].as_str() {
        ui::info(&ui::dim(&format!("conversation {}", id)));
    }
    Ok(())
}
