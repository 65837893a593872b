use anyhow::Result;
use console::style;
use serde_json::{json, Value};

use crate::commands::ready_client;
use crate::ui;

pub struct SearchArgs {
    pub query: String,
    pub tags: Vec<String>,
    pub players: Vec<String>,
    pub access: Option<String>,
    pub size: usize,
}

impl SearchArgs {
    fn to_params(&self) -> Value {
        let mut params = json!({
            "query": self.query,
            "tags": self.tags,
            "players": self.players,
            "size": self.size,
        });
        if let Some(access) = &self.access {
            params["access_level"] = Value::String(access.to_lowercase());
        }
        params
    }
}

pub async fn run(args: SearchArgs, json: bool) -> Result<()> {
    let Some(client) = ready_client().await? else {
        return Ok(());
    };
    let response = client.call("search", Some(args.to_params())).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    let hits = response["hits"].as_array().cloned().unwrap_or_default();
    if hits.is_empty() {
        ui::info("No matching documents.");
        return Ok(());
    }

    println!();
    for hit in &hits {
        let title = hit["title"].as_str().unwrap_or("(untitled)");
        let folder = hit["folder_path"].as_str().unwrap_or("");
        println!("  {}  {}", style(title).bold(), ui::dim(folder));
        for fragment in hit["highlights"].as_array().into_iter().flatten().take(2) {
            if let Some(text) = fragment.as_str() {
                println!("    {}", text.replace('\n', " "));
            }
        }
        if let Some(link) = hit["web_view_link"].as_str() {
            println!("    {}", ui::dim(link));
        }
    }
    println!();
    ui::info(&ui::dim(&format!(
        "{} of {} results in {}ms",
        hits.len(),
        response["total"].as_u64().unwrap_or(0),
        response["took_ms"].as_u64().unwrap_or(0)
    )));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_carry_filters() {
        let args = SearchArgs {
            query: "lineout calls".into(),
            tags: vec!["set-piece".into()],
            players: vec![],
            access: Some("Coaches".into()),
            size: 5,
        };
        let params = args.to_params();
        assert_eq!(params["query"], "lineout calls");
        assert_eq!(params["tags"][0], "set-piece");
        assert_eq!(params["access_level"], "coaches");
        assert_eq!(params["size"], 5);
    }

    #[test]
    fn test_params_without_access_level() {
        let args = SearchArgs {
            query: String::new(),
            tags: vec![],
            players: vec!["Tom".into()],
            access: None,
            size: 10,
        };
        let params = args.to_params();
        assert!(params.get("access_level").is_none());
        assert_eq!(params["players"][0], "Tom");
    }
}
