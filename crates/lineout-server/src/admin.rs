use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use lineout_agent::AgentService;
use lineout_core::{Core, PollingService, WebhookHandler};
use lineout_ingest::AccessLevel;
use lineout_search::{SearchFilters, SearchRequest};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info};
use uuid::Uuid;

/// Everything built once the core is up.
#[derive(Clone)]
pub struct Services {
    pub core: Core,
    pub agent: Arc<AgentService>,
    pub webhook: Arc<WebhookHandler>,
    pub polling: Arc<PollingService>,
}

#[derive(Default)]
pub struct ServerState {
    services: RwLock<Option<Services>>,
}

impl ServerState {
    pub async fn set_ready(&self, services: Services) {
        *self.services.write().await = Some(services);
    }

    async fn services(&self) -> Option<Services> {
        self.services.read().await.clone()
    }
}

#[derive(Debug, Deserialize)]
pub struct AdminRequest {
    pub id: Option<String>,
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct AdminResponse {
    pub id: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AdminResponse {
    fn success(id: Option<String>, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchParams {
    query: String,
    tags: Vec<String>,
    players: Vec<String>,
    mime_type: Option<String>,
    folder_id: Option<String>,
    access_level: Option<String>,
    modified_after: Option<DateTime<Utc>>,
    modified_before: Option<DateTime<Utc>>,
    from: usize,
    size: Option<usize>,
}

impl SearchParams {
    fn into_request(self) -> Result<SearchRequest> {
        let max_access_rank = match self.access_level.as_deref() {
            Some(level) => Some(
                AccessLevel::parse(level)
                    .ok_or_else(|| anyhow!("unknown access level: {}", level))?
                    .rank(),
            ),
            None => None,
        };
        let mut request = SearchRequest::new(self.query).with_filters(SearchFilters {
            tags: self.tags,
            players: self.players,
            mime_type: self.mime_type,
            folder_id: self.folder_id,
            max_access_rank,
            modified_after: self.modified_after,
            modified_before: self.modified_before,
        });
        request.from = self.from;
        if let Some(size) = self.size {
            request = request.with_size(size);
        }
        Ok(request)
    }
}

#[derive(Debug, Deserialize)]
struct AskParams {
    text: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    name: String,
    body: String,
    #[serde(default)]
    folder_id: Option<String>,
    #[serde(default)]
    file_id: Option<String>,
}

fn params<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T> {
    let value = if value.is_null() { json!({}) } else { value };
    serde_json::from_value(value).map_err(|e| anyhow!("invalid params: {}", e))
}

fn str_param(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

#[derive(Clone)]
pub struct AdminHandler {
    state: Arc<ServerState>,
}

impl AdminHandler {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub async fn handle(&self, request: AdminRequest) -> AdminResponse {
        let id = request.id.clone();
        let method = request.method.clone().unwrap_or_default();

        match method.as_str() {
            "ping" => return AdminResponse::success(id, json!({ "pong": true })),
            "get_status" => {
                let Some(services) = self.state.services().await else {
                    return AdminResponse::success(
                        id,
                        json!({ "running": true, "ready": false, "version": env!("CARGO_PKG_VERSION") }),
                    );
                };
                return match services.core.status().await {
                    Ok(status) => AdminResponse::success(
                        id,
                        json!({
                            "running": true,
                            "ready": true,
                            "version": env!("CARGO_PKG_VERSION"),
                            "sync": status,
                            "channels": services.webhook.channels(),
                        }),
                    ),
                    Err(e) => AdminResponse::failure(id, format!("{:#}", e)),
                };
            }
            _ => {}
        }

        let Some(services) = self.state.services().await else {
            return AdminResponse::failure(id, "Engine still initializing, please wait...");
        };
        let started = Instant::now();
        let result = self.dispatch(&services, &method, request.params).await;
        info!("[ADMIN] {} finished in {}ms", method, started.elapsed().as_millis());
        match result {
            Ok(value) => AdminResponse::success(id, value),
            Err(e) => AdminResponse::failure(id, format!("{:#}", e)),
        }
    }

    async fn dispatch(&self, services: &Services, method: &str, params_value: Value) -> Result<Value> {
        let core = &services.core;
        match method {
            "full_sync" => Ok(json!(core.full_sync().await?)),
            "poll_now" => Ok(json!(services.polling.run_once().await?)),
            "discover" => {
                let found = core.discover().await?;
                Ok(json!({
                    "files": found.files.len(),
                    "folders": found.folders.len(),
                    "skipped_folders": found.skipped_folders,
                    "tree": found.tree,
                }))
            }
            "search" => {
                let request = params::<SearchParams>(params_value)?.into_request()?;
                Ok(json!(core.search(&request).await?))
            }
            "ask" => {
                let ask: AskParams = params(params_value)?;
                let conversation_id = ask
                    .conversation_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                let user = ask.user.unwrap_or_else(|| "cli".to_string());
                Ok(json!(services.agent.handle(&conversation_id, &user, &ask.text).await?))
            }
            "watch_start" => {
                let channel = match str_param(&params_value, "file_id") {
                    Some(file_id) => services.webhook.watch_file(&file_id).await?,
                    None => services.webhook.register_channel().await?,
                };
                Ok(json!(channel))
            }
            "watch_stop" => {
                let stopped = match str_param(&params_value, "channel_id") {
                    Some(channel_id) => services.webhook.stop_channel(&channel_id).await?,
                    None => services.webhook.stop_changes_channel().await?,
                };
                Ok(json!({ "stopped": stopped }))
            }
            "reindex" => Ok(json!(core.indexing.reindex_all().await?)),
            "upload" => {
                let upload: UploadParams = params(params_value)?;
                let result = core
                    .upload_document(
                        &upload.name,
                        &upload.body,
                        upload.folder_id.as_deref(),
                        upload.file_id.as_deref(),
                    )
                    .await?;
                Ok(json!(result))
            }
            other => Err(anyhow!("unknown admin method: {}", other)),
        }
    }
}

pub async fn handle_admin_client(stream: tokio::net::UnixStream, handler: Arc<AdminHandler>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let (tx, mut rx) = mpsc::unbounded_channel::<AdminResponse>();
    let write_task = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let payload = match serde_json::to_string(&response) {
                Ok(p) => p,
                Err(err) => {
                    error!("Failed to serialize admin response: {}", err);
                    continue;
                }
            };
            if let Err(err) = writer.write_all(payload.as_bytes()).await {
                error!("Failed to write admin response: {}", err);
                break;
            }
            if let Err(err) = writer.write_all(b"\n").await {
                error!("Failed to write newline: {}", err);
                break;
            }
        }
    });

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<AdminRequest>(trimmed) {
            Ok(request) => {
                info!("[ADMIN] {:?} id={:?}", request.method, request.id);
                let handler = handler.clone();
                let tx = tx.clone();
                // long syncs must not block pings on the same connection
                tokio::spawn(async move {
                    let response = handler.handle(request).await;
                    let _ = tx.send(response);
                });
            }
            Err(err) => {
                let _ = tx.send(AdminResponse::failure(None, format!("invalid request: {}", err)));
            }
        }
    }

    drop(tx);
    let _ = write_task.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str) -> AdminRequest {
        AdminRequest {
            id: Some("1".into()),
            method: Some(method.into()),
            params: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_ping_and_status_before_ready() {
        let handler = AdminHandler::new(Arc::new(ServerState::default()));
        let pong = handler.handle(request("ping")).await;
        assert!(pong.ok);
        assert_eq!(pong.id.as_deref(), Some("1"));

        let status = handler.handle(request("get_status")).await;
        assert!(status.ok);
        assert_eq!(status.result.unwrap()["ready"], false);
    }

    #[tokio::test]
    async fn test_methods_wait_for_core() {
        let handler = AdminHandler::new(Arc::new(ServerState::default()));
        let response = handler.handle(request("full_sync")).await;
        assert!(!response.ok);
        assert!(response.error.unwrap().contains("initializing"));
    }

    #[test]
    fn test_search_params_build_request() {
        let raw = json!({
            "query": "lineout",
            "tags": ["defence"],
            "access_level": "coaches",
            "from": 10,
            "size": 500
        });
        let request = params::<SearchParams>(raw).unwrap().into_request().unwrap();
        assert_eq!(request.query, "lineout");
        assert_eq!(request.filters.tags, vec!["defence"]);
        assert_eq!(request.filters.max_access_rank, Some(2));
        assert_eq!(request.from, 10);
        assert_eq!(request.page_size(), 100);

        let bad = json!({ "access_level": "captain" });
        assert!(params::<SearchParams>(bad).unwrap().into_request().is_err());
        assert!(params::<SearchParams>(Value::Null).unwrap().into_request().is_ok());
    }

    #[test]
    fn test_request_line_parses() {
        let line = r#"{"id":"7","method":"search","params":{"query":"maul"}}"#;
        let request: AdminRequest = serde_json::from_str(line).unwrap();
        assert_eq!(request.method.as_deref(), Some("search"));
        assert_eq!(request.params["query"], "maul");
    }
}
