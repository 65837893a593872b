//! Google Drive v3 REST client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use lineout_auth_bridge::RefreshingToken;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
pub const DOC_MIME: &str = "application/vnd.google-apps.document";
pub const SHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";
pub const SLIDES_MIME: &str = "application/vnd.google-apps.presentation";

const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FILE_FIELDS: &str = "id,name,mimeType,parents,modifiedTime,webViewLink,owners(displayName,emailAddress),size,trashed,version,lastModifyingUser(displayName,emailAddress)";
const PAGE_SIZE: &str = "100";

const MAX_RATE_LIMIT_RETRIES: u32 = 8;
const MAX_SERVER_RETRIES: u32 = 3;
const MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("drive request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{label}: rate limited after {retries} retries")]
    RateLimited { label: String, retries: u32 },

    #[error("{0}: access forbidden (403), check sharing and OAuth scopes")]
    Forbidden(String),

    #[error("{0}: unauthorized (401)")]
    Unauthorized(String),

    #[error("{0}: not found")]
    NotFound(String),

    #[error("{label}: HTTP {status} - {body}")]
    Status { label: String, status: u16, body: String },

    #[error("google token unavailable: {0}")]
    Token(String),
}

pub type DriveResult<T> = std::result::Result<T, DriveError>;

/// Supplies bearer tokens for Google APIs.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> anyhow::Result<String>;

    /// Force a refresh after the API rejected the current token.
    async fn refresh(&self) -> anyhow::Result<String>;
}

#[async_trait]
impl TokenSource for RefreshingToken {
    async fn access_token(&self) -> anyhow::Result<String> {
        RefreshingToken::access_token(self).await
    }

    async fn refresh(&self) -> anyhow::Result<String> {
        RefreshingToken::refresh(self).await
    }
}

/// Fixed token, for service setups that manage tokens elsewhere.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }

    async fn refresh(&self) -> anyhow::Result<String> {
        Err(anyhow::anyhow!("static token cannot be refreshed"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveUser {
    pub display_name: Option<String>,
    pub email_address: Option<String>,
}

impl DriveUser {
    pub fn label(&self) -> Option<String> {
        self.email_address.clone().or_else(|| self.display_name.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub parents: Vec<String>,
    pub modified_time: Option<DateTime<Utc>>,
    pub web_view_link: Option<String>,
    #[serde(default)]
    pub owners: Vec<DriveUser>,
    /// int64 encoded as a string by the API.
    pub size: Option<String>,
    #[serde(default)]
    pub trashed: bool,
    pub version: Option<String>,
    pub last_modifying_user: Option<DriveUser>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_deref().and_then(|s| s.parse().ok())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub file_id: Option<String>,
    #[serde(default)]
    pub removed: bool,
    pub time: Option<DateTime<Utc>>,
    pub change_type: Option<String>,
    pub file: Option<DriveFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeList {
    #[serde(default)]
    pub changes: Vec<Change>,
    pub next_page_token: Option<String>,
    pub new_start_page_token: Option<String>,
}

/// Body of a `changes.watch` / `files.watch` request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
    pub token: Option<String>,
    /// Milliseconds since the epoch, as a string.
    pub expiration: Option<String>,
}

impl ChannelRequest {
    pub fn web_hook(id: &str, address: &str, token: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            kind: "web_hook".to_string(),
            address: address.to_string(),
            token: Some(token.to_string()),
            expiration: Some(expires_at.timestamp_millis().to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelResponse {
    pub id: String,
    pub resource_id: String,
    pub resource_uri: Option<String>,
    pub expiration: Option<String>,
}

impl ChannelResponse {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expiration
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPageToken {
    start_page_token: String,
}

pub fn children_query(folder_id: &str) -> String {
    format!(
        "'{}' in parents and trashed = false",
        folder_id.replace('\\', "\\\\").replace('\'', "\\'")
    )
}

/// Drive operations the sync pipeline needs.
#[async_trait]
pub trait DriveApi: Send + Sync {
    /// One page of `files.list` for a `q` expression.
    async fn list_page(&self, query: &str, page_token: Option<&str>) -> DriveResult<FileList>;

    async fn list_children(&self, folder_id: &str, page_token: Option<&str>) -> DriveResult<FileList> {
        self.list_page(&children_query(folder_id), page_token).await
    }

    /// Every page of `files.list`.
    async fn list_files(&self, query: &str) -> DriveResult<Vec<DriveFile>> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self.list_page(query, page_token.as_deref()).await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(files)
    }

    /// `None` when the file does not exist or is not visible to us.
    async fn get_file(&self, file_id: &str) -> DriveResult<Option<DriveFile>>;

    async fn export(&self, file_id: &str, mime: &str) -> DriveResult<String>;

    async fn download(&self, file_id: &str) -> DriveResult<String>;

    async fn create_file(
        &self,
        name: &str,
        mime: &str,
        parents: &[String],
        body: &str,
    ) -> DriveResult<DriveFile>;

    async fn update_file(&self, file_id: &str, body: &str) -> DriveResult<DriveFile>;

    async fn get_start_page_token(&self) -> DriveResult<String>;

    async fn list_changes(&self, page_token: &str) -> DriveResult<ChangeList>;

    async fn watch_changes(
        &self,
        page_token: &str,
        channel: &ChannelRequest,
    ) -> DriveResult<ChannelResponse>;

    async fn watch_file(&self, file_id: &str, channel: &ChannelRequest) -> DriveResult<ChannelResponse>;

    async fn stop_channel(&self, channel_id: &str, resource_id: &str) -> DriveResult<()>;
}

/// Seconds from a `Retry-After` header, if it holds a delay.
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Send a request, retrying rate limits and transient server errors.
///
/// 429 honours `Retry-After` (up to 8 retries, delay doubling to a 60s cap),
/// 5xx is retried 3 times, 401/403/404 and everything else fail immediately.
pub async fn call_with_backoff<F>(label: &str, mut builder_fn: F) -> DriveResult<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let mut rate_limited = 0;
    let mut server_errors = 0;
    let mut delay = Duration::from_secs(1);

    loop {
        let response = builder_fn().send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            if rate_limited >= MAX_RATE_LIMIT_RETRIES {
                return Err(DriveError::RateLimited {
                    label: label.to_string(),
                    retries: rate_limited,
                });
            }
            let wait = retry_after(response.headers()).unwrap_or(delay);
            warn!("{}: rate limited, waiting {:?}", label, wait);
            sleep(wait).await;
            rate_limited += 1;
            delay = std::cmp::min(delay * 2, MAX_DELAY);
            continue;
        }

        if status.is_server_error() && server_errors < MAX_SERVER_RETRIES {
            warn!("{}: server error {}, retrying", label, status);
            sleep(delay).await;
            server_errors += 1;
            delay = std::cmp::min(delay * 2, MAX_DELAY);
            continue;
        }

        return Err(match status {
            StatusCode::UNAUTHORIZED => DriveError::Unauthorized(label.to_string()),
            StatusCode::FORBIDDEN => DriveError::Forbidden(label.to_string()),
            StatusCode::NOT_FOUND => DriveError::NotFound(label.to_string()),
            _ => DriveError::Status {
                label: label.to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            },
        });
    }
}

/// Authenticated [`call_with_backoff`]; a 401 triggers one token refresh and replay.
pub async fn call_authorized<F>(tokens: &dyn TokenSource, label: &str, build: F) -> DriveResult<Response>
where
    F: Fn(&str) -> RequestBuilder,
{
    let token = tokens
        .access_token()
        .await
        .map_err(|e| DriveError::Token(e.to_string()))?;
    match call_with_backoff(label, || build(&token)).await {
        Err(DriveError::Unauthorized(_)) => {
            debug!("{}: token rejected, refreshing", label);
            let token = tokens
                .refresh()
                .await
                .map_err(|e| DriveError::Token(e.to_string()))?;
            call_with_backoff(label, || build(&token)).await
        }
        other => other,
    }
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    tokens: Arc<dyn TokenSource>,
    api_base: String,
    upload_base: String,
}

impl DriveClient {
    pub fn new(tokens: Arc<dyn TokenSource>) -> DriveResult<Self> {
        let http = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            http,
            tokens,
            api_base: API_BASE.to_string(),
            upload_base: UPLOAD_BASE.to_string(),
        })
    }

    async fn call<F>(&self, label: &str, build: F) -> DriveResult<Response>
    where
        F: Fn(&Client, &str) -> RequestBuilder,
    {
        call_authorized(self.tokens.as_ref(), label, |token| build(&self.http, token)).await
    }

    fn files_url(&self, file_id: &str) -> String {
        format!("{}/files/{}", self.api_base, file_id)
    }
}

#[async_trait]
impl DriveApi for DriveClient {
    async fn list_page(&self, query: &str, page_token: Option<&str>) -> DriveResult<FileList> {
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let url = format!("{}/files", self.api_base);
        let response = self
            .call("drive.files.list", |http, token| {
                let mut params = vec![
                    ("q", query),
                    ("fields", fields.as_str()),
                    ("pageSize", PAGE_SIZE),
                    ("supportsAllDrives", "true"),
                    ("includeItemsFromAllDrives", "true"),
                ];
                if let Some(pt) = page_token {
                    params.push(("pageToken", pt));
                }
                http.get(&url).query(&params).bearer_auth(token)
            })
            .await?;
        Ok(response.json().await?)
    }

    async fn get_file(&self, file_id: &str) -> DriveResult<Option<DriveFile>> {
        let url = self.files_url(file_id);
        let result = self
            .call("drive.files.get", |http, token| {
                http.get(&url)
                    .query(&[("fields", FILE_FIELDS), ("supportsAllDrives", "true")])
                    .bearer_auth(token)
            })
            .await;
        match result {
            Ok(response) => Ok(Some(response.json().await?)),
            Err(DriveError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn export(&self, file_id: &str, mime: &str) -> DriveResult<String> {
        let url = format!("{}/export", self.files_url(file_id));
        let response = self
            .call("drive.files.export", |http, token| {
                http.get(&url).query(&[("mimeType", mime)]).bearer_auth(token)
            })
            .await?;
        Ok(response.text().await?)
    }

    async fn download(&self, file_id: &str) -> DriveResult<String> {
        let url = self.files_url(file_id);
        let response = self
            .call("drive.files.download", |http, token| {
                http.get(&url)
                    .query(&[("alt", "media"), ("supportsAllDrives", "true")])
                    .bearer_auth(token)
            })
            .await?;
        Ok(response.text().await?)
    }

    async fn create_file(
        &self,
        name: &str,
        mime: &str,
        parents: &[String],
        body: &str,
    ) -> DriveResult<DriveFile> {
        let url = format!("{}/files", self.api_base);
        let metadata = serde_json::json!({
            "name": name,
            "mimeType": mime,
            "parents": parents,
        });
        let response = self
            .call("drive.files.create", |http, token| {
                http.post(&url)
                    .query(&[("fields", "id"), ("supportsAllDrives", "true")])
                    .json(&metadata)
                    .bearer_auth(token)
            })
            .await?;
        let created: DriveFile = response.json().await?;
        self.update_file(&created.id, body).await
    }

    async fn update_file(&self, file_id: &str, body: &str) -> DriveResult<DriveFile> {
        let url = format!("{}/files/{}", self.upload_base, file_id);
        let response = self
            .call("drive.files.update", |http, token| {
                http.patch(&url)
                    .query(&[
                        ("uploadType", "media"),
                        ("fields", FILE_FIELDS),
                        ("supportsAllDrives", "true"),
                    ])
                    .header("Content-Type", "text/plain; charset=UTF-8")
                    .body(body.to_string())
                    .bearer_auth(token)
            })
            .await?;
        Ok(response.json().await?)
    }

    async fn get_start_page_token(&self) -> DriveResult<String> {
        let url = format!("{}/changes/startPageToken", self.api_base);
        let response = self
            .call("drive.changes.getStartPageToken", |http, token| {
                http.get(&url)
                    .query(&[("supportsAllDrives", "true")])
                    .bearer_auth(token)
            })
            .await?;
        let parsed: StartPageToken = response.json().await?;
        Ok(parsed.start_page_token)
    }

    async fn list_changes(&self, page_token: &str) -> DriveResult<ChangeList> {
        let url = format!("{}/changes", self.api_base);
        let fields = format!(
            "nextPageToken,newStartPageToken,changes(fileId,removed,time,changeType,file({}))",
            FILE_FIELDS
        );
        let response = self
            .call("drive.changes.list", |http, token| {
                http.get(&url)
                    .query(&[
                        ("pageToken", page_token),
                        ("fields", fields.as_str()),
                        ("pageSize", PAGE_SIZE),
                        ("includeRemoved", "true"),
                        ("supportsAllDrives", "true"),
                        ("includeItemsFromAllDrives", "true"),
                    ])
                    .bearer_auth(token)
            })
            .await?;
        Ok(response.json().await?)
    }

    async fn watch_changes(
        &self,
        page_token: &str,
        channel: &ChannelRequest,
    ) -> DriveResult<ChannelResponse> {
        let url = format!("{}/changes/watch", self.api_base);
        let response = self
            .call("drive.changes.watch", |http, token| {
                http.post(&url)
                    .query(&[("pageToken", page_token), ("supportsAllDrives", "true")])
                    .json(channel)
                    .bearer_auth(token)
            })
            .await?;
        Ok(response.json().await?)
    }

    async fn watch_file(&self, file_id: &str, channel: &ChannelRequest) -> DriveResult<ChannelResponse> {
        let url = format!("{}/watch", self.files_url(file_id));
        let response = self
            .call("drive.files.watch", |http, token| {
                http.post(&url)
                    .query(&[("supportsAllDrives", "true")])
                    .json(channel)
                    .bearer_auth(token)
            })
            .await?;
        Ok(response.json().await?)
    }

    async fn stop_channel(&self, channel_id: &str, resource_id: &str) -> DriveResult<()> {
        let url = format!("{}/channels/stop", self.api_base);
        let body = serde_json::json!({ "id": channel_id, "resourceId": resource_id });
        self.call("drive.channels.stop", |http, token| {
            http.post(&url).json(&body).bearer_auth(token)
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_children_query_escapes_quotes() {
        assert_eq!(children_query("abc"), "'abc' in parents and trashed = false");
        assert_eq!(children_query("a'b"), "'a\\'b' in parents and trashed = false");
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert("Retry-After", HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert("Retry-After", HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_file_deserializes_from_api_json() {
        let raw = r#"{
            "id": "1x",
            "name": "Lineout calls",
            "mimeType": "application/vnd.google-apps.document",
            "parents": ["0Root"],
            "modifiedTime": "2024-03-12T18:04:05.123Z",
            "size": "2048",
            "owners": [{"displayName": "Head Coach", "emailAddress": "coach@club.example"}],
            "lastModifyingUser": {"displayName": "Analyst"}
        }"#;
        let file: DriveFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.size_bytes(), Some(2048));
        assert!(!file.trashed);
        assert!(!file.is_folder());
        assert_eq!(file.owners[0].label().as_deref(), Some("coach@club.example"));
        assert_eq!(file.last_modifying_user.unwrap().label().as_deref(), Some("Analyst"));
    }

    #[test]
    fn test_change_list_deserializes() {
        let raw = r#"{
            "changes": [
                {"fileId": "a", "removed": true, "time": "2024-03-12T18:04:05Z", "changeType": "file"},
                {"fileId": "b", "time": "2024-03-12T18:05:00Z", "file": {"id": "b", "name": "B", "mimeType": "text/plain"}}
            ],
            "newStartPageToken": "1234"
        }"#;
        let list: ChangeList = serde_json::from_str(raw).unwrap();
        assert_eq!(list.changes.len(), 2);
        assert!(list.changes[0].removed);
        assert_eq!(list.changes[1].file.as_ref().unwrap().name, "B");
        assert_eq!(list.new_start_page_token.as_deref(), Some("1234"));
        assert!(list.next_page_token.is_none());
    }

    #[test]
    fn test_channel_request_serializes_type_and_expiration() {
        let expires = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let req = ChannelRequest::web_hook("chan-1", "https://x.example/hook", "tok", expires);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["type"], "web_hook");
        assert_eq!(value["expiration"], "1704067200000");

        let resp = ChannelResponse {
            expiration: Some("1704067200000".to_string()),
            ..Default::default()
        };
        assert_eq!(resp.expires_at(), Some(expires));
    }
}
