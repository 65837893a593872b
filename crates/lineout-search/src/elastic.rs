use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::query::{build_query, IndexedDocument, SearchHit, SearchRequest, SearchResponse};
use crate::{BulkReport, SearchError, SearchIndex, SearchResult};

#[derive(Debug, Clone)]
pub enum ElasticAuth {
    ApiKey(String),
    Basic { username: String, password: String },
}

/// Elasticsearch over its REST API.
#[derive(Debug, Clone)]
pub struct ElasticIndex {
    client: Client,
    base: Url,
    index: String,
    auth: Option<ElasticAuth>,
}

impl ElasticIndex {
    pub fn new(base_url: &str, index: &str, auth: Option<ElasticAuth>) -> SearchResult<Self> {
        let base = Url::parse(base_url).map_err(|e| SearchError::Url(format!("{}: {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(SearchError::Url(base_url.to_string()));
        }
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base,
            index: index.to_string(),
            auth,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    fn endpoint(&self, segments: &[&str]) -> SearchResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SearchError::Url(self.base.to_string()))?
            .pop_if_empty()
            .push(&self.index)
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.auth {
            Some(ElasticAuth::ApiKey(key)) => {
                builder.header("Authorization", format!("ApiKey {}", key))
            }
            Some(ElasticAuth::Basic { username, password }) => {
                builder.basic_auth(username, Some(password))
            }
            None => builder,
        }
    }

    async fn check(response: Response) -> SearchResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SearchError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Index settings and field mappings.
pub(crate) fn index_definition() -> Value {
    json!({
        "settings": {
            "analysis": {
                "normalizer": {
                    "lowercase": { "type": "custom", "filter": ["lowercase"] }
                }
            }
        },
        "mappings": {
            "properties": {
                "id": { "type": "keyword" },
                "title": { "type": "text", "fields": { "keyword": { "type": "keyword" } } },
                "content": { "type": "text" },
                "tags": { "type": "keyword", "normalizer": "lowercase" },
                "players": {
                    "type": "text",
                    "fields": { "keyword": { "type": "keyword", "normalizer": "lowercase" } }
                },
                "dates": { "type": "date", "format": "yyyy-MM-dd" },
                "mime_type": { "type": "keyword" },
                "folder_id": { "type": "keyword" },
                "folder_path": { "type": "keyword" },
                "access_level": { "type": "keyword" },
                "access_rank": { "type": "byte" },
                "web_view_link": { "type": "keyword", "index": false },
                "drive_modified_time": { "type": "date" },
                "version": { "type": "integer" }
            }
        }
    })
}

#[derive(Deserialize)]
struct RawSearch {
    took: u64,
    hits: RawHits,
}

#[derive(Deserialize)]
struct RawHits {
    total: RawTotal,
    hits: Vec<RawHit>,
}

#[derive(Deserialize)]
struct RawTotal {
    value: u64,
}

#[derive(Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score")]
    score: Option<f64>,
    #[serde(rename = "_source")]
    source: RawSource,
    #[serde(default)]
    highlight: Option<RawHighlight>,
}

#[derive(Deserialize)]
struct RawSource {
    title: String,
    mime_type: String,
    folder_path: Option<String>,
    web_view_link: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    drive_modified_time: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Deserialize)]
struct RawHighlight {
    #[serde(default)]
    content: Vec<String>,
}

/// Turn a `_bulk` response body into a report.
pub(crate) fn parse_bulk_response(body: &Value, attempted: usize) -> BulkReport {
    if body.get("errors").and_then(Value::as_bool) != Some(true) {
        return BulkReport {
            indexed: attempted,
            failed: Vec::new(),
        };
    }
    let mut report = BulkReport::default();
    let items = body.get("items").and_then(Value::as_array).cloned().unwrap_or_default();
    for item in items {
        let Some(result) = item.get("index") else { continue };
        let id = result.get("_id").and_then(Value::as_str).unwrap_or_default().to_string();
        match result.get("error") {
            Some(err) => {
                let reason = err
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                report.failed.push((id, reason));
            }
            None => report.indexed += 1,
        }
    }
    report
}

#[async_trait]
impl SearchIndex for ElasticIndex {
    #[instrument(skip_all, fields(index = %self.index))]
    async fn ensure_index(&self) -> SearchResult<()> {
        let url = self.endpoint(&[])?;
        let head = self.request(Method::HEAD, url.clone()).send().await?;
        if head.status().is_success() {
            debug!("search index already exists");
            return Ok(());
        }
        if head.status() != StatusCode::NOT_FOUND {
            return Self::check(head).await.map(|_| ());
        }
        let response = self
            .request(Method::PUT, url)
            .json(&index_definition())
            .send()
            .await?;
        Self::check(response).await?;
        info!("Created search index '{}'", self.index);
        Ok(())
    }

    async fn index(&self, doc: &IndexedDocument) -> SearchResult<()> {
        let url = self.endpoint(&["_doc", &doc.id])?;
        let response = self.request(Method::PUT, url).json(doc).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(count = docs.len()))]
    async fn bulk_index(&self, docs: &[IndexedDocument]) -> SearchResult<BulkReport> {
        if docs.is_empty() {
            return Ok(BulkReport::default());
        }
        let mut body = String::new();
        for doc in docs {
            body.push_str(&json!({ "index": { "_index": self.index, "_id": doc.id } }).to_string());
            body.push('\n');
            body.push_str(&serde_json::to_string(doc)?);
            body.push('\n');
        }
        let url = self.endpoint(&["_bulk"])?;
        let response = self
            .request(Method::POST, url)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let response = Self::check(response).await?;
        let value: Value = response.json().await?;
        let report = parse_bulk_response(&value, docs.len());
        if !report.failed.is_empty() {
            warn!("{} documents rejected by bulk index", report.failed.len());
        }
        Ok(report)
    }

    async fn delete(&self, id: &str) -> SearchResult<bool> {
        let url = self.endpoint(&["_doc", id])?;
        let response = self.request(Method::DELETE, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response).await?;
        Ok(true)
    }

    async fn search(&self, request: &SearchRequest) -> SearchResult<SearchResponse> {
        let started = Instant::now();
        let url = self.endpoint(&["_search"])?;
        let response = self
            .request(Method::POST, url)
            .json(&build_query(request))
            .send()
            .await?;
        let response = Self::check(response).await?;
        let raw: RawSearch = serde_json::from_slice(&response.bytes().await?)?;
        debug!(took = raw.took, elapsed_ms = started.elapsed().as_millis() as u64, "search");

        let hits = raw
            .hits
            .hits
            .into_iter()
            .map(|hit| SearchHit {
                id: hit.id,
                score: hit.score.unwrap_or(0.0),
                title: hit.source.title,
                mime_type: hit.source.mime_type,
                folder_path: hit.source.folder_path,
                web_view_link: hit.source.web_view_link,
                tags: hit.source.tags,
                drive_modified_time: hit.source.drive_modified_time,
                highlights: hit.highlight.map(|h| h.content).unwrap_or_default(),
            })
            .collect();
        Ok(SearchResponse {
            total: raw.hits.total.value,
            took_ms: raw.took,
            hits,
        })
    }

    async fn clear(&self) -> SearchResult<()> {
        let url = self.endpoint(&["_delete_by_query"])?;
        let response = self
            .request(Method::POST, url)
            .query(&[("conflicts", "proceed"), ("refresh", "true")])
            .json(&json!({ "query": { "match_all": {} } }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn count(&self) -> SearchResult<u64> {
        let url = self.endpoint(&["_count"])?;
        let response = self.request(Method::GET, url).send().await?;
        let value: Value = Self::check(response).await?.json().await?;
        Ok(value.get("count").and_then(Value::as_u64).unwrap_or(0))
    }
}
