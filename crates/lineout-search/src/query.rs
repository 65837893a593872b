use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

/// What gets written to the search index for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub players: Vec<String>,
    #[serde(default)]
    pub dates: Vec<String>,
    pub mime_type: String,
    pub folder_id: Option<String>,
    pub folder_path: Option<String>,
    pub access_level: String,
    pub access_rank: u8,
    pub web_view_link: Option<String>,
    pub drive_modified_time: Option<DateTime<Utc>>,
    pub version: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Every listed tag must be present.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Every listed player must be present.
    #[serde(default)]
    pub players: Vec<String>,
    pub mime_type: Option<String>,
    pub folder_id: Option<String>,
    /// Highest access rank the caller may see.
    pub max_access_rank: Option<u8>,
    pub modified_after: Option<DateTime<Utc>>,
    pub modified_before: Option<DateTime<Utc>>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self == &SearchFilters::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub from: usize,
    #[serde(default = "default_size")]
    pub size: usize,
}

fn default_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            filters: SearchFilters::default(),
            from: 0,
            size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn page_size(&self) -> usize {
        self.size.clamp(1, MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub title: String,
    pub mime_type: String,
    pub folder_path: Option<String>,
    pub web_view_link: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub drive_modified_time: Option<DateTime<Utc>>,
    /// Content fragments around the matched terms.
    #[serde(default)]
    pub highlights: Vec<String>,
}

impl SearchHit {
    pub fn from_document(doc: &IndexedDocument, score: f64, highlights: Vec<String>) -> Self {
        Self {
            id: doc.id.clone(),
            score,
            title: doc.title.clone(),
            mime_type: doc.mime_type.clone(),
            folder_path: doc.folder_path.clone(),
            web_view_link: doc.web_view_link.clone(),
            tags: doc.tags.clone(),
            drive_modified_time: doc.drive_modified_time,
            highlights,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub total: u64,
    pub took_ms: u64,
    pub hits: Vec<SearchHit>,
}

/// Elasticsearch request body for a search.
pub fn build_query(request: &SearchRequest) -> Value {
    let query = request.query.trim();
    let must = if query.is_empty() {
        json!({ "match_all": {} })
    } else {
        json!({
            "multi_match": {
                "query": query,
                "fields": ["title^3", "content", "tags^2", "players^2"],
                "type": "best_fields",
                "fuzziness": "AUTO"
            }
        })
    };

    let mut filter = Vec::new();
    let f = &request.filters;
    for tag in &f.tags {
        filter.push(json!({ "term": { "tags": tag.to_lowercase() } }));
    }
    for player in &f.players {
        filter.push(json!({ "term": { "players.keyword": player.to_lowercase() } }));
    }
    if let Some(mime) = &f.mime_type {
        filter.push(json!({ "term": { "mime_type": mime } }));
    }
    if let Some(folder) = &f.folder_id {
        filter.push(json!({ "term": { "folder_id": folder } }));
    }
    if let Some(rank) = f.max_access_rank {
        filter.push(json!({ "range": { "access_rank": { "lte": rank } } }));
    }
    if f.modified_after.is_some() || f.modified_before.is_some() {
        let mut range = serde_json::Map::new();
        if let Some(after) = f.modified_after {
            range.insert("gte".into(), json!(after.to_rfc3339()));
        }
        if let Some(before) = f.modified_before {
            range.insert("lte".into(), json!(before.to_rfc3339()));
        }
        filter.push(json!({ "range": { "drive_modified_time": range } }));
    }

    json!({
        "from": request.from,
        "size": request.page_size(),
        "query": {
            "bool": {
                "must": [must],
                "filter": filter
            }
        },
        "highlight": {
            "fields": {
                "content": { "fragment_size": 150, "number_of_fragments": 3 }
            }
        },
        "_source": { "excludes": ["content"] }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_empty_query_matches_all() {
        let body = build_query(&SearchRequest::new("   "));
        assert_eq!(body["query"]["bool"]["must"][0], json!({ "match_all": {} }));
        assert_eq!(body["query"]["bool"]["filter"], json!([]));
    }

    #[test]
    fn test_text_query_boosts_title() {
        let body = build_query(&SearchRequest::new("lineout calls"));
        let mm = &body["query"]["bool"]["must"][0]["multi_match"];
        assert_eq!(mm["query"], "lineout calls");
        assert_eq!(mm["fields"][0], "title^3");
        assert_eq!(body["highlight"]["fields"]["content"]["number_of_fragments"], 3);
    }

    #[test]
    fn test_filters_become_terms_and_ranges() {
        let filters = SearchFilters {
            tags: vec!["Defence".into(), "scrum".into()],
            players: vec!["Tom Curry".into()],
            mime_type: Some("application/vnd.google-apps.document".into()),
            folder_id: Some("folder-1".into()),
            max_access_rank: Some(1),
            modified_after: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
            modified_before: None,
        };
        let body = build_query(&SearchRequest::new("").with_filters(filters));
        let filter = body["query"]["bool"]["filter"].as_array().unwrap();

        assert!(filter.contains(&json!({ "term": { "tags": "defence" } })));
        assert!(filter.contains(&json!({ "term": { "tags": "scrum" } })));
        assert!(filter.contains(&json!({ "term": { "players.keyword": "tom curry" } })));
        assert!(filter.contains(&json!({ "term": { "folder_id": "folder-1" } })));
        assert!(filter.contains(&json!({ "range": { "access_rank": { "lte": 1 } } })));

        let date = filter
            .iter()
            .find(|f| f["range"].get("drive_modified_time").is_some())
            .unwrap();
        assert!(date["range"]["drive_modified_time"]["gte"]
            .as_str()
            .unwrap()
            .starts_with("2024-03-01"));
        assert!(date["range"]["drive_modified_time"].get("lte").is_none());
    }

    #[test]
    fn test_page_size_is_capped() {
        let body = build_query(&SearchRequest::new("x").with_size(5000));
        assert_eq!(body["size"], MAX_PAGE_SIZE);

        let zero = SearchRequest::new("x").with_size(0);
        assert_eq!(zero.page_size(), 1);
    }

    #[test]
    fn test_request_defaults_from_json() {
        let request: SearchRequest = serde_json::from_str(r#"{"query":"kick-off"}"#).unwrap();
        assert_eq!(request.size, DEFAULT_PAGE_SIZE);
        assert!(request.filters.is_empty());
    }
}
