use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::query::{IndexedDocument, SearchFilters, SearchHit, SearchRequest, SearchResponse};
use crate::{BulkReport, SearchIndex, SearchResult};

const SNIPPET_RADIUS: usize = 60;

/// Term-count scoring over an in-process map. Weights mirror the Elasticsearch field boosts.
#[derive(Default)]
pub struct MemoryIndex {
    docs: RwLock<HashMap<String, IndexedDocument>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<IndexedDocument> {
        self.docs.read().await.get(id).cloned()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn occurrences(haystack: &[String], term: &str) -> usize {
    haystack.iter().filter(|t| t.as_str() == term).count()
}

fn score(doc: &IndexedDocument, terms: &[String]) -> f64 {
    let title = tokenize(&doc.title);
    let content = tokenize(&doc.content);
    let tags: Vec<String> = doc.tags.iter().flat_map(|t| tokenize(t)).collect();
    let players: Vec<String> = doc.players.iter().flat_map(|p| tokenize(p)).collect();
    terms
        .iter()
        .map(|term| {
            3.0 * occurrences(&title, term) as f64
                + occurrences(&content, term) as f64
                + 2.0 * occurrences(&tags, term) as f64
                + 2.0 * occurrences(&players, term) as f64
        })
        .sum()
}

fn matches_filters(doc: &IndexedDocument, filters: &SearchFilters) -> bool {
    let has_all = |wanted: &[String], present: &[String]| {
        wanted
            .iter()
            .all(|w| present.iter().any(|p| p.eq_ignore_ascii_case(w)))
    };
    if !has_all(&filters.tags, &doc.tags) || !has_all(&filters.players, &doc.players) {
        return false;
    }
    if filters.mime_type.as_ref().is_some_and(|m| m != &doc.mime_type) {
        return false;
    }
    if filters.folder_id.is_some() && filters.folder_id != doc.folder_id {
        return false;
    }
    if filters.max_access_rank.is_some_and(|max| doc.access_rank > max) {
        return false;
    }
    if filters.modified_after.is_some() || filters.modified_before.is_some() {
        let Some(modified) = doc.drive_modified_time else {
            return false;
        };
        if filters.modified_after.is_some_and(|after| modified < after)
            || filters.modified_before.is_some_and(|before| modified > before)
        {
            return false;
        }
    }
    true
}

/// Fragment of `content` around the first matched term.
fn snippet(content: &str, terms: &[String]) -> Option<String> {
    let lower = content.to_lowercase();
    // lowercasing can change byte lengths, so only use offsets when they line up
    if lower.len() != content.len() {
        return None;
    }
    let pos = terms.iter().filter_map(|t| lower.find(t.as_str())).min()?;
    let mut start = pos.saturating_sub(SNIPPET_RADIUS);
    while !content.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (pos + SNIPPET_RADIUS).min(content.len());
    while !content.is_char_boundary(end) {
        end += 1;
    }
    Some(content[start..end].trim().to_string())
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn ensure_index(&self) -> SearchResult<()> {
        Ok(())
    }

    async fn index(&self, doc: &IndexedDocument) -> SearchResult<()> {
        self.docs.write().await.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn bulk_index(&self, docs: &[IndexedDocument]) -> SearchResult<BulkReport> {
        let mut map = self.docs.write().await;
        for doc in docs {
            map.insert(doc.id.clone(), doc.clone());
        }
        Ok(BulkReport {
            indexed: docs.len(),
            failed: Vec::new(),
        })
    }

    async fn delete(&self, id: &str) -> SearchResult<bool> {
        Ok(self.docs.write().await.remove(id).is_some())
    }

    async fn search(&self, request: &SearchRequest) -> SearchResult<SearchResponse> {
        let started = Instant::now();
        let terms = tokenize(&request.query);
        let docs = self.docs.read().await;

        let mut scored: Vec<(f64, &IndexedDocument)> = docs
            .values()
            .filter(|d| matches_filters(d, &request.filters))
            .filter_map(|d| {
                if terms.is_empty() {
                    return Some((1.0, d));
                }
                let s = score(d, &terms);
                (s > 0.0).then_some((s, d))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });

        let total = scored.len() as u64;
        let hits = scored
            .into_iter()
            .skip(request.from)
            .take(request.page_size())
            .map(|(s, d)| {
                let highlights = snippet(&d.content, &terms).into_iter().collect();
                SearchHit::from_document(d, s, highlights)
            })
            .collect();

        Ok(SearchResponse {
            total,
            took_ms: started.elapsed().as_millis() as u64,
            hits,
        })
    }

    async fn clear(&self) -> SearchResult<()> {
        self.docs.write().await.clear();
        Ok(())
    }

    async fn count(&self) -> SearchResult<u64> {
        Ok(self.docs.read().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn doc(id: &str, title: &str, content: &str, tags: &[&str], rank: u8) -> IndexedDocument {
        IndexedDocument {
            id: id.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            players: Vec::new(),
            dates: Vec::new(),
            mime_type: "text/plain".to_string(),
            folder_id: Some("root".to_string()),
            folder_path: Some("Coaching".to_string()),
            access_level: "team".to_string(),
            access_rank: rank,
            web_view_link: None,
            drive_modified_time: Some(Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap()),
            version: 1,
        }
    }

    #[tokio::test]
    async fn test_title_matches_rank_first() {
        let index = MemoryIndex::new();
        index
            .bulk_index(&[
                doc("a", "Match report", "the lineout worked well", &[], 1),
                doc("b", "Lineout calls", "calls for saturday", &[], 1),
                doc("c", "Fixtures", "nothing relevant", &[], 1),
            ])
            .await
            .unwrap();

        let response = index.search(&SearchRequest::new("lineout")).await.unwrap();
        assert_eq!(response.total, 2);
        assert_eq!(response.hits[0].id, "b");
        assert_eq!(response.hits[1].id, "a");
        assert_eq!(response.hits[1].highlights, vec!["the lineout worked well".to_string()]);
    }

    #[tokio::test]
    async fn test_filters_and_access_rank() {
        let index = MemoryIndex::new();
        index.index(&doc("public", "Squad list", "", &["squad"], 0)).await.unwrap();
        index.index(&doc("coaches", "Squad ratings", "", &["squad", "selection"], 2)).await.unwrap();

        let mut filters = SearchFilters {
            tags: vec!["SQUAD".into()],
            max_access_rank: Some(1),
            ..Default::default()
        };
        let request = SearchRequest::new("").with_filters(filters.clone());
        let response = index.search(&request).await.unwrap();
        assert_eq!(response.hits.len(), 1);
        assert_eq!(response.hits[0].id, "public");

        filters.max_access_rank = Some(3);
        filters.tags.push("selection".into());
        let response = index.search(&SearchRequest::new("").with_filters(filters)).await.unwrap();
        assert_eq!(response.hits.len(), 1);
        assert_eq!(response.hits[0].id, "coaches");
    }

    #[tokio::test]
    async fn test_date_range_filter() {
        let index = MemoryIndex::new();
        index.index(&doc("a", "Plan", "", &[], 1)).await.unwrap();

        let after = SearchFilters {
            modified_after: Some(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        let response = index.search(&SearchRequest::new("").with_filters(after)).await.unwrap();
        assert_eq!(response.total, 0);

        let before = SearchFilters {
            modified_before: Some(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        };
        let response = index.search(&SearchRequest::new("").with_filters(before)).await.unwrap();
        assert_eq!(response.total, 1);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let index = MemoryIndex::new();
        index.index(&doc("a", "A", "", &[], 1)).await.unwrap();
        index.index(&doc("b", "B", "", &[], 1)).await.unwrap();

        assert!(index.delete("a").await.unwrap());
        assert!(!index.delete("a").await.unwrap());
        assert_eq!(index.count().await.unwrap(), 1);

        index.clear().await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[test]
    fn test_snippet_respects_char_boundaries() {
        let content = format!("{}café lineout drills", "é".repeat(40));
        let snip = snippet(&content, &["lineout".to_string()]).unwrap();
        assert!(snip.contains("lineout"));
    }
}
