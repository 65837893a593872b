//! Full-text document index.
//!
//! The metadata store is the source of truth. This index is derived from it
//! and can always be rebuilt with a reindex.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod elastic;
mod error;
mod memory;
pub mod query;

pub use elastic::{ElasticAuth, ElasticIndex};
pub use error::{SearchError, SearchResult};
pub use memory::MemoryIndex;
pub use query::{
    build_query, IndexedDocument, SearchFilters, SearchHit, SearchRequest, SearchResponse,
    DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};

/// Outcome of a bulk write. Individual item failures do not fail the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkReport {
    pub indexed: usize,
    /// `(document id, reason)` for each rejected item.
    pub failed: Vec<(String, String)>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create the index with its mappings if it does not exist yet.
    async fn ensure_index(&self) -> SearchResult<()>;

    async fn index(&self, doc: &IndexedDocument) -> SearchResult<()>;

    async fn bulk_index(&self, docs: &[IndexedDocument]) -> SearchResult<BulkReport>;

    /// Returns false when the document was not in the index.
    async fn delete(&self, id: &str) -> SearchResult<bool>;

    async fn search(&self, request: &SearchRequest) -> SearchResult<SearchResponse>;

    /// Remove every document, keeping the index and its mappings.
    async fn clear(&self) -> SearchResult<()>;

    async fn count(&self) -> SearchResult<u64>;
}
