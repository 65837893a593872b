//! Metadata store for mirrored Drive documents, folders and sync bookkeeping.
//!
//! [`MongoStore`] is the production backend. [`MemoryStore`] keeps the same
//! contract in process memory so the sync pipeline can be exercised without
//! a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

mod error;
mod memory;
pub mod models;
mod mongo;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use models::*;
pub use mongo::MongoStore;

/// Sync-state key holding the Drive changes page token.
pub const CHANGES_STATE: &str = "drive_changes";
/// Sync-state key holding the active push-notification channel.
pub const CHANNEL_STATE: &str = "drive_channel";

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Look up a document by Drive id, including soft-deleted ones.
    async fn get_document(&self, drive_id: &str) -> StoreResult<Option<DocumentRecord>>;

    /// Insert or replace the record keyed by `google_drive_id`.
    async fn upsert_document(&self, record: &DocumentRecord) -> StoreResult<()>;

    /// Soft-delete. Returns false when no live record existed.
    async fn mark_deleted(&self, drive_id: &str, at: DateTime<Utc>) -> StoreResult<bool>;

    /// Most recently updated first.
    async fn list_documents(&self, filter: &DocumentFilter) -> StoreResult<Vec<DocumentRecord>>;

    async fn live_document_ids(&self) -> StoreResult<Vec<String>>;

    async fn document_count(&self) -> StoreResult<u64>;

    async fn upsert_folder(&self, folder: &FolderRecord) -> StoreResult<()>;

    async fn get_folder(&self, drive_id: &str) -> StoreResult<Option<FolderRecord>>;

    async fn list_folders(&self) -> StoreResult<Vec<FolderRecord>>;

    /// Drop a folder record. Returns false when none was stored.
    async fn delete_folder(&self, drive_id: &str) -> StoreResult<bool>;

    async fn get_sync_state(&self, name: &str) -> StoreResult<Option<SyncState>>;

    async fn put_sync_state(&self, state: &SyncState) -> StoreResult<()>;

    async fn append_audit(&self, entry: &AuditLog) -> StoreResult<()>;

    /// Newest first.
    async fn recent_audit(&self, limit: usize) -> StoreResult<Vec<AuditLog>>;

    async fn log_search(&self, entry: &SearchQueryLog) -> StoreResult<()>;

    /// Append messages, creating the conversation on first use.
    async fn append_conversation(
        &self,
        conversation_id: &str,
        user: &str,
        messages: &[ConversationMessage],
    ) -> StoreResult<()>;

    async fn get_conversation(&self, conversation_id: &str) -> StoreResult<Option<AgentConversation>>;

    async fn insert_notification(&self, notification: &NotificationRecord) -> StoreResult<()>;

    /// Newest first, optionally for a single recipient.
    async fn list_notifications(
        &self,
        recipient: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<NotificationRecord>>;

    async fn upsert_event(&self, event: &EventRecord) -> StoreResult<()>;

    /// Events starting at or after `from`, soonest first.
    async fn upcoming_events(&self, from: DateTime<Utc>, limit: usize) -> StoreResult<Vec<EventRecord>>;
}

/// Keep events that start at or after `from`, soonest first.
pub(crate) fn select_upcoming(
    mut events: Vec<EventRecord>,
    from: DateTime<Utc>,
    limit: usize,
) -> Vec<EventRecord> {
    events.retain(|e| e.start.map(|s| s >= from).unwrap_or(false));
    events.sort_by_key(|e| e.start);
    events.truncate(limit);
    events
}
