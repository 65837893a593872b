use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::models::*;
use crate::{select_upcoming, MetadataStore, StoreError, StoreResult};

#[derive(Default)]
struct Tables {
    documents: HashMap<String, DocumentRecord>,
    folders: HashMap<String, FolderRecord>,
    events: HashMap<String, EventRecord>,
    notifications: Vec<NotificationRecord>,
    audit: Vec<AuditLog>,
    searches: Vec<SearchQueryLog>,
    conversations: HashMap<String, AgentConversation>,
    sync_state: HashMap<String, SyncState>,
}

/// In-process store with the same semantics as [`crate::MongoStore`].
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn search_log(&self) -> Vec<SearchQueryLog> {
        self.tables.read().await.searches.clone()
    }

    pub async fn audit_actions(&self) -> Vec<AuditAction> {
        self.tables.read().await.audit.iter().map(|a| a.action).collect()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get_document(&self, drive_id: &str) -> StoreResult<Option<DocumentRecord>> {
        Ok(self.tables.read().await.documents.get(drive_id).cloned())
    }

    async fn upsert_document(&self, record: &DocumentRecord) -> StoreResult<()> {
        if record.google_drive_id.is_empty() {
            return Err(StoreError::Invalid("document without google_drive_id".into()));
        }
        self.tables
            .write()
            .await
            .documents
            .insert(record.google_drive_id.clone(), record.clone());
        Ok(())
    }

    async fn mark_deleted(&self, drive_id: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.documents.get_mut(drive_id) {
            Some(doc) if !doc.is_deleted => {
                doc.is_deleted = true;
                doc.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_documents(&self, filter: &DocumentFilter) -> StoreResult<Vec<DocumentRecord>> {
        let tables = self.tables.read().await;
        let mut docs: Vec<DocumentRecord> = tables
            .documents
            .values()
            .filter(|d| filter.include_deleted || !d.is_deleted)
            .filter(|d| match &filter.folder_id {
                Some(folder) => d.folder_id.as_ref() == Some(folder),
                None => true,
            })
            .filter(|d| filter.max_access.map(|max| d.access_level <= max).unwrap_or(true))
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = filter.limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }

    async fn live_document_ids(&self) -> StoreResult<Vec<String>> {
        let tables = self.tables.read().await;
        let mut ids: Vec<String> = tables
            .documents
            .values()
            .filter(|d| !d.is_deleted)
            .map(|d| d.google_drive_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn document_count(&self) -> StoreResult<u64> {
        let tables = self.tables.read().await;
        Ok(tables.documents.values().filter(|d| !d.is_deleted).count() as u64)
    }

    async fn upsert_folder(&self, folder: &FolderRecord) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .folders
            .insert(folder.google_drive_id.clone(), folder.clone());
        Ok(())
    }

    async fn get_folder(&self, drive_id: &str) -> StoreResult<Option<FolderRecord>> {
        Ok(self.tables.read().await.folders.get(drive_id).cloned())
    }

    async fn list_folders(&self) -> StoreResult<Vec<FolderRecord>> {
        let mut folders: Vec<FolderRecord> =
            self.tables.read().await.folders.values().cloned().collect();
        folders.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.path.cmp(&b.path)));
        Ok(folders)
    }

    async fn delete_folder(&self, drive_id: &str) -> StoreResult<bool> {
        Ok(self.tables.write().await.folders.remove(drive_id).is_some())
    }

    async fn get_sync_state(&self, name: &str) -> StoreResult<Option<SyncState>> {
        Ok(self.tables.read().await.sync_state.get(name).cloned())
    }

    async fn put_sync_state(&self, state: &SyncState) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .sync_state
            .insert(state.name.clone(), state.clone());
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditLog) -> StoreResult<()> {
        self.tables.write().await.audit.push(entry.clone());
        Ok(())
    }

    async fn recent_audit(&self, limit: usize) -> StoreResult<Vec<AuditLog>> {
        let tables = self.tables.read().await;
        Ok(tables.audit.iter().rev().take(limit).cloned().collect())
    }

    async fn log_search(&self, entry: &SearchQueryLog) -> StoreResult<()> {
        self.tables.write().await.searches.push(entry.clone());
        Ok(())
    }

    async fn append_conversation(
        &self,
        conversation_id: &str,
        user: &str,
        messages: &[ConversationMessage],
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let convo = tables
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| AgentConversation {
                id: None,
                conversation_id: conversation_id.to_string(),
                user: user.to_string(),
                messages: Vec::new(),
                updated_at: Utc::now(),
            });
        convo.messages.extend_from_slice(messages);
        convo.updated_at = Utc::now();
        Ok(())
    }

    async fn get_conversation(&self, conversation_id: &str) -> StoreResult<Option<AgentConversation>> {
        Ok(self.tables.read().await.conversations.get(conversation_id).cloned())
    }

    async fn insert_notification(&self, notification: &NotificationRecord) -> StoreResult<()> {
        self.tables.write().await.notifications.push(notification.clone());
        Ok(())
    }

    async fn list_notifications(
        &self,
        recipient: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<NotificationRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .notifications
            .iter()
            .rev()
            .filter(|n| recipient.map(|r| n.recipient == r).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn upsert_event(&self, event: &EventRecord) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .events
            .insert(event.google_event_id.clone(), event.clone());
        Ok(())
    }

    async fn upcoming_events(&self, from: DateTime<Utc>, limit: usize) -> StoreResult<Vec<EventRecord>> {
        let events: Vec<EventRecord> = self.tables.read().await.events.values().cloned().collect();
        Ok(select_upcoming(events, from, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: &str, folder: Option<&str>) -> DocumentRecord {
        let now = Utc::now();
        DocumentRecord {
            id: None,
            google_drive_id: id.to_string(),
            title: format!("Doc {}", id),
            mime_type: "text/plain".to_string(),
            folder_id: folder.map(str::to_string),
            folder_path: None,
            parents: Vec::new(),
            web_view_link: None,
            owners: Vec::new(),
            content: String::new(),
            metadata: DocumentMetadata::default(),
            access_level: AccessLevel::Team,
            version: 1,
            version_history: Vec::new(),
            drive_modified_time: Some(now),
            last_indexed_at: Some(now),
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_mark_deleted_only_once() {
        let store = MemoryStore::new();
        store.upsert_document(&record("a", None)).await.unwrap();

        assert!(store.mark_deleted("a", Utc::now()).await.unwrap());
        assert!(!store.mark_deleted("a", Utc::now()).await.unwrap());
        assert!(!store.mark_deleted("missing", Utc::now()).await.unwrap());

        assert_eq!(store.document_count().await.unwrap(), 0);
        assert!(store.live_document_ids().await.unwrap().is_empty());
        // still retrievable for history
        assert!(store.get_document("a").await.unwrap().unwrap().is_deleted);
    }

    #[tokio::test]
    async fn test_list_documents_filters_folder_and_deleted() {
        let store = MemoryStore::new();
        store.upsert_document(&record("a", Some("f1"))).await.unwrap();
        store.upsert_document(&record("b", Some("f2"))).await.unwrap();
        store.upsert_document(&record("c", Some("f1"))).await.unwrap();
        store.mark_deleted("c", Utc::now()).await.unwrap();

        let filter = DocumentFilter {
            folder_id: Some("f1".to_string()),
            ..Default::default()
        };
        let docs = store.list_documents(&filter).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].google_drive_id, "a");

        let all = DocumentFilter {
            include_deleted: true,
            ..Default::default()
        };
        assert_eq!(store.list_documents(&all).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_list_documents_filters_access() {
        let store = MemoryStore::new();
        let mut selection = record("xv", None);
        selection.access_level = AccessLevel::Coaches;
        store.upsert_document(&selection).await.unwrap();
        store.upsert_document(&record("kit", None)).await.unwrap();

        let team = DocumentFilter {
            max_access: Some(AccessLevel::Team),
            limit: Some(1),
            ..Default::default()
        };
        let docs = store.list_documents(&team).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].google_drive_id, "kit");
    }

    #[tokio::test]
    async fn test_delete_folder() {
        let store = MemoryStore::new();
        store
            .upsert_folder(&FolderRecord {
                id: None,
                google_drive_id: "f1".to_string(),
                name: "Analysis".to_string(),
                parent_id: None,
                path: "Analysis".to_string(),
                depth: 1,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(store.delete_folder("f1").await.unwrap());
        assert!(!store.delete_folder("f1").await.unwrap());
        assert!(store.get_folder("f1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_empty_drive_id() {
        let store = MemoryStore::new();
        let err = store.upsert_document(&record("", None)).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_conversation_appends() {
        let store = MemoryStore::new();
        let msg = |text: &str, role| ConversationMessage {
            role,
            text: text.to_string(),
            intent: None,
            at: Utc::now(),
        };
        store
            .append_conversation("c1", "coach", &[msg("hi", Role::User), msg("hello", Role::Agent)])
            .await
            .unwrap();
        store
            .append_conversation("c1", "someone-else", &[msg("again", Role::User)])
            .await
            .unwrap();

        let convo = store.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(convo.user, "coach");
        assert_eq!(convo.messages.len(), 3);
        assert_eq!(convo.messages[2].text, "again");
    }

    #[tokio::test]
    async fn test_upcoming_events_sorted_and_bounded() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (id, offset) in [("past", -2), ("later", 5), ("soon", 1), ("unscheduled", 0)] {
            store
                .upsert_event(&EventRecord {
                    id: None,
                    google_event_id: id.to_string(),
                    summary: id.to_string(),
                    description: None,
                    location: None,
                    start: (id != "unscheduled").then(|| now + Duration::days(offset)),
                    end: None,
                    html_link: None,
                    updated_at: now,
                })
                .await
                .unwrap();
        }

        let events = store.upcoming_events(now, 10).await.unwrap();
        let ids: Vec<_> = events.iter().map(|e| e.google_event_id.as_str()).collect();
        assert_eq!(ids, vec!["soon", "later"]);
        assert_eq!(store.upcoming_events(now, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_state_keys_are_independent() {
        let store = MemoryStore::new();
        let mut changes = SyncState::named(crate::CHANGES_STATE);
        changes.page_token = Some("42".to_string());
        store.put_sync_state(&changes).await.unwrap();
        store
            .put_sync_state(&SyncState::named(crate::CHANNEL_STATE))
            .await
            .unwrap();

        let loaded = store.get_sync_state(crate::CHANGES_STATE).await.unwrap().unwrap();
        assert_eq!(loaded.page_token.as_deref(), Some("42"));
        assert!(store
            .get_sync_state(crate::CHANNEL_STATE)
            .await
            .unwrap()
            .unwrap()
            .page_token
            .is_none());
    }
}
