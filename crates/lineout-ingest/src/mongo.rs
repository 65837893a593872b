use async_trait::async_trait;
use bson::{doc, Document};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{options::IndexOptions, Client, Collection, Database, IndexModel};
use tracing::{info, instrument};

use crate::models::*;
use crate::{select_upcoming, MetadataStore, StoreError, StoreResult};

/// MongoDB-backed metadata store.
#[derive(Clone)]
pub struct MongoStore {
    db: Database,
    documents: Collection<DocumentRecord>,
    folders: Collection<FolderRecord>,
    events: Collection<EventRecord>,
    notifications: Collection<NotificationRecord>,
    audit: Collection<AuditLog>,
    searches: Collection<SearchQueryLog>,
    conversations: Collection<AgentConversation>,
    sync_state: Collection<SyncState>,
}

impl MongoStore {
    /// Connect, ping and make sure the unique indexes exist.
    pub async fn connect(uri: &str, database: &str) -> StoreResult<Self> {
        info!("Connecting to MongoDB database '{}'", database);
        // fail fast when the server is unreachable instead of the 30s driver default
        let uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=5000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=5000", uri)
        };
        let client = Client::with_uri_str(&uri).await?;
        let db = client.database(database);
        db.run_command(doc! { "ping": 1 }).await?;

        let store = Self::from_database(db);
        store.ensure_indexes().await?;
        Ok(store)
    }

    pub fn from_database(db: Database) -> Self {
        Self {
            documents: db.collection(DOCUMENTS),
            folders: db.collection(FOLDERS),
            events: db.collection(EVENTS),
            notifications: db.collection(NOTIFICATIONS),
            audit: db.collection(AUDIT_LOGS),
            searches: db.collection(SEARCH_QUERIES),
            conversations: db.collection(AGENT_CONVERSATIONS),
            sync_state: db.collection(SYNC_STATE),
            db,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    #[instrument(skip_all)]
    async fn ensure_indexes(&self) -> StoreResult<()> {
        self.documents
            .create_indexes(vec![
                unique_index(doc! { "google_drive_id": 1 }),
                IndexModel::builder().keys(doc! { "folder_id": 1 }).build(),
                IndexModel::builder().keys(doc! { "updated_at": -1 }).build(),
            ])
            .await?;
        self.folders
            .create_index(unique_index(doc! { "google_drive_id": 1 }))
            .await?;
        self.events
            .create_index(unique_index(doc! { "google_event_id": 1 }))
            .await?;
        self.sync_state
            .create_index(unique_index(doc! { "name": 1 }))
            .await?;
        self.conversations
            .create_index(unique_index(doc! { "conversation_id": 1 }))
            .await?;
        self.audit
            .create_index(IndexModel::builder().keys(doc! { "created_at": -1 }).build())
            .await?;
        Ok(())
    }
}

fn unique_index(keys: Document) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().unique(true).build())
        .build()
}

fn live() -> Document {
    doc! { "is_deleted": { "$ne": true } }
}

#[async_trait]
impl MetadataStore for MongoStore {
    async fn get_document(&self, drive_id: &str) -> StoreResult<Option<DocumentRecord>> {
        Ok(self
            .documents
            .find_one(doc! { "google_drive_id": drive_id })
            .await?)
    }

    #[instrument(skip_all, fields(drive_id = %record.google_drive_id))]
    async fn upsert_document(&self, record: &DocumentRecord) -> StoreResult<()> {
        if record.google_drive_id.is_empty() {
            return Err(StoreError::Invalid("document without google_drive_id".into()));
        }
        self.documents
            .replace_one(doc! { "google_drive_id": &record.google_drive_id }, record)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn mark_deleted(&self, drive_id: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        let mut filter = live();
        filter.insert("google_drive_id", drive_id);
        let result = self
            .documents
            .update_one(
                filter,
                doc! { "$set": {
                    "is_deleted": true,
                    "updated_at": bson::DateTime::from_chrono(at),
                } },
            )
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn list_documents(&self, filter: &DocumentFilter) -> StoreResult<Vec<DocumentRecord>> {
        let mut query = if filter.include_deleted { Document::new() } else { live() };
        if let Some(folder_id) = &filter.folder_id {
            query.insert("folder_id", folder_id);
        }
        if let Some(max) = filter.max_access {
            let visible: Vec<&str> = max.visible().map(|level| level.as_str()).collect();
            query.insert("access_level", doc! { "$in": visible });
        }
        let mut find = self.documents.find(query).sort(doc! { "updated_at": -1 });
        if let Some(limit) = filter.limit {
            find = find.limit(limit as i64);
        }
        Ok(find.await?.try_collect().await?)
    }

    async fn live_document_ids(&self) -> StoreResult<Vec<String>> {
        let raw = self.documents.clone_with_type::<Document>();
        let cursor = raw
            .find(live())
            .projection(doc! { "google_drive_id": 1, "_id": 0 })
            .await?;
        let docs: Vec<Document> = cursor.try_collect().await?;
        Ok(docs
            .iter()
            .filter_map(|d| d.get_str("google_drive_id").ok().map(str::to_string))
            .collect())
    }

    async fn document_count(&self) -> StoreResult<u64> {
        Ok(self.documents.count_documents(live()).await?)
    }

    async fn upsert_folder(&self, folder: &FolderRecord) -> StoreResult<()> {
        self.folders
            .replace_one(doc! { "google_drive_id": &folder.google_drive_id }, folder)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn get_folder(&self, drive_id: &str) -> StoreResult<Option<FolderRecord>> {
        Ok(self
            .folders
            .find_one(doc! { "google_drive_id": drive_id })
            .await?)
    }

    async fn list_folders(&self) -> StoreResult<Vec<FolderRecord>> {
        let cursor = self
            .folders
            .find(doc! {})
            .sort(doc! { "depth": 1, "path": 1 })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    #[instrument(skip(self))]
    async fn delete_folder(&self, drive_id: &str) -> StoreResult<bool> {
        let result = self
            .folders
            .delete_one(doc! { "google_drive_id": drive_id })
            .await?;
        Ok(result.deleted_count > 0)
    }

    async fn get_sync_state(&self, name: &str) -> StoreResult<Option<SyncState>> {
        Ok(self.sync_state.find_one(doc! { "name": name }).await?)
    }

    async fn put_sync_state(&self, state: &SyncState) -> StoreResult<()> {
        self.sync_state
            .replace_one(doc! { "name": &state.name }, state)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditLog) -> StoreResult<()> {
        self.audit.insert_one(entry).await?;
        Ok(())
    }

    async fn recent_audit(&self, limit: usize) -> StoreResult<Vec<AuditLog>> {
        let cursor = self
            .audit
            .find(doc! {})
            .sort(doc! { "created_at": -1 })
            .limit(limit as i64)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn log_search(&self, entry: &SearchQueryLog) -> StoreResult<()> {
        self.searches.insert_one(entry).await?;
        Ok(())
    }

    async fn append_conversation(
        &self,
        conversation_id: &str,
        user: &str,
        messages: &[ConversationMessage],
    ) -> StoreResult<()> {
        let encoded = messages
            .iter()
            .map(bson::to_bson)
            .collect::<Result<Vec<_>, _>>()?;
        self.conversations
            .update_one(
                doc! { "conversation_id": conversation_id },
                doc! {
                    "$push": { "messages": { "$each": encoded } },
                    "$set": { "updated_at": bson::DateTime::now() },
                    "$setOnInsert": { "user": user },
                },
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn get_conversation(&self, conversation_id: &str) -> StoreResult<Option<AgentConversation>> {
        Ok(self
            .conversations
            .find_one(doc! { "conversation_id": conversation_id })
            .await?)
    }

    async fn insert_notification(&self, notification: &NotificationRecord) -> StoreResult<()> {
        self.notifications.insert_one(notification).await?;
        Ok(())
    }

    async fn list_notifications(
        &self,
        recipient: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<NotificationRecord>> {
        let filter = match recipient {
            Some(r) => doc! { "recipient": r },
            None => doc! {},
        };
        let cursor = self
            .notifications
            .find(filter)
            .sort(doc! { "created_at": -1 })
            .limit(limit as i64)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn upsert_event(&self, event: &EventRecord) -> StoreResult<()> {
        self.events
            .replace_one(doc! { "google_event_id": &event.google_event_id }, event)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn upcoming_events(&self, from: DateTime<Utc>, limit: usize) -> StoreResult<Vec<EventRecord>> {
        // start is stored as an RFC 3339 string, so ordering happens client side
        let events: Vec<EventRecord> = self.events.find(doc! {}).await?.try_collect().await?;
        Ok(select_upcoming(events, from, limit))
    }
}
