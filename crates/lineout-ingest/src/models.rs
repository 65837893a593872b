//! Records persisted in the metadata store.
//!
//! Each struct maps to one MongoDB collection. Relationships are plain
//! Drive-id references; uniqueness of `google_drive_id` is enforced by
//! an index, everything else is application convention.

use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DOCUMENTS: &str = "documents";
pub const FOLDERS: &str = "folders";
pub const EVENTS: &str = "events";
pub const NOTIFICATIONS: &str = "notifications";
pub const AUDIT_LOGS: &str = "audit_logs";
pub const SEARCH_QUERIES: &str = "search_queries";
pub const AGENT_CONVERSATIONS: &str = "agent_conversations";
pub const SYNC_STATE: &str = "sync_state";

/// Who may read a document. Ordered from most to least visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Public,
    #[default]
    Team,
    Coaches,
    Admin,
}

impl AccessLevel {
    pub const ALL: [AccessLevel; 4] = [
        AccessLevel::Public,
        AccessLevel::Team,
        AccessLevel::Coaches,
        AccessLevel::Admin,
    ];

    /// Levels a viewer at `self` may read, most visible first.
    pub fn visible(&self) -> impl Iterator<Item = AccessLevel> {
        let max = *self;
        Self::ALL.into_iter().filter(move |level| *level <= max)
    }

    /// Numeric rank stored in the search index; a viewer sees every rank up to their own.
    pub fn rank(&self) -> u8 {
        match self {
            AccessLevel::Public => 0,
            AccessLevel::Team => 1,
            AccessLevel::Coaches => 2,
            AccessLevel::Admin => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Public => "public",
            AccessLevel::Team => "team",
            AccessLevel::Coaches => "coaches",
            AccessLevel::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "public" => Some(AccessLevel::Public),
            "team" | "player" | "players" => Some(AccessLevel::Team),
            "coaches" | "coach" | "staff" => Some(AccessLevel::Coaches),
            "admin" => Some(AccessLevel::Admin),
            _ => None,
        }
    }
}

/// Values scraped from document content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub word_count: u64,
    pub line_count: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    /// ISO `YYYY-MM-DD` dates mentioned in the text.
    #[serde(default)]
    pub dates: Vec<String>,
    #[serde(default)]
    pub players: Vec<String>,
    #[serde(default)]
    pub headings: Vec<String>,
    pub csv_rows: Option<u64>,
    #[serde(default)]
    pub csv_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: u32,
    pub modified_time: Option<DateTime<Utc>>,
    pub modified_by: Option<String>,
    pub size: Option<u64>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub recorded_at: DateTime<Utc>,
}

/// Mirror of one Drive file plus its search metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub google_drive_id: String,
    pub title: String,
    pub mime_type: String,
    pub folder_id: Option<String>,
    pub folder_path: Option<String>,
    #[serde(default)]
    pub parents: Vec<String>,
    pub web_view_link: Option<String>,
    #[serde(default)]
    pub owners: Vec<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
    #[serde(default)]
    pub access_level: AccessLevel,
    pub version: u32,
    #[serde(default)]
    pub version_history: Vec<VersionEntry>,
    pub drive_modified_time: Option<DateTime<Utc>>,
    pub last_indexed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderRecord {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub google_drive_id: String,
    pub name: String,
    pub parent_id: Option<String>,
    /// Slash-joined folder names from the watched root, root itself is `""`.
    pub path: String,
    pub depth: u32,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

/// Mirror of one Calendar event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub google_event_id: String,
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub html_link: Option<String>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Push,
    InApp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Queued,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub recipient: String,
    pub title: String,
    pub body: String,
    pub channel: NotificationChannel,
    pub status: NotificationStatus,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "document.indexed")]
    DocumentIndexed,
    #[serde(rename = "document.updated")]
    DocumentUpdated,
    #[serde(rename = "document.removed")]
    DocumentRemoved,
    #[serde(rename = "document.skipped")]
    DocumentSkipped,
    #[serde(rename = "sync.full")]
    SyncFull,
    #[serde(rename = "sync.changes")]
    SyncChanges,
    #[serde(rename = "webhook.received")]
    WebhookReceived,
    #[serde(rename = "channel.registered")]
    ChannelRegistered,
    #[serde(rename = "channel.stopped")]
    ChannelStopped,
    #[serde(rename = "agent.message")]
    AgentMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub action: AuditAction,
    pub resource_id: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

impl AuditLog {
    pub fn new(action: AuditAction, resource_id: Option<&str>, details: serde_json::Value) -> Self {
        Self {
            id: None,
            action,
            resource_id: resource_id.map(str::to_string),
            details,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuerySource {
    Api,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQueryLog {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub query: String,
    #[serde(default)]
    pub filters: serde_json::Value,
    pub result_count: u64,
    pub took_ms: u64,
    pub source: QuerySource,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub text: String,
    pub intent: Option<String>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConversation {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub conversation_id: String,
    pub user: String,
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Changes,
    File,
}

/// A Drive push-notification channel we registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchChannel {
    pub id: String,
    pub resource_id: String,
    pub token: String,
    pub kind: ChannelKind,
    /// Set for `ChannelKind::File` channels.
    pub file_id: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

/// Named cursor/bookkeeping row (`drive_changes`, `drive_channel`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    pub name: String,
    pub page_token: Option<String>,
    pub channel: Option<WatchChannel>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub last_poll_at: Option<DateTime<Utc>>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    pub fn named(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            page_token: None,
            channel: None,
            last_full_sync_at: None,
            last_poll_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// Listing options for stored documents.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub include_deleted: bool,
    pub folder_id: Option<String>,
    /// Only documents a viewer at this level may read.
    pub max_access: Option<AccessLevel>,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_level_ordering() {
        assert!(AccessLevel::Public < AccessLevel::Team);
        assert!(AccessLevel::Coaches < AccessLevel::Admin);
        assert_eq!(AccessLevel::Coaches.rank(), 2);
        assert_eq!(AccessLevel::default(), AccessLevel::Team);
    }

    #[test]
    fn test_visible_levels() {
        let team: Vec<_> = AccessLevel::Team.visible().collect();
        assert_eq!(team, vec![AccessLevel::Public, AccessLevel::Team]);
        assert_eq!(AccessLevel::Admin.visible().count(), 4);
    }

    #[test]
    fn test_access_level_parse_aliases() {
        assert_eq!(AccessLevel::parse("Coach"), Some(AccessLevel::Coaches));
        assert_eq!(AccessLevel::parse(" players "), Some(AccessLevel::Team));
        assert_eq!(AccessLevel::parse("owner"), None);
    }

    #[test]
    fn test_audit_action_serializes_dotted() {
        let value = serde_json::to_value(AuditAction::DocumentRemoved).unwrap();
        assert_eq!(value, serde_json::json!("document.removed"));
    }
}
