//! Chat assistant for the squad: classifies a message, runs the matching
//! document, calendar, email or notification action and keeps a transcript.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use lineout_core::Core;
use lineout_ingest::{
    AccessLevel, AuditAction, AuditLog, ConversationMessage, MetadataStore, Role,
};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

mod intent;
mod services;

pub use intent::{extract_query, extract_tags, Intent, IntentClassifier};
pub use services::{
    CalendarService, DocumentService, EmailSender, GoogleCalendar, NotificationSink,
    OutgoingEmail, RecordingOutbox,
};

const SEARCH_RESULTS: usize = 5;

const HELP_TEXT: &str = "I can help with:\n\
- finding documents: \"find the lineout calls\", \"search for #defence\"\n\
- recent uploads: \"latest documents\"\n\
- the calendar: \"what's on this week\", \"upcoming fixtures in the next 30 days\"\n\
- email: \"email coach@club.org about kit: bring both jerseys\"\n\
- team notices: \"notify the squad that training moves to 7pm\"\n\
- sync health: \"sync status\"";

#[derive(Debug, Clone, Serialize)]
pub struct AgentReply {
    pub conversation_id: String,
    pub intent: Intent,
    pub text: String,
    /// Structured result for clients that render their own view.
    pub data: serde_json::Value,
}

pub struct AgentService {
    classifier: IntentClassifier,
    documents: DocumentService,
    calendar: Arc<dyn CalendarService>,
    email: Arc<dyn EmailSender>,
    notifications: Arc<dyn NotificationSink>,
    store: Arc<dyn MetadataStore>,
    viewer: AccessLevel,
}

impl AgentService {
    pub fn new(
        documents: DocumentService,
        calendar: Arc<dyn CalendarService>,
        email: Arc<dyn EmailSender>,
        notifications: Arc<dyn NotificationSink>,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            classifier: IntentClassifier::new(),
            documents,
            calendar,
            email,
            notifications,
            store,
            viewer: AccessLevel::Team,
        }
    }

    /// Google Calendar plus the recording outbox, over the core's backends.
    pub fn from_core(core: &Core) -> Result<Self> {
        let calendar = GoogleCalendar::new(
            core.tokens.clone(),
            &core.config.google.calendar_id,
            core.store.clone(),
        )?;
        let outbox = Arc::new(RecordingOutbox::new(core.store.clone()));
        Ok(Self::new(
            DocumentService::new(core.indexing.clone(), core.store.clone()),
            Arc::new(calendar),
            outbox.clone(),
            outbox,
            core.store.clone(),
        ))
    }

    /// Highest access level whose documents the agent may surface.
    pub fn with_access_level(mut self, viewer: AccessLevel) -> Self {
        self.viewer = viewer;
        self
    }

    pub async fn handle(&self, conversation_id: &str, user: &str, text: &str) -> Result<AgentReply> {
        let received_at = Utc::now();
        let intent = self.classifier.classify(text);
        info!("Agent message from {} classified as {}", user, intent.name());

        let (reply, data) = match self.dispatch(&intent, user).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Agent action {} failed: {:#}", intent.name(), e);
                (
                    format!("Sorry, I couldn't complete that ({}). Please try again shortly.", e),
                    json!({ "error": e.to_string() }),
                )
            }
        };

        let messages = [
            ConversationMessage {
                role: Role::User,
                text: text.to_string(),
                intent: Some(intent.name().to_string()),
                at: received_at,
            },
            ConversationMessage {
                role: Role::Agent,
                text: reply.clone(),
                intent: None,
                at: Utc::now(),
            },
        ];
        self.store
            .append_conversation(conversation_id, user, &messages)
            .await?;
        if let Err(e) = self
            .store
            .append_audit(&AuditLog::new(
                AuditAction::AgentMessage,
                Some(conversation_id),
                json!({ "user": user, "intent": intent.name() }),
            ))
            .await
        {
            warn!("Failed to write agent audit: {}", e);
        }

        Ok(AgentReply {
            conversation_id: conversation_id.to_string(),
            intent,
            text: reply,
            data,
        })
    }

    async fn dispatch(&self, intent: &Intent, user: &str) -> Result<(String, serde_json::Value)> {
        match intent {
            Intent::SearchDocuments { query, tags } => {
                let response = self
                    .documents
                    .search(query, tags, self.viewer, SEARCH_RESULTS)
                    .await?;
                let label = if query.is_empty() {
                    tags.iter().map(|t| format!("#{}", t)).collect::<Vec<_>>().join(" ")
                } else {
                    format!("\"{}\"", query)
                };
                if response.hits.is_empty() {
                    return Ok((format!("No documents found for {}.", label), json!(response)));
                }
                let mut text = format!("Found {} document(s) for {}:", response.total, label);
                for (i, hit) in response.hits.iter().enumerate() {
                    let _ = write!(text, "\n{}. {}", i + 1, hit.title);
                    if let Some(path) = &hit.folder_path {
                        let _ = write!(text, " ({})", path);
                    }
                    if let Some(link) = &hit.web_view_link {
                        let _ = write!(text, " {}", link);
                    }
                }
                Ok((text, json!(response)))
            }
            Intent::ListRecent { limit } => {
                let docs = self.documents.recent(*limit, self.viewer).await?;
                if docs.is_empty() {
                    return Ok(("No documents have been indexed yet.".to_string(), json!([])));
                }
                let mut text = "Recently updated:".to_string();
                for (i, doc) in docs.iter().enumerate() {
                    let _ = write!(
                        text,
                        "\n{}. {} (v{}, {})",
                        i + 1,
                        doc.title,
                        doc.version,
                        doc.updated_at.format("%d %b %Y")
                    );
                }
                let data: Vec<_> = docs
                    .iter()
                    .map(|d| json!({ "id": d.google_drive_id, "title": d.title, "version": d.version }))
                    .collect();
                Ok((text, json!(data)))
            }
            Intent::UpcomingEvents { days } => {
                let events = self.calendar.upcoming(*days).await?;
                if events.is_empty() {
                    return Ok((format!("Nothing on the calendar in the next {} days.", days), json!([])));
                }
                let mut text = format!("Coming up in the next {} days:", days);
                for event in &events {
                    let when = event
                        .start
                        .map(|s| s.format("%a %d %b %H:%M").to_string())
                        .unwrap_or_else(|| "TBC".to_string());
                    let _ = write!(text, "\n- {}: {}", when, event.summary);
                    if let Some(location) = &event.location {
                        let _ = write!(text, " @ {}", location);
                    }
                }
                Ok((text, json!(events)))
            }
            Intent::SendEmail { to, subject, body } => {
                self.email
                    .send(&OutgoingEmail {
                        to: to.clone(),
                        subject: subject.clone(),
                        body: body.clone(),
                    })
                    .await?;
                Ok((
                    format!("Email to {} queued: \"{}\".", to, subject),
                    json!({ "to": to, "subject": subject }),
                ))
            }
            Intent::Notify { audience, message } => {
                let title = format!("Message from {}", user);
                self.notifications.notify(audience, &title, message).await?;
                Ok((
                    format!("Notification queued for {}.", audience),
                    json!({ "audience": audience }),
                ))
            }
            Intent::SyncStatus => {
                let (state, documents) = self.documents.sync_state().await?;
                let last_poll = state
                    .as_ref()
                    .and_then(|s| s.last_poll_at)
                    .map(|t| t.format("%d %b %Y %H:%M UTC").to_string())
                    .unwrap_or_else(|| "never".to_string());
                let last_full = state
                    .as_ref()
                    .and_then(|s| s.last_full_sync_at)
                    .map(|t| t.format("%d %b %Y %H:%M UTC").to_string())
                    .unwrap_or_else(|| "never".to_string());
                Ok((
                    format!(
                        "{} documents indexed. Last change check: {}. Last full sync: {}.",
                        documents, last_poll, last_full
                    ),
                    json!({ "documents": documents, "state": state }),
                ))
            }
            Intent::Help => Ok((HELP_TEXT.to_string(), json!(null))),
            Intent::Unknown => Ok((
                format!("Sorry, I didn't catch that. {}", HELP_TEXT),
                json!(null),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use lineout_core::config::{ExtractConfig, IndexingConfig};
    use lineout_core::drive::{
        ChangeList, ChannelRequest, ChannelResponse, DriveApi, DriveError, DriveFile, DriveResult,
        FileList,
    };
    use lineout_core::indexing::to_indexed;
    use lineout_core::{ContentExtractor, IndexingService};
    use lineout_ingest::{
        DocumentMetadata, DocumentRecord, EventRecord, MemoryStore, NotificationChannel, QuerySource,
    };
    use lineout_search::{MemoryIndex, SearchIndex};

    /// The agent never touches Drive directly.
    struct OfflineDrive;

    fn offline<T>() -> DriveResult<T> {
        Err(DriveError::NotFound("offline".into()))
    }

    #[async_trait]
    impl DriveApi for OfflineDrive {
        async fn list_page(&self, _: &str, _: Option<&str>) -> DriveResult<FileList> {
            offline()
        }
        async fn get_file(&self, _: &str) -> DriveResult<Option<DriveFile>> {
            Ok(None)
        }
        async fn export(&self, _: &str, _: &str) -> DriveResult<String> {
            offline()
        }
        async fn download(&self, _: &str) -> DriveResult<String> {
            offline()
        }
        async fn create_file(&self, _: &str, _: &str, _: &[String], _: &str) -> DriveResult<DriveFile> {
            offline()
        }
        async fn update_file(&self, _: &str, _: &str) -> DriveResult<DriveFile> {
            offline()
        }
        async fn get_start_page_token(&self) -> DriveResult<String> {
            offline()
        }
        async fn list_changes(&self, _: &str) -> DriveResult<ChangeList> {
            offline()
        }
        async fn watch_changes(&self, _: &str, _: &ChannelRequest) -> DriveResult<ChannelResponse> {
            offline()
        }
        async fn watch_file(&self, _: &str, _: &ChannelRequest) -> DriveResult<ChannelResponse> {
            offline()
        }
        async fn stop_channel(&self, _: &str, _: &str) -> DriveResult<()> {
            offline()
        }
    }

    struct FixedCalendar(Vec<EventRecord>);

    #[async_trait]
    impl CalendarService for FixedCalendar {
        async fn upcoming(&self, _days: i64) -> Result<Vec<EventRecord>> {
            Ok(self.0.clone())
        }
    }

    fn record(id: &str, title: &str, content: &str, tags: &[&str], level: AccessLevel) -> DocumentRecord {
        let now = Utc::now();
        DocumentRecord {
            id: None,
            google_drive_id: id.into(),
            title: title.into(),
            mime_type: "text/plain".into(),
            folder_id: Some("root".into()),
            folder_path: Some("Coaching".into()),
            parents: vec!["root".into()],
            web_view_link: None,
            owners: vec![],
            content: content.into(),
            metadata: DocumentMetadata {
                tags: tags.iter().map(|t| t.to_string()).collect(),
                ..Default::default()
            },
            access_level: level,
            version: 1,
            version_history: vec![],
            drive_modified_time: Some(now),
            last_indexed_at: Some(now),
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    async fn agent(events: Vec<EventRecord>) -> (AgentService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(MemoryIndex::new());
        for doc in [
            record("calls", "Lineout calls", "front ball call is Apple", &["lineout"], AccessLevel::Team),
            record("sel", "Lineout selection notes", "lineout jumpers ranked", &["selection"], AccessLevel::Coaches),
        ] {
            store.upsert_document(&doc).await.unwrap();
            index.index(&to_indexed(&doc)).await.unwrap();
        }
        let indexing = Arc::new(IndexingService::new(
            store.clone(),
            index,
            Arc::new(OfflineDrive),
            ContentExtractor::new(&ExtractConfig::default()),
            IndexingConfig::default(),
        ));
        let outbox = Arc::new(RecordingOutbox::new(store.clone()));
        let service = AgentService::new(
            DocumentService::new(indexing, store.clone()),
            Arc::new(FixedCalendar(events)),
            outbox.clone(),
            outbox,
            store.clone(),
        );
        (service, store)
    }

    #[tokio::test]
    async fn test_search_respects_access_level_and_logs() {
        let (agent, store) = agent(vec![]).await;
        let reply = agent.handle("c1", "winger@club.example", "find lineout").await.unwrap();
        assert_eq!(reply.intent.name(), "search_documents");
        assert!(reply.text.contains("Lineout calls"));
        assert!(!reply.text.contains("selection notes"));

        let coach = agent.with_access_level(AccessLevel::Coaches);
        let reply = coach.handle("c2", "coach@club.example", "find lineout").await.unwrap();
        assert!(reply.text.contains("Lineout selection notes"));

        let log = store.search_log().await;
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|q| q.source == QuerySource::Agent));
    }

    #[tokio::test]
    async fn test_transcript_and_audit_are_written() {
        let (agent, store) = agent(vec![]).await;
        agent.handle("conv", "hooker@club.example", "help").await.unwrap();
        agent.handle("conv", "hooker@club.example", "sync status").await.unwrap();

        let conv = store.get_conversation("conv").await.unwrap().unwrap();
        assert_eq!(conv.messages.len(), 4);
        assert_eq!(conv.messages[0].role, Role::User);
        assert_eq!(conv.messages[0].intent.as_deref(), Some("help"));
        assert_eq!(conv.messages[3].role, Role::Agent);
        assert!(conv.messages[3].text.contains("2 documents indexed"));
        assert_eq!(
            store.audit_actions().await,
            vec![AuditAction::AgentMessage, AuditAction::AgentMessage]
        );
    }

    #[tokio::test]
    async fn test_email_and_notify_are_queued() {
        let (agent, store) = agent(vec![]).await;
        let reply = agent
            .handle("c", "coach@club.example", "email physio@club.example about Tom: hamstring check")
            .await
            .unwrap();
        assert!(reply.text.contains("physio@club.example"));
        agent
            .handle("c", "coach@club.example", "notify the team that the bus leaves at 9")
            .await
            .unwrap();

        let queued = store.list_notifications(None, 10).await.unwrap();
        assert_eq!(queued.len(), 2);
        let email = queued.iter().find(|n| n.channel == NotificationChannel::Email).unwrap();
        assert_eq!(email.title, "Tom");
        assert_eq!(email.body, "hamstring check");
        let notice = queued.iter().find(|n| n.channel == NotificationChannel::InApp).unwrap();
        assert_eq!(notice.recipient, "team");
        assert_eq!(notice.body, "the bus leaves at 9");
    }

    #[tokio::test]
    async fn test_upcoming_events_and_recent() {
        let start = Utc::now() + Duration::days(2);
        let event = EventRecord {
            id: None,
            google_event_id: "e1".into(),
            summary: "Captain's run".into(),
            description: None,
            location: Some("Home ground".into()),
            start: Some(start),
            end: None,
            html_link: None,
            updated_at: Utc::now(),
        };
        let (agent, _) = agent(vec![event]).await;
        let reply = agent.handle("c", "u", "what's on this week").await.unwrap();
        assert!(reply.text.contains("Captain's run @ Home ground"));

        let reply = agent.handle("c", "u", "latest documents").await.unwrap();
        assert!(reply.text.contains("Lineout calls"));
        assert!(!reply.text.contains("selection notes"));
    }

    #[tokio::test]
    async fn test_recent_skips_restricted_documents_without_shrinking() {
        let (agent, store) = agent(vec![]).await;
        for i in 0..30 {
            let mut doc = record(&format!("staff{}", i), "Staff memo", "", &[], AccessLevel::Coaches);
            doc.updated_at = Utc::now() + Duration::minutes(i + 1);
            store.upsert_document(&doc).await.unwrap();
        }

        let reply = agent.handle("c", "u", "latest documents").await.unwrap();
        assert!(reply.text.contains("Lineout calls"));
        assert!(!reply.text.contains("Staff memo"));
    }

    #[tokio::test]
    async fn test_unknown_message_gets_help() {
        let (agent, _) = agent(vec![]).await;
        let reply = agent.handle("c", "u", "good game lads").await.unwrap();
        assert_eq!(reply.intent, Intent::Unknown);
        assert!(reply.text.contains("I can help with"));
    }
}
