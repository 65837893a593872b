use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use lineout_core::drive::call_authorized;
use lineout_core::{IndexingService, TokenSource};
use lineout_ingest::{
    AccessLevel, DocumentFilter, DocumentRecord, EventRecord, MetadataStore, NotificationChannel,
    NotificationRecord, NotificationStatus, QuerySource, SyncState, CHANGES_STATE,
};
use lineout_search::{SearchFilters, SearchRequest, SearchResponse};
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::{debug, info, warn};

const CALENDAR_API: &str = "https://www.googleapis.com/calendar/v3";
const MAX_EVENTS: usize = 50;

/// Document lookups on behalf of the agent.
pub struct DocumentService {
    indexing: Arc<IndexingService>,
    store: Arc<dyn MetadataStore>,
}

impl DocumentService {
    pub fn new(indexing: Arc<IndexingService>, store: Arc<dyn MetadataStore>) -> Self {
        Self { indexing, store }
    }

    pub async fn search(
        &self,
        query: &str,
        tags: &[String],
        viewer: AccessLevel,
        size: usize,
    ) -> Result<SearchResponse> {
        let request = SearchRequest::new(query)
            .with_filters(SearchFilters {
                tags: tags.to_vec(),
                max_access_rank: Some(viewer.rank()),
                ..Default::default()
            })
            .with_size(size);
        self.indexing.search(&request, QuerySource::Agent).await
    }

    /// Most recently updated live documents the viewer may see.
    pub async fn recent(&self, limit: usize, viewer: AccessLevel) -> Result<Vec<DocumentRecord>> {
        let docs = self
            .store
            .list_documents(&DocumentFilter {
                max_access: Some(viewer),
                limit: Some(limit),
                ..Default::default()
            })
            .await?;
        Ok(docs)
    }

    pub async fn sync_state(&self) -> Result<(Option<SyncState>, u64)> {
        let state = self.store.get_sync_state(CHANGES_STATE).await?;
        let count = self.store.document_count().await?;
        Ok((state, count))
    }
}

#[async_trait]
pub trait CalendarService: Send + Sync {
    /// Events starting between now and `days` from now, soonest first.
    async fn upcoming(&self, days: i64) -> Result<Vec<EventRecord>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventTime {
    date_time: Option<DateTime<Utc>>,
    date: Option<NaiveDate>,
}

impl EventTime {
    fn resolve(&self) -> Option<DateTime<Utc>> {
        self.date_time.or_else(|| {
            self.date
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarEvent {
    id: String,
    #[serde(default)]
    summary: String,
    description: Option<String>,
    location: Option<String>,
    start: Option<EventTime>,
    end: Option<EventTime>,
    html_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventList {
    #[serde(default)]
    items: Vec<CalendarEvent>,
}

pub(crate) fn parse_events(body: &str, now: DateTime<Utc>) -> Result<Vec<EventRecord>> {
    let list: EventList = serde_json::from_str(body)?;
    Ok(list
        .items
        .into_iter()
        .map(|e| EventRecord {
            id: None,
            google_event_id: e.id,
            summary: e.summary,
            description: e.description,
            location: e.location,
            start: e.start.as_ref().and_then(EventTime::resolve),
            end: e.end.as_ref().and_then(EventTime::resolve),
            html_link: e.html_link,
            updated_at: now,
        })
        .collect())
}

/// Google Calendar over REST. Fetched events are cached in the metadata
/// store and served from there when the API is unreachable.
pub struct GoogleCalendar {
    http: Client,
    tokens: Arc<dyn TokenSource>,
    calendar_id: String,
    store: Arc<dyn MetadataStore>,
    api_base: String,
}

impl GoogleCalendar {
    pub fn new(tokens: Arc<dyn TokenSource>, calendar_id: &str, store: Arc<dyn MetadataStore>) -> Result<Self> {
        let http = Client::builder().timeout(StdDuration::from_secs(30)).build()?;
        Ok(Self {
            http,
            tokens,
            calendar_id: calendar_id.to_string(),
            store,
            api_base: CALENDAR_API.to_string(),
        })
    }

    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }

    fn events_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.api_base)?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("calendar api url cannot be a base"))?
            .extend(["calendars", self.calendar_id.as_str(), "events"]);
        Ok(url)
    }

    async fn fetch(&self, from: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<EventRecord>> {
        let url = self.events_url()?;
        let time_min = from.to_rfc3339();
        let time_max = until.to_rfc3339();
        let max = MAX_EVENTS.to_string();
        let response = call_authorized(self.tokens.as_ref(), "calendar.events.list", |token| {
            self.http
                .get(url.clone())
                .query(&[
                    ("timeMin", time_min.as_str()),
                    ("timeMax", time_max.as_str()),
                    ("singleEvents", "true"),
                    ("orderBy", "startTime"),
                    ("maxResults", max.as_str()),
                ])
                .bearer_auth(token)
        })
        .await?;
        let body = response.text().await?;
        parse_events(&body, Utc::now())
    }
}

#[async_trait]
impl CalendarService for GoogleCalendar {
    async fn upcoming(&self, days: i64) -> Result<Vec<EventRecord>> {
        let now = Utc::now();
        let until = now + Duration::days(days);
        match self.fetch(now, until).await {
            Ok(events) => {
                for event in &events {
                    if let Err(e) = self.store.upsert_event(event).await {
                        warn!("Failed to cache event {}: {}", event.google_event_id, e);
                    }
                }
                debug!("Fetched {} calendar events", events.len());
                Ok(events)
            }
            Err(e) => {
                warn!("Calendar unavailable, using cached events: {:#}", e);
                let cached = self.store.upcoming_events(now, MAX_EVENTS).await?;
                Ok(cached
                    .into_iter()
                    .filter(|ev| ev.start.is_some_and(|s| s <= until))
                    .collect())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<()>;
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver `message` to an audience (`team`, `coaches`, an address, ...).
    async fn notify(&self, audience: &str, title: &str, message: &str) -> Result<()>;
}

/// Records outgoing mail and notifications as queued `notifications` rows
/// for a delivery worker outside this process.
pub struct RecordingOutbox {
    store: Arc<dyn MetadataStore>,
}

impl RecordingOutbox {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    async fn queue(&self, recipient: &str, title: &str, body: &str, channel: NotificationChannel) -> Result<()> {
        self.store
            .insert_notification(&NotificationRecord {
                id: None,
                recipient: recipient.to_string(),
                title: title.to_string(),
                body: body.to_string(),
                channel,
                status: NotificationStatus::Queued,
                created_at: Utc::now(),
            })
            .await?;
        info!("Queued {:?} notification for {}", channel, recipient);
        Ok(())
    }
}

#[async_trait]
impl EmailSender for RecordingOutbox {
    async fn send(&self, email: &OutgoingEmail) -> Result<()> {
        self.queue(&email.to, &email.subject, &email.body, NotificationChannel::Email)
            .await
    }
}

#[async_trait]
impl NotificationSink for RecordingOutbox {
    async fn notify(&self, audience: &str, title: &str, message: &str) -> Result<()> {
        self.queue(audience, title, message, NotificationChannel::InApp)
            .await
    }
}
