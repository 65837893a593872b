//! Drive push notifications: channel bookkeeping, validation and the
//! single worker that turns notifications into change processing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use lineout_ingest::{
    AuditAction, AuditLog, ChannelKind, MetadataStore, SyncState, WatchChannel, CHANNEL_STATE,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::changes::{ChangeProcessor, ResourceState};
use crate::config::WebhookConfig;
use crate::drive::{ChannelRequest, DriveApi};

const RECENT_CAPACITY: usize = 1024;

/// Parsed `X-Goog-*` headers of one push notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub channel_id: String,
    pub resource_id: Option<String>,
    pub resource_state: ResourceState,
    pub message_number: Option<u64>,
    pub channel_token: Option<String>,
    pub resource_uri: Option<String>,
}

impl Notification {
    /// Build from raw header pairs; names are matched case-insensitively.
    /// `None` when the channel id or resource state is missing.
    pub fn from_headers<'a, I>(headers: I) -> Option<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut channel_id = None;
        let mut resource_id = None;
        let mut state = None;
        let mut message_number = None;
        let mut token = None;
        let mut uri = None;
        for (name, value) in headers {
            let value = value.trim().to_string();
            match name.to_ascii_lowercase().as_str() {
                "x-goog-channel-id" => channel_id = Some(value),
                "x-goog-resource-id" => resource_id = Some(value),
                "x-goog-resource-state" => state = Some(ResourceState::parse(&value)),
                "x-goog-message-number" => message_number = value.parse().ok(),
                "x-goog-channel-token" => token = Some(value),
                "x-goog-resource-uri" => uri = Some(value),
                _ => {}
            }
        }
        Some(Self {
            channel_id: channel_id?,
            resource_id,
            resource_state: state?,
            message_number,
            channel_token: token,
            resource_uri: uri,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ack {
    Accepted,
    Duplicate,
    UnknownChannel,
    /// Token did not match the registered channel.
    Invalid,
    /// `sync` handshakes and anything that needs no work.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct QueuedNotification {
    pub notification: Notification,
    pub channel: WatchChannel,
}

/// Bounded set of recently seen `(channel, message number)` pairs.
struct RecentMessages {
    order: VecDeque<(String, u64)>,
    seen: HashSet<(String, u64)>,
    capacity: usize,
}

impl RecentMessages {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// `false` if the key was already present.
    fn insert(&mut self, key: (String, u64)) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

pub struct WebhookHandler {
    drive: Arc<dyn DriveApi>,
    store: Arc<dyn MetadataStore>,
    changes: Arc<ChangeProcessor>,
    config: WebhookConfig,
    channels: RwLock<HashMap<String, WatchChannel>>,
    recent: Mutex<RecentMessages>,
    queue: mpsc::UnboundedSender<QueuedNotification>,
}

/// Consumes accepted notifications one at a time.
pub struct WebhookWorker {
    rx: mpsc::UnboundedReceiver<QueuedNotification>,
    changes: Arc<ChangeProcessor>,
    store: Arc<dyn MetadataStore>,
}

impl WebhookHandler {
    pub fn new(
        drive: Arc<dyn DriveApi>,
        store: Arc<dyn MetadataStore>,
        changes: Arc<ChangeProcessor>,
        config: WebhookConfig,
    ) -> (Arc<Self>, WebhookWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = WebhookWorker {
            rx,
            changes: changes.clone(),
            store: store.clone(),
        };
        let handler = Arc::new(Self {
            drive,
            store,
            changes,
            config,
            channels: RwLock::new(HashMap::new()),
            recent: Mutex::new(RecentMessages::new(RECENT_CAPACITY)),
            queue: tx,
        });
        (handler, worker)
    }

    fn channel(&self, id: &str) -> Option<WatchChannel> {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn remember(&self, channel: WatchChannel) {
        self.channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(channel.id.clone(), channel);
    }

    fn forget(&self, id: &str) -> Option<WatchChannel> {
        self.channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    /// The active `changes.watch` channel, if any.
    pub fn changes_channel(&self) -> Option<WatchChannel> {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|c| c.kind == ChannelKind::Changes)
            .cloned()
    }

    pub fn channels(&self) -> Vec<WatchChannel> {
        self.channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Validate and enqueue a notification. Never blocks; the HTTP layer
    /// answers 200 whatever this returns.
    pub fn accept(&self, notification: Notification) -> Ack {
        let Some(channel) = self.channel(&notification.channel_id) else {
            debug!("Notification for unknown channel {}", notification.channel_id);
            return Ack::UnknownChannel;
        };
        if notification.channel_token.as_deref() != Some(channel.token.as_str()) {
            warn!("Channel token mismatch for {}", channel.id);
            return Ack::Invalid;
        }
        if notification.resource_state == ResourceState::Sync {
            debug!("Sync handshake for channel {}", channel.id);
            return Ack::Ignored;
        }
        if let Some(number) = notification.message_number {
            let fresh = self
                .recent
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert((channel.id.clone(), number));
            if !fresh {
                return Ack::Duplicate;
            }
        }
        if self
            .queue
            .send(QueuedNotification {
                notification,
                channel,
            })
            .is_err()
        {
            error!("Webhook worker has stopped, dropping notification");
            return Ack::Ignored;
        }
        Ack::Accepted
    }

    async fn audit(&self, action: AuditAction, resource_id: &str, details: serde_json::Value) {
        if let Err(e) = self
            .store
            .append_audit(&AuditLog::new(action, Some(resource_id), details))
            .await
        {
            warn!("Failed to write audit entry {:?}: {}", action, e);
        }
    }

    fn new_channel_request(&self, address: &str, now: DateTime<Utc>) -> (ChannelRequest, String) {
        let secret = Uuid::new_v4().simple().to_string();
        let expires = now + Duration::seconds(self.config.channel_ttl_secs as i64);
        let request = ChannelRequest::web_hook(&Uuid::new_v4().to_string(), address, &secret, expires);
        (request, secret)
    }

    fn callback_address(&self) -> Result<String> {
        self.config
            .callback_address()
            .ok_or_else(|| anyhow!("webhook.public_url is not configured"))
    }

    /// Register a `changes.watch` channel, replacing the current one.
    pub async fn register_channel(&self) -> Result<WatchChannel> {
        let address = self.callback_address()?;
        if let Some(old) = self.changes_channel() {
            if let Err(e) = self.stop_channel(&old.id).await {
                warn!("Failed to stop previous channel {}: {:#}", old.id, e);
            }
        }

        let page_token = self.changes.ensure_page_token().await?;
        let now = Utc::now();
        let (request, secret) = self.new_channel_request(&address, now);
        let response = self.drive.watch_changes(&page_token, &request).await?;
        let channel = WatchChannel {
            id: response.id.clone(),
            resource_id: response.resource_id.clone(),
            token: secret,
            kind: ChannelKind::Changes,
            file_id: None,
            expiration: response.expires_at(),
            registered_at: now,
        };

        let mut state = self
            .store
            .get_sync_state(CHANNEL_STATE)
            .await?
            .unwrap_or_else(|| SyncState::named(CHANNEL_STATE));
        state.channel = Some(channel.clone());
        state.updated_at = now;
        self.store.put_sync_state(&state).await?;

        self.remember(channel.clone());
        self.audit(
            AuditAction::ChannelRegistered,
            &channel.id,
            json!({ "kind": "changes", "address": address, "expiration": channel.expiration }),
        )
        .await;
        info!("Registered Drive changes channel {}", channel.id);
        Ok(channel)
    }

    /// Watch a single file. File channels live only as long as the process.
    pub async fn watch_file(&self, file_id: &str) -> Result<WatchChannel> {
        let address = self.callback_address()?;
        let now = Utc::now();
        let (request, secret) = self.new_channel_request(&address, now);
        let response = self.drive.watch_file(file_id, &request).await?;
        let channel = WatchChannel {
            id: response.id.clone(),
            resource_id: response.resource_id.clone(),
            token: secret,
            kind: ChannelKind::File,
            file_id: Some(file_id.to_string()),
            expiration: response.expires_at(),
            registered_at: now,
        };
        self.remember(channel.clone());
        self.audit(
            AuditAction::ChannelRegistered,
            &channel.id,
            json!({ "kind": "file", "file_id": file_id }),
        )
        .await;
        Ok(channel)
    }

    /// Stop a channel we registered. `false` if the id is unknown.
    pub async fn stop_channel(&self, channel_id: &str) -> Result<bool> {
        let Some(channel) = self.forget(channel_id) else {
            return Ok(false);
        };
        self.drive
            .stop_channel(&channel.id, &channel.resource_id)
            .await?;
        if channel.kind == ChannelKind::Changes {
            if let Some(mut state) = self.store.get_sync_state(CHANNEL_STATE).await? {
                if state.channel.as_ref().map(|c| c.id.as_str()) == Some(channel.id.as_str()) {
                    state.channel = None;
                    state.updated_at = Utc::now();
                    self.store.put_sync_state(&state).await?;
                }
            }
        }
        self.audit(
            AuditAction::ChannelStopped,
            &channel.id,
            json!({ "resource_id": channel.resource_id }),
        )
        .await;
        info!("Stopped channel {}", channel.id);
        Ok(true)
    }

    pub async fn stop_changes_channel(&self) -> Result<bool> {
        match self.changes_channel() {
            Some(channel) => self.stop_channel(&channel.id).await,
            None => Ok(false),
        }
    }

    /// Renew the changes channel once less than 10% of its lifetime is left.
    /// Expired file channels are dropped.
    pub async fn renew_if_expiring(&self, now: DateTime<Utc>) -> Result<Option<WatchChannel>> {
        self.channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, c| c.kind == ChannelKind::Changes || c.expiration.map_or(true, |exp| exp > now));

        let Some(channel) = self.changes_channel() else {
            return Ok(None);
        };
        let Some(expiration) = channel.expiration else {
            return Ok(None);
        };
        let lifetime = expiration - channel.registered_at;
        let remaining = expiration - now;
        if remaining * 10 >= lifetime {
            return Ok(None);
        }
        info!("Channel {} expires at {}, renewing", channel.id, expiration);
        self.register_channel().await.map(Some)
    }

    /// Restore the persisted changes channel after a restart.
    pub async fn load_channel(&self) -> Result<Option<WatchChannel>> {
        let Some(state) = self.store.get_sync_state(CHANNEL_STATE).await? else {
            return Ok(None);
        };
        match state.channel {
            Some(channel) if channel.expiration.map_or(true, |exp| exp > Utc::now()) => {
                self.remember(channel.clone());
                Ok(Some(channel))
            }
            Some(channel) => {
                debug!("Persisted channel {} has expired", channel.id);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

impl WebhookWorker {
    /// Process notifications until every handler is dropped.
    pub async fn run(mut self) {
        while let Some(queued) = self.rx.recv().await {
            self.handle(queued).await;
        }
        debug!("Webhook worker stopped");
    }

    async fn handle(&self, queued: QueuedNotification) {
        let QueuedNotification {
            notification,
            channel,
        } = queued;
        let details = json!({
            "state": notification.resource_state,
            "message_number": notification.message_number,
            "resource_uri": notification.resource_uri,
        });
        if let Err(e) = self
            .store
            .append_audit(&AuditLog::new(AuditAction::WebhookReceived, Some(&channel.id), details))
            .await
        {
            warn!("Failed to write webhook audit: {}", e);
        }

        let result = match (&channel.kind, &channel.file_id) {
            (ChannelKind::File, Some(file_id)) => self
                .changes
                .process(file_id, &notification.resource_state)
                .await
                .map(|outcome| debug!("{}: {:?}", file_id, outcome)),
            _ => self
                .changes
                .drain_changes()
                .await
                .map(|summary| debug!("Drained {} changes", summary.received)),
        };
        if let Err(e) = result {
            error!("Failed to process notification on {}: {:#}", channel.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExtractConfig, IndexingConfig};
    use crate::drive::{Change, ChangeList};
    use crate::extract::ContentExtractor;
    use crate::fake_drive::{file, FakeDrive};
    use crate::indexing::IndexingService;
    use lineout_ingest::{FolderRecord, MemoryStore};
    use lineout_search::MemoryIndex;

    struct Harness {
        drive: Arc<FakeDrive>,
        store: Arc<MemoryStore>,
        handler: Arc<WebhookHandler>,
        worker: WebhookWorker,
    }

    async fn harness(ttl: u64) -> Harness {
        let drive = Arc::new(FakeDrive::new());
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_folder(&FolderRecord {
                id: None,
                google_drive_id: "root".into(),
                name: "Club".into(),
                parent_id: None,
                path: String::new(),
                depth: 0,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        let indexing = Arc::new(IndexingService::new(
            store.clone(),
            Arc::new(MemoryIndex::new()),
            drive.clone(),
            ContentExtractor::new(&ExtractConfig::default()),
            IndexingConfig::default(),
        ));
        let changes = Arc::new(ChangeProcessor::new(
            drive.clone(),
            store.clone(),
            indexing,
            Some("root".into()),
        ));
        let config = WebhookConfig {
            enabled: true,
            public_url: Some("https://lineout.example/".into()),
            channel_ttl_secs: ttl,
            ..Default::default()
        };
        let (handler, worker) = WebhookHandler::new(drive.clone(), store.clone(), changes, config);
        Harness {
            drive,
            store,
            handler,
            worker,
        }
    }

    fn notification(channel: &WatchChannel, state: &str, number: u64) -> Notification {
        Notification {
            channel_id: channel.id.clone(),
            resource_id: Some(channel.resource_id.clone()),
            resource_state: ResourceState::parse(state),
            message_number: Some(number),
            channel_token: Some(channel.token.clone()),
            resource_uri: None,
        }
    }

    #[test]
    fn test_from_headers_is_case_insensitive() {
        let headers = [
            ("x-goog-channel-id", "chan-1"),
            ("X-Goog-Resource-State", "update"),
            ("X-GOOG-MESSAGE-NUMBER", "42"),
            ("X-Goog-Channel-Token", "secret"),
            ("Content-Length", "0"),
        ];
        let n = Notification::from_headers(headers).unwrap();
        assert_eq!(n.channel_id, "chan-1");
        assert_eq!(n.resource_state, ResourceState::Update);
        assert_eq!(n.message_number, Some(42));
        assert_eq!(n.channel_token.as_deref(), Some("secret"));

        assert!(Notification::from_headers([("X-Goog-Channel-ID", "c")]).is_none());
    }

    #[test]
    fn test_recent_messages_evicts_oldest() {
        let mut recent = RecentMessages::new(2);
        assert!(recent.insert(("c".into(), 1)));
        assert!(!recent.insert(("c".into(), 1)));
        assert!(recent.insert(("c".into(), 2)));
        assert!(recent.insert(("c".into(), 3)));
        assert!(recent.insert(("c".into(), 1)));
    }

    #[tokio::test]
    async fn test_register_persists_channel_and_uses_callback_url() {
        let h = harness(3600).await;
        let channel = h.handler.register_channel().await.unwrap();
        assert_eq!(channel.kind, ChannelKind::Changes);
        assert_eq!(channel.resource_id, format!("res-{}", channel.id));

        let watches = h.drive.watches();
        assert_eq!(watches.len(), 1);
        assert_eq!(watches[0].address, "https://lineout.example/webhooks/drive");
        assert_eq!(watches[0].token.as_deref(), Some(channel.token.as_str()));

        let state = h.store.get_sync_state(CHANNEL_STATE).await.unwrap().unwrap();
        assert_eq!(state.channel.unwrap().id, channel.id);
        assert!(h.store.audit_actions().await.contains(&AuditAction::ChannelRegistered));
    }

    #[tokio::test]
    async fn test_accept_validates_and_dedups() {
        let h = harness(3600).await;
        let channel = h.handler.register_channel().await.unwrap();

        assert_eq!(h.handler.accept(notification(&channel, "change", 1)), Ack::Accepted);
        assert_eq!(h.handler.accept(notification(&channel, "change", 1)), Ack::Duplicate);
        assert_eq!(h.handler.accept(notification(&channel, "sync", 2)), Ack::Ignored);

        let mut forged = notification(&channel, "change", 3);
        forged.channel_token = Some("nope".into());
        assert_eq!(h.handler.accept(forged), Ack::Invalid);

        let mut stranger = notification(&channel, "change", 4);
        stranger.channel_id = "someone-else".into();
        assert_eq!(h.handler.accept(stranger), Ack::UnknownChannel);
    }

    #[tokio::test]
    async fn test_worker_drains_changes_for_accepted_notification() {
        let h = harness(3600).await;
        let channel = h.handler.register_channel().await.unwrap();
        let f = file("doc", "Match report", "text/plain", "root", "2024-03-09T17:00:00Z");
        h.drive.add_file(f.clone(), "Won 24-10 #report");
        h.drive.set_changes(
            "1",
            ChangeList {
                changes: vec![Change {
                    file_id: Some("doc".into()),
                    time: Some("2024-03-09T17:00:00Z".parse().unwrap()),
                    file: Some(f),
                    ..Default::default()
                }],
                next_page_token: None,
                new_start_page_token: Some("2".into()),
            },
        );

        assert_eq!(h.handler.accept(notification(&channel, "change", 1)), Ack::Accepted);
        let Harness {
            store,
            handler,
            worker,
            ..
        } = h;
        drop(handler);
        worker.run().await;

        let doc = store.get_document("doc").await.unwrap().unwrap();
        assert_eq!(doc.metadata.tags, vec!["report"]);
        let actions = store.audit_actions().await;
        assert!(actions.contains(&AuditAction::WebhookReceived));
        assert!(actions.contains(&AuditAction::SyncChanges));
    }

    #[tokio::test]
    async fn test_file_channel_processes_watched_file() {
        let h = harness(3600).await;
        let f = file("sheet", "Fitness", "text/csv", "root", "2024-03-01T10:00:00Z");
        h.drive.add_file(f, "Player,Time\nAna,12:30\n");
        let channel = h.handler.watch_file("sheet").await.unwrap();
        assert_eq!(channel.file_id.as_deref(), Some("sheet"));

        assert_eq!(h.handler.accept(notification(&channel, "update", 1)), Ack::Accepted);
        let Harness {
            store,
            handler,
            worker,
            ..
        } = h;
        drop(handler);
        worker.run().await;

        let doc = store.get_document("sheet").await.unwrap().unwrap();
        assert_eq!(doc.metadata.csv_rows, Some(1));
    }

    #[tokio::test]
    async fn test_stop_channel_clears_state() {
        let h = harness(3600).await;
        let channel = h.handler.register_channel().await.unwrap();
        assert!(h.handler.stop_changes_channel().await.unwrap());
        assert!(!h.handler.stop_changes_channel().await.unwrap());

        assert_eq!(h.drive.stopped(), vec![(channel.id.clone(), channel.resource_id.clone())]);
        let state = h.store.get_sync_state(CHANNEL_STATE).await.unwrap().unwrap();
        assert!(state.channel.is_none());
        assert_eq!(h.handler.accept(notification(&channel, "change", 9)), Ack::UnknownChannel);
    }

    #[tokio::test]
    async fn test_renews_only_near_expiry() {
        let h = harness(1000).await;
        let first = h.handler.register_channel().await.unwrap();

        assert!(h.handler.renew_if_expiring(Utc::now()).await.unwrap().is_none());

        let late = first.registered_at + Duration::seconds(950);
        let renewed = h.handler.renew_if_expiring(late).await.unwrap().unwrap();
        assert_ne!(renewed.id, first.id);
        assert_eq!(h.drive.stopped().len(), 1);
        assert_eq!(h.handler.channels().len(), 1);
    }

    #[tokio::test]
    async fn test_load_channel_restores_registration() {
        let h = harness(3600).await;
        let channel = h.handler.register_channel().await.unwrap();

        let (fresh, _worker) = WebhookHandler::new(
            h.drive.clone(),
            h.store.clone(),
            h.handler.changes.clone(),
            h.handler.config.clone(),
        );
        assert!(fresh.changes_channel().is_none());
        let loaded = fresh.load_channel().await.unwrap().unwrap();
        assert_eq!(loaded.id, channel.id);
        assert_eq!(fresh.accept(notification(&channel, "change", 1)), Ack::Accepted);
    }
}
