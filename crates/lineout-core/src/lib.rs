use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

pub mod changes;
pub mod config;
pub mod discovery;
pub mod drive;
pub mod extract;
pub mod indexing;
pub mod polling;
pub mod progress;
pub mod webhook;

#[cfg(test)]
mod fake_drive;

pub use changes::{ChangeProcessor, DrainSummary, ProcessOutcome, ResourceState};
pub use config::LineoutConfig;
pub use discovery::{DiscoveryResult, DocumentDiscovery, FolderNode};
pub use drive::{DriveApi, DriveClient, DriveError, DriveFile, StaticToken, TokenSource};
pub use extract::ContentExtractor;
pub use indexing::{BulkSummary, IndexOutcome, IndexingService, ReindexSummary};
pub use polling::PollingService;
pub use progress::{emit_error, emit_progress};
pub use webhook::{Ack, Notification, WebhookHandler, WebhookWorker};

pub use lineout_auth_bridge::{AuthToken, OAuthConfig, RefreshingToken, TokenStore};
pub use lineout_ingest::{
    AuditAction, AuditLog, MemoryStore, MetadataStore, MongoStore, QuerySource, WatchChannel,
};
pub use lineout_search::{
    ElasticAuth, ElasticIndex, MemoryIndex, SearchFilters, SearchIndex, SearchRequest,
    SearchResponse,
};

use lineout_ingest::{CHANGES_STATE, CHANNEL_STATE};

#[derive(Debug, Clone)]
pub struct LineoutPaths {
    pub base_dir: PathBuf,
    pub config_path: PathBuf,
    pub auth_path: PathBuf,
    pub admin_socket_path: PathBuf,
}

impl LineoutPaths {
    pub fn from_env() -> Self {
        if let Some(dir) = std::env::var_os("LINEOUT_DATA_DIR") {
            return Self::from_base(PathBuf::from(dir));
        }
        if let Some(home) = std::env::var_os("HOME") {
            return Self::from_base(PathBuf::from(home).join(".lineout"));
        }
        Self::from_base(PathBuf::from(".lineout"))
    }

    pub fn from_base(base_dir: PathBuf) -> Self {
        Self {
            config_path: base_dir.join("lineout.toml"),
            auth_path: base_dir.join("auth.json"),
            admin_socket_path: base_dir.join("admin.sock"),
            base_dir,
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub files_discovered: usize,
    pub folders: usize,
    pub indexing: BulkSummary,
    /// Stored documents no longer present in the tree.
    pub removed: usize,
    /// Stored folders no longer present in the tree.
    pub folders_removed: usize,
    pub page_token: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoreStatus {
    pub documents: u64,
    pub indexed: u64,
    pub folders: usize,
    pub page_token: Option<String>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub channel: Option<WatchChannel>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub file: DriveFile,
    pub outcome: IndexOutcome,
}

#[derive(Clone)]
pub struct Core {
    pub config: LineoutConfig,
    pub store: Arc<dyn MetadataStore>,
    pub index: Arc<dyn SearchIndex>,
    pub drive: Arc<dyn DriveApi>,
    pub tokens: Arc<dyn TokenSource>,
    pub indexing: Arc<IndexingService>,
    pub changes: Arc<ChangeProcessor>,
    pub discovery: Arc<DocumentDiscovery>,
}

impl Core {
    pub async fn init(paths: &LineoutPaths) -> Result<Self> {
        info!("Initializing Lineout core...");
        paths.ensure_dirs()?;
        let config = LineoutConfig::load(&paths.config_path)?;

        let store = MongoStore::connect(&config.mongo.uri, &config.mongo.database)
            .await
            .with_context(|| format!("Failed to connect to MongoDB at {}", config.mongo.uri))?;

        let auth = match (&config.elastic.api_key, &config.elastic.username) {
            (Some(key), _) => Some(ElasticAuth::ApiKey(key.clone())),
            (None, Some(user)) => Some(ElasticAuth::Basic {
                username: user.clone(),
                password: config.elastic.password.clone().unwrap_or_default(),
            }),
            (None, None) => None,
        };
        let index = ElasticIndex::new(&config.elastic.url, &config.elastic.index, auth)?;
        index
            .ensure_index()
            .await
            .with_context(|| format!("Failed to prepare Elasticsearch index {}", config.elastic.index))?;

        let token_store = TokenStore::load(&paths.auth_path)?;
        let oauth = OAuthConfig::google(
            &config.google.client_id,
            &config.google.client_secret,
            config.google.redirect_uri.as_deref(),
        );
        let tokens: Arc<dyn TokenSource> = Arc::new(RefreshingToken::new(token_store, oauth));
        let drive = DriveClient::new(tokens.clone())?;

        Ok(Self::from_parts(
            config,
            Arc::new(store),
            Arc::new(index),
            Arc::new(drive),
            tokens,
        ))
    }

    /// Wire the pipeline over already-built backends.
    pub fn from_parts(
        config: LineoutConfig,
        store: Arc<dyn MetadataStore>,
        index: Arc<dyn SearchIndex>,
        drive: Arc<dyn DriveApi>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        let root = config.drive.root_folder_id.clone();
        let indexing = Arc::new(IndexingService::new(
            store.clone(),
            index.clone(),
            drive.clone(),
            ContentExtractor::new(&config.extract),
            config.indexing.clone(),
        ));
        let changes = Arc::new(ChangeProcessor::new(
            drive.clone(),
            store.clone(),
            indexing.clone(),
            root.clone(),
        ));
        let discovery = Arc::new(DocumentDiscovery::new(
            drive.clone(),
            store.clone(),
            root,
            config.discovery.max_depth,
        ));
        Self {
            config,
            store,
            index,
            drive,
            tokens,
            indexing,
            changes,
            discovery,
        }
    }

    pub fn webhook_handler(&self) -> (Arc<WebhookHandler>, WebhookWorker) {
        WebhookHandler::new(
            self.drive.clone(),
            self.store.clone(),
            self.changes.clone(),
            self.config.webhook.clone(),
        )
    }

    pub fn polling_service(&self, webhook: Option<Arc<WebhookHandler>>) -> PollingService {
        PollingService::new(self.changes.clone(), webhook, self.config.polling.clone())
    }

    pub async fn discover(&self) -> Result<DiscoveryResult> {
        self.discovery.discover().await
    }

    /// Mirror the whole tree: discover, bulk index, drop what disappeared,
    /// then restart the changes feed from a token taken before discovery.
    pub async fn full_sync(&self) -> Result<SyncSummary> {
        let started = Instant::now();
        let started_at = Utc::now();
        emit_progress("sync", "running", "Starting full sync", None);

        // taken first so edits made during the walk are replayed by the next drain
        let page_token = self.drive.get_start_page_token().await?;

        emit_progress("discovery", "running", "Walking Drive folders", None);
        let discovered = match self.discovery.discover().await {
            Ok(d) => d,
            Err(e) => {
                emit_error("discovery", &format!("{:#}", e));
                return Err(e);
            }
        };
        emit_progress(
            "discovery",
            "complete",
            &format!(
                "Found {} files in {} folders",
                discovered.files.len(),
                discovered.folders.len()
            ),
            Some(discovered.files.len()),
        );

        let indexing = self.indexing.bulk_index(&discovered.files).await?;

        emit_progress("cleanup", "running", "Removing documents no longer in Drive", None);
        let present: HashSet<&str> = discovered.files.iter().map(|f| f.file.id.as_str()).collect();
        let mut removed = 0;
        for id in self.store.live_document_ids().await? {
            if present.contains(id.as_str()) {
                continue;
            }
            match self.indexing.remove(&id).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to remove {}: {:#}", id, e),
            }
        }

        let walked: HashSet<&str> = discovered
            .folders
            .iter()
            .map(|f| f.google_drive_id.as_str())
            .collect();
        let mut folders_removed = 0;
        for folder in self.store.list_folders().await? {
            if walked.contains(folder.google_drive_id.as_str()) {
                continue;
            }
            match self.store.delete_folder(&folder.google_drive_id).await {
                Ok(true) => folders_removed += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to drop folder {}: {}", folder.google_drive_id, e),
            }
        }

        self.changes
            .reset_page_token(&page_token, Some(started_at))
            .await?;

        let summary = SyncSummary {
            files_discovered: discovered.files.len(),
            folders: discovered.folders.len(),
            indexing,
            removed,
            folders_removed,
            page_token,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        let details = serde_json::to_value(&summary).unwrap_or_else(|_| json!({}));
        if let Err(e) = self
            .store
            .append_audit(&AuditLog::new(AuditAction::SyncFull, None, details))
            .await
        {
            warn!("Failed to write sync.full audit: {}", e);
        }
        emit_progress(
            "sync",
            "complete",
            &format!(
                "Full sync done: {} new, {} updated, {} removed",
                summary.indexing.inserted, summary.indexing.updated, summary.removed
            ),
            Some(summary.indexing.processed()),
        );
        info!("Full sync finished in {}ms", summary.duration_ms);
        Ok(summary)
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        self.indexing.search(request, QuerySource::Api).await
    }

    pub async fn status(&self) -> Result<CoreStatus> {
        let changes = self.store.get_sync_state(CHANGES_STATE).await?;
        let channel = self
            .store
            .get_sync_state(CHANNEL_STATE)
            .await?
            .and_then(|s| s.channel);
        Ok(CoreStatus {
            documents: self.store.document_count().await?,
            indexed: self.index.count().await?,
            folders: self.store.list_folders().await?.len(),
            page_token: changes.as_ref().and_then(|s| s.page_token.clone()),
            last_full_sync_at: changes.as_ref().and_then(|s| s.last_full_sync_at),
            last_poll_at: changes.as_ref().and_then(|s| s.last_poll_at),
            channel,
        })
    }

    /// Create a text document in Drive (or replace the body of `file_id`)
    /// and index it straight away.
    pub async fn upload_document(
        &self,
        name: &str,
        body: &str,
        folder_id: Option<&str>,
        file_id: Option<&str>,
    ) -> Result<UploadResult> {
        let file = match file_id {
            Some(id) => self.drive.update_file(id, body).await?,
            None => {
                let parent = folder_id
                    .map(str::to_string)
                    .or_else(|| self.config.drive.root_folder_id.clone())
                    .ok_or_else(|| anyhow!("no folder given and drive.root_folder_id is not set"))?;
                self.drive
                    .create_file(name, "text/plain", &[parent], body)
                    .await?
            }
        };

        let mut folder_path = None;
        for parent in &file.parents {
            if let Some(folder) = self.store.get_folder(parent).await? {
                folder_path = discovery::display_path(&folder.path);
                break;
            }
        }
        let outcome = self
            .indexing
            .index_file(&file, folder_path.as_deref())
            .await?;
        Ok(UploadResult { file, outcome })
    }
}
