//! Applies Drive change notifications to the dual index.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use lineout_ingest::{
    AuditAction, AuditLog, DocumentFilter, DocumentRecord, FolderRecord, MetadataStore, SyncState,
    CHANGES_STATE,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::discovery::{display_path, join_path};
use crate::drive::{Change, DriveApi, DriveFile};
use crate::indexing::{IndexOutcome, IndexingService};

/// `X-Goog-Resource-State` values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Sync,
    Add,
    Update,
    Change,
    Remove,
    Trash,
    Untrash,
    Exists,
    NotExists,
    Other(String),
}

impl ResourceState {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "sync" => ResourceState::Sync,
            "add" => ResourceState::Add,
            "update" => ResourceState::Update,
            "change" => ResourceState::Change,
            "remove" => ResourceState::Remove,
            "trash" => ResourceState::Trash,
            "untrash" => ResourceState::Untrash,
            "exists" => ResourceState::Exists,
            "not_exists" => ResourceState::NotExists,
            other => ResourceState::Other(other.to_string()),
        }
    }

    fn is_removal(&self) -> bool {
        matches!(
            self,
            ResourceState::Remove | ResourceState::Trash | ResourceState::NotExists
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result", content = "outcome")]
pub enum ProcessOutcome {
    Ignored,
    Indexed(IndexOutcome),
    Removed,
    /// The file now lives outside the watched tree and was dropped.
    MovedOut,
    FolderUpdated,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainSummary {
    pub pages: usize,
    pub received: usize,
    /// Distinct files after keeping the last change per file.
    pub collapsed: usize,
    pub processed: usize,
    /// Not newer than the last change already applied for that file.
    pub stale: usize,
    pub failed: usize,
    pub page_token: Option<String>,
}

/// Keep only the last change for each file, in order of those last changes.
pub fn collapse_changes(changes: Vec<Change>) -> Vec<Change> {
    let mut last: HashMap<String, usize> = HashMap::new();
    for (i, change) in changes.iter().enumerate() {
        if let Some(id) = &change.file_id {
            last.insert(id.clone(), i);
        }
    }
    changes
        .into_iter()
        .enumerate()
        .filter(|(i, c)| {
            c.file_id
                .as_ref()
                .map(|id| last.get(id) == Some(i))
                .unwrap_or(false)
        })
        .map(|(_, c)| c)
        .collect()
}

/// How far behind the newest applied change a per-file time is kept.
const APPLIED_WINDOW_HOURS: i64 = 24;
const MAX_TRACKED_FILES: usize = 10_000;

/// Drop applied-change times that can no longer shadow a redelivery.
fn prune_applied(applied: &mut HashMap<String, DateTime<Utc>>) {
    let Some(newest) = applied.values().max().copied() else {
        return;
    };
    let cutoff = newest - Duration::hours(APPLIED_WINDOW_HOURS);
    applied.retain(|_, at| *at >= cutoff);
    if applied.len() > MAX_TRACKED_FILES {
        let mut times: Vec<DateTime<Utc>> = applied.values().copied().collect();
        times.sort_unstable();
        let cutoff = times[times.len() - MAX_TRACKED_FILES];
        applied.retain(|_, at| *at >= cutoff);
    }
}

/// Folders below `root_id`, parents before children.
fn descendants<'a>(folders: &'a [FolderRecord], root_id: &str) -> Vec<&'a FolderRecord> {
    let mut seen: HashSet<&str> = HashSet::from([root_id]);
    let mut queue: VecDeque<&str> = VecDeque::from([root_id]);
    let mut found = Vec::new();
    while let Some(parent) = queue.pop_front() {
        for folder in folders
            .iter()
            .filter(|f| f.parent_id.as_deref() == Some(parent))
        {
            if seen.insert(folder.google_drive_id.as_str()) {
                queue.push_back(folder.google_drive_id.as_str());
                found.push(folder);
            }
        }
    }
    found
}

struct Location {
    folder_path: Option<String>,
    parent: Option<FolderRecord>,
}

pub struct ChangeProcessor {
    drive: Arc<dyn DriveApi>,
    store: Arc<dyn MetadataStore>,
    indexing: Arc<IndexingService>,
    root_folder_id: Option<String>,
    /// Serializes page-token consumption between the webhook worker and the poller.
    drain_lock: Mutex<()>,
    last_applied: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl ChangeProcessor {
    pub fn new(
        drive: Arc<dyn DriveApi>,
        store: Arc<dyn MetadataStore>,
        indexing: Arc<IndexingService>,
        root_folder_id: Option<String>,
    ) -> Self {
        Self {
            drive,
            store,
            indexing,
            root_folder_id,
            drain_lock: Mutex::new(()),
            last_applied: Mutex::new(HashMap::new()),
        }
    }

    /// Where `file` sits in the watched tree, `None` when it is outside it.
    async fn locate(&self, file: &DriveFile) -> Result<Option<Location>> {
        for parent in &file.parents {
            if let Some(folder) = self.store.get_folder(parent).await? {
                return Ok(Some(Location {
                    folder_path: display_path(&folder.path),
                    parent: Some(folder),
                }));
            }
        }
        if self.root_folder_id.is_none() {
            // whole-Drive mode: everything is watched even before discovery knows the folder
            return Ok(Some(Location {
                folder_path: None,
                parent: None,
            }));
        }
        Ok(None)
    }

    async fn live_documents_in(&self, folder_id: &str) -> Result<Vec<DocumentRecord>> {
        let filter = DocumentFilter {
            folder_id: Some(folder_id.to_string()),
            ..Default::default()
        };
        Ok(self.store.list_documents(&filter).await?)
    }

    /// Forget a folder and its recorded subfolders, removing the documents filed in them.
    async fn drop_folder(&self, folder_id: &str) -> Result<usize> {
        let folders = self.store.list_folders().await?;
        let mut ids = vec![folder_id.to_string()];
        ids.extend(
            descendants(&folders, folder_id)
                .into_iter()
                .map(|f| f.google_drive_id.clone()),
        );

        let mut removed = 0;
        for id in &ids {
            for doc in self.live_documents_in(id).await? {
                if self.indexing.remove(&doc.google_drive_id).await? {
                    removed += 1;
                }
            }
            self.store.delete_folder(id).await?;
        }
        info!(
            "Dropped folder {} with {} subfolders and {} documents",
            folder_id,
            ids.len() - 1,
            removed
        );
        Ok(removed)
    }

    /// Rewrite paths below a folder whose path changed, and the documents filed there.
    async fn relocate_subtree(&self, folder: &FolderRecord) -> Result<usize> {
        let folders = self.store.list_folders().await?;
        let mut paths: HashMap<String, (String, u32)> = HashMap::from([(
            folder.google_drive_id.clone(),
            (folder.path.clone(), folder.depth),
        )]);
        for child in descendants(&folders, &folder.google_drive_id) {
            let Some((parent_path, parent_depth)) = child
                .parent_id
                .as_ref()
                .and_then(|p| paths.get(p))
                .cloned()
            else {
                continue;
            };
            let mut record = child.clone();
            record.path = join_path(&parent_path, &child.name);
            record.depth = parent_depth + 1;
            record.updated_at = Utc::now();
            self.store.upsert_folder(&record).await?;
            paths.insert(record.google_drive_id, (record.path, record.depth));
        }

        let mut moved = 0;
        for (folder_id, (path, _)) in &paths {
            for doc in self.live_documents_in(folder_id).await? {
                if self.indexing.relocate(doc, display_path(path)).await? {
                    moved += 1;
                }
            }
        }
        debug!("Relocated {} documents under {}", moved, folder.google_drive_id);
        Ok(moved)
    }

    async fn remove_file_or_folder(&self, file_id: &str) -> Result<ProcessOutcome> {
        if self.store.get_folder(file_id).await?.is_some() {
            self.drop_folder(file_id).await?;
        } else {
            self.indexing.remove(file_id).await?;
        }
        Ok(ProcessOutcome::Removed)
    }

    async fn apply_folder(&self, file: &DriveFile, location: Option<Location>) -> Result<ProcessOutcome> {
        let previous = self.store.get_folder(&file.id).await?;
        if previous.as_ref().is_some_and(|f| f.parent_id.is_none()) {
            // the watched root, its own parents are outside the tree
            return Ok(ProcessOutcome::Ignored);
        }
        let Some(location) = location else {
            return if previous.is_some() {
                self.drop_folder(&file.id).await?;
                Ok(ProcessOutcome::MovedOut)
            } else {
                Ok(ProcessOutcome::Ignored)
            };
        };

        let (path, depth, parent_id) = match &location.parent {
            Some(parent) => (
                join_path(&parent.path, &file.name),
                parent.depth + 1,
                Some(parent.google_drive_id.clone()),
            ),
            None => (file.name.clone(), 1, file.parents.first().cloned()),
        };
        let record = FolderRecord {
            id: previous.as_ref().and_then(|f| f.id),
            google_drive_id: file.id.clone(),
            name: file.name.clone(),
            parent_id,
            path,
            depth,
            updated_at: Utc::now(),
        };
        self.store.upsert_folder(&record).await?;
        if previous.is_some_and(|f| f.path != record.path) {
            self.relocate_subtree(&record).await?;
        }
        Ok(ProcessOutcome::FolderUpdated)
    }

    async fn apply_file(&self, file: &DriveFile) -> Result<ProcessOutcome> {
        if file.trashed {
            return self.remove_file_or_folder(&file.id).await;
        }
        let location = self.locate(file).await?;
        if file.is_folder() {
            return self.apply_folder(file, location).await;
        }
        let Some(location) = location else {
            debug!("{} is outside the watched tree", file.id);
            return if self.store.get_document(&file.id).await?.is_some_and(|d| !d.is_deleted) {
                self.indexing.remove(&file.id).await?;
                Ok(ProcessOutcome::MovedOut)
            } else {
                Ok(ProcessOutcome::Ignored)
            };
        };

        let outcome = self
            .indexing
            .index_file(file, location.folder_path.as_deref())
            .await?;
        Ok(ProcessOutcome::Indexed(outcome))
    }

    /// Handle a push notification for a single watched file.
    pub async fn process(&self, file_id: &str, state: &ResourceState) -> Result<ProcessOutcome> {
        if *state == ResourceState::Sync {
            return Ok(ProcessOutcome::Ignored);
        }
        if state.is_removal() {
            return self.remove_file_or_folder(file_id).await;
        }
        match self.drive.get_file(file_id).await? {
            Some(file) => self.apply_file(&file).await,
            None => self.remove_file_or_folder(file_id).await,
        }
    }

    /// Apply one entry from `changes.list`.
    pub async fn process_change(&self, change: &Change) -> Result<ProcessOutcome> {
        let Some(file_id) = change.file_id.as_deref() else {
            return Ok(ProcessOutcome::Ignored);
        };
        if change.removed {
            return self.remove_file_or_folder(file_id).await;
        }
        match &change.file {
            Some(file) => self.apply_file(file).await,
            None => self.process(file_id, &ResourceState::Change).await,
        }
    }

    async fn is_stale(&self, change: &Change) -> bool {
        let (Some(id), Some(time)) = (&change.file_id, change.time) else {
            return false;
        };
        self.last_applied
            .lock()
            .await
            .get(id)
            .is_some_and(|seen| time <= *seen)
    }

    async fn mark_applied(&self, change: &Change) {
        if let (Some(id), Some(time)) = (&change.file_id, change.time) {
            self.last_applied.lock().await.insert(id.clone(), time);
        }
    }

    /// Current page token, fetching a start token on first use.
    pub async fn ensure_page_token(&self) -> Result<String> {
        let _guard = self.drain_lock.lock().await;
        self.load_or_init_token().await.map(|(_, token)| token)
    }

    async fn load_or_init_token(&self) -> Result<(SyncState, String)> {
        let mut state = self
            .store
            .get_sync_state(CHANGES_STATE)
            .await?
            .unwrap_or_else(|| SyncState::named(CHANGES_STATE));
        if let Some(token) = state.page_token.clone() {
            return Ok((state, token));
        }
        let token = self.drive.get_start_page_token().await?;
        info!("Initialised Drive changes page token");
        state.page_token = Some(token.clone());
        state.updated_at = Utc::now();
        self.store.put_sync_state(&state).await?;
        Ok((state, token))
    }

    /// Replace the stored page token, e.g. after a full sync captured a fresh one.
    pub async fn reset_page_token(&self, token: &str, full_sync_at: Option<DateTime<Utc>>) -> Result<()> {
        let _guard = self.drain_lock.lock().await;
        let mut state = self
            .store
            .get_sync_state(CHANGES_STATE)
            .await?
            .unwrap_or_else(|| SyncState::named(CHANGES_STATE));
        state.page_token = Some(token.to_string());
        if full_sync_at.is_some() {
            state.last_full_sync_at = full_sync_at;
        }
        state.updated_at = Utc::now();
        self.store.put_sync_state(&state).await?;
        Ok(())
    }

    /// Read every pending change since the stored page token and apply it.
    ///
    /// A failing file is logged and counted; the token still advances so one
    /// bad file cannot wedge the feed.
    pub async fn drain_changes(&self) -> Result<DrainSummary> {
        let _guard = self.drain_lock.lock().await;
        let (mut state, start_token) = self.load_or_init_token().await?;

        let mut summary = DrainSummary::default();
        let mut changes = Vec::new();
        let mut token = start_token;
        let new_start = loop {
            let page = self.drive.list_changes(&token).await?;
            summary.pages += 1;
            changes.extend(page.changes);
            match (page.next_page_token, page.new_start_page_token) {
                (Some(next), _) => token = next,
                (None, Some(new_start)) => break new_start,
                (None, None) => break token,
            }
        };

        summary.received = changes.len();
        let changes = collapse_changes(changes);
        summary.collapsed = changes.len();

        let mut failed_ids = Vec::new();
        for change in &changes {
            if self.is_stale(change).await {
                summary.stale += 1;
                continue;
            }
            match self.process_change(change).await {
                Ok(outcome) => {
                    debug!("change {:?}: {:?}", change.file_id, outcome);
                    self.mark_applied(change).await;
                    summary.processed += 1;
                }
                Err(e) => {
                    error!("Failed to apply change for {:?}: {:#}", change.file_id, e);
                    summary.failed += 1;
                    failed_ids.extend(change.file_id.clone());
                }
            }
        }

        prune_applied(&mut *self.last_applied.lock().await);

        state.page_token = Some(new_start.clone());
        state.last_poll_at = Some(Utc::now());
        state.updated_at = Utc::now();
        self.store.put_sync_state(&state).await?;
        summary.page_token = Some(new_start);

        if summary.received > 0 {
            info!(
                "Applied {} of {} Drive changes ({} stale, {} failed)",
                summary.processed, summary.received, summary.stale, summary.failed
            );
            let details = json!({
                "received": summary.received,
                "processed": summary.processed,
                "stale": summary.stale,
                "failed": summary.failed,
                "failed_ids": failed_ids,
            });
            if let Err(e) = self
                .store
                .append_audit(&AuditLog::new(AuditAction::SyncChanges, None, details))
                .await
            {
                warn!("Failed to write sync.changes audit: {}", e);
            }
        }
        Ok(summary)
    }
}
