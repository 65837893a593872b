use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use lineout_ingest::{
    AuditAction, AuditLog, DocumentFilter, DocumentRecord, MetadataStore, QuerySource,
    SearchQueryLog, VersionEntry,
};
use lineout_search::{IndexedDocument, SearchIndex, SearchRequest, SearchResponse};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::IndexingConfig;
use crate::discovery::DiscoveredFile;
use crate::drive::{DriveApi, DriveFile};
use crate::extract::{ContentExtractor, ExportPlan};
use crate::progress::emit_progress;

const MAX_VERSION_HISTORY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexOutcome {
    Inserted,
    Updated,
    /// Same content, new name or folder.
    Moved,
    Unchanged,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkSummary {
    pub inserted: usize,
    pub updated: usize,
    pub moved: usize,
    pub unchanged: usize,
    pub skipped: usize,
    /// Files whose export or store write failed.
    pub failed: usize,
    /// Documents the search index rejected.
    pub index_failures: usize,
}

impl BulkSummary {
    fn record(&mut self, outcome: IndexOutcome) {
        match outcome {
            IndexOutcome::Inserted => self.inserted += 1,
            IndexOutcome::Updated => self.updated += 1,
            IndexOutcome::Moved => self.moved += 1,
            IndexOutcome::Unchanged => self.unchanged += 1,
            IndexOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn processed(&self) -> usize {
        self.inserted + self.updated + self.moved + self.unchanged + self.skipped + self.failed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReindexSummary {
    pub indexed: usize,
    pub failed: usize,
}

enum Prepared {
    Ready(Box<DocumentRecord>, IndexOutcome),
    Unchanged,
    Skipped,
}

/// Search-index view of a stored document.
pub fn to_indexed(record: &DocumentRecord) -> IndexedDocument {
    IndexedDocument {
        id: record.google_drive_id.clone(),
        title: record.title.clone(),
        content: record.content.clone(),
        tags: record.metadata.tags.clone(),
        players: record.metadata.players.clone(),
        dates: record.metadata.dates.clone(),
        mime_type: record.mime_type.clone(),
        folder_id: record.folder_id.clone(),
        folder_path: record.folder_path.clone(),
        access_level: record.access_level.as_str().to_string(),
        access_rank: record.access_level.rank(),
        web_view_link: record.web_view_link.clone(),
        drive_modified_time: record.drive_modified_time,
        version: record.version,
    }
}

/// Keeps the metadata store and the search index in step for each Drive file.
pub struct IndexingService {
    store: Arc<dyn MetadataStore>,
    index: Arc<dyn SearchIndex>,
    drive: Arc<dyn DriveApi>,
    extractor: ContentExtractor,
    config: IndexingConfig,
}

impl IndexingService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        index: Arc<dyn SearchIndex>,
        drive: Arc<dyn DriveApi>,
        extractor: ContentExtractor,
        config: IndexingConfig,
    ) -> Self {
        Self {
            store,
            index,
            drive,
            extractor,
            config,
        }
    }

    async fn prepare(&self, file: &DriveFile, folder_path: Option<&str>) -> Result<Prepared> {
        let existing = self.store.get_document(&file.id).await?;
        if let Some(doc) = &existing {
            if !doc.is_deleted
                && matches!(
                    (doc.drive_modified_time, file.modified_time),
                    (Some(stored), Some(seen)) if seen < stored
                )
            {
                debug!("{} snapshot is older than the indexed version", file.id);
                return Ok(Prepared::Unchanged);
            }
            if !doc.is_deleted
                && doc.drive_modified_time.is_some()
                && doc.drive_modified_time == file.modified_time
            {
                // Drive keeps modifiedTime across renames and moves
                let folder_path = folder_path.map(str::to_string);
                if doc.title == file.name && doc.parents == file.parents && doc.folder_path == folder_path {
                    return Ok(Prepared::Unchanged);
                }
                let mut doc = doc.clone();
                doc.title = file.name.clone();
                doc.folder_id = file.parents.first().cloned();
                doc.folder_path = folder_path;
                doc.parents = file.parents.clone();
                doc.web_view_link = file.web_view_link.clone();
                doc.last_indexed_at = Some(Utc::now());
                doc.updated_at = Utc::now();
                return Ok(Prepared::Ready(Box::new(doc), IndexOutcome::Moved));
            }
        }

        let plan = ContentExtractor::export_format(&file.mime_type);
        let (body, format) = match plan {
            ExportPlan::Export(mime, format) => (self.drive.export(&file.id, mime).await?, format),
            ExportPlan::Download(format) => (self.drive.download(&file.id).await?, format),
            ExportPlan::Unsupported => return Ok(Prepared::Skipped),
        };
        let extracted = self.extractor.extract(format, &body);

        let now = Utc::now();
        let mut entry = VersionEntry {
            version: 1,
            modified_time: file.modified_time,
            modified_by: file.last_modifying_user.as_ref().and_then(|u| u.label()),
            size: file.size_bytes().or(Some(body.len() as u64)),
            recorded_at: now,
        };
        let folder_id = file.parents.first().cloned();
        let folder_path = folder_path.map(str::to_string);
        let owners = file.owners.iter().filter_map(|o| o.label()).collect();

        let prepared = match existing {
            Some(mut doc) => {
                doc.version += 1;
                entry.version = doc.version;
                doc.version_history.push(entry);
                if doc.version_history.len() > MAX_VERSION_HISTORY {
                    let excess = doc.version_history.len() - MAX_VERSION_HISTORY;
                    doc.version_history.drain(..excess);
                }
                doc.title = file.name.clone();
                doc.mime_type = file.mime_type.clone();
                doc.folder_id = folder_id;
                doc.folder_path = folder_path;
                doc.parents = file.parents.clone();
                doc.web_view_link = file.web_view_link.clone();
                doc.owners = owners;
                doc.content = extracted.text;
                doc.metadata = extracted.metadata;
                doc.drive_modified_time = file.modified_time;
                doc.last_indexed_at = Some(now);
                doc.is_deleted = false;
                doc.updated_at = now;
                Prepared::Ready(Box::new(doc), IndexOutcome::Updated)
            }
            None => {
                let access_level = self.config.access_for(folder_path.as_deref());
                let record = DocumentRecord {
                    id: None,
                    google_drive_id: file.id.clone(),
                    title: file.name.clone(),
                    mime_type: file.mime_type.clone(),
                    folder_id,
                    folder_path,
                    parents: file.parents.clone(),
                    web_view_link: file.web_view_link.clone(),
                    owners,
                    content: extracted.text,
                    metadata: extracted.metadata,
                    access_level,
                    version: 1,
                    version_history: vec![entry],
                    drive_modified_time: file.modified_time,
                    last_indexed_at: Some(now),
                    is_deleted: false,
                    created_at: now,
                    updated_at: now,
                };
                Prepared::Ready(Box::new(record), IndexOutcome::Inserted)
            }
        };
        Ok(prepared)
    }

    async fn audit(&self, action: AuditAction, resource_id: Option<&str>, details: serde_json::Value) {
        if let Err(e) = self
            .store
            .append_audit(&AuditLog::new(action, resource_id, details))
            .await
        {
            warn!("Failed to write audit entry {:?}: {}", action, e);
        }
    }

    async fn audit_outcome(&self, record: &DocumentRecord, outcome: IndexOutcome) {
        let action = match outcome {
            IndexOutcome::Inserted => AuditAction::DocumentIndexed,
            IndexOutcome::Updated | IndexOutcome::Moved => AuditAction::DocumentUpdated,
            _ => return,
        };
        self.audit(
            action,
            Some(&record.google_drive_id),
            json!({
                "title": record.title,
                "version": record.version,
                "folder_path": record.folder_path,
            }),
        )
        .await;
    }

    async fn audit_skipped(&self, file: &DriveFile) {
        debug!("Skipping {} ({}): unsupported type", file.name, file.mime_type);
        self.audit(
            AuditAction::DocumentSkipped,
            Some(&file.id),
            json!({ "title": file.name, "mime_type": file.mime_type }),
        )
        .await;
    }

    /// Export, extract and write one file to both indexes.
    pub async fn index_file(&self, file: &DriveFile, folder_path: Option<&str>) -> Result<IndexOutcome> {
        match self.prepare(file, folder_path).await? {
            Prepared::Unchanged => {
                debug!("{} unchanged since last index", file.id);
                Ok(IndexOutcome::Unchanged)
            }
            Prepared::Skipped => {
                self.audit_skipped(file).await;
                Ok(IndexOutcome::Skipped)
            }
            Prepared::Ready(record, outcome) => {
                // search index first: a failed store write is retried as a fresh change next time
                self.index.index(&to_indexed(&record)).await?;
                self.store.upsert_document(&record).await?;
                self.audit_outcome(&record, outcome).await;
                info!("{:?} {} (v{})", outcome, record.title, record.version);
                Ok(outcome)
            }
        }
    }

    /// Index many files with one bulk search-index request per batch.
    pub async fn bulk_index(&self, files: &[DiscoveredFile]) -> Result<BulkSummary> {
        let mut summary = BulkSummary::default();
        let batch_size = self.config.bulk_size.max(1);

        for batch in files.chunks(batch_size) {
            let mut ready: Vec<(DocumentRecord, IndexOutcome)> = Vec::new();
            for found in batch {
                match self.prepare(&found.file, found.folder_path.as_deref()).await {
                    Ok(Prepared::Ready(record, outcome)) => ready.push((*record, outcome)),
                    Ok(Prepared::Unchanged) => summary.record(IndexOutcome::Unchanged),
                    Ok(Prepared::Skipped) => {
                        self.audit_skipped(&found.file).await;
                        summary.record(IndexOutcome::Skipped);
                    }
                    Err(e) => {
                        warn!("Failed to prepare {} ({}): {:#}", found.file.name, found.file.id, e);
                        summary.failed += 1;
                    }
                }
            }

            let docs: Vec<IndexedDocument> = ready.iter().map(|(r, _)| to_indexed(r)).collect();
            let report = self.index.bulk_index(&docs).await?;
            summary.index_failures += report.failed.len();
            for (id, reason) in &report.failed {
                warn!("Search index rejected {}: {}", id, reason);
            }

            for (record, outcome) in ready {
                if report.failed.iter().any(|(id, _)| id == &record.google_drive_id) {
                    continue;
                }
                match self.store.upsert_document(&record).await {
                    Ok(()) => {
                        self.audit_outcome(&record, outcome).await;
                        summary.record(outcome);
                    }
                    Err(e) => {
                        warn!("Failed to store {}: {}", record.google_drive_id, e);
                        summary.failed += 1;
                    }
                }
            }

            emit_progress(
                "indexing",
                "running",
                &format!("Indexed {} of {} files", summary.processed(), files.len()),
                Some(summary.processed()),
            );
        }

        info!(
            "Bulk index: {} inserted, {} updated, {} unchanged, {} skipped, {} failed",
            summary.inserted, summary.updated, summary.unchanged, summary.skipped, summary.failed
        );
        Ok(summary)
    }

    /// Point a stored document at the new path of its renamed or moved folder.
    pub async fn relocate(&self, mut doc: DocumentRecord, folder_path: Option<String>) -> Result<bool> {
        if doc.folder_path == folder_path {
            return Ok(false);
        }
        doc.folder_path = folder_path;
        doc.updated_at = Utc::now();
        self.index.index(&to_indexed(&doc)).await?;
        self.store.upsert_document(&doc).await?;
        Ok(true)
    }

    /// Soft-delete from the store and drop from the search index.
    pub async fn remove(&self, file_id: &str) -> Result<bool> {
        let removed = self.store.mark_deleted(file_id, Utc::now()).await?;
        let unindexed = self.index.delete(file_id).await?;
        if removed || unindexed {
            self.audit(AuditAction::DocumentRemoved, Some(file_id), json!({})).await;
            info!("Removed {}", file_id);
        }
        Ok(removed)
    }

    /// Run a search and record it in the query log.
    pub async fn search(&self, request: &SearchRequest, source: QuerySource) -> Result<SearchResponse> {
        let started = Instant::now();
        let response = self.index.search(request).await?;
        let entry = SearchQueryLog {
            id: None,
            query: request.query.clone(),
            filters: serde_json::to_value(&request.filters)?,
            result_count: response.total,
            took_ms: started.elapsed().as_millis() as u64,
            source,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.log_search(&entry).await {
            warn!("Failed to log search: {}", e);
        }
        Ok(response)
    }

    /// Rebuild the search index from the metadata store.
    pub async fn reindex_all(&self) -> Result<ReindexSummary> {
        self.index.ensure_index().await?;
        self.index.clear().await?;
        let docs = self.store.list_documents(&DocumentFilter::default()).await?;

        let mut summary = ReindexSummary::default();
        for batch in docs.chunks(self.config.bulk_size.max(1)) {
            let indexed: Vec<IndexedDocument> = batch.iter().map(to_indexed).collect();
            let report = self.index.bulk_index(&indexed).await?;
            summary.indexed += report.indexed;
            summary.failed += report.failed.len();
        }
        info!("Reindexed {} documents ({} failed)", summary.indexed, summary.failed);
        Ok(summary)
    }
}
