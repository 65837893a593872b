use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::changes::{ChangeProcessor, DrainSummary};
use crate::config::PollingConfig;
use crate::webhook::WebhookHandler;

const MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Fallback loop that drains the Drive changes feed on a schedule.
pub struct PollingService {
    changes: Arc<ChangeProcessor>,
    webhook: Option<Arc<WebhookHandler>>,
    config: PollingConfig,
}

impl PollingService {
    pub fn new(
        changes: Arc<ChangeProcessor>,
        webhook: Option<Arc<WebhookHandler>>,
        config: PollingConfig,
    ) -> Self {
        Self {
            changes,
            webhook,
            config,
        }
    }

    pub fn effective_interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_secs).max(MIN_INTERVAL)
    }

    /// Delay after `failures` consecutive errors: interval * 2^(failures - 1),
    /// capped at `max_backoff_secs`.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let interval = self.effective_interval();
        let cap = Duration::from_secs(self.config.max_backoff_secs).max(interval);
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        interval.checked_mul(factor).unwrap_or(cap).min(cap)
    }

    /// One poll: renew the webhook channel if needed, then drain changes.
    pub async fn run_once(&self) -> Result<DrainSummary> {
        if let Some(webhook) = &self.webhook {
            if let Err(e) = webhook.renew_if_expiring(Utc::now()).await {
                warn!("Failed to renew webhook channel: {:#}", e);
            }
        }
        self.changes.drain_changes().await
    }

    /// Poll until `shutdown` flips to true. Errors back off and retry forever.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Polling Drive changes every {:?}", self.effective_interval());
        let mut failures: u32 = 0;
        loop {
            let delay = match self.run_once().await {
                Ok(summary) => {
                    failures = 0;
                    if summary.received > 0 {
                        info!("Poll applied {} changes", summary.processed);
                    }
                    self.effective_interval()
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.backoff_delay(failures);
                    error!("Poll failed ({} in a row), retrying in {:?}: {:#}", failures, delay, e);
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Polling stopped");
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
    use lineout_ingest::{MemoryStore, MetadataStore};
    use lineout_search::MemoryIndex;

    fn service(drive: Arc<FakeDrive>, store: Arc<MemoryStore>, config: PollingConfig) -> PollingService {
        let indexing = Arc::new(IndexingService::new(
            store.clone(),
            Arc::new(MemoryIndex::new()),
            drive.clone(),
            ContentExtractor::new(&ExtractConfig::default()),
            IndexingConfig::default(),
        ));
        let changes = Arc::new(ChangeProcessor::new(drive, store, indexing, None));
        PollingService::new(changes, None, config)
    }

    fn config(interval_secs: u64, max_backoff_secs: u64) -> PollingConfig {
        PollingConfig {
            enabled: true,
            interval_secs,
            max_backoff_secs,
        }
    }

    #[test]
    fn test_interval_has_a_floor() {
        let s = service(Arc::new(FakeDrive::new()), Arc::new(MemoryStore::new()), config(5, 3600));
        assert_eq!(s.effective_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let s = service(Arc::new(FakeDrive::new()), Arc::new(MemoryStore::new()), config(300, 3600));
        assert_eq!(s.backoff_delay(1), Duration::from_secs(300));
        assert_eq!(s.backoff_delay(2), Duration::from_secs(600));
        assert_eq!(s.backoff_delay(4), Duration::from_secs(2400));
        assert_eq!(s.backoff_delay(5), Duration::from_secs(3600));
        assert_eq!(s.backoff_delay(40), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_run_once_applies_changes() {
        let drive = Arc::new(FakeDrive::new());
        let store = Arc::new(MemoryStore::new());
        let f = file("doc", "Bench notes", "text/plain", "anywhere", "2024-03-01T10:00:00Z");
        drive.add_file(f.clone(), "notes");
        drive.set_changes(
            "1",
            ChangeList {
                changes: vec![Change {
                    file_id: Some("doc".into()),
                    file: Some(f),
                    ..Default::default()
                }],
                next_page_token: None,
                new_start_page_token: Some("2".into()),
            },
        );
        let s = service(drive, store.clone(), config(300, 3600));

        let summary = s.run_once().await.unwrap();
        assert_eq!(summary.processed, 1);
        assert!(store.get_document("doc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let s = service(Arc::new(FakeDrive::new()), Arc::new(MemoryStore::new()), config(300, 3600));
        let (tx, rx) = watch::channel(false);
        let handle = async {
            tx.send(true).unwrap();
        };
        let ((), ()) = tokio::join!(s.run(rx), handle);
    }
}
