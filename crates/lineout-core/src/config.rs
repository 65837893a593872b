//! Daemon configuration.
//!
//! Read from `<data_dir>/lineout.toml`. Every section is optional and falls
//! back to its defaults, then `LINEOUT_*` environment variables override the
//! handful of values operators usually change per deployment.

use std::path::Path;

use anyhow::{Context, Result};
use lineout_ingest::AccessLevel;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LineoutConfig {
    pub google: GoogleConfig,
    pub mongo: MongoConfig,
    pub elastic: ElasticConfig,
    pub drive: DriveConfig,
    pub discovery: DiscoveryConfig,
    pub extract: ExtractConfig,
    pub indexing: IndexingConfig,
    pub webhook: WebhookConfig,
    pub polling: PollingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: Option<String>,
    pub calendar_id: String,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: None,
            calendar_id: "primary".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            database: "lineout".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticConfig {
    pub url: String,
    pub index: String,
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            index: "lineout-documents".to_string(),
            api_key: None,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Folder whose subtree is mirrored. `None` watches the whole Drive.
    pub root_folder_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub max_depth: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { max_depth: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub max_bytes: usize,
    /// Squad names looked up in document text.
    pub roster: Vec<String>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            max_bytes: 200_000,
            roster: Vec::new(),
        }
    }
}

/// Folder-path prefix that sets the access level of new documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRule {
    pub path_prefix: String,
    pub level: AccessLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub bulk_size: usize,
    pub default_access_level: AccessLevel,
    pub access_rules: Vec<AccessRule>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            bulk_size: 100,
            default_access_level: AccessLevel::Team,
            access_rules: Vec::new(),
        }
    }
}

impl IndexingConfig {
    /// Longest matching rule wins.
    pub fn access_for(&self, folder_path: Option<&str>) -> AccessLevel {
        let Some(path) = folder_path else {
            return self.default_access_level;
        };
        self.access_rules
            .iter()
            .filter(|rule| path_has_prefix(path, &rule.path_prefix))
            .max_by_key(|rule| rule.path_prefix.len())
            .map(|rule| rule.level)
            .unwrap_or(self.default_access_level)
    }
}

fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix || path.starts_with(&format!("{}/", prefix))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub path: String,
    /// Externally reachable base URL Drive posts notifications to.
    pub public_url: Option<String>,
    pub channel_ttl_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: "127.0.0.1:8787".to_string(),
            path: "/webhooks/drive".to_string(),
            public_url: None,
            channel_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl WebhookConfig {
    pub fn callback_address(&self) -> Option<String> {
        self.public_url
            .as_ref()
            .map(|base| format!("{}{}", base.trim_end_matches('/'), self.path))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            max_backoff_secs: 3600,
        }
    }
}

impl LineoutConfig {
    /// Load from `path` (missing file means defaults) and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(uri) = lookup("LINEOUT_MONGO_URI") {
            self.mongo.uri = uri;
        }
        if let Some(url) = lookup("LINEOUT_ELASTIC_URL") {
            self.elastic.url = url;
        }
        if let Some(root) = lookup("LINEOUT_ROOT_FOLDER_ID") {
            self.drive.root_folder_id = Some(root).filter(|r| !r.is_empty());
        }
        if let Some(secs) = lookup("LINEOUT_POLL_INTERVAL_SECS") {
            self.polling.interval_secs = secs
                .parse()
                .with_context(|| format!("LINEOUT_POLL_INTERVAL_SECS is not a number: {}", secs))?;
        }
        if let Some(bytes) = lookup("LINEOUT_DOC_MAX_BYTES") {
            self.extract.max_bytes = bytes
                .parse()
                .with_context(|| format!("LINEOUT_DOC_MAX_BYTES is not a number: {}", bytes))?;
        }
        if let Some(id) = lookup("LINEOUT_GOOGLE_CLIENT_ID") {
            self.google.client_id = id;
        }
        if let Some(secret) = lookup("LINEOUT_GOOGLE_CLIENT_SECRET") {
            self.google.client_secret = secret;
        }
        if let Some(url) = lookup("LINEOUT_WEBHOOK_URL") {
            self.webhook.public_url = Some(url);
            self.webhook.enabled = true;
        }
        Ok(())
    }
}
