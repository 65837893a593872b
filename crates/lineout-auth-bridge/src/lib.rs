use std::borrow::Cow;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use oauth2::{
    basic::{BasicClient, BasicTokenResponse}, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken,
    EndpointNotSet, EndpointSet, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use reqwest::redirect::Policy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Scopes needed to mirror, edit and watch the team Drive plus read the fixtures calendar.
pub const GOOGLE_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/drive",
    "https://www.googleapis.com/auth/calendar.readonly",
];

/// Tokens are refreshed this long before Google says they expire.
const EXPIRY_SLACK_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
}

impl AuthToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map(|exp| exp - Duration::seconds(EXPIRY_SLACK_SECS) <= now)
            .unwrap_or(false)
    }
}

/// JSON file holding the Google token for the daemon.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
    token: Option<AuthToken>,
}

impl TokenStore {
    pub fn load(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let token = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read token file: {}", path.display()))?;
            if raw.trim().is_empty() {
                None
            } else {
                Some(
                    serde_json::from_str(&raw)
                        .with_context(|| format!("Failed to parse token file: {}", path.display()))?,
                )
            }
        } else {
            None
        };
        Ok(Self {
            path: path.to_path_buf(),
            token,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Option<&AuthToken> {
        self.token.as_ref()
    }

    /// Replace the stored token. A refresh response without a refresh token keeps the old one.
    pub fn set(&mut self, mut token: AuthToken) {
        if token.refresh_token.is_none() {
            token.refresh_token = self.token.as_ref().and_then(|t| t.refresh_token.clone());
        }
        self.token = Some(token);
    }

    pub fn save(&self) -> Result<()> {
        let payload = serde_json::to_string_pretty(&self.token)?;
        std::fs::write(&self.path, payload)
            .with_context(|| format!("Failed to write token file: {}", self.path.display()))?;
        Ok(())
    }

    pub fn reload(&mut self) -> Result<()> {
        let fresh = Self::load(&self.path)?;
        self.token = fresh.token;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: Option<String>,
}

impl OAuthConfig {
    pub fn google(client_id: &str, client_secret: &str, redirect_uri: Option<&str>) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            redirect_uri: redirect_uri.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthBridge {
    http_client: Client,
}

impl Default for AuthBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthBridge {
    pub fn new() -> Self {
        let http_client = Client::builder()
            .redirect(Policy::none())
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { http_client }
    }

    pub fn authorize_url(
        &self,
        config: &OAuthConfig,
        scopes: &[&str],
    ) -> Result<(String, CsrfToken)> {
        let client = build_client(config)?;
        let mut req = client.authorize_url(CsrfToken::new_random);
        for scope in scopes {
            req = req.add_scope(Scope::new(scope.to_string()));
        }
        // offline access is what gets us a refresh token from Google
        let (url, csrf) = req
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .url();
        Ok((url.to_string(), csrf))
    }

    pub async fn exchange_code(&self, code: &str, config: &OAuthConfig) -> Result<AuthToken> {
        let client = build_client(config)?;
        let mut req = client.exchange_code(AuthorizationCode::new(code.to_string()));
        if let Some(redirect_uri) = &config.redirect_uri {
            req = req.set_redirect_uri(Cow::Owned(RedirectUrl::new(redirect_uri.to_string())?));
        }
        let token = req.request_async(&self.http_client).await?;

        info!("exchanged OAuth code for google token");
        Ok(to_auth_token(&token))
    }

    pub async fn refresh_token(&self, refresh_token: &str, config: &OAuthConfig) -> Result<AuthToken> {
        let client = build_client(config)?;
        let token = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http_client)
            .await?;
        Ok(to_auth_token(&token))
    }
}

fn to_auth_token(token: &BasicTokenResponse) -> AuthToken {
    let expires_at = token
        .expires_in()
        .and_then(|d| Duration::from_std(d).ok())
        .map(|d| Utc::now() + d);
    let scope = token.scopes().map(|scopes| {
        scopes
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    });
    AuthToken {
        access_token: token.access_token().secret().to_string(),
        refresh_token: token.refresh_token().map(|t| t.secret().to_string()),
        expires_at,
        scope,
        token_type: Some(token.token_type().as_ref().to_string()),
    }
}

type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

fn build_client(config: &OAuthConfig) -> Result<ConfiguredClient> {
    let auth_url =
        AuthUrl::new(config.auth_url.clone()).map_err(|_| anyhow!("invalid auth_url"))?;
    let token_url =
        TokenUrl::new(config.token_url.clone()).map_err(|_| anyhow!("invalid token_url"))?;
    let mut client = BasicClient::new(ClientId::new(config.client_id.clone()))
        .set_client_secret(ClientSecret::new(config.client_secret.clone()))
        .set_auth_uri(auth_url)
        .set_token_uri(token_url);
    if let Some(redirect_uri) = &config.redirect_uri {
        client = client.set_redirect_uri(RedirectUrl::new(redirect_uri.clone())?);
    }
    Ok(client)
}

/// Token store plus the OAuth client needed to keep its access token fresh.
///
/// Shared by the Drive and Calendar clients; refreshed tokens are written back to disk.
pub struct RefreshingToken {
    store: RwLock<TokenStore>,
    config: OAuthConfig,
    bridge: AuthBridge,
}

impl RefreshingToken {
    pub fn new(store: TokenStore, config: OAuthConfig) -> Self {
        Self {
            store: RwLock::new(store),
            config,
            bridge: AuthBridge::new(),
        }
    }

    /// Current access token, refreshed first when it is about to expire.
    pub async fn access_token(&self) -> Result<String> {
        {
            let store = self.store.read().await;
            if let Some(token) = store.get() {
                if !token.is_expired(Utc::now()) {
                    return Ok(token.access_token.clone());
                }
            }
        }
        self.refresh().await
    }

    pub async fn refresh(&self) -> Result<String> {
        let mut store = self.store.write().await;
        if let Err(err) = store.reload() {
            warn!("Could not reload token file before refresh: {}", err);
        }
        let refresh = store
            .get()
            .and_then(|t| t.refresh_token.clone())
            .ok_or_else(|| anyhow!("missing google refresh token, run `lineout auth`"))?;

        let fresh = self.bridge.refresh_token(&refresh, &self.config).await?;
        let access = fresh.access_token.clone();
        store.set(fresh);
        store.save()?;
        info!("refreshed google access token");
        Ok(access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(access: &str, refresh: Option<&str>) -> AuthToken {
        AuthToken {
            access_token: access.to_string(),
            refresh_token: refresh.map(str::to_string),
            expires_at: None,
            scope: None,
            token_type: Some("Bearer".to_string()),
        }
    }

    #[test]
    fn test_store_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");

        let mut store = TokenStore::load(&path).unwrap();
        assert!(store.get().is_none());

        store.set(token("ya29.first", Some("1//refresh")));
        store.save().unwrap();

        let reloaded = TokenStore::load(&path).unwrap();
        assert_eq!(reloaded.get().unwrap().access_token, "ya29.first");
        assert_eq!(reloaded.get().unwrap().refresh_token.as_deref(), Some("1//refresh"));
    }

    #[test]
    fn test_set_keeps_existing_refresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TokenStore::load(&dir.path().join("auth.json")).unwrap();
        store.set(token("a", Some("keep-me")));
        store.set(token("b", None));
        assert_eq!(store.get().unwrap().access_token, "b");
        assert_eq!(store.get().unwrap().refresh_token.as_deref(), Some("keep-me"));
    }

    #[test]
    fn test_expiry_has_slack() {
        let now = Utc::now();
        let mut t = token("a", None);
        assert!(!t.is_expired(now));

        t.expires_at = Some(now + Duration::seconds(30));
        assert!(t.is_expired(now));

        t.expires_at = Some(now + Duration::seconds(3600));
        assert!(!t.is_expired(now));
    }

    #[test]
    fn test_authorize_url_requests_offline_access() {
        let config = OAuthConfig::google("client-id", "secret", Some("http://127.0.0.1:8847/callback"));
        let (url, _csrf) = AuthBridge::new().authorize_url(&config, GOOGLE_SCOPES).unwrap();
        assert!(url.starts_with(GOOGLE_AUTH_URL));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("client_id=client-id"));
    }
}
