use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use lineout_auth_bridge::{AuthBridge, OAuthConfig, TokenStore, GOOGLE_SCOPES};
use lineout_core::{LineoutConfig, LineoutPaths};
use tiny_http::{Header, Response, Server};
use url::Url;

use crate::ui;

const DEFAULT_REDIRECT: &str = "http://127.0.0.1:8847/callback";
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// `code` and `state` from the OAuth redirect target.
fn parse_callback(target: &str) -> Result<(String, String)> {
    let url = Url::parse("http://localhost")?.join(target)?;
    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => return Err(anyhow!("Authorization denied: {}", value)),
            _ => {}
        }
    }
    let code = code.ok_or_else(|| anyhow!("No authorization code in callback"))?;
    let state = state.ok_or_else(|| anyhow!("No state in callback"))?;
    Ok((code, state))
}

/// Host and port the callback listener must bind for `redirect_uri`.
fn callback_bind_address(redirect_uri: &str) -> Result<String> {
    let url = Url::parse(redirect_uri).with_context(|| format!("Invalid redirect URI: {}", redirect_uri))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("Redirect URI has no host: {}", redirect_uri))?;
    let port = url.port_or_known_default().unwrap_or(80);
    Ok(format!("{}:{}", host, port))
}

fn wait_for_callback(server: Server) -> Result<String> {
    let request = server
        .recv_timeout(CALLBACK_TIMEOUT)?
        .ok_or_else(|| anyhow!("No callback received within {}s", CALLBACK_TIMEOUT.as_secs()))?;
    let target = request.url().to_string();

    let page = Response::from_string(
        "<html><body><h1>Lineout is connected.</h1><p>You can close this window.</p></body></html>",
    );
    let page = match Header::from_bytes(&b"Content-Type"[..], &b"text/html"[..]) {
        Ok(header) => page.with_header(header),
        Err(()) => page,
    };
    let _ = request.respond(page);
    Ok(target)
}

pub async fn run() -> Result<()> {
    let paths = LineoutPaths::from_env();
    paths.ensure_dirs()?;
    let config = LineoutConfig::load(&paths.config_path)?;

    ui::header("Connect Google Drive");
    ui::info("Create an OAuth client (Desktop app) with the Drive and Calendar APIs enabled.");
    println!();

    let client_id = if config.google.client_id.is_empty() {
        ui::prompt_input("Client ID")?
    } else {
        config.google.client_id.clone()
    };
    let client_secret = if config.google.client_secret.is_empty() {
        ui::prompt_password("Client secret")?
    } else {
        config.google.client_secret.clone()
    };
    let redirect_uri = config
        .google
        .redirect_uri
        .clone()
        .unwrap_or_else(|| DEFAULT_REDIRECT.to_string());

    let oauth = OAuthConfig::google(&client_id, &client_secret, Some(&redirect_uri));
    let bridge = AuthBridge::new();
    let (auth_url, csrf) = bridge.authorize_url(&oauth, GOOGLE_SCOPES)?;

    let bind = callback_bind_address(&redirect_uri)?;
    let server = Server::http(&bind).map_err(|e| anyhow!("Failed to start callback server on {}: {}", bind, e))?;

    ui::info("Opening browser for authorization...");
    if open::that(&auth_url).is_err() {
        ui::info("Open this URL to continue:");
        println!("    {}", auth_url);
    }

    let spinner = ui::spinner("Waiting for authorization...");
    let target = tokio::task::spawn_blocking(move || wait_for_callback(server)).await?;
    spinner.finish_and_clear();
    let (code, state) = parse_callback(&target?)?;
    if state != *csrf.secret() {
        return Err(anyhow!("OAuth state mismatch, refusing the callback"));
    }

    let spinner = ui::spinner("Exchanging authorization code...");
    let token = bridge.exchange_code(&code, &oauth).await;
    spinner.finish_and_clear();
    let token = token?;
    if token.refresh_token.is_none() {
        ui::info("Google returned no refresh token; re-run `lineout auth` when access expires.");
    }

    let mut store = TokenStore::load(&paths.auth_path)?;
    store.set(token);
    store.save()?;
    ui::success(&format!("Token saved to {}", paths.auth_path.display()));

    if config.google.client_id.is_empty() {
        ui::background_notice(
            "The daemon refreshes tokens with the client credentials from lineout.toml.",
            "Set [google] client_id and client_secret there, or LINEOUT_GOOGLE_CLIENT_ID/SECRET.",
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_callback_reads_code_and_state() {
        let (code, state) = parse_callback("/callback?state=abc&code=4%2F0Ad&scope=drive").unwrap();
        assert_eq!(code, "4/0Ad");
        assert_eq!(state, "abc");
    }

    #[test]
    fn test_parse_callback_reports_denial() {
        let err = parse_callback("/callback?error=access_denied&state=abc").unwrap_err();
        assert!(err.to_string().contains("access_denied"));
        assert!(parse_callback("/callback").is_err());
    }

    #[test]
    fn test_callback_bind_address() {
        assert_eq!(callback_bind_address(DEFAULT_REDIRECT).unwrap(), "127.0.0.1:8847");
        assert_eq!(callback_bind_address("http://localhost/cb").unwrap(), "localhost:80");
        assert!(callback_bind_address("not a url").is_err());
    }
}
