//! Inbound Drive push notifications over plain HTTP.

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Result};
use lineout_core::{Ack, Notification, WebhookHandler};
use tiny_http::{Method, Response, Server};
use tracing::{debug, info, warn};

/// Strip the query string from a request target.
fn request_path(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

/// Serve `path` on `bind_address` from a dedicated thread.
///
/// Drive retries anything other than 2xx, so every request is answered
/// 200 before the notification is looked at.
pub fn spawn_listener(
    bind_address: &str,
    path: &str,
    handler: Arc<WebhookHandler>,
) -> Result<JoinHandle<()>> {
    let server = Server::http(bind_address)
        .map_err(|e| anyhow!("Failed to bind webhook listener on {}: {}", bind_address, e))?;
    info!("Webhook listener on http://{}{}", bind_address, path);
    let path = path.to_string();

    let handle = std::thread::spawn(move || {
        for request in server.incoming_requests() {
            let is_hook = *request.method() == Method::Post && request_path(request.url()) == path;
            let headers: Vec<(String, String)> = request
                .headers()
                .iter()
                .map(|h| (h.field.as_str().to_string(), h.value.as_str().to_string()))
                .collect();
            if let Err(e) = request.respond(Response::empty(200)) {
                warn!("Failed to answer webhook request: {}", e);
            }
            if !is_hook {
                continue;
            }

            let notification =
                Notification::from_headers(headers.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            match notification {
                Some(n) => match handler.accept(n) {
                    Ack::Accepted => debug!("Queued Drive notification"),
                    other => debug!("Drive notification not queued: {:?}", other),
                },
                None => warn!("Webhook request without Drive channel headers"),
            }
        }
    });
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_path_drops_query() {
        assert_eq!(request_path("/webhooks/drive?x=1"), "/webhooks/drive");
        assert_eq!(request_path("/webhooks/drive"), "/webhooks/drive");
    }
}
