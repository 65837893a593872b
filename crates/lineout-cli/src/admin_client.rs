use anyhow::{anyhow, Result};
use lineout_core::LineoutPaths;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Debug, Serialize)]
pub struct AdminRequest {
    pub id: Option<String>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct AdminResponse {
    pub ok: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl AdminResponse {
    fn into_result(self) -> Result<Value> {
        if !self.ok {
            return Err(anyhow!(self
                .error
                .unwrap_or_else(|| "Unknown error".to_string())));
        }
        self.result.ok_or_else(|| anyhow!("No result"))
    }
}

#[derive(Debug)]
pub struct DaemonStatus {
    pub running: bool,
    pub ready: bool,
    pub version: String,
    /// `CoreStatus` as reported once the engine is up.
    pub sync: Option<Value>,
    pub channels: Vec<Value>,
}

pub struct AdminClient {
    socket_path: PathBuf,
}

impl AdminClient {
    pub fn new() -> Self {
        Self {
            socket_path: LineoutPaths::from_env().admin_socket_path,
        }
    }

    pub fn is_daemon_running(&self) -> bool {
        self.socket_path.exists()
    }

    async fn send(&self, request: AdminRequest) -> Result<AdminResponse> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            anyhow!(
                "Cannot connect to daemon at {}: {}",
                self.socket_path.display(),
                e
            )
        })?;

        let payload = serde_json::to_string(&request)?;
        stream.write_all(payload.as_bytes()).await?;
        stream.write_all(b"\n").await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(anyhow!("Daemon closed the connection"));
        }

        let response: AdminResponse = serde_json::from_str(&line)?;
        Ok(response)
    }

    /// Call an admin method and return its `result`.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.send(AdminRequest {
            id: Some(method.to_string()),
            method: method.to_string(),
            params,
        })
        .await?
        .into_result()
    }

    pub async fn get_status(&self) -> Result<DaemonStatus> {
        let result = self.call("get_status", None).await?;
        Ok(parse_status(&result))
    }
}

fn parse_status(result: &Value) -> DaemonStatus {
    DaemonStatus {
        running: result["running"].as_bool().unwrap_or(false),
        ready: result["ready"].as_bool().unwrap_or(false),
        version: result["version"].as_str().unwrap_or("unknown").to_string(),
        sync: result.get("sync").cloned().filter(|v| !v.is_null()),
        channels: result["channels"].as_array().cloned().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_omits_missing_params() {
        let request = AdminRequest {
            id: Some("ping".into()),
            method: "ping".into(),
            params: None,
        };
        let raw = serde_json::to_string(&request).unwrap();
        assert_eq!(raw, r#"{"id":"ping","method":"ping"}"#);
    }

    #[test]
    fn test_response_errors_surface() {
        let failed: AdminResponse =
            serde_json::from_str(r#"{"id":"1","ok":false,"error":"Engine still initializing"}"#).unwrap();
        let err = failed.into_result().unwrap_err();
        assert!(err.to_string().contains("initializing"));

        let ok: AdminResponse = serde_json::from_str(r#"{"id":"1","ok":true,"result":{"pong":true}}"#).unwrap();
        assert_eq!(ok.into_result().unwrap()["pong"], true);
    }

    #[test]
    fn test_parse_status_before_ready() {
        let status = parse_status(&json!({ "running": true, "ready": false, "version": "0.1.0" }));
        assert!(status.running);
        assert!(!status.ready);
        assert!(status.sync.is_none());
        assert!(status.channels.is_empty());
    }
}
