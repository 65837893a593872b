//! Structured progress lines for long-running syncs.
//!
//! Format: `LINEOUT_PROGRESS:{"stage":"indexing","status":"running",...}`.
//! The CLI and log shippers pick these out of the daemon's stdout.

use std::io::Write;

use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressEvent<'a> {
    pub stage: &'a str,
    pub status: &'a str,
    pub message: &'a str,
    pub documents_processed: Option<usize>,
}

pub fn progress_line(event: &ProgressEvent<'_>) -> String {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("LINEOUT_PROGRESS:{}", payload)
}

/// Emit a progress update.
///
/// * `stage` - "discovery", "indexing", "cleanup", "sync"
/// * `status` - "running", "complete", "error"
pub fn emit_progress(stage: &str, status: &str, message: &str, docs: Option<usize>) {
    let line = progress_line(&ProgressEvent {
        stage,
        status,
        message,
        documents_processed: docs,
    });
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{}", line);
    let _ = stdout.flush();
}

pub fn emit_error(stage: &str, message: &str) {
    emit_progress(stage, "error", message, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_line_format() {
        let line = progress_line(&ProgressEvent {
            stage: "indexing",
            status: "running",
            message: "Indexed 100 of 250 files",
            documents_processed: Some(100),
        });
        assert!(line.starts_with("LINEOUT_PROGRESS:{"));
        let json: serde_json::Value =
            serde_json::from_str(line.trim_start_matches("LINEOUT_PROGRESS:")).unwrap();
        assert_eq!(json["stage"], "indexing");
        assert_eq!(json["documents_processed"], 100);
    }
}
