//! Dead-letter sink - appends rejected messages to a JSONL file
//!
//! One JSON object per line, so the file can be tailed or replayed.

use crate::domain::types::DeadLetter;
use crate::io::collaborators::DeadLetterSink;
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct JsonlDeadLetterSink {
    file_path: PathBuf,
    /// Serializes appends from concurrent workers
    write_lock: Mutex<()>,
}

impl JsonlDeadLetterSink {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        let file_path = file_path.as_ref().to_path_buf();
        info!(file_path = %file_path.display(), "dead_letter_sink_initialized");
        Self { file_path, write_lock: Mutex::new(()) }
    }

    /// Append a line to the dead-letter file
    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock();

        // Create parent directories if they don't exist
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path.display(), bytes = %line.len(), "dead_letter_written");
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for JsonlDeadLetterSink {
    async fn put(&self, letter: DeadLetter) -> anyhow::Result<()> {
        let line = serde_json::to_string(&letter)?;
        self.append_line(&line)
            .with_context(|| format!("Failed to append to {}", self.file_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::RejectReason;
    use std::fs;
    use tempfile::tempdir;

    fn letter(reason: RejectReason) -> DeadLetter {
        DeadLetter {
            ts: "2024-05-01T10:00:00Z".to_string(),
            stage: "enricher".to_string(),
            reason,
            detail: "plate 3ABC123".to_string(),
            receive_count: 1,
            body: r#"{"plate":"3ABC123"}"#.to_string(),
        }
    }

    #[tokio::test]
    async fn test_append_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dead.jsonl");
        let sink = JsonlDeadLetterSink::new(&path);

        sink.put(letter(RejectReason::PlateNotFound)).await.unwrap();
        sink.put(letter(RejectReason::Malformed)).await.unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(content.ends_with('\n'));

        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["reason"], "plate_not_found");
        assert_eq!(parsed["receiveCount"], 1);
        let back: DeadLetter = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(back.reason, RejectReason::Malformed);
    }

    #[tokio::test]
    async fn test_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested").join("dir").join("dead.jsonl");
        let sink = JsonlDeadLetterSink::new(&nested);

        sink.put(letter(RejectReason::UnknownViolationType)).await.unwrap();
        assert!(nested.exists());
    }
}
