//! Append-only per-run execution log.
//!
//! One JSONL file per run, flushed before `log` returns so every event is
//! durable before the next step begins. Raw upstream payloads go to a
//! parallel `raw/` store keyed by subtask, source, and attempt, keeping
//! the event log compact. Writes are serialized through an async mutex;
//! callers never lock anything themselves.

use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::Result;

use super::events::ExecutionEvent;

/// Per-run audit logger. Scoped to exactly one run directory; file handles
/// are released by `finish`, on success and failure alike.
pub struct ExecutionLogger {
    run_dir: PathBuf,
    log_file: Mutex<Option<File>>,
    subscribers: std::sync::Mutex<Vec<mpsc::UnboundedSender<ExecutionEvent>>>,
}

impl ExecutionLogger {
    /// Create the run directory layout and open the event log.
    pub async fn create(output_root: &Path, run_id: &str) -> Result<Self> {
        let run_dir = output_root.join(run_id);
        tokio::fs::create_dir_all(run_dir.join("raw")).await?;

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join("execution_log.jsonl"))
            .await?;

        Ok(Self {
            run_dir,
            log_file: Mutex::new(Some(log_file)),
            subscribers: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Append one event and flush before returning.
    pub async fn log(&self, event: &ExecutionEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        {
            let mut guard = self.log_file.lock().await;
            if let Some(file) = guard.as_mut() {
                file.write_all(line.as_bytes()).await?;
                file.flush().await?;
            } else {
                debug!("event after finish dropped: {}", event.as_log_line());
            }
        }

        // Fan out to live progress subscribers, dropping the dead ones.
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .retain(|tx| tx.send(event.clone()).is_ok());

        Ok(())
    }

    /// Store a raw upstream payload; returns the key recorded in events.
    pub async fn store_raw(
        &self,
        subtask_id: &str,
        source_id: &str,
        attempt: u32,
        payload: &Value,
    ) -> Result<String> {
        let key = format!(
            "{}_{}_a{attempt}.json",
            sanitize(subtask_id),
            sanitize(source_id)
        );
        let path = self.run_dir.join("raw").join(&key);
        tokio::fs::write(&path, serde_json::to_vec_pretty(payload)?).await?;
        Ok(key)
    }

    /// Register a live subscriber; it receives every subsequent event and
    /// hangs up automatically when the logger finishes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ExecutionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(tx);
        rx
    }

    /// Flush and release the log file handle, and hang up subscribers.
    pub async fn finish(&self) -> Result<()> {
        let mut guard = self.log_file.lock().await;
        if let Some(mut file) = guard.take() {
            file.flush().await?;
        }
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .clear();
        Ok(())
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }
}

/// Keep raw-store keys filesystem-safe.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Read back a run's event stream from disk, in append order.
pub async fn read_event_log(run_dir: &Path) -> Result<Vec<ExecutionEvent>> {
    let text = tokio::fs::read_to_string(run_dir.join("execution_log.jsonl")).await?;
    let mut events = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        events.push(serde_json::from_str(line)?);
    }
    Ok(events)
}
