//! Asynchronous request-event logging
//!
//! The engine never blocks on logging: entries go into a bounded channel
//! and a single background worker drains them to the configured sink (an
//! append-only file plus stdout). When the channel is full the entry is
//! dropped and counted — the request path always wins over log delivery.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use palisade_common::LogSeverity;

use crate::metrics::WafMetrics;

/// One structured log entry
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: LogSeverity,
    pub event: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl LogEntry {
    pub fn new(severity: LogSeverity, event: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            event: event.into(),
            fields: serde_json::Map::new(),
        }
    }

    /// Attach one structured field.
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    fn render_console(&self) -> String {
        let mut line = format!(
            "{} {} {}",
            self.timestamp.to_rfc3339(),
            self.severity.to_string().to_ascii_uppercase(),
            self.event
        );
        for (key, value) in &self.fields {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            match value {
                Value::String(s) => line.push_str(s),
                other => line.push_str(&other.to_string()),
            }
        }
        line
    }
}

/// Sending side of the log pipeline; cheap to clone
#[derive(Clone)]
pub struct LogHandle {
    tx: Arc<Mutex<Option<mpsc::Sender<LogEntry>>>>,
    min_severity: LogSeverity,
    metrics: Arc<WafMetrics>,
}

impl LogHandle {
    /// Enqueue an entry. Entries below the severity threshold are filtered;
    /// entries that do not fit the channel are dropped and counted.
    pub fn emit(&self, entry: LogEntry) {
        if entry.severity < self.min_severity {
            return;
        }
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return;
        };
        if tx.try_send(entry).is_err() {
            self.metrics.record_log_dropped();
        }
    }
}

/// The background drain task and its shutdown control
pub struct LogWorker {
    tx: Arc<Mutex<Option<mpsc::Sender<LogEntry>>>>,
    handle: JoinHandle<()>,
}

impl LogWorker {
    /// Spawn the worker and return the handle pair.
    pub fn spawn(
        capacity: usize,
        min_severity: LogSeverity,
        json: bool,
        log_file: Option<PathBuf>,
        metrics: Arc<WafMetrics>,
    ) -> (LogHandle, LogWorker) {
        let (tx, mut rx) = mpsc::channel::<LogEntry>(capacity.max(1));

        let writer = log_file.and_then(|path| {
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => Some(BufWriter::new(file)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to open log file, logging to stdout only");
                    None
                }
            }
        });

        let handle = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(entry) = rx.recv().await {
                let line = if json {
                    serde_json::to_string(&entry).unwrap_or_else(|_| "{}".to_string())
                } else {
                    entry.render_console()
                };

                println!("{line}");
                if let Some(w) = writer.as_mut() {
                    if writeln!(w, "{line}").and_then(|_| w.flush()).is_err() {
                        error!("Failed to write log entry to file");
                    }
                }
            }
        });

        let tx = Arc::new(Mutex::new(Some(tx)));
        (
            LogHandle {
                tx: Arc::clone(&tx),
                min_severity,
                metrics,
            },
            LogWorker { tx, handle },
        )
    }

    /// Close the channel and drain remaining entries within the deadline.
    pub async fn shutdown(self, deadline: Duration) {
        // Dropping the sender lets the worker drain what is buffered and
        // then exit on its own.
        self.tx.lock().take();
        if tokio::time::timeout(deadline, self.handle).await.is_err() {
            warn!("Log worker did not drain within deadline, abandoning remaining entries");
        }
    }
}
