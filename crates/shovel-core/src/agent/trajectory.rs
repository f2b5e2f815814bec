//! Per-instance JSONL trajectory log.
//!
//! One header line, one line per agent event, one footer line. Losing a
//! trajectory never fails the instance, so every write is best-effort.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use super::types::AgentEvent;
use crate::workspace::sanitize_instance_id;

pub struct TrajectoryLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    started: Instant,
}

impl TrajectoryLog {
    /// Path of the trajectory file for `instance_id` under `log_dir`.
    pub fn path_for(log_dir: &Path, instance_id: &str) -> PathBuf {
        log_dir.join(format!("{}.jsonl", sanitize_instance_id(instance_id)))
    }

    /// Open the log for one attempt and write its header.
    ///
    /// Attempt 1 truncates any earlier file; later attempts append, so a
    /// retried session keeps the trajectories of the attempts that failed.
    pub fn create(log_dir: &Path, instance_id: &str, attempt: u32, user_prompt: &str) -> Self {
        let path = Self::path_for(log_dir, instance_id);
        let first = attempt <= 1;
        let writer = fs::create_dir_all(log_dir)
            .and_then(|()| {
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(first)
                    .append(!first)
                    .open(&path)
            })
            .map(BufWriter::new)
            .map_err(|e| {
                tracing::warn!(path = %path.display(), error = %e, "cannot open trajectory log");
            })
            .ok();

        let mut log = Self {
            path,
            writer,
            started: Instant::now(),
        };
        log.write_line(&json!({
            "type": "header",
            "run_id": Uuid::new_v4().to_string(),
            "instance_id": instance_id,
            "attempt": attempt,
            "user_prompt": user_prompt,
            "start_time": Utc::now().to_rfc3339(),
        }));
        log
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, event: &AgentEvent) {
        match serde_json::to_value(event) {
            Ok(mut value) => {
                if let Some(obj) = value.as_object_mut() {
                    obj.insert("timestamp".into(), Utc::now().to_rfc3339().into());
                }
                self.write_line(&value);
            }
            Err(e) => tracing::debug!(error = %e, "unserializable agent event"),
        }
    }

    /// Write the footer and flush.
    pub fn finish(mut self, outcome: &str) {
        self.write_line(&json!({
            "type": "footer",
            "outcome": outcome,
            "end_time": Utc::now().to_rfc3339(),
            "duration_seconds": self.started.elapsed().as_secs_f64(),
        }));
        if let Some(mut w) = self.writer.take() {
            if let Err(e) = w.flush() {
                tracing::warn!(path = %self.path.display(), error = %e, "trajectory flush failed");
            }
        }
    }

    fn write_line(&mut self, value: &serde_json::Value) {
        let Some(w) = self.writer.as_mut() else {
            return;
        };
        let result = serde_json::to_writer(&mut *w, value)
            .map_err(std::io::Error::from)
            .and_then(|()| w.write_all(b"\n"))
            .and_then(|()| w.flush());
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "trajectory write failed; disabling");
            self.writer = None;
        }
    }
}
