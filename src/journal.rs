use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::dispatch::{DispatchAttempt, DispatchReport};
use crate::error::DispatchError;
use crate::transport::{Encoding, TransportResponse};

/// Dispatch outcomes stored as JSON-L lines, one per logical request.
#[derive(Debug, Clone)]
pub struct DispatchJournal {
    log_path: PathBuf,
}

impl DispatchJournal {
    pub fn new(log_path: PathBuf) -> Self {
        Self { log_path }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Unable to create journal directory {}", parent.display())
            })?;
        }

        let line = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("Failed to open journal {}", self.log_path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// The last `limit` entries, oldest first. Lines that fail to parse are skipped.
    pub fn read_recent(&self, limit: usize) -> Result<Vec<JournalEntry>> {
        if limit == 0 || !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.log_path)
            .with_context(|| format!("Failed to open journal {}", self.log_path.display()))?;
        let reader = BufReader::new(file);

        let mut buffer: VecDeque<JournalEntry> = VecDeque::with_capacity(limit);
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(line = index + 1, error = %err, "skipping unreadable journal line");
                    continue;
                }
            };
            if buffer.len() == limit {
                buffer.pop_front();
            }
            buffer.push_back(entry);
        }

        Ok(buffer.into_iter().collect())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: Uuid,
    pub request: String,
    pub succeeded: bool,
    pub candidate: Option<String>,
    pub encoding: Option<Encoding>,
    pub attempts: Vec<DispatchAttempt>,
    pub error: Option<String>,
}

impl JournalEntry {
    pub fn from_dispatch(
        report: &DispatchReport,
        outcome: &Result<TransportResponse, DispatchError>,
    ) -> Self {
        let (candidate, encoding, error) = match outcome {
            Ok(response) => (
                Some(response.candidate.to_string()),
                Some(response.encoding),
                None,
            ),
            Err(err) => (None, None, Some(err.to_string())),
        };
        Self {
            timestamp: report.started_at,
            request_id: report.request_id,
            request: report.request.to_string(),
            succeeded: outcome.is_ok(),
            candidate,
            encoding,
            attempts: report.attempts.clone(),
            error,
        }
    }
}
