// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Dead-Letter Sink
//!
//! Appends one JSON object per line to `dlq_<destination>_<YYYY-MM-DD>.jsonl`
//! files. Writes are append-only and flushed at line granularity; each file
//! is guarded by a per-file lock so concurrent sink workers never interleave
//! partial lines.
//!
//! A failure to write a DLQ record is logged and swallowed - the DLQ is the
//! last resort, and its own failures must never take the pipeline down.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, warn};

use cdc_relay_domain::{ChangeEvent, DeadLetterRecord, Destination, PipelineError};

/// Append-only writer for dead-letter records.
pub struct DeadLetterWriter {
    directory: PathBuf,
    // One lock-wrapped handle per (destination, date) file.
    files: Mutex<HashMap<String, Arc<Mutex<tokio::fs::File>>>>,
}

impl DeadLetterWriter {
    /// Creates the writer, ensuring the DLQ directory exists.
    pub async fn new(directory: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|e| PipelineError::IoError(format!("create {}: {e}", directory.display())))?;

        Ok(Self {
            directory,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Routes a failed event to the DLQ. Never returns an error.
    pub async fn write_event(
        &self,
        event: &ChangeEvent,
        destination: Destination,
        error: &PipelineError,
    ) {
        let record = DeadLetterRecord::from_event(event, destination, error);
        self.append(record).await;
    }

    /// Routes an undecodable entry to the DLQ. Never returns an error.
    pub async fn write_undecodable(
        &self,
        segment: &str,
        position: u64,
        payload: &[u8],
        destination: Destination,
        error: &PipelineError,
    ) {
        let record =
            DeadLetterRecord::from_undecodable(segment, position, payload, destination, error);
        self.append(record).await;
    }

    /// Appends one record as a JSON line. Failures are logged and swallowed.
    pub async fn append(&self, record: DeadLetterRecord) {
        let filename = format!(
            "dlq_{}_{}.jsonl",
            record.destination,
            Utc::now().format("%Y-%m-%d")
        );

        warn!(
            event_id = %record.event_id,
            destination = %record.destination,
            error_type = %record.error_type,
            dlq_file = %filename,
            "Event routed to DLQ"
        );

        if let Err(write_error) = self.try_append(&filename, &record).await {
            error!(
                event_id = %record.event_id,
                error = %write_error,
                "Failed to write DLQ record, dropping"
            );
        }
    }

    async fn try_append(
        &self,
        filename: &str,
        record: &DeadLetterRecord,
    ) -> Result<(), PipelineError> {
        let handle = {
            let mut files = self.files.lock().await;
            match files.get(filename) {
                Some(handle) => Arc::clone(handle),
                None => {
                    let path = self.directory.join(filename);
                    let file = tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .await
                        .map_err(|e| {
                            PipelineError::IoError(format!("open {}: {e}", path.display()))
                        })?;
                    let handle = Arc::new(Mutex::new(file));
                    files.insert(filename.to_string(), Arc::clone(&handle));
                    handle
                }
            }
        };

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = handle.lock().await;
        file.write_all(&line)
            .await
            .map_err(|e| PipelineError::IoError(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| PipelineError::IoError(e.to_string()))?;
        Ok(())
    }

    /// DLQ files present on disk, optionally filtered by destination,
    /// sorted by name.
    pub async fn dlq_files(
        &self,
        destination: Option<Destination>,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        let prefix = match destination {
            Some(destination) => format!("dlq_{}_", destination.as_str()),
            None => "dlq_".to_string(),
        };

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.directory)
            .await
            .map_err(|e| PipelineError::IoError(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::IoError(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(".jsonl") {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Total dead-lettered events, optionally filtered by destination.
    pub async fn count_events(
        &self,
        destination: Option<Destination>,
    ) -> Result<usize, PipelineError> {
        let mut total = 0;
        for path in self.dlq_files(destination).await? {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| PipelineError::IoError(e.to_string()))?;
            total += contents.lines().filter(|line| !line.is_empty()).count();
        }
        Ok(total)
    }

    /// Reads every record back, optionally filtered by destination.
    /// Intended for inspection tooling and tests, not the hot path.
    pub async fn read_records(
        &self,
        destination: Option<Destination>,
    ) -> Result<Vec<DeadLetterRecord>, PipelineError> {
        let mut records = Vec::new();
        for path in self.dlq_files(destination).await? {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| PipelineError::IoError(e.to_string()))?;
            for line in contents.lines().filter(|line| !line.is_empty()) {
                records.push(serde_json::from_str(line)?);
            }
        }
        Ok(records)
    }

    /// Directory records are written into.
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}
