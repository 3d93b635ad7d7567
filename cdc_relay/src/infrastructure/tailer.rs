// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Commit-Log Tailer
//!
//! Exposes a lazy, restartable sequence of framed entries from a directory
//! of append-only segment files.
//!
//! ## Framing
//!
//! Each entry is a 4-byte big-endian length prefix followed by `length`
//! payload bytes. A length of zero or one, or above 100 MB, is a corrupt
//! frame: processing of the current segment halts (the pipeline moves on to
//! the next segment), but the pipeline itself keeps running.
//!
//! ## Tailing semantics
//!
//! Segments are consumed in ascending lexicographic order, which equals age
//! order for `CommitLog-<generation>-<id>.log` names. A short read (length
//! prefix incomplete, or payload shorter than declared) on the *newest*
//! segment means the writer is still appending: the tailer pauses and
//! retries after the poll interval. The same condition on an older segment
//! means the writer crashed mid-entry; the truncated tail is abandoned and
//! the tailer advances. An I/O error on a segment is logged and the tailer
//! advances rather than aborting the pipeline.
//!
//! ## Resumption
//!
//! The `position` carried by each [`FramedEntry`] is the pre-read offset of
//! the entry's length prefix: restarting at a recorded position re-reads
//! exactly that entry. Offsets persist `next_position` instead so a restart
//! resumes *after* the last committed entry.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, error, info, warn};

use cdc_relay_bootstrap::CancellationToken;
use cdc_relay_domain::{FramedEntry, PipelineError, SegmentPosition};

/// Largest accepted entry payload, in bytes.
pub const MAX_ENTRY_BYTES: u32 = 100_000_000;

/// Smallest accepted entry payload, in bytes. A 1-byte payload cannot carry
/// an operation discriminator plus content and is treated as corrupt.
pub const MIN_ENTRY_BYTES: u32 = 2;

/// Pattern for commit-log segment file names.
///
/// Known-good at compile time; on the impossible compile failure we fall
/// back to a regex that matches nothing rather than panicking.
static SEGMENT_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^CommitLog-\d+-\d+\.log$")
        .unwrap_or_else(|_| Regex::new(r"[^\s\S]").unwrap_or_else(|_| unsafe { std::hint::unreachable_unchecked() }))
});

/// True when `name` looks like a commit-log segment file.
pub fn is_segment_name(name: &str) -> bool {
    SEGMENT_NAME_REGEX.is_match(name)
}

/// Outcome of attempting to read one frame from a segment.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A complete entry.
    Entry(FramedEntry),
    /// Not enough bytes yet; the reader rewound to the frame start.
    Incomplete,
    /// Unparseable frame; the current segment should be abandoned.
    Corrupt {
        /// Why the frame was rejected.
        reason: String,
    },
}

/// Sequential frame reader over one segment file.
pub struct SegmentReader {
    file: tokio::fs::File,
    segment_file: String,
    position: u64,
}

impl SegmentReader {
    /// Opens a segment and seeks to `start_position`.
    pub async fn open(path: &Path, start_position: u64) -> Result<Self, PipelineError> {
        let segment_file = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| PipelineError::IoError(format!("open {}: {e}", path.display())))?;

        if start_position > 0 {
            file.seek(SeekFrom::Start(start_position))
                .await
                .map_err(|e| PipelineError::IoError(format!("seek {}: {e}", path.display())))?;
            debug!(segment = %segment_file, position = start_position, "Resuming from position");
        }

        Ok(Self {
            file,
            segment_file,
            position: start_position,
        })
    }

    /// Byte offset the next frame would be read from.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads the next frame.
    ///
    /// On `Incomplete` the reader seeks back to the frame start so a later
    /// call retries the same frame (the segment may still be written to).
    /// `Err` is reserved for genuine I/O failures.
    pub async fn read_entry(&mut self) -> Result<FrameOutcome, PipelineError> {
        let frame_start = self.position;

        let mut length_prefix = [0u8; 4];
        let read = read_fully(&mut self.file, &mut length_prefix).await?;
        if read < 4 {
            self.rewind_to(frame_start).await?;
            return Ok(FrameOutcome::Incomplete);
        }

        let length = u32::from_be_bytes(length_prefix);
        if !(MIN_ENTRY_BYTES..=MAX_ENTRY_BYTES).contains(&length) {
            return Ok(FrameOutcome::Corrupt {
                reason: format!(
                    "length prefix {length} outside [{MIN_ENTRY_BYTES}, {MAX_ENTRY_BYTES}]"
                ),
            });
        }

        let mut payload = vec![0u8; length as usize];
        let read = read_fully(&mut self.file, &mut payload).await?;
        if read < payload.len() {
            self.rewind_to(frame_start).await?;
            return Ok(FrameOutcome::Incomplete);
        }

        self.position = frame_start + 4 + u64::from(length);
        Ok(FrameOutcome::Entry(FramedEntry {
            payload,
            segment_file: self.segment_file.clone(),
            position: frame_start,
            next_position: self.position,
        }))
    }

    async fn rewind_to(&mut self, position: u64) -> Result<(), PipelineError> {
        self.file
            .seek(SeekFrom::Start(position))
            .await
            .map_err(|e| PipelineError::IoError(format!("rewind {}: {e}", self.segment_file)))?;
        self.position = position;
        Ok(())
    }
}

/// Reads until the buffer is full or EOF; returns bytes read.
async fn read_fully(
    file: &mut tokio::fs::File,
    buffer: &mut [u8],
) -> Result<usize, PipelineError> {
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file
            .read(&mut buffer[filled..])
            .await
            .map_err(|e| PipelineError::IoError(e.to_string()))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Items yielded by the tailer stream.
#[derive(Debug, PartialEq, Eq)]
pub enum TailerItem {
    /// A complete framed entry.
    Entry(FramedEntry),
    /// A corrupt frame was hit; the segment was abandoned.
    CorruptFrame {
        /// Segment containing the corrupt frame.
        segment: String,
        /// Byte offset of the rejected length prefix.
        position: u64,
        /// Why the frame was rejected.
        reason: String,
    },
    /// The tailer caught up with the newest segment; marks the end of a
    /// poll cycle (the dispatcher seals partial batches on this).
    Idle,
}

/// Polls a commit-log directory and yields framed entries.
pub struct CommitLogTailer {
    directory: PathBuf,
    poll_interval: Duration,
    start: Option<SegmentPosition>,
}

impl CommitLogTailer {
    /// Creates a tailer over `directory`.
    ///
    /// `start` is the resume coordinate; `None` begins at the oldest
    /// segment. If the segment named in `start` no longer exists the tailer
    /// warns and starts from the oldest available.
    pub fn new(
        directory: impl Into<PathBuf>,
        poll_interval: Duration,
        start: Option<SegmentPosition>,
    ) -> Self {
        Self {
            directory: directory.into(),
            poll_interval,
            start,
        }
    }

    /// Lists segment file names in ascending lexicographic order.
    pub async fn list_segments(&self) -> Result<Vec<String>, PipelineError> {
        if !self.directory.exists() {
            warn!(directory = %self.directory.display(), "Commit-log directory does not exist");
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.directory)
            .await
            .map_err(|e| PipelineError::IoError(format!("read_dir {}: {e}", self.directory.display())))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::IoError(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_segment_name(&name) {
                names.push(name);
            }
        }
        names.sort();
        debug!(count = names.len(), "Found commit-log segments");
        Ok(names)
    }

    /// Turns the tailer into an endless stream of [`TailerItem`]s.
    ///
    /// The stream terminates when `shutdown` is cancelled. Corrupt frames
    /// and per-segment I/O errors are reported in-band and never end the
    /// stream.
    pub fn stream(self, shutdown: CancellationToken) -> impl Stream<Item = TailerItem> + Send {
        stream! {
            // Cursor: the next (segment, position) to read. Resolved lazily
            // against the directory on every poll cycle so new segments are
            // picked up and vanished ones are skipped.
            let mut cursor: Option<SegmentPosition> = self.start.clone();
            let mut start_warning_emitted = false;

            'poll: loop {
                if shutdown.is_cancelled() {
                    info!("Tailer stopping on shutdown signal");
                    break;
                }

                let segments = match self.list_segments().await {
                    Ok(segments) => segments,
                    Err(error) => {
                        error!(error = %error, "Failed to enumerate segments");
                        Vec::new()
                    }
                };

                if segments.is_empty() {
                    yield TailerItem::Idle;
                    if !sleep_or_shutdown(self.poll_interval, &shutdown).await {
                        break;
                    }
                    continue;
                }

                let (start_index, resolved) = resolve_start(&segments, cursor.as_ref());
                if !resolved && !start_warning_emitted {
                    warn!(
                        start = %cursor.as_ref().map(|c| c.segment_file.as_str()).unwrap_or(""),
                        "Start segment not found, beginning from oldest available"
                    );
                    start_warning_emitted = true;
                }

                for (index, segment) in segments.iter().enumerate().skip(start_index) {
                    if shutdown.is_cancelled() {
                        break 'poll;
                    }

                    let is_newest = index == segments.len() - 1;
                    let start_position = match &cursor {
                        Some(position) if resolved && position.segment_file == *segment => {
                            position.position
                        }
                        _ => 0,
                    };

                    let path = self.directory.join(segment);
                    let mut reader = match SegmentReader::open(&path, start_position).await {
                        Ok(reader) => reader,
                        Err(error) => {
                            error!(segment = %segment, error = %error, "Failed to open segment, advancing");
                            cursor = next_segment_cursor(&segments, index);
                            continue;
                        }
                    };

                    loop {
                        match reader.read_entry().await {
                            Ok(FrameOutcome::Entry(entry)) => {
                                cursor = Some(SegmentPosition::new(
                                    entry.segment_file.clone(),
                                    entry.next_position,
                                ));
                                yield TailerItem::Entry(entry);
                            }
                            Ok(FrameOutcome::Incomplete) => {
                                if is_newest {
                                    // Still being written; hold position and
                                    // retry next poll cycle.
                                    cursor = Some(SegmentPosition::new(
                                        segment.clone(),
                                        reader.position(),
                                    ));
                                } else {
                                    debug!(
                                        segment = %segment,
                                        position = reader.position(),
                                        "Truncated tail on closed segment, advancing"
                                    );
                                    cursor = next_segment_cursor(&segments, index);
                                }
                                break;
                            }
                            Ok(FrameOutcome::Corrupt { reason }) => {
                                yield TailerItem::CorruptFrame {
                                    segment: segment.clone(),
                                    position: reader.position(),
                                    reason,
                                };
                                cursor = next_segment_cursor(&segments, index);
                                break;
                            }
                            Err(error) => {
                                error!(segment = %segment, error = %error, "I/O error reading segment, advancing");
                                cursor = next_segment_cursor(&segments, index);
                                break;
                            }
                        }
                    }
                }

                yield TailerItem::Idle;
                if !sleep_or_shutdown(self.poll_interval, &shutdown).await {
                    break;
                }
            }
        }
    }
}

/// Resolves the cursor against the current segment list.
///
/// Returns `(start_index, resolved)` where `resolved` is false when the
/// cursor named a segment that no longer exists (the caller warns and the
/// tailer starts from the oldest).
fn resolve_start(segments: &[String], cursor: Option<&SegmentPosition>) -> (usize, bool) {
    match cursor {
        None => (0, true),
        Some(position) => match segments.iter().position(|s| *s == position.segment_file) {
            Some(index) => (index, true),
            // Vanished cursor segment: start from the oldest available.
            // Already-delivered entries replay and deduplicate downstream.
            None => (0, false),
        },
    }
}

/// Cursor pointing past the abandoned segment `index`.
///
/// When a later segment exists the cursor moves to its start; otherwise it
/// parks past the end of the current segment so the abandoned remainder is
/// never re-read once the directory grows.
fn next_segment_cursor(segments: &[String], index: usize) -> Option<SegmentPosition> {
    match segments.get(index + 1) {
        Some(next) => Some(SegmentPosition::new(next.clone(), 0)),
        None => segments
            .get(index)
            .map(|current| SegmentPosition::new(current.clone(), u64::MAX)),
    }
}

/// Sleeps for the poll interval; returns false when shutdown fired.
async fn sleep_or_shutdown(interval: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        _ = shutdown.cancelled() => false,
    }
}
