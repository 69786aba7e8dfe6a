//! Chunked, verified LIST upload.
//!
//! A waveform is sent as a sequence of chunks, strictly one after another.
//! Each chunk goes through the same cycle:
//!
//! ```text
//! Idle -> ChunkSending(i) -> ChunkVerifying(i) -> ChunkSending(i+1) ... -> Done
//!                 ^                  |
//!                 +---- mismatch ----+  (bounded retries, then Failed)
//! ```
//!
//! Verification reads the device's point count back with
//! `LIST:{VOLT|CURR}:POIN?`. A retry re-sends the whole chunk, since
//! `LIST:CLE` starts every chunk from an empty list. Cancellation is only
//! observed between chunks and between retries, never mid-chunk.

pub mod list_cmd;

use crate::channel::CommandChannel;
use crate::error::KepcoError;
use crate::limits::{LIST_CMD_BYTE_LIMIT, LIST_VALUES_PER_CMD, MAX_CHUNK_POINTS, VERIFY_RETRIES};
use crate::waveform::{Chunk, Waveform};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Which output quantity the list drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ListMode {
    /// Voltage list (`LIST:VOLT`).
    #[default]
    #[serde(rename = "volt", alias = "voltage")]
    Voltage,
    /// Current list (`LIST:CURR`).
    #[serde(rename = "curr", alias = "current")]
    Current,
}

impl ListMode {
    /// SCPI mnemonic: `VOLT` or `CURR`.
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        match self {
            ListMode::Voltage => "VOLT",
            ListMode::Current => "CURR",
        }
    }
}

impl fmt::Display for ListMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// When the device error queue is read during an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCheck {
    /// After every verified chunk.
    #[default]
    PerChunk,
    /// Once, after the last chunk.
    AfterAll,
}

/// Upload parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadConfig {
    /// Voltage or current list.
    pub mode: ListMode,
    /// Re-sends of a chunk that failed verification.
    pub verify_retries: u32,
    /// When to read the error queue.
    pub error_check: ErrorCheck,
    /// Values per list-data command.
    pub values_per_command: usize,
    /// Byte budget per list-data command.
    pub command_byte_limit: usize,
    /// Points per chunk (clamped to the device limit).
    pub chunk_size: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            mode: ListMode::Voltage,
            verify_retries: VERIFY_RETRIES,
            error_check: ErrorCheck::PerChunk,
            values_per_command: LIST_VALUES_PER_CMD,
            command_byte_limit: LIST_CMD_BYTE_LIMIT,
            chunk_size: MAX_CHUNK_POINTS,
        }
    }
}

/// Where an upload currently stands. Chunk numbers are one-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadState {
    /// Nothing sent yet.
    #[default]
    Idle,
    /// Writing the given chunk.
    ChunkSending(usize),
    /// Reading back the given chunk's point count.
    ChunkVerifying(usize),
    /// Every chunk verified.
    Done,
    /// Stopped on an error.
    Failed,
}

/// Progress snapshot published while uploading.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UploadProgress {
    /// Current chunk (one-based), 0 before the first.
    pub chunk: usize,
    /// Total chunks.
    pub chunks: usize,
    /// Points written in the current attempt of the current chunk, plus
    /// all points of verified chunks.
    pub points_sent: usize,
    /// Points in the waveform.
    pub points_total: usize,
    /// Current state.
    pub state: UploadState,
}

/// Upload protocol failures. Chunk numbers are one-based.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UploadError {
    /// The device holds a different number of points than were sent.
    #[error("Chunk {chunk}: device reports {actual} points, expected {expected}")]
    VerificationMismatch {
        /// Chunk that failed
        chunk: usize,
        /// Points sent
        expected: usize,
        /// Points reported
        actual: usize,
    },

    /// The point-count query answered with something that is not a count.
    #[error("Chunk {chunk}: unreadable point count '{response}'")]
    UnreadablePointCount {
        /// Chunk that failed
        chunk: usize,
        /// Raw response
        response: String,
    },

    /// The device queued SCPI errors.
    #[error("Device reported error{}: {message}", after_chunk(.chunk))]
    DeviceReportedError {
        /// Chunk after which the queue was read; `None` for an after-all check
        chunk: Option<usize>,
        /// Error entries, verbatim, joined with `; `
        message: String,
    },

    /// Cancelled before the chunk was sent.
    #[error("Cancelled before chunk {chunk}")]
    Cancelled {
        /// First chunk not sent
        chunk: usize,
    },

    /// The channel failed while sending or verifying.
    #[error("Chunk {chunk}: communication failed: {message}")]
    Communication {
        /// Chunk in flight
        chunk: usize,
        /// Underlying error
        message: String,
    },
}

/// Outcome of one upload call.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadResult {
    /// Chunks that were sent and verified.
    pub chunks_sent: usize,
    /// Points in those chunks.
    pub points_verified: usize,
    /// Why the upload stopped early, if it did.
    pub error: Option<UploadError>,
}

impl UploadResult {
    /// True when every chunk verified and no device error was reported.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Turn a failed result into its error.
    ///
    /// # Errors
    /// The upload error, if any.
    pub fn into_result(self) -> Result<Self, UploadError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Runs the upload protocol over one channel.
pub struct Uploader<'a> {
    channel: &'a CommandChannel,
    config: &'a UploadConfig,
    progress: Option<&'a watch::Sender<UploadProgress>>,
}

impl<'a> Uploader<'a> {
    /// Create an uploader.
    pub fn new(channel: &'a CommandChannel, config: &'a UploadConfig) -> Self {
        Self {
            channel,
            config,
            progress: None,
        }
    }

    /// Publish progress snapshots on `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: &'a watch::Sender<UploadProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Upload every chunk of `waveform`, verifying each.
    ///
    /// Protocol failures are reported in [`UploadResult::error`], together
    /// with how far the upload got.
    pub async fn upload(&self, waveform: &Waveform, cancel: &CancellationToken) -> UploadResult {
        let chunks = waveform.chunk(self.config.chunk_size);
        let total_chunks = chunks.len();
        let points_total = waveform.len();

        tracing::info!(
            peer = %self.channel.peer(),
            mode = %self.config.mode,
            points = points_total,
            chunks = total_chunks,
            "Starting list upload"
        );

        let mut result = UploadResult {
            chunks_sent: 0,
            points_verified: 0,
            error: None,
        };
        self.publish(0, total_chunks, 0, points_total, UploadState::Idle);

        for chunk in &chunks {
            if cancel.is_cancelled() {
                let err = UploadError::Cancelled {
                    chunk: chunk.ordinal(),
                };
                return self.fail(result, err);
            }

            let sent = self
                .send_verified(chunk, total_chunks, result.points_verified, points_total, cancel)
                .await;
            if let Err(err) = sent {
                return self.fail(result, err);
            }
            result.chunks_sent += 1;
            result.points_verified += chunk.len();

            if self.config.error_check == ErrorCheck::PerChunk {
                if let Err(err) = self.check_errors(Some(chunk.ordinal())).await {
                    return self.fail(result, err);
                }
            }
        }

        if self.config.error_check == ErrorCheck::AfterAll {
            if let Err(err) = self.check_errors(None).await {
                return self.fail(result, err);
            }
        }

        self.publish(
            total_chunks,
            total_chunks,
            points_total,
            points_total,
            UploadState::Done,
        );
        tracing::info!(
            peer = %self.channel.peer(),
            chunks = result.chunks_sent,
            points = result.points_verified,
            "List upload verified"
        );
        result
    }

    /// Send one chunk and verify it, re-sending up to `verify_retries` times.
    ///
    /// # Errors
    /// The last verification failure once retries run out, `Cancelled` if
    /// the token fires between attempts, or `Communication`.
    pub async fn send_verified(
        &self,
        chunk: &Chunk<'_>,
        total_chunks: usize,
        points_before: usize,
        points_total: usize,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        let n = chunk.ordinal();
        let query = list_cmd::point_query(self.config.mode);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.publish(
                n,
                total_chunks,
                points_before,
                points_total,
                UploadState::ChunkSending(n),
            );
            tracing::debug!(chunk = n, attempt, points = chunk.len(), "Sending chunk");

            self.send_chunk(chunk, total_chunks, points_before, points_total)
                .await
                .map_err(|e| communication(n, &e))?;

            self.publish(
                n,
                total_chunks,
                points_before + chunk.len(),
                points_total,
                UploadState::ChunkVerifying(n),
            );
            let response = self
                .channel
                .query(&query)
                .await
                .map_err(|e| communication(n, &e))?;

            let failure = match list_cmd::parse_count(&response) {
                Some(actual) if actual == chunk.len() => {
                    tracing::debug!(chunk = n, points = actual, "Chunk verified");
                    return Ok(());
                }
                Some(actual) => UploadError::VerificationMismatch {
                    chunk: n,
                    expected: chunk.len(),
                    actual,
                },
                None => UploadError::UnreadablePointCount {
                    chunk: n,
                    response,
                },
            };

            if attempt > self.config.verify_retries {
                return Err(failure);
            }
            tracing::warn!(
                chunk = n,
                attempt,
                error = %failure,
                "Chunk verification failed, re-sending"
            );
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled { chunk: n });
            }
        }
    }

    async fn send_chunk(
        &self,
        chunk: &Chunk<'_>,
        total_chunks: usize,
        points_before: usize,
        points_total: usize,
    ) -> Result<(), KepcoError> {
        let n = chunk.ordinal();
        let cfg = self.config;

        let (per_cmd, byte_limit) = (cfg.values_per_command, cfg.command_byte_limit);

        for cmd in list_cmd::setup_commands(cfg.mode, chunk, per_cmd, byte_limit) {
            self.channel.send_command(&cmd).await?;
        }

        let mut sent = 0;
        for batch in list_cmd::value_commands(cfg.mode, chunk, per_cmd, byte_limit) {
            self.channel.send_command(&batch.command).await?;
            sent += batch.count;
            self.publish(
                n,
                total_chunks,
                points_before + sent,
                points_total,
                UploadState::ChunkSending(n),
            );
        }

        self.channel.sync().await
    }

    /// Drain the device error queue and fail if it held anything.
    ///
    /// # Errors
    /// `DeviceReportedError` with every entry read, or `Communication`.
    pub(crate) async fn check_errors(&self, chunk: Option<usize>) -> Result<(), UploadError> {
        let errors = self
            .channel
            .drain_errors()
            .await
            .map_err(|e| communication(chunk.unwrap_or(0), &e))?;
        if errors.is_empty() {
            return Ok(());
        }
        Err(UploadError::DeviceReportedError {
            chunk,
            message: errors.join("; "),
        })
    }

    fn fail(&self, mut result: UploadResult, err: UploadError) -> UploadResult {
        tracing::error!(peer = %self.channel.peer(), error = %err, "List upload failed");
        if let Some(tx) = self.progress {
            tx.send_modify(|p| p.state = UploadState::Failed);
        }
        result.error = Some(err);
        result
    }

    fn publish(
        &self,
        chunk: usize,
        chunks: usize,
        points_sent: usize,
        points_total: usize,
        state: UploadState,
    ) {
        if let Some(tx) = self.progress {
            tx.send_replace(UploadProgress {
                chunk,
                chunks,
                points_sent,
                points_total,
                state,
            });
        }
    }
}

fn after_chunk(chunk: &Option<usize>) -> String {
    chunk.map(|c| format!(" after chunk {}", c)).unwrap_or_default()
}

fn communication(chunk: usize, err: &KepcoError) -> UploadError {
    UploadError::Communication {
        chunk,
        message: err.to_string(),
    }
}
