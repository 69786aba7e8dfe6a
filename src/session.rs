//! Session lifecycle and the output safety interlock.
//!
//! A [`Session`] owns the only [`CommandChannel`] to a device. Whatever
//! happens during the session, the channel is released through
//! [`Session::disconnect`], which first sends the interlock:
//!
//! ```text
//! VOLT 0  ->  CURR 0  ->  OUTP OFF  ->  close
//! ```
//!
//! Each interlock command is attempted even if the one before it failed,
//! and the connection is closed regardless. A `Session` dropped without
//! `disconnect` (an early `?`, a cancelled future, a panic) schedules the
//! same sequence on the current Tokio runtime.

use crate::channel::{ChannelConfig, CommandChannel};
use crate::discovery::DeviceEndpoint;
use crate::error::{AppResult, KepcoError};
use crate::limits::{RUN_MARGIN, SOCKET_PORT, TELNET_PORT};
use crate::transport::ProtocolMode;
use crate::upload::{ErrorCheck, UploadConfig, UploadProgress, UploadResult, Uploader};
use crate::waveform::Waveform;
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Zero both setpoints, then disable the output.
pub const INTERLOCK_COMMANDS: [&str; 3] = ["VOLT 0", "CURR 0", "OUTP OFF"];

/// Leave list mode and return to fixed voltage output, disabled.
pub const STOP_COMMANDS: [&str; 4] = [
    "VOLT:MODE FIX",
    "CURR:MODE FIX",
    "OUTP OFF",
    "FUNC:MODE VOLT",
];

/// Everything a session needs to know.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Pacing and timeouts.
    pub channel: ChannelConfig,
    /// Upload protocol parameters.
    pub upload: UploadConfig,
    /// Slack added to each chunk's playback time in multi-chunk runs.
    pub run_margin: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            upload: UploadConfig::default(),
            run_margin: RUN_MARGIN,
        }
    }
}

/// Outcome of the interlock sequence.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InterlockReport {
    /// Commands that were sent successfully, in order.
    pub sent: Vec<&'static str>,
    /// Commands that failed, with the error text.
    pub failed: Vec<(&'static str, String)>,
    /// True when the session had already been disconnected.
    pub already_disconnected: bool,
}

impl InterlockReport {
    /// True when every interlock command went out.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Send the interlock triplet, logging and skipping failures.
pub async fn interlock(channel: &CommandChannel) -> InterlockReport {
    let mut report = InterlockReport::default();
    for cmd in INTERLOCK_COMMANDS {
        match channel.send_command(cmd).await {
            Ok(()) => report.sent.push(cmd),
            Err(e) => {
                tracing::error!(
                    peer = %channel.peer(),
                    command = cmd,
                    error = %e,
                    "Interlock command failed"
                );
                report.failed.push((cmd, e.to_string()));
            }
        }
    }
    report
}

/// An open, interlocked device session.
///
/// Close a session with [`disconnect`](Self::disconnect) or run it inside
/// [`scoped`](Self::scoped); both send the interlock before returning.
/// Dropping a connected session only spawns the interlock on the current
/// runtime. That task is lost if the runtime is shutting down, for example
/// when `#[tokio::main]` returns, so the output may stay on.
pub struct Session {
    channel: Option<CommandChannel>,
    config: SessionConfig,
    identity: Option<String>,
    uploaded: Option<Waveform>,
    resident_chunk: Option<usize>,
    progress: watch::Sender<UploadProgress>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.channel.as_ref().map(CommandChannel::peer))
            .field("identity", &self.identity)
            .field("uploaded_points", &self.uploaded.as_ref().map(Waveform::len))
            .field("resident_chunk", &self.resident_chunk)
            .finish()
    }
}

impl Session {
    /// Open a session to exactly `endpoint`.
    ///
    /// The device identity is read and cached; a device that does not
    /// answer `*IDN?` still yields a session.
    ///
    /// # Errors
    /// `KepcoError::Connect` if the endpoint cannot be reached.
    pub async fn connect(endpoint: &DeviceEndpoint, config: SessionConfig) -> AppResult<Self> {
        let host = endpoint.address.to_string();
        let channel = CommandChannel::open(
            &host,
            endpoint.port,
            endpoint.mode,
            config.channel.clone(),
        )
        .await?;
        let mut session = Self::with_channel(channel, config);

        if let Some(channel) = session.channel.as_ref() {
            match channel.identity().await {
                Ok(idn) => {
                    tracing::info!(peer = %channel.peer(), identity = %idn, "Session opened");
                    session.identity = Some(idn);
                }
                Err(e) => {
                    tracing::warn!(peer = %channel.peer(), error = %e, "Device did not identify");
                }
            }
        }
        Ok(session)
    }

    /// Open a session to `host`, trying Telnet on 5024 and then the raw
    /// socket on 5025.
    ///
    /// # Errors
    /// The last connect error if neither port answers.
    pub async fn connect_host(host: &str, config: SessionConfig) -> AppResult<Self> {
        let address = host.parse().map_err(|e| KepcoError::connect(host, TELNET_PORT, e))?;
        let mut last = None;
        let attempts = [
            (TELNET_PORT, ProtocolMode::Line),
            (SOCKET_PORT, ProtocolMode::Raw),
        ];
        for (port, mode) in attempts {
            let endpoint = DeviceEndpoint::new(address, port, mode);
            match Self::connect(&endpoint, config.clone()).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    tracing::debug!(host, port, error = %e, "Connect attempt failed");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or(KepcoError::NotConnected))
    }

    /// Wrap an open channel. No identity query is made.
    #[must_use]
    pub fn with_channel(channel: CommandChannel, config: SessionConfig) -> Self {
        let (progress, _) = watch::channel(UploadProgress::default());
        Self {
            channel: Some(channel),
            config,
            identity: None,
            uploaded: None,
            resident_chunk: None,
            progress,
        }
    }

    /// Connect, run `f`, and disconnect on every exit path.
    ///
    /// The interlock runs after `f` returns, whether it succeeded or not.
    /// If the returned future is dropped midway, the session's `Drop`
    /// schedules the interlock instead.
    ///
    /// # Errors
    /// A connect error, or whatever `f` returns.
    pub async fn scoped<T, F>(endpoint: &DeviceEndpoint, config: SessionConfig, f: F) -> AppResult<T>
    where
        F: for<'s> FnOnce(&'s mut Session) -> BoxFuture<'s, AppResult<T>>,
    {
        let mut session = Self::connect(endpoint, config).await?;
        let result = f(&mut session).await;
        let report = session.disconnect().await;
        if !report.is_clean() {
            tracing::warn!(failed = report.failed.len(), "Session closed with interlock failures");
        }
        result
    }

    /// Cached `*IDN?` reply.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// True until `disconnect` has run.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// The session's channel, for direct SCPI access.
    ///
    /// # Errors
    /// `NotConnected` after disconnect.
    pub fn channel(&self) -> AppResult<&CommandChannel> {
        self.channel.as_ref().ok_or(KepcoError::NotConnected)
    }

    /// Session parameters.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to upload progress.
    #[must_use]
    pub fn progress(&self) -> watch::Receiver<UploadProgress> {
        self.progress.subscribe()
    }

    /// Upload `waveform` and verify every chunk.
    ///
    /// On success the waveform is remembered for [`run`](Self::run); on
    /// failure any previously uploaded waveform is forgotten, since the
    /// device list no longer matches it.
    ///
    /// # Errors
    /// `NotConnected` after disconnect. Protocol failures are reported in
    /// the returned [`UploadResult`].
    pub async fn prepare_and_upload(
        &mut self,
        waveform: &Waveform,
        cancel: &CancellationToken,
    ) -> AppResult<UploadResult> {
        let channel = self.channel.as_ref().ok_or(KepcoError::NotConnected)?;
        self.uploaded = None;
        self.resident_chunk = None;

        let result = Uploader::new(channel, &self.config.upload)
            .with_progress(&self.progress)
            .upload(waveform, cancel)
            .await;

        if result.is_success() {
            let chunks = waveform.chunk(self.config.upload.chunk_size).len();
            self.resident_chunk = chunks.checked_sub(1);
            self.uploaded = Some(waveform.clone());
        }
        Ok(result)
    }

    /// Start list playback.
    ///
    /// A single-chunk list runs once, or indefinitely (`LIST:COUN 0`) when
    /// `looping`; the call returns as soon as the device is running. A
    /// multi-chunk waveform is played chunk by chunk in upload order: each
    /// chunk is made resident (re-uploaded and verified unless it already
    /// is), run once, and waited out. The error queue is read after each
    /// re-upload, or after each pass with [`ErrorCheck::AfterAll`]. With
    /// `looping` this repeats until `cancel` fires.
    ///
    /// # Errors
    /// `NoListLoaded` before a successful upload, `Cancelled` when `cancel`
    /// fires during a multi-chunk run, `Upload` if re-uploading a chunk
    /// fails or the device queues an error during playback, or a channel
    /// error.
    pub async fn run(&mut self, looping: bool, cancel: &CancellationToken) -> AppResult<()> {
        let channel = self.channel.as_ref().ok_or(KepcoError::NotConnected)?;
        let waveform = self.uploaded.as_ref().ok_or(KepcoError::NoListLoaded)?;
        let upload = &self.config.upload;
        let chunks = waveform.chunk(upload.chunk_size);

        if chunks.len() == 1 {
            let count = if looping { 0 } else { 1 };
            start_list(channel, upload, count).await?;
            tracing::info!(peer = %channel.peer(), count, "List running");
            return Ok(());
        }

        let uploader = Uploader::new(channel, upload).with_progress(&self.progress);
        loop {
            for chunk in &chunks {
                if cancel.is_cancelled() {
                    return Err(KepcoError::Cancelled);
                }
                if self.resident_chunk != Some(chunk.index) {
                    self.resident_chunk = None;
                    uploader
                        .send_verified(chunk, chunks.len(), chunk.offset, waveform.len(), cancel)
                        .await?;
                    if upload.error_check == ErrorCheck::PerChunk {
                        uploader.check_errors(Some(chunk.ordinal())).await?;
                    }
                    self.resident_chunk = Some(chunk.index);
                }

                start_list(channel, upload, 1).await?;
                let playback = chunk.duration() + self.config.run_margin;
                tracing::info!(
                    chunk = chunk.ordinal(),
                    chunks = chunks.len(),
                    ?playback,
                    "Chunk running"
                );
                tokio::select! {
                    _ = tokio::time::sleep(playback) => {}
                    _ = cancel.cancelled() => return Err(KepcoError::Cancelled),
                }
            }
            if upload.error_check == ErrorCheck::AfterAll {
                uploader.check_errors(None).await?;
            }
            if !looping {
                return Ok(());
            }
        }
    }

    /// Leave list mode and disable the output.
    ///
    /// # Errors
    /// The first command that fails.
    pub async fn stop(&self) -> AppResult<()> {
        let channel = self.channel()?;
        for cmd in STOP_COMMANDS {
            channel.send_command(cmd).await?;
        }
        tracing::info!(peer = %channel.peer(), "List stopped");
        Ok(())
    }

    /// Send the interlock, then close the connection.
    ///
    /// Safe to call repeatedly; later calls report `already_disconnected`.
    pub async fn disconnect(&mut self) -> InterlockReport {
        let Some(channel) = self.channel.take() else {
            return InterlockReport {
                already_disconnected: true,
                ..InterlockReport::default()
            };
        };
        let report = interlock(&channel).await;
        channel.close().await;
        tracing::info!(peer = %channel.peer(), clean = report.is_clean(), "Session closed");
        report
    }
}

/// Best-effort interlock. Not sent if the runtime is gone or shutting down.
impl Drop for Session {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(
                    peer = %channel.peer(),
                    "Session dropped while connected, sending interlock"
                );
                handle.spawn(async move {
                    interlock(&channel).await;
                    channel.close().await;
                });
            }
            Err(_) => {
                tracing::error!(
                    peer = %channel.peer(),
                    "Session dropped outside a runtime, interlock not sent"
                );
            }
        }
    }
}

async fn start_list(channel: &CommandChannel, upload: &UploadConfig, count: u32) -> AppResult<()> {
    channel.send_command(&format!("LIST:COUN {}", count)).await?;
    channel.send_command("OUTP ON").await?;
    channel
        .send_command(&format!("{}:MODE LIST", upload.mode.mnemonic()))
        .await
}
