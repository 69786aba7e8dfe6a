//! SCPI command/query channel with pacing and echo suppression.
//!
//! The BIT 802E processes roughly one command every 25 ms and echoes every
//! line it receives on the Telnet port. [`CommandChannel`] hides both facts:
//!
//! - every write waits until `command_gap` has elapsed since the end of the
//!   previous write on the same connection;
//! - in line mode a command's echo is consumed before the call returns, and
//!   a query's echo is skipped before its response is read.
//!
//! All entry points take the internal lock for the full
//! write-drain-read cycle, so concurrent callers are serialized and their
//! echoes can never interleave.

use crate::error::{AppResult, KepcoError};
use crate::limits::{
    COMMAND_GAP, CONNECT_TIMEOUT, ECHO_TIMEOUT, MAX_ERROR_DRAIN, NEGOTIATION_DRAIN, QUERY_RETRIES,
    QUERY_TIMEOUT, STALE_DRAIN,
};
use crate::transport::{Connection, ProtocolMode};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Device error query.
pub const ERROR_QUERY: &str = "SYST:ERR?";

/// Timing and retry parameters for a [`CommandChannel`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Bound for establishing the TCP session.
    pub connect_timeout: Duration,
    /// Bound for one query response.
    pub query_timeout: Duration,
    /// Window for collecting a command's echo in line mode.
    pub echo_timeout: Duration,
    /// Minimum gap from the end of one write to the start of the next.
    pub command_gap: Duration,
    /// Re-sends of a query that timed out.
    pub query_retries: u32,
    /// Window for discarding the Telnet negotiation burst after connect.
    pub negotiation_drain: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            query_timeout: QUERY_TIMEOUT,
            echo_timeout: ECHO_TIMEOUT,
            command_gap: COMMAND_GAP,
            query_retries: QUERY_RETRIES,
            negotiation_drain: NEGOTIATION_DRAIN,
        }
    }
}

/// Last-write bookkeeping for one connection.
#[derive(Debug)]
struct Pacer {
    gap: Duration,
    last_write: Option<Instant>,
}

impl Pacer {
    fn new(gap: Duration) -> Self {
        Self {
            gap,
            last_write: None,
        }
    }

    async fn wait(&self) {
        if let Some(last) = self.last_write {
            sleep_until(last + self.gap).await;
        }
    }

    fn mark(&mut self) {
        self.last_write = Some(Instant::now());
    }
}

#[derive(Debug)]
struct ChannelState {
    conn: Connection,
    pacer: Pacer,
}

impl ChannelState {
    fn ensure_alive(&self) -> AppResult<()> {
        if self.conn.is_alive() {
            Ok(())
        } else {
            Err(KepcoError::ConnectionClosed)
        }
    }

    async fn paced_write(&mut self, cmd: &str) -> AppResult<()> {
        self.pacer.wait().await;
        let line = format!("{}\n", cmd);
        let result = self.conn.write(line.as_bytes()).await;
        self.pacer.mark();
        result
    }
}

/// Serialized SCPI access to one device connection.
#[derive(Debug)]
pub struct CommandChannel {
    state: Mutex<ChannelState>,
    config: ChannelConfig,
    peer: String,
    mode: ProtocolMode,
}

impl CommandChannel {
    /// Open a connection and wrap it.
    ///
    /// In line mode the device's option negotiation is drained before the
    /// channel is handed out.
    ///
    /// # Errors
    /// `KepcoError::Connect` if the transport cannot be opened.
    pub async fn open(
        host: &str,
        port: u16,
        mode: ProtocolMode,
        config: ChannelConfig,
    ) -> AppResult<Self> {
        let mut conn = Connection::open(host, port, mode, config.connect_timeout).await?;
        if mode == ProtocolMode::Line {
            let dropped = conn.drain(config.negotiation_drain).await?;
            tracing::debug!(peer = %conn.peer(), bytes = dropped, "Drained connect negotiation");
        }
        Ok(Self::from_connection(conn, config))
    }

    /// Wrap an already-open connection.
    #[must_use]
    pub fn from_connection(conn: Connection, config: ChannelConfig) -> Self {
        let peer = conn.peer();
        let mode = conn.mode();
        Self {
            state: Mutex::new(ChannelState {
                conn,
                pacer: Pacer::new(config.command_gap),
            }),
            config,
            peer,
            mode,
        }
    }

    /// `host:port` of the device.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Framing of the underlying connection.
    #[must_use]
    pub fn mode(&self) -> ProtocolMode {
        self.mode
    }

    /// Channel timing parameters.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Send a command that produces no response.
    ///
    /// In line mode the echo is drained before returning. A missing echo
    /// only logs a warning.
    ///
    /// # Errors
    /// `ConnectionClosed` or `Io` when the connection fails.
    pub async fn send_command(&self, cmd: &str) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_alive()?;

        tracing::debug!(peer = %self.peer, command = cmd, "SCPI write");
        state.paced_write(cmd).await?;

        if self.mode.echoes() {
            self.drain_echo(&mut state, cmd).await?;
        }
        Ok(())
    }

    /// Send a query and return its trimmed response line.
    ///
    /// Uses the configured query timeout and retry count.
    ///
    /// # Errors
    /// `Timeout` once all attempts went unanswered; `ConnectionClosed` or
    /// `Io` when the connection fails.
    pub async fn query(&self, cmd: &str) -> AppResult<String> {
        self.query_with_timeout(cmd, self.config.query_timeout).await
    }

    /// Like [`query`](Self::query) with an explicit per-attempt timeout.
    ///
    /// # Errors
    /// See [`query`](Self::query).
    pub async fn query_with_timeout(&self, cmd: &str, wait: Duration) -> AppResult<String> {
        let mut state = self.state.lock().await;
        state.ensure_alive()?;

        let mut attempt = 0;
        loop {
            match self.query_once(&mut state, cmd, wait).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.config.query_retries => {
                    attempt += 1;
                    tracing::warn!(
                        peer = %self.peer,
                        query = cmd,
                        attempt,
                        "Query timed out, re-sending"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read one entry from the device error queue, verbatim.
    ///
    /// Use [`is_no_error`] to interpret the response.
    ///
    /// # Errors
    /// See [`query`](Self::query).
    pub async fn query_error(&self) -> AppResult<String> {
        self.query(ERROR_QUERY).await
    }

    /// Read the error queue until it reports no error.
    ///
    /// Returns every error entry read, oldest first. Stops after
    /// `MAX_ERROR_DRAIN` reads.
    ///
    /// # Errors
    /// See [`query`](Self::query).
    pub async fn drain_errors(&self) -> AppResult<Vec<String>> {
        let mut errors = Vec::new();
        for _ in 0..MAX_ERROR_DRAIN {
            let response = self.query_error().await?;
            if is_no_error(&response) {
                break;
            }
            errors.push(response);
        }
        Ok(errors)
    }

    /// `*IDN?`
    ///
    /// # Errors
    /// See [`query`](Self::query).
    pub async fn identity(&self) -> AppResult<String> {
        self.query("*IDN?").await
    }

    /// `*WAI`: hold the device's command processor until pending
    /// operations finish.
    ///
    /// # Errors
    /// See [`send_command`](Self::send_command).
    pub async fn sync(&self) -> AppResult<()> {
        self.send_command("*WAI").await
    }

    /// False after the peer closed, an I/O error, or `close`.
    pub async fn is_alive(&self) -> bool {
        self.state.lock().await.conn.is_alive()
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        self.state.lock().await.conn.close().await;
    }

    async fn query_once(
        &self,
        state: &mut ChannelState,
        cmd: &str,
        wait: Duration,
    ) -> AppResult<String> {
        // A late echo of the previous command can land during the gap.
        state.pacer.wait().await;
        let window = if self.mode.echoes() {
            STALE_DRAIN
        } else {
            Duration::ZERO
        };
        let stale = state.conn.drain(window).await?;
        if stale > 0 {
            tracing::debug!(peer = %self.peer, bytes = stale, "Discarded stale input");
        }

        tracing::debug!(peer = %self.peer, query = cmd, "SCPI query");
        state.paced_write(cmd).await?;

        let deadline = Instant::now() + wait;
        let echo = cmd.trim();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = state
                .conn
                .read_line(remaining)
                .await
                .map_err(|e| name_timeout(e, cmd, wait))?;
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if text.is_empty() || (self.mode.echoes() && text == echo) {
                continue;
            }
            tracing::debug!(peer = %self.peer, query = cmd, response = %text, "SCPI response");
            return Ok(text);
        }
    }

    async fn drain_echo(&self, state: &mut ChannelState, cmd: &str) -> AppResult<()> {
        let deadline = Instant::now() + self.config.echo_timeout;
        let echo = cmd.trim();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match state.conn.read_line(remaining).await {
                Ok(line) => {
                    let text = String::from_utf8_lossy(&line);
                    if text.trim() == echo {
                        return Ok(());
                    }
                    tracing::debug!(peer = %self.peer, line = %text, "Discarded unexpected line");
                }
                Err(KepcoError::Timeout { .. }) => {
                    tracing::warn!(
                        peer = %self.peer,
                        command = cmd,
                        window = ?self.config.echo_timeout,
                        "No echo within window, continuing"
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// True when an error-queue response means "no error".
///
/// An empty response, a response starting with `0`, or one containing
/// `No error` all qualify.
#[must_use]
pub fn is_no_error(response: &str) -> bool {
    let r = response.trim();
    r.is_empty() || r.starts_with('0') || r.contains("No error")
}

fn name_timeout(err: KepcoError, cmd: &str, wait: Duration) -> KepcoError {
    match err {
        KepcoError::Timeout { .. } => KepcoError::Timeout {
            command: cmd.to_string(),
            after: wait,
        },
        other => other,
    }
}
