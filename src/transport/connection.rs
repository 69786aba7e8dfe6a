//! Byte-level connection to a BIT 802E.
//!
//! A [`Connection`] owns one stream and turns it into clean lines of payload.
//! In [`ProtocolMode::Line`] every read passes through a [`TelnetFilter`] and
//! every write is scrubbed of control markers; [`ProtocolMode::Raw`] passes
//! bytes through untouched. Echo handling is not done here; that is the
//! command channel's job.

use super::telnet::{self, TelnetFilter};
use super::ProtocolMode;
use crate::error::{AppResult, KepcoError};
use crate::limits::MAX_LINE_BYTES;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

/// Any bidirectional byte stream a connection can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

const READ_CHUNK: usize = 512;

/// An open transport session to one device port.
pub struct Connection {
    host: String,
    port: u16,
    mode: ProtocolMode,
    stream: Option<Box<dyn ByteStream>>,
    filter: TelnetFilter,
    pending: Vec<u8>,
    alive: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("mode", &self.mode)
            .field("alive", &self.alive)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Connection {
    /// Open a TCP connection to `host:port`.
    ///
    /// # Errors
    /// `KepcoError::Connect` when the connection is refused, unresolvable,
    /// or not established within `connect_timeout`.
    pub async fn open(
        host: &str,
        port: u16,
        mode: ProtocolMode,
        connect_timeout: Duration,
    ) -> AppResult<Self> {
        let stream = match timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(KepcoError::connect(host, port, e)),
            Err(_) => {
                return Err(KepcoError::connect(
                    host,
                    port,
                    format!("no answer within {:?}", connect_timeout),
                ))
            }
        };

        // Commands are tiny; do not let Nagle hold them back.
        stream
            .set_nodelay(true)
            .map_err(|e| KepcoError::connect(host, port, e))?;

        tracing::info!(host, port, %mode, "Transport connected");
        Ok(Self::from_stream(stream, host, port, mode))
    }

    /// Wrap an already-open stream.
    pub fn from_stream(
        stream: impl ByteStream + 'static,
        host: impl Into<String>,
        port: u16,
        mode: ProtocolMode,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            mode,
            stream: Some(Box::new(stream)),
            filter: TelnetFilter::new(),
            pending: Vec::new(),
            alive: true,
        }
    }

    /// Host this connection was opened to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port this connection was opened to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Framing mode of this connection.
    #[must_use]
    pub fn mode(&self) -> ProtocolMode {
        self.mode
    }

    /// `host:port` for log messages.
    #[must_use]
    pub fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// False once the peer closed, an I/O error occurred, or `close` ran.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Send bytes to the device.
    ///
    /// In line mode any control marker in `bytes` is removed first.
    ///
    /// # Errors
    /// `ConnectionClosed` after close; `Io` if the write fails (the
    /// connection is then marked dead).
    pub async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        let scrubbed;
        let payload = match self.mode {
            ProtocolMode::Line => {
                scrubbed = telnet::strip(bytes);
                scrubbed.as_slice()
            }
            ProtocolMode::Raw => bytes,
        };

        let stream = self.stream.as_mut().ok_or(KepcoError::ConnectionClosed)?;
        let result = async {
            stream.write_all(payload).await?;
            stream.flush().await
        }
        .await;

        if let Err(e) = result {
            self.alive = false;
            return Err(KepcoError::Io(e));
        }
        Ok(())
    }

    /// Read one line of payload, without its `\r\n` terminator.
    ///
    /// Bytes after the line stay buffered for the next call. Partial data
    /// read before a timeout is kept as well.
    ///
    /// # Errors
    /// `Timeout` when no full line arrives within `wait`,
    /// `ConnectionClosed` when the peer hangs up.
    pub async fn read_line(&mut self, wait: Duration) -> AppResult<Vec<u8>> {
        let deadline = Instant::now() + wait;
        let mut buf = [0u8; READ_CHUNK];

        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            if self.pending.len() > MAX_LINE_BYTES {
                self.pending.clear();
                return Err(KepcoError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unterminated line exceeds {} bytes", MAX_LINE_BYTES),
                )));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(KepcoError::Timeout {
                    command: String::new(),
                    after: wait,
                });
            }

            let n = self.read_some(&mut buf, remaining).await?;
            match n {
                Some(n) => self.ingest(&buf[..n]),
                None => {
                    return Err(KepcoError::Timeout {
                        command: String::new(),
                        after: wait,
                    })
                }
            }
        }
    }

    /// Discard whatever arrives within `window`.
    ///
    /// A zero window still takes bytes that are already readable. Returns
    /// the number of payload bytes thrown away, including bytes already
    /// buffered.
    ///
    /// # Errors
    /// `ConnectionClosed` or `Io` if the stream fails while draining.
    pub async fn drain(&mut self, window: Duration) -> AppResult<usize> {
        let deadline = Instant::now() + window;
        let mut buf = [0u8; READ_CHUNK];
        let mut discarded = self.discard_buffered();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.read_some(&mut buf, remaining).await? {
                Some(n) => {
                    self.ingest(&buf[..n]);
                    discarded += self.discard_buffered();
                    if n < buf.len() && Instant::now() >= deadline {
                        break;
                    }
                }
                None => break,
            }
        }
        Ok(discarded)
    }

    /// Drop buffered payload without touching the socket.
    pub fn discard_buffered(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }

    /// Close the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        self.alive = false;
        self.pending.clear();
        self.filter.reset();
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(peer = %self.peer(), error = %e, "Shutdown after close failed");
            }
            tracing::info!(peer = %self.peer(), "Transport closed");
        }
    }

    /// One read bounded by `wait`; `None` on timeout.
    async fn read_some(&mut self, buf: &mut [u8], wait: Duration) -> AppResult<Option<usize>> {
        let stream = self.stream.as_mut().ok_or(KepcoError::ConnectionClosed)?;
        match timeout(wait, stream.read(buf)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => {
                self.alive = false;
                Err(KepcoError::ConnectionClosed)
            }
            Ok(Ok(n)) => Ok(Some(n)),
            Ok(Err(e)) => {
                self.alive = false;
                Err(KepcoError::Io(e))
            }
        }
    }

    fn ingest(&mut self, raw: &[u8]) {
        match self.mode {
            ProtocolMode::Line => self.filter.feed(raw, &mut self.pending),
            ProtocolMode::Raw => self.pending.extend_from_slice(raw),
        }
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }
}
