//! TCP front end: the Telnet port and the raw socket port.
//!
//! Both listeners share one [`Device`]. On the Telnet port the simulator
//! opens with an option negotiation burst and echoes every command line
//! back as `command\r\n` before any reply, like the real interface card.
//! The raw port does neither. Replies end with `\n`.

use crate::device::{Device, Snapshot};
use crate::faults::Faults;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Telnet port of the real device.
pub const DEFAULT_TELNET_PORT: u16 = 5024;

/// Raw socket port of the real device.
pub const DEFAULT_SOCKET_PORT: u16 = 5025;

/// Unterminated input beyond this is discarded with error -223.
pub const MAX_RX_LINE_BYTES: usize = 1 << 20;

/// `IAC WILL ECHO`, `IAC WILL SUPPRESS-GO-AHEAD`.
const NEGOTIATION: [u8; 6] = [0xFF, 0xFB, 0x01, 0xFF, 0xFB, 0x03];

/// Which listener a command arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framing {
    /// Telnet port, echoing.
    Telnet,
    /// Raw socket port.
    Socket,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Framing::Telnet => "telnet",
            Framing::Socket => "socket",
        })
    }
}

/// Simulator startup options.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Listen address.
    pub bind: IpAddr,
    /// Telnet port; `Some(0)` picks a free port, `None` disables it.
    pub telnet_port: Option<u16>,
    /// Raw socket port; `Some(0)` picks a free port, `None` disables it.
    pub socket_port: Option<u16>,
    /// Send the Telnet negotiation burst on connect.
    pub negotiate: bool,
    /// Faults armed at startup.
    pub faults: Faults,
}

impl Default for SimConfig {
    /// Loopback, both ports ephemeral.
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            telnet_port: Some(0),
            socket_port: Some(0),
            negotiate: true,
            faults: Faults::none(),
        }
    }
}

impl SimConfig {
    /// The device's own ports on `bind`.
    #[must_use]
    pub fn standard(bind: IpAddr) -> Self {
        Self {
            bind,
            telnet_port: Some(DEFAULT_TELNET_PORT),
            socket_port: Some(DEFAULT_SOCKET_PORT),
            ..Self::default()
        }
    }

    /// Telnet port only.
    #[must_use]
    pub fn telnet_only(bind: IpAddr, port: u16) -> Self {
        Self {
            bind,
            telnet_port: Some(port),
            socket_port: None,
            ..Self::default()
        }
    }

    /// Raw socket port only.
    #[must_use]
    pub fn socket_only(bind: IpAddr, port: u16) -> Self {
        Self {
            bind,
            telnet_port: None,
            socket_port: Some(port),
            ..Self::default()
        }
    }

    /// Arm faults.
    #[must_use]
    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }
}

/// One received command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedCommand {
    /// Arrival time on the Tokio clock.
    pub at: Instant,
    /// Listener it arrived on.
    pub framing: Framing,
    /// The line, trimmed.
    pub line: String,
}

#[derive(Debug)]
struct Inner {
    device: Device,
    log: Vec<LoggedCommand>,
    list_owner: Option<u64>,
}

#[derive(Debug)]
struct Shared {
    inner: Mutex<Inner>,
    next_client: AtomicU64,
    negotiate: bool,
    shutdown: CancellationToken,
}

/// A running simulator.
///
/// Dropping it stops the listeners and disconnects all clients.
#[derive(Debug)]
pub struct Simulator {
    shared: Arc<Shared>,
    telnet_addr: Option<SocketAddr>,
    socket_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl Simulator {
    /// Bind the configured ports and start serving.
    ///
    /// # Errors
    /// A port could not be bound.
    pub async fn start(config: SimConfig) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                device: Device::new(config.faults),
                log: Vec::new(),
                list_owner: None,
            }),
            next_client: AtomicU64::new(1),
            negotiate: config.negotiate,
            shutdown: CancellationToken::new(),
        });

        let telnet = bind_listener(config.bind, config.telnet_port, Framing::Telnet).await?;
        let socket = bind_listener(config.bind, config.socket_port, Framing::Socket).await?;
        let telnet_addr = telnet.as_ref().map(|(_, addr)| *addr);
        let socket_addr = socket.as_ref().map(|(_, addr)| *addr);

        let tasks = [(telnet, Framing::Telnet), (socket, Framing::Socket)]
            .into_iter()
            .filter_map(|(bound, framing)| bound.map(|(listener, _)| (listener, framing)))
            .map(|(listener, framing)| {
                tokio::spawn(accept_loop(listener, framing, Arc::clone(&shared)))
            })
            .collect();

        Ok(Self {
            shared,
            telnet_addr,
            socket_addr,
            tasks,
        })
    }

    /// Telnet listener address.
    #[must_use]
    pub fn telnet_addr(&self) -> Option<SocketAddr> {
        self.telnet_addr
    }

    /// Raw socket listener address.
    #[must_use]
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.socket_addr
    }

    /// Every command received so far, in arrival order.
    pub async fn commands(&self) -> Vec<LoggedCommand> {
        self.shared.inner.lock().await.log.clone()
    }

    /// Command lines received so far.
    pub async fn command_lines(&self) -> Vec<String> {
        let inner = self.shared.inner.lock().await;
        inner.log.iter().map(|c| c.line.clone()).collect()
    }

    /// Forget the command log.
    pub async fn clear_log(&self) {
        self.shared.inner.lock().await.log.clear();
    }

    /// Current device state.
    pub async fn snapshot(&self) -> Snapshot {
        self.shared.inner.lock().await.device.snapshot()
    }

    /// Replace the armed faults.
    pub async fn set_faults(&self, faults: Faults) {
        *self.shared.inner.lock().await.device.faults_mut() = faults;
    }

    /// Run `f` against the device.
    pub async fn with_device<R>(&self, f: impl FnOnce(&mut Device) -> R) -> R {
        f(&mut self.shared.inner.lock().await.device)
    }

    /// Stop listening and disconnect every client.
    pub async fn stop(mut self) {
        self.shared.shutdown.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn bind_listener(
    ip: IpAddr,
    port: Option<u16>,
    framing: Framing,
) -> io::Result<Option<(TcpListener, SocketAddr)>> {
    let Some(port) = port else {
        return Ok(None);
    };
    let listener = TcpListener::bind((ip, port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, %framing, "Simulator listening");
    Ok(Some((listener, addr)))
}

async fn accept_loop(listener: TcpListener, framing: Framing, shared: Arc<Shared>) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let id = shared.next_client.fetch_add(1, Ordering::Relaxed);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    tracing::debug!(%peer, %framing, client = id, "Client connected");
                    if let Err(e) = serve_client(stream, id, framing, &shared).await {
                        tracing::debug!(%peer, client = id, error = %e, "Client I/O error");
                    }
                    release_client(id, &shared).await;
                    tracing::debug!(%peer, client = id, "Client disconnected");
                });
            }
            Err(e) => {
                tracing::warn!(%framing, error = %e, "Accept failed");
            }
        }
    }
}

async fn serve_client(
    mut stream: TcpStream,
    id: u64,
    framing: Framing,
    shared: &Shared,
) -> io::Result<()> {
    let _ = stream.set_nodelay(true);
    if framing == Framing::Telnet && shared.negotiate {
        stream.write_all(&NEGOTIATION).await?;
    }

    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => return Ok(()),
            read = stream.read(&mut chunk) => read?,
        };
        if n == 0 {
            return Ok(());
        }
        pending.extend_from_slice(&chunk[..n]);

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if line.is_empty() {
                continue;
            }

            let (reply, echo, iac, delay) = {
                let mut inner = shared.inner.lock().await;
                inner.log.push(LoggedCommand {
                    at: Instant::now(),
                    framing,
                    line: line.clone(),
                });
                let upper = line.to_uppercase();
                if upper.contains("VOLT:MODE LIST") || upper.contains("CURR:MODE LIST") {
                    inner.list_owner = Some(id);
                }
                let faults = inner.device.faults();
                let echo = framing == Framing::Telnet && !faults.suppress_echo;
                let iac = faults.iac_in_echo;
                let delay = faults.echo_delay;
                (inner.device.process(&line), echo, iac, delay)
            };

            if echo {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let text = format!("{}\r\n", line);
                if iac {
                    stream.write_all(&NEGOTIATION[..2]).await?;
                    stream.flush().await?;
                    stream.write_all(&NEGOTIATION[2..3]).await?;
                }
                stream.write_all(text.as_bytes()).await?;
            }
            if let Some(reply) = reply {
                stream.write_all(format!("{}\n", reply).as_bytes()).await?;
            }
        }

        if pending.len() > MAX_RX_LINE_BYTES {
            tracing::warn!(client = id, bytes = pending.len(), "Dropped oversized unterminated input");
            shared
                .inner
                .lock()
                .await
                .device
                .push_error(-223, "Too much data");
            pending.clear();
        }
    }
}

/// A list started by a client stops when that client goes away.
async fn release_client(id: u64, shared: &Shared) {
    let mut inner = shared.inner.lock().await;
    if inner.list_owner == Some(id) {
        inner.list_owner = None;
        inner.device.stop_list();
    }
}
