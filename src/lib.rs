//! # Kepco LIST Core Library
//!
//! Communication and waveform-upload core for Kepco BIT 802E (BOP series)
//! power supplies. The library finds a device on the local subnet, holds a
//! paced SCPI conversation with it, uploads LIST waveforms in verified
//! chunks, and makes sure the output is switched off whenever a session
//! ends.
//!
//! ## Crate Structure
//!
//! - **`transport`**: TCP connection with Telnet control-marker filtering and
//!   line framing. See `transport::Connection`.
//! - **`channel`**: Paced command/query channel with echo handling and retries.
//!   See `channel::CommandChannel`.
//! - **`waveform`**: Waveform construction, validation and chunking, plus the
//!   periodic shape generator.
//! - **`upload`**: Chunked LIST upload with per-chunk point-count verification.
//! - **`session`**: Session lifecycle, run control and the output safety
//!   interlock.
//! - **`discovery`**: Concurrent, time-bounded /24 subnet scan.
//! - **`config`**: Figment-backed settings (TOML file + `KEPCO_` environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: The crate-wide `KepcoError` and `AppResult`.
//! - **`limits`**: Hardware limits and protocol timing constants.

pub mod channel;
pub mod config;
pub mod discovery;
pub mod error;
pub mod limits;
pub mod logging;
pub mod session;
pub mod transport;
pub mod upload;
pub mod waveform;

pub use channel::{ChannelConfig, CommandChannel};
pub use config::Settings;
pub use discovery::{DeviceEndpoint, DiscoveryConfig, Scanner};
pub use error::{AppResult, KepcoError};
pub use session::{InterlockReport, Session, SessionConfig};
pub use transport::ProtocolMode;
pub use upload::{ListMode, UploadConfig, UploadError, UploadResult, Uploader};
pub use waveform::{Waveform, WaveformPoint};
