//! TCP transport to the BIT 802E.
//!
//! Two framings are supported:
//! - [`ProtocolMode::Line`]: the Telnet server on port 5024. The device
//!   negotiates options and echoes every command back.
//! - [`ProtocolMode::Raw`]: the plain socket on port 5025. No negotiation,
//!   no echo.

pub mod connection;
pub mod telnet;

pub use connection::{ByteStream, Connection};
pub use telnet::TelnetFilter;

use crate::limits::{SOCKET_PORT, TELNET_PORT};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Framing used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolMode {
    /// Telnet with option negotiation and command echo.
    #[default]
    Line,
    /// Raw socket, no echo.
    Raw,
}

impl ProtocolMode {
    /// Port the device serves this mode on.
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            ProtocolMode::Line => TELNET_PORT,
            ProtocolMode::Raw => SOCKET_PORT,
        }
    }

    /// Whether the device echoes commands in this mode.
    #[must_use]
    pub fn echoes(self) -> bool {
        matches!(self, ProtocolMode::Line)
    }
}

impl fmt::Display for ProtocolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolMode::Line => write!(f, "line"),
            ProtocolMode::Raw => write!(f, "raw"),
        }
    }
}
