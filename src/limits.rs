//! Hard device limits and protocol timing constants.
//!
//! This module centralizes:
//! - LIST size limits (points per waveform, points per upload)
//! - Dwell bounds accepted by the BIT 802E list engine
//! - Port numbers and default timeouts for the SCPI transports
//!
//! Every boundary check in the crate reads from here so the numbers are
//! tuned in exactly one place.

use std::time::Duration;

// =============================================================================
// LIST Limits
// =============================================================================

/// Maximum points in one waveform (four full list uploads).
pub const MAX_TOTAL_POINTS: usize = 4000;

/// Maximum points transferred in one list upload.
///
/// The card accepts 1002 steps; uploads stay at 1000 for headroom.
pub const MAX_CHUNK_POINTS: usize = 1000;

/// Shortest dwell the list engine accepts (500 µs).
pub const MIN_DWELL: Duration = Duration::from_micros(500);

/// Longest dwell the list engine accepts (10 s).
pub const MAX_DWELL: Duration = Duration::from_secs(10);

/// Values per `LIST:VOLT`/`LIST:CURR` command.
///
/// The manual examples never exceed 11 values per message.
pub const LIST_VALUES_PER_CMD: usize = 10;

/// Upper bound on values per command accepted by configuration.
pub const MAX_LIST_VALUES_PER_CMD: usize = 11;

/// Byte budget for one list command (input buffer is 253 bytes).
pub const LIST_CMD_BYTE_LIMIT: usize = 200;

// =============================================================================
// Ports
// =============================================================================

/// Telnet (line-mode) SCPI port.
pub const TELNET_PORT: u16 = 5024;

/// Raw socket SCPI port, used when Telnet is unavailable.
pub const SOCKET_PORT: u16 = 5025;

// =============================================================================
// Timing
// =============================================================================

/// Minimum gap between consecutive writes on one connection (35 ms).
///
/// The card needs ~25 ms per command; faster writers stall its firmware.
pub const COMMAND_GAP: Duration = Duration::from_millis(35);

/// Lowest command gap configuration may select.
pub const MIN_COMMAND_GAP: Duration = Duration::from_millis(25);

/// Timeout for establishing a TCP session.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a single query response.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Window for collecting the Telnet echo of a command.
pub const ECHO_TIMEOUT: Duration = Duration::from_millis(20);

/// Window for discarding the negotiation burst sent on connect.
pub const NEGOTIATION_DRAIN: Duration = Duration::from_millis(100);

/// Window for discarding late echoes before a line-mode query.
pub const STALE_DRAIN: Duration = Duration::from_millis(10);

/// Re-sends of a query that timed out.
pub const QUERY_RETRIES: u32 = 2;

/// Re-sends of a list chunk whose point count did not verify.
pub const VERIFY_RETRIES: u32 = 2;

/// Upper bound for any configured retry count.
pub const MAX_RETRIES: u32 = 10;

/// Extra wait after a chunk's nominal playback time before the next chunk.
pub const RUN_MARGIN: Duration = Duration::from_millis(100);

/// Maximum `SYST:ERR?` reads while draining the error queue.
pub const MAX_ERROR_DRAIN: usize = 20;

// =============================================================================
// Discovery
// =============================================================================

/// Connect-and-greet budget for one host.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Wall-clock ceiling for one subnet scan.
pub const SCAN_BUDGET: Duration = Duration::from_secs(3);

/// Probes in flight at once during a scan.
pub const SCAN_CONCURRENCY: usize = 64;

// =============================================================================
// Size Limits
// =============================================================================

/// Longest response line accepted before the transport gives up (64 KiB).
pub const MAX_LINE_BYTES: usize = 64 * 1024;
