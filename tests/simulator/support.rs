// Shared fixtures for simulator-backed tests

use kepco_list::channel::ChannelConfig;
use kepco_list::waveform::{Waveform, WaveformPoint};
use kepco_list::{DeviceEndpoint, ProtocolMode, SessionConfig};
use kepco_sim::{Faults, SimConfig, Simulator};
use std::time::Duration;

/// Channel timing tightened so multi-chunk uploads finish quickly.
pub fn fast_channel() -> ChannelConfig {
    ChannelConfig {
        command_gap: Duration::from_millis(1),
        query_timeout: Duration::from_secs(1),
        negotiation_drain: Duration::from_millis(50),
        ..ChannelConfig::default()
    }
}

/// Session config using [`fast_channel`].
pub fn fast_session() -> SessionConfig {
    SessionConfig {
        channel: fast_channel(),
        ..SessionConfig::default()
    }
}

/// Loopback simulator with both ports ephemeral.
pub async fn start_sim(faults: Faults) -> Simulator {
    Simulator::start(SimConfig::default().with_faults(faults))
        .await
        .unwrap()
}

/// Telnet endpoint of `sim`.
pub fn telnet_endpoint(sim: &Simulator) -> DeviceEndpoint {
    let addr = sim.telnet_addr().unwrap();
    DeviceEndpoint::new(addr.ip(), addr.port(), ProtocolMode::Line)
}

/// Raw socket endpoint of `sim`.
pub fn socket_endpoint(sim: &Simulator) -> DeviceEndpoint {
    let addr = sim.socket_addr().unwrap();
    DeviceEndpoint::new(addr.ip(), addr.port(), ProtocolMode::Raw)
}

/// `len` points rising by 0.01 from zero, all with `dwell`.
pub fn ramp(len: usize, dwell: Duration) -> Waveform {
    Waveform::new(
        (0..len)
            .map(|i| WaveformPoint::new(i as f64 * 0.01, dwell))
            .collect(),
    )
    .unwrap()
}

/// How many logged lines equal `line`.
pub fn count(lines: &[String], line: &str) -> usize {
    lines.iter().filter(|l| l.as_str() == line).count()
}
