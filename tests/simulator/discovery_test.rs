// Subnet discovery against simulators on loopback aliases

use kepco_list::discovery::{probe_port, DiscoveryConfig, ProbePort, Scanner};
use kepco_list::ProtocolMode;
use kepco_sim::{SimConfig, Simulator, IDN};
use serial_test::serial;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn loopback(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, last))
}

fn config_for(port: u16, mode: ProtocolMode) -> DiscoveryConfig {
    DiscoveryConfig {
        ports: vec![ProbePort { port, mode }],
        per_host_timeout: Duration::from_millis(300),
        scan_budget: Duration::from_secs(5),
        ..DiscoveryConfig::default()
    }
}

#[tokio::test]
#[serial]
async fn test_scan_finds_simulator() {
    let sim = Simulator::start(SimConfig::telnet_only(loopback(5), 0))
        .await
        .unwrap();
    let port = sim.telnet_addr().unwrap().port();

    let scanner = Scanner::new(Ipv4Addr::new(127, 0, 0, 0), config_for(port, ProtocolMode::Line));
    let found = scanner.collect(&CancellationToken::new()).await;

    assert_eq!(found.len(), 1, "{:?}", found);
    let endpoint = &found[0];
    assert_eq!(endpoint.address, loopback(5));
    assert_eq!(endpoint.port, port);
    assert_eq!(endpoint.mode, ProtocolMode::Line);
    assert_eq!(endpoint.identity.as_deref(), Some(IDN));
    assert!(endpoint.latency < Duration::from_millis(300));
    sim.stop().await;
}

#[tokio::test]
#[serial]
async fn test_scan_finds_both_ports_of_one_host() {
    let sim = Simulator::start(SimConfig {
        bind: loopback(6),
        ..SimConfig::default()
    })
    .await
    .unwrap();
    let telnet = sim.telnet_addr().unwrap().port();
    let socket = sim.socket_addr().unwrap().port();

    let config = DiscoveryConfig {
        ports: vec![
            ProbePort {
                port: telnet,
                mode: ProtocolMode::Line,
            },
            ProbePort {
                port: socket,
                mode: ProtocolMode::Raw,
            },
        ],
        ..config_for(telnet, ProtocolMode::Line)
    };
    let found = Scanner::new(Ipv4Addr::new(127, 0, 0, 0), config)
        .collect(&CancellationToken::new())
        .await;

    let ports: Vec<(u16, ProtocolMode)> = found.iter().map(|e| (e.port, e.mode)).collect();
    let mut expected = vec![(telnet, ProtocolMode::Line), (socket, ProtocolMode::Raw)];
    expected.sort_by_key(|(port, _)| *port);
    assert_eq!(ports, expected);
    sim.stop().await;
}

#[tokio::test]
async fn test_probe_rejects_unrecognised_identity() {
    let sim = Simulator::start(SimConfig::default()).await.unwrap();
    let port = sim.socket_addr().unwrap().port();
    let config = DiscoveryConfig {
        identity_markers: vec!["AGILENT".into()],
        ..config_for(port, ProtocolMode::Raw)
    };

    let probe = ProbePort {
        port,
        mode: ProtocolMode::Raw,
    };
    assert!(probe_port(loopback(1), probe, &config).await.is_none());

    let accepting = DiscoveryConfig {
        identity_markers: Vec::new(),
        ..config
    };
    assert!(probe_port(loopback(1), probe, &accepting).await.is_some());
}

#[tokio::test]
async fn test_cancelled_scan_returns_quickly() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    // TEST-NET-1 is never routed; probes would sit in connect.
    let scanner = Scanner::new(Ipv4Addr::new(192, 0, 2, 0), DiscoveryConfig::default());

    let started = tokio::time::Instant::now();
    let found = scanner.collect(&cancel).await;

    assert!(found.is_empty());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_scan_budget_caps_duration() {
    let config = DiscoveryConfig {
        per_host_timeout: Duration::from_secs(2),
        scan_budget: Duration::from_millis(300),
        ..DiscoveryConfig::default()
    };
    let scanner = Scanner::new(Ipv4Addr::new(192, 0, 2, 0), config);

    let started = tokio::time::Instant::now();
    let found = scanner.collect(&CancellationToken::new()).await;

    assert!(found.is_empty());
    assert!(started.elapsed() < Duration::from_secs(1));
}
