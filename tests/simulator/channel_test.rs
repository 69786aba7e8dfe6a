// Command channel against the simulator
//
// Pacing, echo handling on the Telnet port, Telnet control sequences
// inside the data stream, and query retry after a lost reply.

use super::support::{fast_channel, start_sim, socket_endpoint, telnet_endpoint};
use kepco_list::channel::{ChannelConfig, CommandChannel};
use kepco_list::limits::COMMAND_GAP;
use kepco_list::{DeviceEndpoint, KepcoError};
use kepco_sim::{Faults, IDN};
use std::time::Duration;

async fn open(endpoint: &DeviceEndpoint, config: ChannelConfig) -> CommandChannel {
    CommandChannel::open(
        &endpoint.address.to_string(),
        endpoint.port,
        endpoint.mode,
        config,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_writes_are_paced_at_the_device() {
    let sim = start_sim(Faults::none()).await;
    let channel = open(&socket_endpoint(&sim), ChannelConfig::default()).await;

    for v in 0..8 {
        channel.send_command(&format!("VOLT {}", v)).await.unwrap();
    }
    assert_eq!(channel.query("*OPC?").await.unwrap(), "1");

    let log = sim.commands().await;
    assert_eq!(log.len(), 9);
    // Arrival jitter on loopback is well under 5 ms.
    let floor = COMMAND_GAP - Duration::from_millis(5);
    for pair in log.windows(2) {
        let gap = pair[1].at.duration_since(pair[0].at);
        assert!(gap >= floor, "gap {:?} between {:?} and {:?}", gap, pair[0].line, pair[1].line);
    }
}

#[tokio::test]
async fn test_telnet_echo_never_reaches_the_caller() {
    let sim = start_sim(Faults::none()).await;
    let channel = open(&telnet_endpoint(&sim), fast_channel()).await;

    channel.send_command("OUTP ON").await.unwrap();
    channel.send_command("VOLT 3").await.unwrap();
    assert_eq!(channel.identity().await.unwrap(), IDN);
    assert_eq!(channel.query("OUTP?").await.unwrap(), "1");
    assert_eq!(channel.query("VOLT?").await.unwrap(), "3.000000E+00");
}

#[tokio::test]
async fn test_control_sequences_inside_echo_are_filtered() {
    let sim = start_sim(Faults::none().with_iac_in_echo()).await;
    let channel = open(&telnet_endpoint(&sim), fast_channel()).await;

    channel.send_command("LIST:CLE").await.unwrap();
    assert_eq!(channel.identity().await.unwrap(), IDN);
    assert_eq!(channel.query("LIST:VOLT:POIN?").await.unwrap(), "0");
}

#[tokio::test]
async fn test_missing_echo_is_tolerated() {
    let sim = start_sim(Faults::none().without_echo()).await;
    let channel = open(&telnet_endpoint(&sim), fast_channel()).await;

    channel.send_command("VOLT 1").await.unwrap();
    assert_eq!(channel.identity().await.unwrap(), IDN);
}

#[tokio::test]
async fn test_late_echo_inside_gap_is_discarded() {
    // Echo lands after the echo window but before the next paced write.
    let sim = start_sim(Faults::none().with_echo_delay(Duration::from_millis(25))).await;
    let channel = open(&telnet_endpoint(&sim), ChannelConfig::default()).await;

    channel.send_command("LIST:CLE").await.unwrap();
    channel.sync().await.unwrap();
    assert_eq!(channel.query("LIST:VOLT:POIN?").await.unwrap(), "0");
    channel.send_command("OUTP OFF").await.unwrap();
    assert_eq!(channel.identity().await.unwrap(), IDN);
}

#[tokio::test]
async fn test_lost_reply_is_retried() {
    let sim = start_sim(Faults::none().with_dropped_replies("*IDN?", 1)).await;
    let config = ChannelConfig {
        query_timeout: Duration::from_millis(200),
        ..fast_channel()
    };
    let channel = open(&socket_endpoint(&sim), config).await;

    assert_eq!(channel.identity().await.unwrap(), IDN);
    let idn_queries = sim
        .command_lines()
        .await
        .iter()
        .filter(|l| l.as_str() == "*IDN?")
        .count();
    assert_eq!(idn_queries, 2);
}

#[tokio::test]
async fn test_error_queue_drains_in_order() {
    let sim = start_sim(Faults::none()).await;
    let channel = open(&socket_endpoint(&sim), fast_channel()).await;

    channel.send_command("FROB").await.unwrap();
    channel.send_command("LIST:DWEL 20").await.unwrap();
    let errors = channel.drain_errors().await.unwrap();

    assert_eq!(errors.len(), 2);
    assert!(errors[0].starts_with("-100"));
    assert!(errors[1].starts_with("-222"));
    assert!(channel.drain_errors().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_simulator_shutdown_closes_channel() {
    let sim = start_sim(Faults::none()).await;
    let channel = open(&socket_endpoint(&sim), fast_channel()).await;
    assert_eq!(channel.identity().await.unwrap(), IDN);

    sim.stop().await;
    let err = channel.query("*IDN?").await.unwrap_err();
    assert!(
        matches!(err, KepcoError::ConnectionClosed | KepcoError::Io(_)),
        "unexpected {:?}",
        err
    );
    assert!(!channel.is_alive().await);
    assert!(matches!(
        channel.send_command("OUTP OFF").await,
        Err(KepcoError::ConnectionClosed)
    ));
}
