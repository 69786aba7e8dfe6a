// Verified list upload against the simulator

use super::support::{count, fast_channel, ramp, socket_endpoint, start_sim, telnet_endpoint};
use kepco_list::channel::CommandChannel;
use kepco_list::upload::{ErrorCheck, UploadProgress, UploadState};
use kepco_list::{DeviceEndpoint, UploadConfig, UploadError, Uploader};
use kepco_sim::{Faults, Simulator};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const DWELL: Duration = Duration::from_millis(1);

async fn open(endpoint: &DeviceEndpoint) -> CommandChannel {
    CommandChannel::open(
        &endpoint.address.to_string(),
        endpoint.port,
        endpoint.mode,
        fast_channel(),
    )
    .await
    .unwrap()
}

async fn raw_channel(sim: &Simulator) -> CommandChannel {
    open(&socket_endpoint(sim)).await
}

#[tokio::test]
async fn test_chunked_upload_leaves_last_chunk_resident() {
    let sim = start_sim(Faults::none()).await;
    let channel = raw_channel(&sim).await;
    let config = UploadConfig::default();
    let waveform = ramp(2500, DWELL);

    let (tx, rx) = watch::channel(UploadProgress::default());
    let result = Uploader::new(&channel, &config)
        .with_progress(&tx)
        .upload(&waveform, &CancellationToken::new())
        .await;

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.chunks_sent, 3);
    assert_eq!(result.points_verified, 2500);

    let progress = rx.borrow().clone();
    assert_eq!(progress.state, UploadState::Done);
    assert_eq!(progress.chunk, 3);
    assert_eq!(progress.points_sent, 2500);

    let lines = sim.command_lines().await;
    assert_eq!(count(&lines, "LIST:CLE"), 3);
    assert_eq!(count(&lines, "LIST:VOLT:POIN?"), 3);
    assert_eq!(count(&lines, "LIST:DWEL 0.001000"), 3);

    let state = sim.snapshot().await;
    assert_eq!(state.list_volt.len(), 500);
    for (i, v) in state.list_volt.iter().enumerate() {
        let expected = (2000 + i) as f64 * 0.01;
        assert!((v - expected).abs() < 1e-6, "point {}: {} != {}", i, v, expected);
    }
    assert!(state.list_curr.is_empty());
    assert!(state.errors.is_empty());
}

#[tokio::test]
async fn test_upload_over_telnet() {
    let sim = start_sim(Faults::none()).await;
    let channel = open(&telnet_endpoint(&sim)).await;
    let config = UploadConfig::default();

    let result = Uploader::new(&channel, &config)
        .upload(&ramp(120, DWELL), &CancellationToken::new())
        .await;

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(sim.snapshot().await.list_volt.len(), 120);
}

#[tokio::test]
async fn test_current_list_upload() {
    let sim = start_sim(Faults::none()).await;
    let channel = raw_channel(&sim).await;
    let config = UploadConfig {
        mode: kepco_list::ListMode::Current,
        ..UploadConfig::default()
    };

    let result = Uploader::new(&channel, &config)
        .upload(&ramp(40, DWELL), &CancellationToken::new())
        .await;

    assert!(result.is_success(), "{:?}", result.error);
    let lines = sim.command_lines().await;
    assert!(lines.iter().any(|l| l == "FUNC:MODE CURR"));
    assert_eq!(count(&lines, "LIST:CURR:POIN?"), 1);
    let state = sim.snapshot().await;
    assert_eq!(state.list_curr.len(), 40);
    assert!(state.list_volt.is_empty());
}

#[tokio::test]
async fn test_persistent_mismatch_stops_after_retries() {
    let sim = start_sim(Faults::none().short_count_from(2)).await;
    let channel = raw_channel(&sim).await;
    let config = UploadConfig::default();

    let result = Uploader::new(&channel, &config)
        .upload(&ramp(2500, DWELL), &CancellationToken::new())
        .await;

    assert_eq!(
        result.error,
        Some(UploadError::VerificationMismatch {
            chunk: 2,
            expected: 1000,
            actual: 999,
        })
    );
    assert_eq!(result.chunks_sent, 1);
    assert_eq!(result.points_verified, 1000);

    // One pass for chunk 1, three attempts at chunk 2, none at chunk 3.
    let lines = sim.command_lines().await;
    assert_eq!(count(&lines, "LIST:VOLT:POIN?"), 4);
    assert_eq!(count(&lines, "LIST:CLE"), 4);
    assert!(!lines.iter().any(|l| l.starts_with("LIST:VOLT 20,")));
}

#[tokio::test]
async fn test_transient_mismatch_recovers_on_resend() {
    let sim = start_sim(
        Faults::none().with_point_count(|n, actual| (n == 1).then(|| (actual / 2).to_string())),
    )
    .await;
    let channel = raw_channel(&sim).await;
    let config = UploadConfig::default();

    let result = Uploader::new(&channel, &config)
        .upload(&ramp(300, DWELL), &CancellationToken::new())
        .await;

    assert!(result.is_success(), "{:?}", result.error);
    let lines = sim.command_lines().await;
    assert_eq!(count(&lines, "LIST:CLE"), 2);
    assert_eq!(sim.snapshot().await.list_volt.len(), 300);
}

#[tokio::test]
async fn test_unreadable_point_count() {
    let sim = start_sim(Faults::none().with_point_count(|_, _| Some("garbage".to_string()))).await;
    let channel = raw_channel(&sim).await;
    let config = UploadConfig {
        verify_retries: 0,
        ..UploadConfig::default()
    };

    let result = Uploader::new(&channel, &config)
        .upload(&ramp(10, DWELL), &CancellationToken::new())
        .await;

    assert_eq!(
        result.error,
        Some(UploadError::UnreadablePointCount {
            chunk: 1,
            response: "garbage".to_string(),
        })
    );
    assert_eq!(result.chunks_sent, 0);
}

#[tokio::test]
async fn test_device_error_reported_after_chunk() {
    let sim = start_sim(Faults::none().with_error_on("LIST:DWEL", -222, "Data out of range", 1)).await;
    let channel = raw_channel(&sim).await;
    let config = UploadConfig::default();

    let result = Uploader::new(&channel, &config)
        .upload(&ramp(1500, DWELL), &CancellationToken::new())
        .await;

    match result.error {
        Some(UploadError::DeviceReportedError { chunk, message }) => {
            assert_eq!(chunk, Some(1));
            assert!(message.starts_with("-222"), "{}", message);
        }
        other => panic!("unexpected {:?}", other),
    }
    // The chunk itself verified before the queue was read.
    assert_eq!(result.chunks_sent, 1);
    assert_eq!(count(&sim.command_lines().await, "LIST:CLE"), 1);
}

#[tokio::test]
async fn test_device_error_reported_after_all() {
    let sim = start_sim(Faults::none().with_error_on("LIST:DWEL", -222, "Data out of range", 1)).await;
    let channel = raw_channel(&sim).await;
    let config = UploadConfig {
        error_check: ErrorCheck::AfterAll,
        ..UploadConfig::default()
    };

    let result = Uploader::new(&channel, &config)
        .upload(&ramp(1500, DWELL), &CancellationToken::new())
        .await;

    match result.error {
        Some(UploadError::DeviceReportedError { chunk, .. }) => assert_eq!(chunk, None),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(result.chunks_sent, 2);
    assert_eq!(count(&sim.command_lines().await, "SYST:ERR?"), 2);
}

#[tokio::test]
async fn test_cancelled_before_first_chunk_sends_nothing() {
    let sim = start_sim(Faults::none()).await;
    let channel = raw_channel(&sim).await;
    let config = UploadConfig::default();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let (tx, rx) = watch::channel(UploadProgress::default());
    let result = Uploader::new(&channel, &config)
        .with_progress(&tx)
        .upload(&ramp(50, DWELL), &cancel)
        .await;

    assert_eq!(result.error, Some(UploadError::Cancelled { chunk: 1 }));
    assert_eq!(rx.borrow().state, UploadState::Failed);
    assert!(sim.command_lines().await.is_empty());
}

#[tokio::test]
async fn test_lost_connection_is_a_communication_error() {
    let sim = start_sim(Faults::none()).await;
    let channel = raw_channel(&sim).await;
    let config = UploadConfig::default();
    sim.stop().await;

    let result = Uploader::new(&channel, &config)
        .upload(&ramp(50, DWELL), &CancellationToken::new())
        .await;

    match result.error {
        Some(UploadError::Communication { chunk, .. }) => assert_eq!(chunk, 1),
        other => panic!("unexpected {:?}", other),
    }
}
