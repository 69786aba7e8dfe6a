// Session lifecycle against the simulator
//
// Covers the disconnect interlock on every exit path, single and
// multi-chunk playback, and port fallback.

use super::support::{count, fast_session, ramp, socket_endpoint, start_sim, telnet_endpoint};
use futures::FutureExt;
use kepco_list::upload::UploadConfig;
use kepco_list::{KepcoError, ProtocolMode, Session, SessionConfig, UploadError};
use kepco_sim::{Faults, SimConfig, Simulator, IDN};
use serial_test::serial;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const INTERLOCK: [&str; 3] = ["VOLT 0", "CURR 0", "OUTP OFF"];

/// Poll the command log until `pred` holds, for at most two seconds.
async fn wait_for_log(sim: &Simulator, pred: impl Fn(&[String]) -> bool) -> Vec<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let lines = sim.command_lines().await;
        if pred(&lines) || tokio::time::Instant::now() >= deadline {
            return lines;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn ends_with_interlock(lines: &[String]) -> bool {
    lines.len() >= 3 && lines[lines.len() - 3..] == INTERLOCK
}

#[tokio::test]
async fn test_connect_caches_identity() {
    let sim = start_sim(Faults::none()).await;
    let mut session = Session::connect(&telnet_endpoint(&sim), fast_session())
        .await
        .unwrap();

    assert!(session.is_connected());
    assert_eq!(session.identity(), Some(IDN));

    let report = session.disconnect().await;
    assert!(report.is_clean());
    assert_eq!(report.sent, INTERLOCK.to_vec());
    assert!(!session.is_connected());
    assert!(session.disconnect().await.already_disconnected);
    assert!(matches!(session.channel(), Err(KepcoError::NotConnected)));
}

#[tokio::test]
async fn test_interlock_follows_failed_upload() {
    let sim = start_sim(Faults::none().short_count_from(1)).await;
    let mut session = Session::connect(&socket_endpoint(&sim), fast_session())
        .await
        .unwrap();
    session.channel().unwrap().send_command("OUTP ON").await.unwrap();
    session.channel().unwrap().send_command("VOLT 4").await.unwrap();

    let result = session
        .prepare_and_upload(&ramp(20, Duration::from_millis(1)), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(
        result.error,
        Some(UploadError::VerificationMismatch { chunk: 1, .. })
    ));
    assert!(matches!(
        session.run(false, &CancellationToken::new()).await,
        Err(KepcoError::NoListLoaded)
    ));

    session.disconnect().await;
    let lines = sim.command_lines().await;
    assert!(ends_with_interlock(&lines), "{:?}", lines);

    let state = sim.snapshot().await;
    assert!(!state.output_on);
    assert_eq!(state.volt_setpoint, 0.0);
    assert_eq!(state.curr_setpoint, 0.0);
}

#[tokio::test]
async fn test_run_before_upload_is_rejected() {
    let sim = start_sim(Faults::none()).await;
    let mut session = Session::connect(&socket_endpoint(&sim), fast_session())
        .await
        .unwrap();

    let err = session.run(false, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, KepcoError::NoListLoaded));
    assert!(!sim.command_lines().await.iter().any(|l| l == "OUTP ON"));
    session.disconnect().await;
}

#[tokio::test]
async fn test_single_chunk_run_starts_list() {
    let sim = start_sim(Faults::none()).await;
    let mut session = Session::connect(&socket_endpoint(&sim), fast_session())
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    let result = session
        .prepare_and_upload(&ramp(20, Duration::from_millis(100)), &cancel)
        .await
        .unwrap();
    assert!(result.is_success(), "{:?}", result.error);
    session.run(false, &cancel).await.unwrap();

    let lines = sim.command_lines().await;
    let tail = &lines[lines.len() - 3..];
    assert_eq!(tail, ["LIST:COUN 1", "OUTP ON", "VOLT:MODE LIST"]);
    let state = sim.snapshot().await;
    assert!(state.list_running);
    assert!(state.output_on);
    assert_eq!(state.list_count, 1);

    session.stop().await.unwrap();
    let state = sim.snapshot().await;
    assert!(!state.list_running);
    assert!(!state.output_on);
    session.disconnect().await;
}

#[tokio::test]
async fn test_single_chunk_loop_runs_indefinitely() {
    let sim = start_sim(Faults::none()).await;
    let mut session = Session::connect(&socket_endpoint(&sim), fast_session())
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    session
        .prepare_and_upload(&ramp(4, Duration::from_millis(1)), &cancel)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    session.run(true, &cancel).await.unwrap();
    assert!(sim.command_lines().await.iter().any(|l| l == "LIST:COUN 0"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sim.snapshot().await.list_running);

    // Closing the connection stops the list.
    session.disconnect().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while sim.snapshot().await.list_running && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!sim.snapshot().await.list_running);
}

fn chunked_session() -> SessionConfig {
    SessionConfig {
        upload: UploadConfig {
            chunk_size: 10,
            ..UploadConfig::default()
        },
        run_margin: Duration::from_millis(20),
        ..fast_session()
    }
}

#[tokio::test]
async fn test_multi_chunk_run_plays_each_chunk() {
    let sim = start_sim(Faults::none()).await;
    let mut session = Session::connect(&socket_endpoint(&sim), chunked_session())
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    let waveform = ramp(25, Duration::from_micros(500));

    let result = session.prepare_and_upload(&waveform, &cancel).await.unwrap();
    assert_eq!(result.chunks_sent, 3);
    sim.clear_log().await;

    session.run(false, &cancel).await.unwrap();

    let lines = sim.command_lines().await;
    assert_eq!(count(&lines, "LIST:COUN 1"), 3);
    assert_eq!(count(&lines, "VOLT:MODE LIST"), 3);
    // The resident chunk is the last one, so playback re-uploads each.
    assert_eq!(count(&lines, "LIST:CLE"), 3);
    assert_eq!(count(&lines, "LIST:VOLT:POIN?"), 3);

    let state = sim.snapshot().await;
    assert_eq!(state.list_volt.len(), 5);
    assert!(state.errors.is_empty(), "{:?}", state.errors);
    session.disconnect().await;
}

#[tokio::test]
async fn test_device_error_during_playback_fails_the_run() {
    let sim = start_sim(Faults::none().with_error_on("LIST:COUN", -222, "Data out of range", 1)).await;
    let mut session = Session::connect(&socket_endpoint(&sim), chunked_session())
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    session
        .prepare_and_upload(&ramp(25, Duration::from_micros(500)), &cancel)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    sim.clear_log().await;

    // The first chunk's LIST:COUN queues the error; the second re-upload reads it.
    match session.run(false, &cancel).await {
        Err(KepcoError::Upload(UploadError::DeviceReportedError { chunk, message })) => {
            assert_eq!(chunk, Some(2));
            assert!(message.starts_with("-222"), "{}", message);
        }
        other => panic!("unexpected {:?}", other),
    }

    let lines = sim.command_lines().await;
    assert_eq!(count(&lines, "VOLT:MODE LIST"), 1);
    assert!(count(&lines, "SYST:ERR?") >= 2);
    assert!(sim.snapshot().await.errors.is_empty());
    session.disconnect().await;
}

#[tokio::test]
async fn test_multi_chunk_loop_stops_on_cancel() {
    let sim = start_sim(Faults::none()).await;
    let mut session = Session::connect(&socket_endpoint(&sim), chunked_session())
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    session
        .prepare_and_upload(&ramp(25, Duration::from_micros(500)), &cancel)
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        trigger.cancel();
    });
    let err = session.run(true, &cancel).await.unwrap_err();
    assert!(matches!(err, KepcoError::Cancelled));

    // More than one full pass went by.
    assert!(count(&sim.command_lines().await, "VOLT:MODE LIST") > 3);

    session.stop().await.unwrap();
    session.disconnect().await;
    assert!(!sim.snapshot().await.output_on);
}

#[tokio::test]
async fn test_scoped_session_disconnects_on_error() {
    let sim = start_sim(Faults::none()).await;
    let endpoint = socket_endpoint(&sim);

    let outcome: Result<(), KepcoError> = Session::scoped(&endpoint, fast_session(), |session| {
        async move {
            session.channel()?.send_command("OUTP ON").await?;
            Err(KepcoError::Cancelled)
        }
        .boxed()
    })
    .await;

    assert!(matches!(outcome, Err(KepcoError::Cancelled)));
    let lines = sim.command_lines().await;
    assert!(ends_with_interlock(&lines), "{:?}", lines);
}

#[tokio::test]
async fn test_dropped_session_still_interlocks() {
    let sim = start_sim(Faults::none()).await;
    let session = Session::connect(&socket_endpoint(&sim), fast_session())
        .await
        .unwrap();
    session.channel().unwrap().send_command("OUTP ON").await.unwrap();
    drop(session);

    let lines = wait_for_log(&sim, ends_with_interlock).await;
    assert!(ends_with_interlock(&lines), "{:?}", lines);
    assert!(!sim.snapshot().await.output_on);
}

#[tokio::test]
#[serial]
async fn test_connect_host_falls_back_to_raw_socket() {
    let address = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 7));
    let sim = Simulator::start(SimConfig::socket_only(address, 5025))
        .await
        .unwrap();

    let mut session = Session::connect_host("127.0.0.7", fast_session())
        .await
        .unwrap();
    assert_eq!(session.channel().unwrap().mode(), ProtocolMode::Raw);
    assert_eq!(session.identity(), Some(IDN));
    session.disconnect().await;
    sim.stop().await;
}

#[tokio::test]
async fn test_connect_refused() {
    // Bind then release a port so nothing listens on it.
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let endpoint = kepco_list::DeviceEndpoint::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        port,
        ProtocolMode::Raw,
    );

    let err = Session::connect(&endpoint, fast_session()).await.unwrap_err();
    match err {
        KepcoError::Connect { port: p, .. } => assert_eq!(p, port),
        other => panic!("unexpected {:?}", other),
    }
}
