mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::tempdir;

use common::{nrf_log, ConnectPlan, SimTransport};
use nus_logger::bluetooth::{EventFilter, EventType, LoggerEvent};
use nus_logger::reconnect::ControllerState;
use nus_logger::{
    DiscoveredDevice, LoggerController, LoggerSettings, NusError, ShutdownHandle, StopReason,
};

fn settings() -> LoggerSettings {
    LoggerSettings {
        name: "log".into(),
        timeout: 1.0,
        connect_timeout: 2.0,
        backoff: 0.5,
        backoff_max: 4.0,
        ..LoggerSettings::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_lines_reach_file_tail_and_subscribers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nus.log");
    let sim = SimTransport::new()
        .advertising(nrf_log())
        .with_plan(ConnectPlan::chunks(&["READY\n", "va", "l=5\n"]));
    let settings = LoggerSettings {
        logfile: Some(path.clone()),
        reconnect: false,
        ..settings()
    };
    let controller = LoggerController::new(sim.into_transport(), settings)
        .unwrap()
        .with_echo(false);
    let (_, mut lines) = controller.subscribe(EventFilter::lines_only()).await;

    let summary = controller.run().await.unwrap();

    assert_eq!(summary.reason, StopReason::SessionEnded);
    assert_eq!(summary.sessions, 1);
    assert_eq!(summary.lines, 2);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "READY\nval=5\n");
    assert_eq!(controller.tail(10).await, vec!["READY", "val=5"]);
    assert_eq!(controller.tail(1).await, vec!["val=5"]);

    assert_eq!(lines.recv().await, Some(LoggerEvent::Line("READY".into())));
    assert_eq!(lines.recv().await, Some(LoggerEvent::Line("val=5".into())));
    // Closed when the run ends
    assert_eq!(lines.recv().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_log_file_is_appended() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nus.log");
    std::fs::write(&path, "earlier\n").unwrap();
    let sim = SimTransport::new()
        .advertising(nrf_log())
        .with_plan(ConnectPlan::chunks(&["x=1\n"]));
    let settings = LoggerSettings {
        logfile: Some(path.clone()),
        reconnect: false,
        raw: true,
        ..settings()
    };
    let controller = LoggerController::new(sim.into_transport(), settings)
        .unwrap()
        .with_echo(false);

    controller.run().await.unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "earlier\nx=1 | 783d31\n");
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_without_session() {
    let sim = SimTransport::new()
        .advertising(nrf_log())
        .with_default_plan(ConnectPlan::Refuse("busy".into()));
    let settings = LoggerSettings {
        max_retries: Some(2),
        ..settings()
    };
    let controller = LoggerController::new(sim.clone().into_transport(), settings)
        .unwrap()
        .with_echo(false);
    let (_, mut events) = controller
        .subscribe(EventFilter::event_types(vec![EventType::Error, EventType::Reconnecting]))
        .await;

    let summary = controller.run().await.unwrap();

    assert_eq!(summary.reason, StopReason::RetriesExhausted { attempts: 2 });
    assert_eq!(summary.sessions, 0);
    assert_eq!(sim.state().connects.len(), 3);

    let mut errors = 0;
    let mut reconnects = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            LoggerEvent::Error(_) => errors += 1,
            LoggerEvent::Reconnecting { attempt, delay } => reconnects.push((attempt, delay)),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(errors, 3);
    assert_eq!(
        reconnects,
        vec![(1, Duration::from_millis(500)), (2, Duration::from_secs(1))]
    );
}

#[tokio::test(start_paused = true)]
async fn test_status_while_streaming() {
    let sim = SimTransport::new()
        .advertising(nrf_log())
        .with_plan(ConnectPlan::chunks_then_open(&["hello\n"]));
    let (handle, signal) = ShutdownHandle::channel();
    let settings = LoggerSettings {
        send: Some("status".into()),
        ..settings()
    };
    let controller = LoggerController::new(sim.clone().into_transport(), settings)
        .unwrap()
        .with_shutdown(signal)
        .with_echo(false);
    let (_, mut lines) = controller.subscribe(EventFilter::lines_only()).await;

    let idle = controller.status().await;
    assert_eq!(idle.state, ControllerState::Idle);
    assert!(!idle.connected);

    let observer = async {
        assert_eq!(lines.recv().await, Some(LoggerEvent::Line("hello".into())));
        let status = controller.status().await;
        handle.trigger();
        status
    };
    let (summary, status) = tokio::join!(controller.run(), observer);

    assert_eq!(status.state, ControllerState::Streaming);
    assert!(status.connected);
    assert!(!status.connecting);
    assert_eq!(status.device.map(|d| d.address), Some("AA:BB".to_string()));
    assert_eq!(status.sessions, 1);
    assert_eq!(status.settings.name, "log");

    let summary = summary.unwrap();
    assert_eq!(summary.reason, StopReason::Shutdown);
    assert_eq!(summary.lines, 1);
    assert!(!controller.status().await.connected);

    let state = sim.state();
    assert_eq!(state.writes, vec![b"status\n".to_vec()]);
    assert_eq!(state.live_links, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_preferred_address_falls_back_to_name() {
    let sim = SimTransport::new()
        .advertising(nrf_log())
        .with_plan(ConnectPlan::chunks(&["up\n"]));
    let settings = LoggerSettings {
        filter_addr: Some("ZZ".into()),
        require_service: false,
        reconnect: false,
        ..settings()
    };
    let controller = LoggerController::new(sim.clone().into_transport(), settings)
        .unwrap()
        .with_echo(false);

    let summary = controller.run().await.unwrap();

    assert_eq!(summary.reason, StopReason::SessionEnded);
    assert_eq!(summary.sessions, 1);
    assert_eq!(sim.state().connects, vec!["AA:BB".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_missing_log_directory_fails_before_scanning() {
    let dir = tempdir().unwrap();
    let sim = SimTransport::new().advertising(nrf_log());
    let settings = LoggerSettings {
        logfile: Some(dir.path().join("missing").join("nus.log")),
        ..settings()
    };
    let controller = LoggerController::new(sim.clone().into_transport(), settings)
        .unwrap()
        .with_echo(false);

    let result = controller.run().await;

    assert!(matches!(result, Err(NusError::Io(_))));
    assert_eq!(sim.state().discovery_starts, 0);
}

#[test]
fn test_invalid_settings_are_rejected() {
    let settings = LoggerSettings {
        backoff: 0.0,
        ..settings()
    };
    let result = LoggerController::new(SimTransport::new().into_transport(), settings);
    assert!(matches!(result, Err(NusError::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn test_scan_lists_all_named_devices() {
    let plain = DiscoveredDevice::new("CC:DD", Some("nrf-log-2")).with_rssi(Some(-30));
    let sim = SimTransport::new()
        .advertising(nrf_log())
        .advertising(plain)
        .advertising(DiscoveredDevice::new("EE:FF", Some("speaker")));
    let controller = LoggerController::new(sim.into_transport(), settings()).unwrap();

    let devices = controller.scan("nrf", Some(Duration::from_secs(1))).await.unwrap();
    let addresses: Vec<&str> = devices.iter().map(|d| d.address.as_str()).collect();
    assert_eq!(addresses, vec!["CC:DD", "AA:BB"]);

    let everything = controller.scan("", Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(everything.len(), 3);
}
