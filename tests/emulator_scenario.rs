//! End-to-end tests against the emulated power supply
//!
//! These go through the full stack: bridge, request channel, device session,
//! emulated transport and the emulator task.

use futures::future::join_all;
use genesys_psu::bridge::{ChannelName, Service};
use genesys_psu::config::{AppConfig, ConnectionConfig, QueueFullPolicy};
use genesys_psu::emulator::EmulatorFault;
use genesys_psu::error::PsuError;
use genesys_psu::protocol::{Command, Value};
use genesys_psu::session::SessionState;
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn start(config: AppConfig) -> Service {
    let service = Service::start(&config).await.unwrap();
    service
        .session()
        .wait_for(SessionState::Ready)
        .await
        .unwrap();
    service
}

// =============================================================================
// Channel scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_voltage_set_then_read_within_jitter() {
    let config = AppConfig::emulated();
    let jitter = config.emulator.jitter;
    let service = start(config).await;
    let bridge = service.bridge();

    bridge.put("volt_set", Value::Number(12.345)).await.unwrap();

    let measured = bridge.get("volt_real").await.unwrap().as_f64().unwrap();
    // Readbacks are reported with 3 decimals, so allow half a digit of rounding.
    assert!(
        (measured - 12.345).abs() <= jitter + 0.0005 + 1e-9,
        "measured {measured} outside jitter bound {jitter}"
    );
    assert_eq!(
        bridge.get("volt_set_rbv").await.unwrap(),
        Value::Number(12.345)
    );

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_output_enable_round_trip() {
    let service = start(AppConfig::emulated()).await;
    let bridge = service.bridge();

    assert_eq!(bridge.get("out_ena").await.unwrap(), Value::Bool(false));
    bridge.put("out_ena", Value::Bool(true)).await.unwrap();
    assert_eq!(bridge.get("out_ena").await.unwrap(), Value::Bool(true));

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_serial_number_is_configured_string() {
    let mut config = AppConfig::emulated();
    config.emulator.serial_number = "2B4L123-0042".into();
    let service = start(config).await;

    assert_eq!(
        service.bridge().get("ser_numb").await.unwrap(),
        Value::Text("2B4L123-0042".into())
    );

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_protection_set_points_echo() {
    let service = start(AppConfig::emulated()).await;
    let bridge = service.bridge();

    bridge
        .put("over_volt_set_point", Value::Number(30.0))
        .await
        .unwrap();
    bridge
        .put("under_volt_set_point", Value::Number(1.25))
        .await
        .unwrap();
    bridge.put("curr_set", Value::Number(2.5)).await.unwrap();

    assert_eq!(
        bridge.get("over_volt_set_point").await.unwrap(),
        Value::Number(30.0)
    );
    assert_eq!(
        bridge.get("under_volt_set_point").await.unwrap(),
        Value::Number(1.25)
    );
    assert_eq!(bridge.get("curr_set_rbv").await.unwrap(), Value::Number(2.5));

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_bridge_rejects_before_enqueueing() {
    let service = start(AppConfig::emulated()).await;
    let bridge = service.bridge();

    assert_eq!(
        bridge.put("volt_real", Value::Number(1.0)).await,
        Err(PsuError::ReadOnly("volt_real".into()))
    );
    assert_eq!(
        bridge.get("voltage").await,
        Err(PsuError::UnknownChannel("voltage".into()))
    );
    assert!(matches!(
        bridge.put("volt_set", Value::Number(f64::NAN)).await,
        Err(PsuError::InvalidValue { .. })
    ));

    // Nothing reached the device.
    let state = service.emulator().unwrap().snapshot().await.unwrap();
    assert_eq!(state.voltage, 0.0);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_device_limit_surfaces_as_device_error() {
    let service = start(AppConfig::emulated()).await;

    let result = service.bridge().put("volt_set", Value::Number(75.0)).await;
    assert_eq!(result, Err(PsuError::Device("E01".into())));
    assert_eq!(service.session().state(), SessionState::Ready);

    service.shutdown().await;
}

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_requests_complete_in_submission_order() {
    let service = start(AppConfig::emulated()).await;
    let completed = Arc::new(Mutex::new(Vec::new()));

    let callers = [
        ("A", Command::SetVoltage(1.0)),
        ("B", Command::ReadVoltageSetpoint),
        ("C", Command::SetVoltage(2.0)),
    ]
    .into_iter()
    .map(|(name, command)| {
        let sender = service.session().sender();
        let completed = completed.clone();
        async move {
            let result = sender.submit(command).await;
            completed.lock().unwrap().push(name);
            result
        }
    });
    let results = join_all(callers).await;

    assert_eq!(*completed.lock().unwrap(), vec!["A", "B", "C"]);
    assert_eq!(results[0], Ok(Value::Ack));
    // B observed A's write and not C's.
    assert_eq!(results[1], Ok(Value::Number(1.0)));
    assert_eq!(results[2], Ok(Value::Ack));

    service.shutdown().await;
}

// =============================================================================
// Polling, configuration and lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_poller_publishes_readings() {
    let service = start(AppConfig::emulated()).await;
    service
        .bridge()
        .put_channel(ChannelName::CurrentSetpoint, Value::Number(4.0))
        .await
        .unwrap();

    let poller = service.poller().spawn();
    let mut readings = poller.subscribe();
    readings.changed().await.unwrap();

    let reading = readings.borrow().clone().unwrap().unwrap();
    assert!((reading.current - 4.0).abs() < 0.01);
    assert!(reading.voltage < 0.01);

    poller.stop();
    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_setpoints_resync_after_unplug() {
    let mut config = AppConfig::emulated();
    config.emulator.serial_number = "2B4L123-0007".into();
    let service = start(config).await;
    let bridge = service.bridge();
    let mut setpoints = service.setpoints();

    let first = setpoints.wait_for(|s| s.is_ok()).await.unwrap().clone().unwrap();
    assert_eq!(first.serial_number, "2B4L123-0007");
    assert!(!first.output_enabled);

    bridge.put("out_ena", Value::Bool(true)).await.unwrap();
    bridge.put("volt_set", Value::Number(7.5)).await.unwrap();
    bridge.put("curr_set", Value::Number(2.0)).await.unwrap();

    let emulator = service.emulator().unwrap();
    emulator.set_fault(EmulatorFault::Unplugged).await;
    assert!(bridge.get("volt_real").await.is_err());
    let offline = setpoints.wait_for(|s| s.is_err()).await.unwrap().clone();
    assert_eq!(offline, Err(PsuError::NotConnected));

    emulator.set_fault(EmulatorFault::None).await;
    let resynced = setpoints.wait_for(|s| s.is_ok()).await.unwrap().clone().unwrap();
    assert!(resynced.output_enabled);
    assert_eq!(resynced.voltage, 7.5);
    assert_eq!(resynced.current, 2.0);
    assert!(resynced.at > first.at);
    assert_eq!(service.session().state(), SessionState::Ready);

    service.shutdown().await;
    assert_eq!(*setpoints.borrow(), Err(PsuError::NotConnected));
}

#[tokio::test]
async fn test_invalid_config_fails_before_connecting() {
    let config = AppConfig::with_connection(ConnectionConfig::tcp("no-port-here"));
    let result = Service::start(&config).await;
    assert!(matches!(result, Err(PsuError::Configuration(_))));
}

#[tokio::test(start_paused = true)]
async fn test_reject_policy_surfaces_queue_full() {
    let mut config = AppConfig::emulated();
    config.session.queue_depth = 1;
    config.session.queue_full_policy = QueueFullPolicy::Reject;
    let service = start(config).await;

    let submissions = (0..4).map(|_| {
        let sender = service.session().sender();
        async move { sender.submit(Command::ReadVoltage).await }
    });
    let results = join_all(submissions).await;

    assert!(results.iter().any(|r| r.is_ok()));
    assert!(results.contains(&Err(PsuError::QueueFull)));

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_disconnects_and_fails_new_requests() {
    let service = start(AppConfig::emulated()).await;
    let sender = service.session().sender();
    let session = service.session().clone();

    service.shutdown().await;
    assert_eq!(session.state(), SessionState::Disconnected);

    let result = tokio::time::timeout(Duration::from_secs(5), sender.submit(Command::ReadOutput))
        .await
        .unwrap();
    assert_eq!(result, Err(PsuError::NotConnected));
}
