//! Session integration tests
//!
//! Drive a BleSession end to end against the recording mock adapter,
//! injecting the hardware callbacks a real stack would deliver.
//!
//! Run with: cargo test --test integration_session

use blelink_core::transport::{AdapterCall, MockBleAdapter};
use blelink_core::{
    BleSession, ConnectionState, GattService, HardwareEvent, LinkState, RemoteDevice,
    SessionConfig, GATT_SUCCESS, SCAN_PERIOD, TARGET_FEATURE_UUID,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const SERVICE: Uuid = Uuid::from_u128(0x0000_ffe0_0000_1000_8000_0080_5f9b_34fb);
const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x0000_2a19_0000_1000_8000_0080_5f9b_34fb);
const ADDRESS: &str = "00:11:22:33:44:55";

fn session_with_mock() -> (BleSession, Arc<MockBleAdapter>) {
    let session = BleSession::new(SessionConfig::default().with_target_name("Test"))
        .expect("Failed to create session");
    let mock = Arc::new(MockBleAdapter::new());
    session.open(Some(mock.clone()));
    (session, mock)
}

fn target_services() -> Vec<GattService> {
    vec![
        GattService::new(Uuid::from_u128(0x180f), [BATTERY_LEVEL]),
        GattService::new(SERVICE, [TARGET_FEATURE_UUID]),
    ]
}

/// Scan, match "Test", link up and resolve the target feature
fn bring_to_ready(session: &BleSession) {
    session.scan(true);
    session.handle_event(HardwareEvent::DeviceDiscovered(RemoteDevice::named(
        ADDRESS, "Test", -58,
    )));
    session.handle_event(HardwareEvent::ConnectionStateChanged {
        status: GATT_SUCCESS,
        state: LinkState::Connected,
    });
    session.handle_event(HardwareEvent::ServicesDiscovered {
        status: GATT_SUCCESS,
        services: target_services(),
    });
    assert_eq!(session.connection_state(), ConnectionState::Ready);
}

/// Close `session` from inside the first adapter request matching `trigger`,
/// as a callback thread racing with the application would
fn close_on_first(mock: &MockBleAdapter, session: &BleSession, trigger: AdapterCall) {
    let pending = Mutex::new(Some(session.clone()));
    mock.on_call(move |call| {
        if *call != trigger {
            return;
        }
        let session = pending.lock().take();
        if let Some(session) = session {
            session.close();
        }
    });
}

fn notify(session: &BleSession, payload: &[u8]) {
    session.handle_event(HardwareEvent::FeatureChanged {
        feature: TARGET_FEATURE_UUID,
        value: payload.to_vec(),
    });
}

#[tokio::test(start_paused = true)]
async fn test_target_match_connects_and_stops_scan() {
    let (session, mock) = session_with_mock();

    session.scan(true);
    assert!(session.is_scanning());

    session.handle_event(HardwareEvent::DeviceDiscovered(RemoteDevice::named(
        ADDRESS, "Test", -60,
    )));

    assert!(!session.is_scanning());
    assert_eq!(session.connection_state(), ConnectionState::Connecting);
    assert_eq!(
        session.connected_peer().expect("Peer").address,
        ADDRESS.to_string()
    );

    let calls = mock.calls();
    let stop = calls
        .iter()
        .position(|c| *c == AdapterCall::StopLeScan)
        .expect("Scan stopped");
    let connect = calls
        .iter()
        .position(|c| matches!(c, AdapterCall::ConnectGatt { .. }))
        .expect("Connect issued");
    assert!(stop < connect);
    assert_eq!(
        calls[connect],
        AdapterCall::ConnectGatt {
            address: ADDRESS.to_string(),
            auto_connect: true,
        }
    );

    // A late duplicate advertisement must not trigger a second connect
    session.handle_event(HardwareEvent::DeviceDiscovered(RemoteDevice::named(
        ADDRESS, "Test", -55,
    )));
    assert_eq!(
        mock.count(|c| matches!(c, AdapterCall::ConnectGatt { .. })),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_other_devices_reported_not_connected() {
    let (session, mock) = session_with_mock();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    session.start_scan(move |device| sink.lock().push(device.name.clone()));
    session.handle_event(HardwareEvent::DeviceDiscovered(RemoteDevice::named(
        "AA:BB:CC:DD:EE:01",
        "Speaker",
        -70,
    )));
    session.handle_event(HardwareEvent::DeviceDiscovered(RemoteDevice::new(
        "AA:BB:CC:DD:EE:02",
        None,
        -80,
    )));
    session.handle_event(HardwareEvent::DeviceDiscovered(RemoteDevice::named(
        "AA:BB:CC:DD:EE:01",
        "Speaker",
        -68,
    )));

    assert_eq!(
        *seen.lock(),
        vec![Some("Speaker".to_string()), Some("Speaker".to_string())]
    );
    assert!(session.is_scanning());
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        mock.count(|c| matches!(c, AdapterCall::ConnectGatt { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_scan_expires_after_period() {
    let (session, mock) = session_with_mock();
    let seen = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&seen);

    session.start_scan(move |_| *sink.lock() += 1);
    tokio::time::sleep(SCAN_PERIOD - Duration::from_millis(1)).await;
    assert!(session.is_scanning());

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert!(!session.is_scanning());
    assert_eq!(mock.count(|c| *c == AdapterCall::StopLeScan), 1);

    // Callbacks still in flight from the stack are ignored
    session.handle_event(HardwareEvent::DeviceDiscovered(RemoteDevice::named(
        ADDRESS, "Other", -60,
    )));
    session.handle_event(HardwareEvent::DeviceDiscovered(RemoteDevice::named(
        ADDRESS, "Test", -60,
    )));
    assert_eq!(*seen.lock(), 0);
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_stopped_scan_timer_does_not_end_new_scan() {
    let (session, mock) = session_with_mock();

    session.scan(true);
    tokio::time::sleep(Duration::from_secs(4)).await;
    session.scan(false);
    session.scan(true);

    // First scan's timer fires here; the second scan must survive it
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(session.is_scanning());

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!session.is_scanning());
    assert_eq!(mock.count(|c| *c == AdapterCall::StartLeScan), 2);
}

#[tokio::test(start_paused = true)]
async fn test_target_feature_makes_connection_ready() {
    let (session, mock) = session_with_mock();

    bring_to_ready(&session);

    assert_eq!(mock.count(|c| *c == AdapterCall::DiscoverServices), 1);
    assert!(mock.calls().contains(&AdapterCall::SetNotification {
        service: SERVICE,
        feature: TARGET_FEATURE_UUID,
        enable: true,
    }));
    let handle = session.feature_handle().expect("Feature handle");
    assert_eq!(handle.feature, TARGET_FEATURE_UUID);
    assert_eq!(handle.service, SERVICE);
}

#[tokio::test(start_paused = true)]
async fn test_missing_feature_blocks_data_flow() {
    let (session, mock) = session_with_mock();
    session.scan(true);
    session.handle_event(HardwareEvent::DeviceDiscovered(RemoteDevice::named(
        ADDRESS, "Test", -58,
    )));
    session.handle_event(HardwareEvent::ConnectionStateChanged {
        status: GATT_SUCCESS,
        state: LinkState::Connected,
    });
    session.handle_event(HardwareEvent::ServicesDiscovered {
        status: GATT_SUCCESS,
        services: vec![GattService::new(Uuid::from_u128(0x180f), [BATTERY_LEVEL])],
    });

    assert_eq!(
        session.connection_state(),
        ConnectionState::DiscoveringFeatures
    );

    session.send_now("hello");
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(
        session.connection_state(),
        ConnectionState::DiscoveringFeatures
    );
    assert!(mock.writes().is_empty());
    assert_eq!(
        mock.count(|c| matches!(c, AdapterCall::SetNotification { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_send_hello_when_ready() {
    let (session, mock) = session_with_mock();
    bring_to_ready(&session);

    session.send("hello", 0);

    assert_eq!(session.feature_handle().expect("Handle").value(), b"hello");
    assert_eq!(mock.writes(), vec![b"hello".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_send_hello_when_disconnected() {
    let (session, mock) = session_with_mock();

    session.send("hello", 0);
    session.send("later", 250);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(session.feature_handle().is_none());
    assert!(mock.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_delayed_send_dropped_after_link_loss() {
    let (session, mock) = session_with_mock();
    bring_to_ready(&session);

    session.send("late", 500);
    session.handle_event(HardwareEvent::ConnectionStateChanged {
        status: 8,
        state: LinkState::Disconnected,
    });
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(mock.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_inbound_fifo_to_every_subscriber() {
    let (session, _mock) = session_with_mock();
    bring_to_ready(&session);

    let mut first = session.subscribe_inbound();
    let mut second = session.subscribe_inbound();
    assert_eq!(session.subscriber_count(), 2);

    notify(&session, b"ACK");
    notify(&session, b"DONE");

    for stream in [&mut first, &mut second] {
        assert_eq!(stream.recv().await.expect("ACK").payload, b"ACK".to_vec());
        assert_eq!(stream.recv().await.expect("DONE").payload, b"DONE".to_vec());
    }

    let mut late = session.subscribe_inbound();
    assert!(late.try_recv().is_none());

    notify(&session, b"MORE");
    assert_eq!(late.recv().await.expect("MORE").text(), "MORE");
}

#[tokio::test(start_paused = true)]
async fn test_notifications_before_ready_are_dropped() {
    let (session, _mock) = session_with_mock();
    let mut inbound = session.subscribe_inbound();

    notify(&session, b"EARLY");
    bring_to_ready(&session);
    session.handle_event(HardwareEvent::FeatureChanged {
        feature: BATTERY_LEVEL,
        value: vec![87],
    });
    notify(&session, b"ACK");

    assert_eq!(inbound.recv().await.expect("ACK").payload, b"ACK".to_vec());
    assert!(inbound.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_keeps_peer_for_relink() {
    let (session, mock) = session_with_mock();
    bring_to_ready(&session);

    session.handle_event(HardwareEvent::ConnectionStateChanged {
        status: 8,
        state: LinkState::Disconnected,
    });
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert!(session.feature_handle().is_none());
    assert!(session.connected_peer().is_some());

    session.send_now("lost");
    assert!(mock.writes().is_empty());

    // The stack re-links on its own (auto_connect)
    session.handle_event(HardwareEvent::ConnectionStateChanged {
        status: GATT_SUCCESS,
        state: LinkState::Connected,
    });
    assert_eq!(
        session.connection_state(),
        ConnectionState::DiscoveringFeatures
    );
    session.handle_event(HardwareEvent::ServicesDiscovered {
        status: GATT_SUCCESS,
        services: target_services(),
    });
    assert_eq!(session.connection_state(), ConnectionState::Ready);
    assert_eq!(mock.count(|c| *c == AdapterCall::DiscoverServices), 2);
}

#[tokio::test(start_paused = true)]
async fn test_close_tears_down_and_is_idempotent() {
    let (session, mock) = session_with_mock();
    bring_to_ready(&session);
    let mut inbound = session.subscribe_inbound();
    mock.clear_calls();

    session.close();

    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert!(session.connected_peer().is_none());
    assert!(!session.is_available());
    assert_eq!(mock.count(|c| *c == AdapterCall::DisconnectGatt), 1);
    assert_eq!(mock.count(|c| *c == AdapterCall::CloseGatt), 1);
    assert_eq!(mock.count(|c| *c == AdapterCall::CancelDiscovery), 1);
    assert!(inbound.next().await.is_none());

    let before = mock.calls().len();
    session.close();
    session.send_now("after close");
    session.scan(true);
    notify(&session, b"GHOST");

    assert_eq!(mock.calls().len(), before);
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert!(session.subscribe_inbound().next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_close_while_scanning_silences_timer() {
    let (session, mock) = session_with_mock();

    session.scan(true);
    session.close();
    assert!(!session.is_scanning());
    let stops = mock.count(|c| *c == AdapterCall::StopLeScan);

    tokio::time::sleep(SCAN_PERIOD * 2).await;
    assert_eq!(mock.count(|c| *c == AdapterCall::StopLeScan), stops);
}

#[tokio::test(start_paused = true)]
async fn test_radio_off_is_enabled_on_open() {
    let session = BleSession::new(SessionConfig::default()).expect("Failed to create session");
    let mock = Arc::new(MockBleAdapter::new());
    mock.set_enabled(false);

    session.open(Some(mock.clone()));

    assert_eq!(mock.calls(), vec![AdapterCall::Enable]);
    assert!(session.is_enabled());
}

#[tokio::test(start_paused = true)]
async fn test_scan_without_target_never_connects() {
    let session = BleSession::new(SessionConfig::default()).expect("Failed to create session");
    let mock = Arc::new(MockBleAdapter::new());
    session.open(Some(mock.clone()));

    session.scan(true);
    session.handle_event(HardwareEvent::DeviceDiscovered(RemoteDevice::named(
        ADDRESS, "Test", -60,
    )));

    assert!(session.is_scanning());
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_config_change_applies_to_next_scan() {
    let session = BleSession::new(SessionConfig::default()).expect("Failed to create session");
    let mock = Arc::new(MockBleAdapter::new());
    session.open(Some(mock.clone()));

    session.scan(true);
    session
        .set_config(session.config().with_target_name("Test"))
        .expect("Valid config");
    session.handle_event(HardwareEvent::DeviceDiscovered(RemoteDevice::named(
        ADDRESS, "Test", -60,
    )));
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);

    session.scan(false);
    session.scan(true);
    session.handle_event(HardwareEvent::DeviceDiscovered(RemoteDevice::named(
        ADDRESS, "Test", -60,
    )));
    assert_eq!(session.connection_state(), ConnectionState::Connecting);
    assert!(mock.calls().contains(&AdapterCall::ConnectGatt {
        address: ADDRESS.to_string(),
        auto_connect: true,
    }));
}

#[tokio::test(start_paused = true)]
async fn test_close_racing_connect_leaves_no_link() {
    let (session, mock) = session_with_mock();
    session.scan(true);
    close_on_first(&mock, &session, AdapterCall::StopLeScan);

    session.handle_event(HardwareEvent::DeviceDiscovered(RemoteDevice::named(
        ADDRESS, "Test", -60,
    )));

    assert!(session.is_closed());
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert!(session.connected_peer().is_none());
    assert_eq!(
        mock.count(|c| matches!(c, AdapterCall::ConnectGatt { .. })),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_close_racing_scan_start_stops_hardware() {
    let (session, mock) = session_with_mock();
    close_on_first(&mock, &session, AdapterCall::StartLeScan);

    session.scan(true);

    assert!(session.is_closed());
    assert!(!session.is_scanning());
    let calls = mock.calls();
    assert_eq!(calls.first(), Some(&AdapterCall::StartLeScan));
    assert_eq!(calls.last(), Some(&AdapterCall::StopLeScan));

    tokio::time::sleep(SCAN_PERIOD * 2).await;
    assert_eq!(mock.calls(), calls);
}

#[tokio::test(start_paused = true)]
async fn test_failed_discovery_status_never_ready() {
    let (session, mock) = session_with_mock();
    session.scan(true);
    session.handle_event(HardwareEvent::DeviceDiscovered(RemoteDevice::named(
        ADDRESS, "Test", -58,
    )));
    session.handle_event(HardwareEvent::ConnectionStateChanged {
        status: GATT_SUCCESS,
        state: LinkState::Connected,
    });

    session.handle_event(HardwareEvent::ServicesDiscovered {
        status: 129,
        services: target_services(),
    });
    session.send_now("hello");

    assert_eq!(
        session.connection_state(),
        ConnectionState::DiscoveringFeatures
    );
    assert!(session.feature_handle().is_none());
    assert!(mock.writes().is_empty());
}
