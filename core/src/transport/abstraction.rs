//! BLE session abstraction layer
//!
//! Defines the hardware-facing types shared by the scanner, the connection
//! manager and the send scheduler, plus the events a platform stack delivers
//! back into the session.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Feature (characteristic) the session subscribes to and writes through
pub const TARGET_FEATURE_UUID: Uuid = Uuid::from_u128(0x0000_ffe1_0000_1000_8000_0080_5f9b_34fb);

/// Fixed duration of a discovery session
pub const SCAN_PERIOD: Duration = Duration::from_millis(10_000);

/// Status code reported by the stack for a successful GATT operation
pub const GATT_SUCCESS: i32 = 0;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Failure taxonomy of the session.
///
/// Public session operations never return these; they log them and return.
/// Internal steps use them to early-return with `?`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,
    #[error("No active connection")]
    NoActiveConnection,
    #[error("Target feature {0} not found")]
    FeatureNotFound(Uuid),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Platform bridge error: {0}")]
    Platform(String),
    #[error("Session closed")]
    SessionClosed,
    #[error("No tokio runtime available")]
    NoRuntime,
}

// ============================================================================
// DEVICES
// ============================================================================

/// A peripheral observed during discovery.
///
/// Only lives for the duration of a discovery callback; the connection
/// manager keeps a [`PeerInfo`] instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    /// Hardware address (opaque to the core)
    pub address: String,
    /// Advertised local name, if any
    pub name: Option<String>,
    /// RSSI in dBm, 0 if the stack reported none
    pub rssi: i16,
    /// Raw advertisement record
    pub scan_record: Vec<u8>,
}

impl RemoteDevice {
    pub fn new(address: impl Into<String>, name: Option<String>, rssi: i16) -> Self {
        Self {
            address: address.into(),
            name,
            rssi,
            scan_record: Vec::new(),
        }
    }

    /// Convenience constructor for a device advertising `name`
    pub fn named(address: impl Into<String>, name: impl Into<String>, rssi: i16) -> Self {
        Self::new(address, Some(name.into()), rssi)
    }

    pub fn with_scan_record(mut self, scan_record: Vec<u8>) -> Self {
        self.scan_record = scan_record;
        self
    }
}

impl fmt::Display for RemoteDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({}, {} dBm)", name, self.address, self.rssi),
            None => write!(f, "{} ({} dBm)", self.address, self.rssi),
        }
    }
}

/// What the connection manager retains about its peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: String,
    pub name: Option<String>,
}

impl From<&RemoteDevice> for PeerInfo {
    fn from(device: &RemoteDevice) -> Self {
        Self {
            address: device.address.clone(),
            name: device.name.clone(),
        }
    }
}

// ============================================================================
// GATT
// ============================================================================

/// Link state as reported by the platform stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "Disconnected"),
            LinkState::Connecting => write!(f, "Connecting"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// A feature (characteristic) exposed by a remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattFeature {
    pub uuid: Uuid,
}

/// A service and the features it exposes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattService {
    pub uuid: Uuid,
    pub features: Vec<GattFeature>,
}

impl GattService {
    pub fn new(uuid: Uuid, feature_uuids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            uuid,
            features: feature_uuids
                .into_iter()
                .map(|uuid| GattFeature { uuid })
                .collect(),
        }
    }
}

/// Resolved handle on the subscribed feature.
///
/// Only exists while the connection is `Ready`. Outbound payloads are set as
/// its value right before the hardware write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureHandle {
    pub service: Uuid,
    pub feature: Uuid,
    value: Vec<u8>,
}

impl FeatureHandle {
    pub fn new(service: Uuid, feature: Uuid) -> Self {
        Self {
            service,
            feature,
            value: Vec::new(),
        }
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn set_value(&mut self, value: &[u8]) {
        self.value.clear();
        self.value.extend_from_slice(value);
    }
}

// ============================================================================
// HARDWARE EVENTS
// ============================================================================

/// Asynchronous callbacks from the platform stack, normalized
#[derive(Debug, Clone)]
pub enum HardwareEvent {
    /// An advertisement was observed while scanning
    DeviceDiscovered(RemoteDevice),
    /// The GATT link changed state
    ConnectionStateChanged { status: i32, state: LinkState },
    /// Service discovery finished
    ServicesDiscovered {
        status: i32,
        services: Vec<GattService>,
    },
    /// A subscribed feature pushed a notification
    FeatureChanged { feature: Uuid, value: Vec<u8> },
}

impl fmt::Display for HardwareEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareEvent::DeviceDiscovered(device) => {
                write!(f, "DeviceDiscovered {{ {} }}", device)
            }
            HardwareEvent::ConnectionStateChanged { status, state } => write!(
                f,
                "ConnectionStateChanged {{ status: {}, state: {} }}",
                status, state
            ),
            HardwareEvent::ServicesDiscovered { status, services } => write!(
                f,
                "ServicesDiscovered {{ status: {}, services: {} }}",
                status,
                services.len()
            ),
            HardwareEvent::FeatureChanged { feature, value } => write!(
                f,
                "FeatureChanged {{ feature: {}, len: {} }}",
                feature,
                value.len()
            ),
        }
    }
}
