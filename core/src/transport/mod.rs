// Transport module: BLE central components
//
// Leaf first: adapter access, scanner, connection manager (gatt), data bus,
// send scheduler. The session facade in lib.rs wires them together.

pub mod abstraction;
pub mod adapter;
pub mod bus;
pub mod gatt;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod scanner;
pub mod scheduler;

pub use abstraction::{
    BleError, FeatureHandle, GattFeature, GattService, HardwareEvent, LinkState, PeerInfo,
    RemoteDevice, GATT_SUCCESS, SCAN_PERIOD, TARGET_FEATURE_UUID,
};
pub use adapter::{AdapterAccess, BleAdapter};
pub use bus::{DataBus, Direction, InboundStream, Message};
pub use gatt::{ConnectionManager, ConnectionState};
#[cfg(any(test, feature = "test-utils"))]
pub use mock::{AdapterCall, CallHook, MockBleAdapter};
pub use scanner::{DeviceScanner, DiscoveryListener, ScanOutcome, ScannerState};
pub use scheduler::SendScheduler;
