// Adapter access
//
// The radio itself lives behind the BleAdapter platform bridge. Every request
// method only *asks* the stack to do something; results come back later as
// HardwareEvents delivered to the session from a driver-owned thread.
//
// AdapterAccess owns the session's handle on that bridge and is the single
// place that decides whether the hardware may be used at all.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::abstraction::{BleError, FeatureHandle};

// ============================================================================
// PLATFORM BRIDGE TRAIT
// ============================================================================

/// Platform-specific BLE central API.
///
/// Implemented by platform glue (Android, CoreBluetooth, BlueZ). Implementers
/// must deliver callbacks asynchronously: calling back into the session from
/// inside one of these methods would re-enter its locks.
pub trait BleAdapter: Send + Sync {
    /// Whether the radio is currently powered on
    fn is_enabled(&self) -> bool;

    /// Ask the stack to power the radio on
    fn enable(&self) -> Result<(), BleError>;

    /// Begin low-energy discovery
    fn start_le_scan(&self) -> Result<(), BleError>;

    /// End low-energy discovery
    fn stop_le_scan(&self);

    /// Cancel any in-flight discovery
    fn cancel_discovery(&self);

    /// Open a GATT link to `address`; `auto_connect` asks the stack to relink
    /// on unexpected drops
    fn connect_gatt(&self, address: &str, auto_connect: bool) -> Result<(), BleError>;

    /// Request service discovery on the open link
    fn discover_services(&self) -> Result<(), BleError>;

    /// Enable or disable notifications for one feature
    fn set_notification(&self, service: Uuid, feature: Uuid, enable: bool) -> Result<(), BleError>;

    /// Write the handle's current value to the peripheral
    fn write_feature(&self, handle: &FeatureHandle) -> Result<(), BleError>;

    fn disconnect_gatt(&self);

    fn close_gatt(&self);
}

// ============================================================================
// ADAPTER ACCESS
// ============================================================================

enum AdapterSlot {
    /// open() not called yet
    Unopened,
    /// open() found no hardware; everything is a no-op
    Unavailable,
    Open(Arc<dyn BleAdapter>),
    /// close() ran; the session is over
    Released,
}

/// Owner of the session's hardware handle
pub struct AdapterAccess {
    slot: RwLock<AdapterSlot>,
}

impl AdapterAccess {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(AdapterSlot::Unopened),
        }
    }

    /// Acquire the hardware handle and power it on.
    ///
    /// `None` means the platform has no BLE hardware. That is logged and the
    /// session stays usable, but every operation becomes a no-op.
    pub fn open(&self, adapter: Option<Arc<dyn BleAdapter>>) {
        let mut slot = self.slot.write();
        match &*slot {
            AdapterSlot::Open(_) => {
                debug!("Adapter already open");
                return;
            }
            AdapterSlot::Released => {
                warn!("Cannot open adapter: {}", BleError::SessionClosed);
                return;
            }
            AdapterSlot::Unopened | AdapterSlot::Unavailable => {}
        }

        match adapter {
            Some(adapter) => {
                if !adapter.is_enabled() {
                    if let Err(e) = adapter.enable() {
                        warn!("Failed to enable Bluetooth adapter: {}", e);
                    }
                }
                *slot = AdapterSlot::Open(adapter);
                info!("Bluetooth adapter opened");
            }
            None => {
                *slot = AdapterSlot::Unavailable;
                warn!("{}: all BLE operations disabled", BleError::AdapterUnavailable);
            }
        }
    }

    /// The hardware handle, if one was acquired
    pub fn get(&self) -> Result<Arc<dyn BleAdapter>, BleError> {
        match &*self.slot.read() {
            AdapterSlot::Open(adapter) => Ok(Arc::clone(adapter)),
            AdapterSlot::Released => Err(BleError::SessionClosed),
            AdapterSlot::Unopened | AdapterSlot::Unavailable => Err(BleError::AdapterUnavailable),
        }
    }

    /// The hardware handle, only if the radio is also powered on
    pub fn enabled(&self) -> Result<Arc<dyn BleAdapter>, BleError> {
        let adapter = self.get()?;
        if !adapter.is_enabled() {
            return Err(BleError::AdapterUnavailable);
        }
        Ok(adapter)
    }

    pub fn is_available(&self) -> bool {
        matches!(&*self.slot.read(), AdapterSlot::Open(_))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled().is_ok()
    }

    pub fn is_released(&self) -> bool {
        matches!(&*self.slot.read(), AdapterSlot::Released)
    }

    /// Give the handle up for good. Returns it if it was open so the caller
    /// can run final teardown requests.
    pub fn release(&self) -> Option<Arc<dyn BleAdapter>> {
        let previous = std::mem::replace(&mut *self.slot.write(), AdapterSlot::Released);
        match previous {
            AdapterSlot::Open(adapter) => Some(adapter),
            _ => None,
        }
    }
}

impl Default for AdapterAccess {
    fn default() -> Self {
        Self::new()
    }
}
