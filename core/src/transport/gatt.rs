/// GATT connection manager
///
/// Drives the link state machine for the single peripheral of a session:
///
/// ```text
/// Disconnected -> Connecting -> LinkUp -> DiscoveringFeatures -> Ready
///       ^______________________________________________________|
///                          (link lost, any state)
/// ```
///
/// The hardware is asked to relink automatically, so after a link loss the
/// stack may report the link as up again without a new `connect`. The
/// connection record (the peer) survives the loss for exactly that reason.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::abstraction::{
    BleError, FeatureHandle, GattService, LinkState, PeerInfo, RemoteDevice, GATT_SUCCESS,
};
use super::adapter::BleAdapter;
use super::bus::{DataBus, Message};

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    /// Hardware connect requested
    Connecting,
    /// Link established, feature discovery not yet requested
    LinkUp,
    /// Waiting for (or stuck after) feature discovery
    DiscoveringFeatures,
    /// Target feature resolved and subscribed; data can flow
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::LinkUp => write!(f, "LinkUp"),
            ConnectionState::DiscoveringFeatures => write!(f, "DiscoveringFeatures"),
            ConnectionState::Ready => write!(f, "Ready"),
        }
    }
}

/// The one open connection of a session
#[derive(Debug, Clone)]
struct Connection {
    peer: PeerInfo,
    state: ConnectionState,
    /// Present iff `state == Ready`
    feature: Option<FeatureHandle>,
}

impl Connection {
    fn transition(&mut self, next: ConnectionState) {
        debug!("Connection {}: {} -> {}", self.peer.address, self.state, next);
        self.state = next;
        if next != ConnectionState::Ready {
            self.feature = None;
        }
    }
}

struct Slot {
    connection: Option<Connection>,
    /// Set for good by `close`; no connection may be opened afterwards
    closed: bool,
}

/// Connection manager for a single peripheral
pub struct ConnectionManager {
    target_feature: Uuid,
    slot: Mutex<Slot>,
    bus: Arc<DataBus>,
}

impl ConnectionManager {
    /// Create a manager that resolves `target_feature` and posts its
    /// notifications to `bus`
    pub fn new(target_feature: Uuid, bus: Arc<DataBus>) -> Self {
        Self {
            target_feature,
            slot: Mutex::new(Slot {
                connection: None,
                closed: false,
            }),
            bus,
        }
    }

    pub fn target_feature(&self) -> Uuid {
        self.target_feature
    }

    /// Current state; `Disconnected` when there is no connection at all
    pub fn state(&self) -> ConnectionState {
        self.slot
            .lock()
            .connection
            .as_ref()
            .map_or(ConnectionState::Disconnected, |c| c.state)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Peer of the current connection record, linked or not
    pub fn peer(&self) -> Option<PeerInfo> {
        self.slot.lock().connection.as_ref().map(|c| c.peer.clone())
    }

    /// Snapshot of the resolved feature handle
    pub fn feature(&self) -> Option<FeatureHandle> {
        self.slot.lock().connection.as_ref().and_then(|c| c.feature.clone())
    }

    /// Open a connection to `device`, superseding any previous one.
    ///
    /// The caller is responsible for stopping discovery first.
    pub fn connect(&self, adapter: &dyn BleAdapter, device: &RemoteDevice) -> Result<(), BleError> {
        let mut slot = self.slot.lock();
        if slot.closed {
            return Err(BleError::SessionClosed);
        }
        let current = &mut slot.connection;
        if let Some(previous) = current.take() {
            info!("Superseding connection to {}", previous.peer.address);
            adapter.close_gatt();
        }

        // auto_connect: the stack relinks on its own after a loss
        adapter.connect_gatt(&device.address, true)?;

        *current = Some(Connection {
            peer: PeerInfo::from(device),
            state: ConnectionState::Connecting,
            feature: None,
        });
        info!("Connecting to {}", device);
        Ok(())
    }

    /// Handle a link state change reported by the stack
    pub fn on_link_state(
        &self,
        adapter: &dyn BleAdapter,
        status: i32,
        state: LinkState,
    ) -> Result<(), BleError> {
        let mut slot = self.slot.lock();
        let current = &mut slot.connection;
        let Some(conn) = current.as_mut() else {
            debug!("Link state {} (status {}) with no connection, ignoring", state, status);
            return Ok(());
        };

        match state {
            LinkState::Connected => match conn.state {
                ConnectionState::Disconnected | ConnectionState::Connecting => {
                    if conn.state == ConnectionState::Disconnected {
                        info!("Link to {} re-established by the stack", conn.peer.address);
                    } else {
                        info!("Link to {} established", conn.peer.address);
                    }
                    conn.transition(ConnectionState::LinkUp);
                    adapter.discover_services()?;
                    conn.transition(ConnectionState::DiscoveringFeatures);
                    Ok(())
                }
                ConnectionState::LinkUp
                | ConnectionState::DiscoveringFeatures
                | ConnectionState::Ready => {
                    debug!("Duplicate link-up in state {}, ignoring", conn.state);
                    Ok(())
                }
            },
            LinkState::Disconnected => {
                info!("Link to {} lost (status {})", conn.peer.address, status);
                conn.transition(ConnectionState::Disconnected);
                Ok(())
            }
            LinkState::Connecting | LinkState::Disconnecting => {
                debug!("Link to {} is {}", conn.peer.address, state);
                Ok(())
            }
        }
    }

    /// Handle the result of feature discovery.
    ///
    /// Without the target feature the connection stays in
    /// `DiscoveringFeatures` and no data can flow.
    pub fn on_services_discovered(
        &self,
        adapter: &dyn BleAdapter,
        status: i32,
        services: &[GattService],
    ) -> Result<(), BleError> {
        let mut slot = self.slot.lock();
        let current = &mut slot.connection;
        let Some(conn) = current.as_mut() else {
            debug!("Services discovered with no connection, ignoring");
            return Ok(());
        };
        if conn.state != ConnectionState::DiscoveringFeatures {
            debug!("Services discovered in state {}, ignoring", conn.state);
            return Ok(());
        }

        let feature_count: usize = services.iter().map(|s| s.features.len()).sum();
        debug!(
            "Discovered {} services, {} features (status {})",
            services.len(),
            feature_count,
            status
        );
        let target = self.target_feature;
        if status != GATT_SUCCESS {
            warn!(
                "Feature discovery on {} failed with status {}",
                conn.peer.address, status
            );
            return Err(BleError::FeatureNotFound(target));
        }

        let (service, feature) = services
            .iter()
            .flat_map(|service| service.features.iter().map(move |f| (service.uuid, f.uuid)))
            .find(|(_, feature)| *feature == target)
            .ok_or(BleError::FeatureNotFound(target))?;

        adapter.set_notification(service, feature, true)?;

        conn.feature = Some(FeatureHandle::new(service, feature));
        conn.state = ConnectionState::Ready;
        info!("Connection to {} ready on feature {}", conn.peer.address, feature);
        Ok(())
    }

    /// Handle a notification; posts it to the data bus when the connection
    /// is ready and the notification comes from the resolved feature
    pub fn on_feature_changed(&self, feature: Uuid, value: Vec<u8>) -> Result<(), BleError> {
        {
            let slot = self.slot.lock();
            let resolved = slot
                .connection
                .as_ref()
                .filter(|c| c.state == ConnectionState::Ready)
                .and_then(|c| c.feature.as_ref())
                .ok_or(BleError::NoActiveConnection)?;
            if resolved.feature != feature {
                debug!("Notification from unsubscribed feature {}, ignoring", feature);
                return Ok(());
            }
        }

        let message = Message::inbound(value);
        debug!("Received {} bytes: {}", message.payload.len(), message.text());
        if !self.bus.post(message) {
            debug!("Data bus closed, notification dropped");
        }
        Ok(())
    }

    /// Set `payload` on the resolved feature and write it.
    ///
    /// Fails with `NoActiveConnection` without touching the handle unless the
    /// connection is `Ready`.
    pub fn write(&self, adapter: &dyn BleAdapter, payload: &[u8]) -> Result<(), BleError> {
        let mut slot = self.slot.lock();
        let current = &mut slot.connection;
        let conn = current.as_mut().ok_or(BleError::NoActiveConnection)?;
        if conn.state != ConnectionState::Ready {
            return Err(BleError::NoActiveConnection);
        }
        let handle = conn.feature.as_mut().ok_or(BleError::NoActiveConnection)?;

        handle.set_value(payload);
        adapter
            .write_feature(handle)
            .map_err(|e| BleError::WriteFailed(e.to_string()))
    }

    /// Tear the current connection down. Returns whether there was one.
    pub fn disconnect(&self, adapter: &dyn BleAdapter) -> bool {
        let Some(previous) = self.slot.lock().connection.take() else {
            return false;
        };
        adapter.disconnect_gatt();
        adapter.close_gatt();
        info!("Disconnected from {}", previous.peer.address);
        true
    }

    /// Forget the connection without issuing hardware requests
    pub fn clear(&self) {
        self.slot.lock().connection.take();
    }

    /// Tear down the connection (if any) and refuse every later `connect`.
    ///
    /// Checked under the same lock as `connect`, so a connect racing with
    /// close either lands first and is torn down here, or is refused.
    pub fn close(&self, adapter: Option<&dyn BleAdapter>) -> bool {
        let previous = {
            let mut slot = self.slot.lock();
            slot.closed = true;
            slot.connection.take()
        };
        let Some(previous) = previous else {
            return false;
        };
        if let Some(adapter) = adapter {
            adapter.disconnect_gatt();
            adapter.close_gatt();
        }
        info!("Connection to {} closed", previous.peer.address);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }
}
