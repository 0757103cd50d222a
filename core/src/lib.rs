// blelink: single-peripheral BLE central session
//
// Scan for a named peripheral, connect, resolve one GATT feature, then stream
// its notifications to subscribers and write payloads back to it.
//
// The radio stack is external: it is driven through the BleAdapter bridge and
// reports back through BleSession::handle_event.

pub mod config;
pub mod transport;

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use config::{ConfigError, SessionConfig};
pub use transport::{
    BleAdapter, BleError, ConnectionState, Direction, FeatureHandle, GattFeature, GattService,
    HardwareEvent, InboundStream, LinkState, Message, PeerInfo, RemoteDevice, ScannerState,
    GATT_SUCCESS, SCAN_PERIOD, TARGET_FEATURE_UUID,
};

use transport::{
    AdapterAccess, ConnectionManager, DataBus, DeviceScanner, DiscoveryListener, ScanOutcome,
    SendScheduler,
};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_filter`. Idempotent: a subscriber that is
/// already installed is left alone.
pub fn init_logging(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .try_init();
}

// ============================================================================
// SESSION
// ============================================================================

struct SessionInner {
    config: RwLock<SessionConfig>,
    adapter: Arc<AdapterAccess>,
    scanner: Arc<DeviceScanner>,
    connection: Arc<ConnectionManager>,
    bus: Arc<DataBus>,
    scheduler: SendScheduler,
    runtime: Handle,
}

/// One BLE central session.
///
/// Created and owned by the application; clones share the same session. The
/// platform glue keeps a clone to deliver hardware callbacks through
/// [`BleSession::handle_event`], from whatever thread the stack uses.
///
/// Operations never fail towards the caller: anything that cannot be done
/// (no hardware, no ready connection, rejected request) is logged and skipped.
#[derive(Clone)]
pub struct BleSession {
    inner: Arc<SessionInner>,
}

impl BleSession {
    /// Create a session on the current tokio runtime
    pub fn new(config: SessionConfig) -> Result<Self, BleError> {
        let runtime = Handle::try_current().map_err(|_| BleError::NoRuntime)?;
        Ok(Self::with_runtime(config, runtime))
    }

    /// Create a session whose timers run on `runtime`
    pub fn with_runtime(config: SessionConfig, runtime: Handle) -> Self {
        init_logging(&config.log_filter);
        if let Err(e) = config.validate() {
            warn!("Session config: {}", e);
        }

        let adapter = Arc::new(AdapterAccess::new());
        let bus = Arc::new(DataBus::new());
        let connection = Arc::new(ConnectionManager::new(TARGET_FEATURE_UUID, Arc::clone(&bus)));
        let scheduler = SendScheduler::new(
            Arc::clone(&adapter),
            Arc::clone(&connection),
            runtime.clone(),
        );

        Self {
            inner: Arc::new(SessionInner {
                config: RwLock::new(config),
                adapter,
                scanner: Arc::new(DeviceScanner::new()),
                connection,
                bus,
                scheduler,
                runtime,
            }),
        }
    }

    pub fn config(&self) -> SessionConfig {
        self.inner.config.read().clone()
    }

    /// Replace the configuration. Scans already running keep the target name
    /// they started with.
    pub fn set_config(&self, config: SessionConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.inner.config.write() = config;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Adapter
    // ------------------------------------------------------------------------

    /// Acquire and power on the hardware. `None` means the platform has no
    /// BLE hardware; the session then ignores every operation.
    pub fn open(&self, adapter: Option<Arc<dyn BleAdapter>>) {
        self.inner.adapter.open(adapter);
    }

    /// Tear everything down: stop scanning, drop the connection, cancel
    /// discovery, release the hardware and complete every inbound stream.
    /// Safe to call any number of times, opened or not.
    pub fn close(&self) {
        info!("Closing BLE session");
        let adapter = self.inner.adapter.release();
        self.inner.scanner.close(adapter.as_deref());
        self.inner.connection.close(adapter.as_deref());
        if let Some(adapter) = adapter {
            adapter.cancel_discovery();
        }
        self.inner.bus.close();
    }

    pub fn is_available(&self) -> bool {
        self.inner.adapter.is_available()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.adapter.is_enabled()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.adapter.is_released()
    }

    // ------------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------------

    /// Start (`true`) or stop (`false`) discovery for the configured target
    pub fn scan(&self, enable: bool) {
        if enable {
            self.arm_scan(None);
        } else {
            self.stop_scan();
        }
    }

    /// Start discovery; named devices other than the target are passed to
    /// `on_discover`, once per advertisement
    pub fn start_scan<F>(&self, on_discover: F)
    where
        F: Fn(&RemoteDevice) + Send + Sync + 'static,
    {
        let listener: DiscoveryListener = Arc::new(on_discover);
        self.arm_scan(Some(listener));
    }

    pub fn stop_scan(&self) {
        let adapter = self.inner.adapter.get().ok();
        self.inner.scanner.stop(adapter.as_deref());
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanner.is_active()
    }

    fn arm_scan(&self, listener: Option<DiscoveryListener>) {
        let adapter = match self.inner.adapter.enabled() {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("Scan ignored: {}", e);
                return;
            }
        };
        let target_name = self.inner.config.read().target_name.clone();
        if let Err(e) = self
            .inner
            .scanner
            .start(adapter, &self.inner.runtime, target_name, listener)
        {
            warn!("Failed to start scan: {}", e);
        }
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Connect to `device`, stopping any scan first. Supersedes the current
    /// connection.
    pub fn connect(&self, device: &RemoteDevice) {
        let adapter = match self.inner.adapter.get() {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("Connect to {} ignored: {}", device, e);
                return;
            }
        };

        self.inner.scanner.stop(Some(&*adapter));
        if let Err(e) = self.inner.connection.connect(&*adapter, device) {
            warn!("Connect to {} failed: {}", device, e);
        }
    }

    /// Drop the current connection but keep the session open
    pub fn disconnect(&self) {
        match self.inner.adapter.get() {
            Ok(adapter) => {
                self.inner.connection.disconnect(&*adapter);
            }
            Err(_) => self.inner.connection.clear(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn connected_peer(&self) -> Option<PeerInfo> {
        self.inner.connection.peer()
    }

    /// Snapshot of the resolved feature handle (present only when Ready)
    pub fn feature_handle(&self) -> Option<FeatureHandle> {
        self.inner.connection.feature()
    }

    pub fn target_feature(&self) -> Uuid {
        self.inner.connection.target_feature()
    }

    // ------------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------------

    /// Write `payload` to the peripheral after `delay_ms` (0 = now).
    /// Fire-and-forget: dropped with a log line unless the connection is
    /// Ready when the write comes due.
    pub fn send(&self, payload: impl Into<Vec<u8>>, delay_ms: u64) {
        self.inner
            .scheduler
            .send(payload.into(), Duration::from_millis(delay_ms));
    }

    pub fn send_now(&self, payload: impl Into<Vec<u8>>) {
        self.send(payload, 0);
    }

    /// Stream of inbound payloads posted from now on
    pub fn subscribe_inbound(&self) -> InboundStream {
        self.inner.bus.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.bus.subscriber_count()
    }

    // ------------------------------------------------------------------------
    // Hardware callbacks
    // ------------------------------------------------------------------------

    /// Entry point for every asynchronous callback from the platform stack
    pub fn handle_event(&self, event: HardwareEvent) {
        debug!("Hardware event: {}", event);
        match event {
            HardwareEvent::DeviceDiscovered(device) => self.on_device_discovered(device),
            HardwareEvent::ConnectionStateChanged { status, state } => {
                self.on_connection_state_change(status, state)
            }
            HardwareEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, &services)
            }
            HardwareEvent::FeatureChanged { feature, value } => {
                self.on_feature_changed(feature, value)
            }
        }
    }

    pub fn on_device_discovered(&self, device: RemoteDevice) {
        if let ScanOutcome::Matched(device) = self.inner.scanner.on_device_found(device) {
            self.connect(&device);
        }
    }

    pub fn on_connection_state_change(&self, status: i32, state: LinkState) {
        let Ok(adapter) = self.inner.adapter.get() else {
            debug!("Link state {} after adapter release, ignoring", state);
            return;
        };
        if let Err(e) = self.inner.connection.on_link_state(&*adapter, status, state) {
            warn!("Feature discovery request failed: {}", e);
        }
    }

    pub fn on_services_discovered(&self, status: i32, services: &[GattService]) {
        let Ok(adapter) = self.inner.adapter.get() else {
            debug!("Services discovered after adapter release, ignoring");
            return;
        };
        match self
            .inner
            .connection
            .on_services_discovered(&*adapter, status, services)
        {
            Ok(()) => {}
            Err(e @ BleError::FeatureNotFound(_)) => {
                warn!("{}: connection cannot carry data", e)
            }
            Err(e) => warn!("Failed to subscribe to target feature: {}", e),
        }
    }

    pub fn on_feature_changed(&self, feature: Uuid, value: Vec<u8>) {
        if let Err(e) = self.inner.connection.on_feature_changed(feature, value) {
            debug!("Notification dropped: {}", e);
        }
    }
}

impl fmt::Debug for BleSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleSession")
            .field("available", &self.is_available())
            .field("scanning", &self.is_scanning())
            .field("connection", &self.connection_state())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
