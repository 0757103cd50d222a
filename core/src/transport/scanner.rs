/// Device scanner with bounded discovery sessions
///
/// At most one discovery session is armed at a time. A session ends when the
/// target device shows up, when `stop` is called, or when the fixed scan
/// period elapses, whichever comes first. The period timer is a detached
/// tokio task; it cannot be cancelled, so each session carries a generation
/// number and a timer only ends the session it was started for.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, info};

use super::abstraction::{BleError, RemoteDevice, SCAN_PERIOD};
use super::adapter::BleAdapter;

/// Callback for named devices that are not the target
pub type DiscoveryListener = Arc<dyn Fn(&RemoteDevice) + Send + Sync>;

/// Scanner state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    /// Idle, not scanning
    Idle,
    /// A discovery session is armed
    Scanning,
}

/// What the scanner did with one discovery callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// No session armed; dropped
    Inactive,
    /// No advertised name; dropped
    Unnamed,
    /// Handed to the discovery listener (if any)
    Reported,
    /// Target found; the session is over and the device should be connected
    Matched(RemoteDevice),
}

struct ScanSession {
    generation: u64,
    target_name: Option<String>,
    listener: Option<DiscoveryListener>,
}

struct ScannerInner {
    session: Option<ScanSession>,
    next_generation: u64,
    closed: bool,
}

/// BLE device scanner
pub struct DeviceScanner {
    inner: Mutex<ScannerInner>,
}

impl DeviceScanner {
    /// Create a new idle scanner
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ScannerInner {
                session: None,
                next_generation: 0,
                closed: false,
            }),
        }
    }

    /// Get current scanner state
    pub fn state(&self) -> ScannerState {
        if self.inner.lock().session.is_some() {
            ScannerState::Scanning
        } else {
            ScannerState::Idle
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == ScannerState::Scanning
    }

    /// Arm a discovery session and start hardware discovery.
    ///
    /// Returns `Ok(false)` without touching the hardware if a session is
    /// already armed, and `SessionClosed` once the scanner is closed. The
    /// target name is captured here; later configuration changes do not
    /// affect a running session.
    pub fn start(
        self: &Arc<Self>,
        adapter: Arc<dyn BleAdapter>,
        runtime: &Handle,
        target_name: Option<String>,
        listener: Option<DiscoveryListener>,
    ) -> Result<bool, BleError> {
        let generation = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(BleError::SessionClosed);
            }
            if inner.session.is_some() {
                debug!("Scan already active, ignoring start request");
                return Ok(false);
            }
            inner.next_generation += 1;
            let generation = inner.next_generation;
            inner.session = Some(ScanSession {
                generation,
                target_name,
                listener,
            });
            generation
        };

        if let Err(e) = adapter.start_le_scan() {
            self.deactivate(Some(generation));
            return Err(e);
        }

        // The session may have ended while the request was in flight
        let (current, closed) = {
            let inner = self.inner.lock();
            let current = inner
                .session
                .as_ref()
                .is_some_and(|session| session.generation == generation);
            (current, inner.closed)
        };
        if !current {
            adapter.stop_le_scan();
            debug!("Scan session {} ended while starting", generation);
            return if closed {
                Err(BleError::SessionClosed)
            } else {
                Ok(false)
            };
        }
        info!("Scan started (session {}, {:?})", generation, SCAN_PERIOD);

        let scanner: Weak<Self> = Arc::downgrade(self);
        runtime.spawn(async move {
            tokio::time::sleep(SCAN_PERIOD).await;
            let Some(scanner) = scanner.upgrade() else {
                return;
            };
            if scanner.deactivate(Some(generation)) {
                adapter.stop_le_scan();
                info!("Scan period elapsed (session {})", generation);
            }
        });

        Ok(true)
    }

    /// Deactivate the current session (if any) and stop hardware discovery.
    ///
    /// Returns whether a session was armed. Safe to call at any time.
    pub fn stop(&self, adapter: Option<&dyn BleAdapter>) -> bool {
        let was_active = self.deactivate(None);
        if let Some(adapter) = adapter {
            adapter.stop_le_scan();
        }
        if was_active {
            info!("Scan stopped");
        }
        was_active
    }

    /// End the current session and refuse every later `start`
    pub fn close(&self, adapter: Option<&dyn BleAdapter>) -> bool {
        let was_active = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.session.take().is_some()
        };
        if let Some(adapter) = adapter {
            adapter.stop_le_scan();
        }
        if was_active {
            info!("Scan stopped, scanner closed");
        }
        was_active
    }

    /// Route one discovery callback.
    ///
    /// The listener runs after the scanner lock is released, so it may call
    /// back into the session (for instance to stop scanning).
    pub fn on_device_found(&self, device: RemoteDevice) -> ScanOutcome {
        let listener = {
            let mut inner = self.inner.lock();
            let Some(session) = inner.session.as_ref() else {
                debug!("Discovery callback while not scanning: {}", device);
                return ScanOutcome::Inactive;
            };
            let Some(name) = device.name.as_deref() else {
                return ScanOutcome::Unnamed;
            };

            debug!("Found device: {}", device);
            if session.target_name.as_deref() == Some(name) {
                inner.session = None;
                info!("Target device {} found, ending scan", name);
                return ScanOutcome::Matched(device);
            }
            session.listener.clone()
        };

        if let Some(listener) = listener {
            listener(&device);
        }
        ScanOutcome::Reported
    }

    /// End the session if it is `generation` (or any session for `None`)
    fn deactivate(&self, generation: Option<u64>) -> bool {
        let mut inner = self.inner.lock();
        let matches = match (&inner.session, generation) {
            (Some(_), None) => true,
            (Some(session), Some(generation)) => session.generation == generation,
            (None, _) => false,
        };
        if matches {
            inner.session = None;
        }
        matches
    }
}

impl Default for DeviceScanner {
    fn default() -> Self {
        Self::new()
    }
}
