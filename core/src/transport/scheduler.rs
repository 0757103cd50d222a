//! Send scheduler: delayed, guarded, fire-and-forget writes
//!
//! Every send is an independent task. A zero delay writes on the caller's
//! thread (the hardware write is only a request, so this never blocks); any
//! other delay spawns a timer task. Guards are evaluated when the write
//! executes, not when it is scheduled. Overlapping delayed sends carry no
//! ordering guarantee between each other.

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::abstraction::BleError;
use super::adapter::AdapterAccess;
use super::bus::Message;
use super::gatt::ConnectionManager;

/// Schedules outbound payloads onto the active connection
pub struct SendScheduler {
    adapter: Arc<AdapterAccess>,
    connection: Arc<ConnectionManager>,
    runtime: Handle,
}

impl SendScheduler {
    pub fn new(
        adapter: Arc<AdapterAccess>,
        connection: Arc<ConnectionManager>,
        runtime: Handle,
    ) -> Self {
        Self {
            adapter,
            connection,
            runtime,
        }
    }

    /// Write `payload` after `delay`. The outcome is only logged.
    pub fn send(&self, payload: Vec<u8>, delay: Duration) {
        let message = Message::outbound(payload, delay);

        if delay.is_zero() {
            Self::execute(&self.adapter, &self.connection, &message);
            return;
        }

        debug!("Send of {} bytes scheduled in {:?}", message.payload.len(), delay);
        let adapter = Arc::clone(&self.adapter);
        let connection = Arc::clone(&self.connection);
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            Self::execute(&adapter, &connection, &message);
        });
    }

    fn execute(adapter: &AdapterAccess, connection: &ConnectionManager, message: &Message) {
        match Self::guarded_write(adapter, connection, &message.payload) {
            Ok(()) => info!("Send success ({} bytes)", message.payload.len()),
            Err(e @ BleError::WriteFailed(_)) => warn!("Send fail: {}", e),
            Err(e) => warn!("Send dropped: {}", e),
        }
    }

    /// Guards, in order: hardware enabled, a connection exists, it is Ready
    fn guarded_write(
        adapter: &AdapterAccess,
        connection: &ConnectionManager,
        payload: &[u8],
    ) -> Result<(), BleError> {
        let adapter = adapter.enabled()?;
        connection.write(&*adapter, payload)
    }
}
