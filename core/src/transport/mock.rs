// Recording BLE adapter for tests
//
// Never touches hardware: every request is appended to a call log and answered
// according to the configured failure switches. Callbacks are not generated;
// tests inject HardwareEvents into the session themselves.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::abstraction::{BleError, FeatureHandle};
use super::adapter::BleAdapter;

/// One request made against the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    Enable,
    StartLeScan,
    StopLeScan,
    CancelDiscovery,
    ConnectGatt { address: String, auto_connect: bool },
    DiscoverServices,
    SetNotification { service: Uuid, feature: Uuid, enable: bool },
    WriteFeature { feature: Uuid, value: Vec<u8> },
    DisconnectGatt,
    CloseGatt,
}

#[derive(Debug)]
struct MockState {
    enabled: bool,
    fail_scan: bool,
    fail_connect: bool,
    fail_discovery: bool,
    fail_notification: bool,
    fail_writes: bool,
    calls: Vec<AdapterCall>,
}

/// Runs after a request is recorded, with no mock lock held
pub type CallHook = Arc<dyn Fn(&AdapterCall) + Send + Sync>;

/// Mock implementation of BleAdapter for testing
pub struct MockBleAdapter {
    state: RwLock<MockState>,
    hook: RwLock<Option<CallHook>>,
}

impl MockBleAdapter {
    /// A powered-on adapter where every request succeeds
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MockState {
                enabled: true,
                fail_scan: false,
                fail_connect: false,
                fail_discovery: false,
                fail_notification: false,
                fail_writes: false,
                calls: Vec::new(),
            }),
            hook: RwLock::new(None),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.write().enabled = enabled;
    }

    pub fn fail_scan(&self, fail: bool) {
        self.state.write().fail_scan = fail;
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state.write().fail_connect = fail;
    }

    pub fn fail_discovery(&self, fail: bool) {
        self.state.write().fail_discovery = fail;
    }

    pub fn fail_notification(&self, fail: bool) {
        self.state.write().fail_notification = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.write().fail_writes = fail;
    }

    /// Every request so far, in order
    pub fn calls(&self) -> Vec<AdapterCall> {
        self.state.read().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&AdapterCall) -> bool) -> usize {
        self.state.read().calls.iter().filter(|c| matches(c)).count()
    }

    /// Payloads passed to `write_feature`, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state
            .read()
            .calls
            .iter()
            .filter_map(|call| match call {
                AdapterCall::WriteFeature { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.write().calls.clear();
    }

    /// Call `hook` for every request from now on. The hook may call back
    /// into whatever drives this adapter, the way a stack delivering a
    /// callback on another thread would.
    pub fn on_call(&self, hook: impl Fn(&AdapterCall) + Send + Sync + 'static) {
        *self.hook.write() = Some(Arc::new(hook));
    }

    fn record(&self, call: AdapterCall) {
        self.state.write().calls.push(call.clone());
        let hook = self.hook.read().clone();
        if let Some(hook) = hook {
            hook(&call);
        }
    }
}

impl fmt::Debug for MockBleAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockBleAdapter")
            .field("state", &*self.state.read())
            .field("hooked", &self.hook.read().is_some())
            .finish()
    }
}

impl Default for MockBleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl BleAdapter for MockBleAdapter {
    fn is_enabled(&self) -> bool {
        self.state.read().enabled
    }

    fn enable(&self) -> Result<(), BleError> {
        self.record(AdapterCall::Enable);
        self.state.write().enabled = true;
        Ok(())
    }

    fn start_le_scan(&self) -> Result<(), BleError> {
        self.record(AdapterCall::StartLeScan);
        if self.state.read().fail_scan {
            return Err(BleError::Platform("scan refused".to_string()));
        }
        Ok(())
    }

    fn stop_le_scan(&self) {
        self.record(AdapterCall::StopLeScan);
    }

    fn cancel_discovery(&self) {
        self.record(AdapterCall::CancelDiscovery);
    }

    fn connect_gatt(&self, address: &str, auto_connect: bool) -> Result<(), BleError> {
        self.record(AdapterCall::ConnectGatt {
            address: address.to_string(),
            auto_connect,
        });
        if self.state.read().fail_connect {
            return Err(BleError::Platform("connect rejected".to_string()));
        }
        Ok(())
    }

    fn discover_services(&self) -> Result<(), BleError> {
        self.record(AdapterCall::DiscoverServices);
        if self.state.read().fail_discovery {
            return Err(BleError::Platform("discovery rejected".to_string()));
        }
        Ok(())
    }

    fn set_notification(&self, service: Uuid, feature: Uuid, enable: bool) -> Result<(), BleError> {
        self.record(AdapterCall::SetNotification {
            service,
            feature,
            enable,
        });
        if self.state.read().fail_notification {
            return Err(BleError::Platform("descriptor write rejected".to_string()));
        }
        Ok(())
    }

    fn write_feature(&self, handle: &FeatureHandle) -> Result<(), BleError> {
        self.record(AdapterCall::WriteFeature {
            feature: handle.feature,
            value: handle.value().to_vec(),
        });
        if self.state.read().fail_writes {
            return Err(BleError::Platform("write rejected".to_string()));
        }
        Ok(())
    }

    fn disconnect_gatt(&self) {
        self.record(AdapterCall::DisconnectGatt);
    }

    fn close_gatt(&self) {
        self.record(AdapterCall::CloseGatt);
    }
}
