//! Mock DeviceProgrammer for unit testing
//!
//! Stores device layouts in memory and can be configured to fail specific
//! operations on specific devices. Every call is recorded so tests can
//! assert on ordering, and concurrently running mutations are counted so
//! tests can assert that device programming is never parallel.

use crate::error::DeviceError;
use crate::models::{AcceleratorInfo, DeviceSnapshot, DeviceTarget};
use crate::programmer_trait::DeviceProgrammer;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Operation kinds that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    /// `query`
    Query,
    /// `configure`
    Configure,
    /// `reset`
    Reset,
}

/// Mock DeviceProgrammer for testing
#[derive(Clone, Default)]
pub struct MockDeviceProgrammer {
    pub(crate) devices: Arc<Mutex<BTreeMap<String, DeviceSnapshot>>>,
    pub(crate) failures: Arc<Mutex<HashMap<(MockOperation, String), String>>>,
    pub(crate) calls: Arc<Mutex<Vec<String>>>,
    pub(crate) delay: Arc<Mutex<Option<Duration>>>,
    pub(crate) in_flight: Arc<AtomicUsize>,
    pub(crate) max_in_flight: Arc<AtomicUsize>,
    pub(crate) discover_fails: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for MockDeviceProgrammer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDeviceProgrammer")
            .field("devices", &self.devices.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

impl MockDeviceProgrammer {
    /// Create a new mock with no devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an unconfigured device (for test setup)
    pub fn add_device(&self, pci_address: &str) {
        self.set_device(DeviceSnapshot::unconfigured(pci_address));
    }

    /// Insert or replace a device snapshot (for test setup)
    pub fn set_device(&self, snapshot: DeviceSnapshot) {
        self.devices.lock().unwrap().insert(snapshot.pci_address.clone(), snapshot);
    }

    /// Remove a device, as if it was unplugged
    pub fn remove_device(&self, pci_address: &str) {
        self.devices.lock().unwrap().remove(pci_address);
    }

    /// Current snapshot of a device
    pub fn device(&self, pci_address: &str) -> Option<DeviceSnapshot> {
        self.devices.lock().unwrap().get(pci_address).cloned()
    }

    /// Make `operation` on `pci_address` fail with `reason` until cleared
    pub fn fail(&self, operation: MockOperation, pci_address: &str, reason: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert((operation, pci_address.to_string()), reason.to_string());
    }

    /// Clear an injected failure
    pub fn clear_failure(&self, operation: MockOperation, pci_address: &str) {
        self.failures.lock().unwrap().remove(&(operation, pci_address.to_string()));
    }

    /// Make `discover` fail with `reason`
    pub fn fail_discover(&self, reason: &str) {
        *self.discover_fails.lock().unwrap() = Some(reason.to_string());
    }

    /// Sleep this long inside every mutating call
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Recorded calls, e.g. `["query 0000:18:00.0", "configure 0000:18:00.0"]`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded mutating calls only (`configure`/`reset`)
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("configure") || c.starts_with("reset"))
            .collect()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Highest number of mutating calls observed running at once
    pub fn max_concurrent_mutations(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn injected(&self, operation: MockOperation, pci_address: &str) -> Option<String> {
        self.failures
            .lock()
            .unwrap()
            .get(&(operation, pci_address.to_string()))
            .cloned()
    }

    async fn enter_mutation(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn exit_mutation(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl DeviceProgrammer for MockDeviceProgrammer {
    async fn discover(&self) -> Result<Vec<AcceleratorInfo>, DeviceError> {
        self.record("discover".to_string());
        if let Some(reason) = self.discover_fails.lock().unwrap().clone() {
            return Err(DeviceError::Rejected(reason));
        }

        Ok(self
            .devices
            .lock()
            .unwrap()
            .values()
            .map(|d| AcceleratorInfo {
                pci_address: d.pci_address.clone(),
                vendor_id: "8086".to_string(),
                device_id: "0d5c".to_string(),
                driver: d.pf_driver.clone(),
                max_virtual_functions: 16,
                virtual_functions: d.vf_amount,
            })
            .collect())
    }

    async fn query(&self, pci_address: &str) -> Result<DeviceSnapshot, DeviceError> {
        self.record(format!("query {}", pci_address));
        if let Some(reason) = self.injected(MockOperation::Query, pci_address) {
            return Err(DeviceError::Rejected(reason));
        }

        self.device(pci_address)
            .ok_or_else(|| DeviceError::NotFound(pci_address.to_string()))
    }

    async fn configure(&self, target: &DeviceTarget) -> Result<(), DeviceError> {
        self.record(format!("configure {}", target.pci_address));
        self.enter_mutation().await;
        let result = (|| {
            if let Some(reason) = self.injected(MockOperation::Configure, &target.pci_address) {
                return Err(DeviceError::Rejected(reason));
            }
            let mut devices = self.devices.lock().unwrap();
            let device = devices
                .get_mut(&target.pci_address)
                .ok_or_else(|| DeviceError::NotFound(target.pci_address.clone()))?;
            if let Some(pf_driver) = &target.pf_driver {
                device.pf_driver = Some(pf_driver.clone());
            }
            device.vf_amount = target.vf_amount;
            device.vf_driver = (target.vf_amount > 0).then(|| target.vf_driver.clone());
            device.bitstream = target.bitstream.clone();
            Ok(())
        })();
        self.exit_mutation();
        result
    }

    async fn reset(&self, pci_address: &str) -> Result<(), DeviceError> {
        self.record(format!("reset {}", pci_address));
        self.enter_mutation().await;
        let result = (|| {
            if let Some(reason) = self.injected(MockOperation::Reset, pci_address) {
                return Err(DeviceError::Rejected(reason));
            }
            let mut devices = self.devices.lock().unwrap();
            let device = devices
                .get_mut(pci_address)
                .ok_or_else(|| DeviceError::NotFound(pci_address.to_string()))?;
            device.vf_amount = 0;
            device.vf_driver = None;
            device.bitstream = None;
            Ok(())
        })();
        self.exit_mutation();
        result
    }
}
