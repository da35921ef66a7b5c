//! Test utilities for daemon unit tests.
//!
//! `MemoryNodeConfigStore` mimics the API server semantics the reconciler
//! relies on: resourceVersion bumps on every write, generation bumps on
//! spec changes only, and conditional status writes fail with a conflict.

use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use crate::store::{NodeConfigStore, StoreError};
use async_trait::async_trait;
use crds::{PhysicalFunctionConfig, SriovFecNodeConfig, SriovFecNodeConfigSpec, SriovFecNodeConfigStatus};
use fec_device_client::{DeviceProgrammer, DeviceSnapshot, MockDeviceProgrammer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub const NODE: &str = "node-1";
pub const NAMESPACE: &str = "vran-acceleration-operators";

/// Physical function config with the default VF driver
pub fn pf(pci_address: &str, vf_amount: u32) -> PhysicalFunctionConfig {
    PhysicalFunctionConfig::new(pci_address, vf_amount)
}

/// Device snapshot as left behind by a successful configure
pub fn configured_device(pci_address: &str, vf_amount: u32) -> DeviceSnapshot {
    DeviceSnapshot {
        pci_address: pci_address.to_string(),
        pf_driver: None,
        vf_driver: (vf_amount > 0).then(|| crds::DEFAULT_VF_DRIVER.to_string()),
        vf_amount,
        bitstream: None,
    }
}

/// Reconciler over the given store and mock, plus its shutdown switch
pub fn reconciler_for(
    store: Arc<MemoryNodeConfigStore>,
    programmer: MockDeviceProgrammer,
) -> (Reconciler, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new().unwrap());
    let store: Arc<dyn NodeConfigStore> = store;
    let programmer: Arc<dyn DeviceProgrammer> = Arc::new(programmer);
    (Reconciler::new(store, programmer, metrics, shutdown_rx), shutdown_tx)
}

/// In-memory NodeConfigStore
#[derive(Default)]
pub struct MemoryNodeConfigStore {
    records: Mutex<HashMap<String, SriovFecNodeConfig>>,
    next_version: AtomicU64,
    /// Spec applied right after the next `get` returns
    edit_after_get: Mutex<Option<Vec<PhysicalFunctionConfig>>>,
    hide_next_get: AtomicBool,
    fail_next_get: AtomicBool,
    status_writes: AtomicUsize,
    create_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

impl MemoryNodeConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_version(&self) -> String {
        (self.next_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Insert a record with the given spec at generation 1
    pub fn insert_spec(&self, name: &str, namespace: &str, physical_functions: Vec<PhysicalFunctionConfig>) {
        let mut record = SriovFecNodeConfig::new(name, SriovFecNodeConfigSpec { physical_functions });
        record.metadata.namespace = Some(namespace.to_string());
        record.metadata.generation = Some(1);
        record.metadata.resource_version = Some(self.bump_version());
        self.records.lock().unwrap().insert(name.to_string(), record);
    }

    /// Replace the spec of an existing record, bumping its generation
    pub fn set_spec(&self, name: &str, physical_functions: Vec<PhysicalFunctionConfig>) {
        let version = self.bump_version();
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(name).expect("record exists");
        record.spec.physical_functions = physical_functions;
        record.metadata.generation = Some(record.metadata.generation.unwrap_or(0) + 1);
        record.metadata.resource_version = Some(version);
    }

    /// Seed a status without counting it as a reconciler write
    pub fn seed_status(&self, name: &str, status: SriovFecNodeConfigStatus) {
        let version = self.bump_version();
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(name).expect("record exists");
        record.status = Some(status);
        record.metadata.resource_version = Some(version);
    }

    pub fn record(&self, name: &str) -> Option<SriovFecNodeConfig> {
        self.records.lock().unwrap().get(name).cloned()
    }

    pub fn status(&self, name: &str) -> Option<SriovFecNodeConfigStatus> {
        self.record(name).and_then(|r| r.status)
    }

    /// Simulate a concurrent spec edit landing between read and write
    pub fn edit_after_next_get(&self, physical_functions: Vec<PhysicalFunctionConfig>) {
        *self.edit_after_get.lock().unwrap() = Some(physical_functions);
    }

    /// Next `get` reports the record as missing
    pub fn hide_next_get(&self) {
        self.hide_next_get.store(true, Ordering::SeqCst);
    }

    /// Next `get` fails with `StoreError::Forbidden`
    pub fn fail_next_get(&self) {
        self.fail_next_get.store(true, Ordering::SeqCst);
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeConfigStore for MemoryNodeConfigStore {
    async fn get(&self, name: &str) -> Result<Option<SriovFecNodeConfig>, StoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_get.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Forbidden(name.to_string()));
        }
        if self.hide_next_get.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }

        let record = self.record(name);
        if record.is_some() {
            if let Some(spec) = self.edit_after_get.lock().unwrap().take() {
                self.set_spec(name, spec);
            }
        }
        Ok(record)
    }

    async fn create(&self, record: &SriovFecNodeConfig) -> Result<SriovFecNodeConfig, StoreError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let name = record.metadata.name.clone().unwrap_or_default();
        let version = self.bump_version();
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&name) {
            return Err(StoreError::AlreadyExists(name));
        }
        let mut stored = record.clone();
        stored.metadata.generation = Some(1);
        stored.metadata.resource_version = Some(version);
        records.insert(name, stored.clone());
        Ok(stored)
    }

    async fn update_status(
        &self,
        name: &str,
        resource_version: Option<&str>,
        status: &SriovFecNodeConfigStatus,
    ) -> Result<SriovFecNodeConfig, StoreError> {
        let version = self.bump_version();
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if let Some(expected) = resource_version {
            if record.metadata.resource_version.as_deref() != Some(expected) {
                return Err(StoreError::Conflict(name.to_string()));
            }
        }
        record.status = Some(status.clone());
        record.metadata.resource_version = Some(version);
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(record.clone())
    }
}
