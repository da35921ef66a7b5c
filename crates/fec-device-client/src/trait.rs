//! DeviceProgrammer trait for mocking
//!
//! This trait abstracts accelerator programming so the reconciler can be
//! exercised without hardware. `SysfsDeviceClient` is the production
//! implementation; tests use `MockDeviceProgrammer`.

use crate::error::DeviceError;
use crate::models::{AcceleratorInfo, DeviceSnapshot, DeviceTarget};

/// Trait for accelerator programming operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
/// Callers must not run two mutating calls for devices sharing a physical
/// function concurrently.
#[async_trait::async_trait]
pub trait DeviceProgrammer: Send + Sync {
    /// Lists supported accelerators present on the node
    async fn discover(&self) -> Result<Vec<AcceleratorInfo>, DeviceError>;

    /// Reads the current layout of a physical function
    ///
    /// Returns `DeviceError::NotFound` when no device exists at the address.
    async fn query(&self, pci_address: &str) -> Result<DeviceSnapshot, DeviceError>;

    /// Programs a physical function to the target layout
    async fn configure(&self, target: &DeviceTarget) -> Result<(), DeviceError>;

    /// Removes all VFs and forgets the loaded bitstream
    async fn reset(&self, pci_address: &str) -> Result<(), DeviceError>;
}
