//! FEC Accelerator Programming Client
//!
//! Reads and changes the SR-IOV layout of forward-error-correction
//! accelerators attached to the local node.
//!
//! # Example
//!
//! ```no_run
//! use fec_device_client::{DeviceProgrammer, DeviceTarget, SysfsDeviceClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SysfsDeviceClient::builder()
//!     .firmware_dir("/sriov_artifacts")
//!     .build();
//!
//! // Current layout of one physical function
//! let snapshot = client.query("0000:18:00.0").await?;
//! println!("{} VFs", snapshot.vf_amount);
//!
//! // Carve two VFs bound to vfio-pci
//! client.configure(&DeviceTarget::new("0000:18:00.0", "vfio-pci", 2)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Discovery**: Finds known FEC accelerators on the PCI bus
//! - **Query**: Reports VF count, drivers and the loaded bitstream
//! - **Configure/Reset**: Programs bitstreams and (re)creates VFs
//! - **test-util**: In-memory `MockDeviceProgrammer` for unit tests

pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod programmer_trait;
pub mod sysfs;
#[cfg(feature = "test-util")]
pub mod mock;

pub use error::DeviceError;
pub use models::*;
pub use programmer_trait::DeviceProgrammer;
pub use sysfs::{SysfsDeviceClient, SysfsDeviceClientBuilder};
#[cfg(feature = "test-util")]
pub use mock::{MockDeviceProgrammer, MockOperation};
