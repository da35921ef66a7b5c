//! Device client errors

use thiserror::Error;

/// Errors that can occur when reading or programming an accelerator
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No device at the given PCI address
    #[error("Device not found: {0}")]
    NotFound(String),

    /// Bitstream/firmware reference missing, unreadable or incompatible
    #[error("Firmware error: {0}")]
    Firmware(String),

    /// The requested layout or privileged operation was refused
    #[error("Operation rejected: {0}")]
    Rejected(String),

    /// The external bitstream tool failed
    #[error("Bitstream tool failed: {0}")]
    Tool(String),

    /// Filesystem error while talking to sysfs
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Returns true when the device does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DeviceError::NotFound(_))
    }
}
