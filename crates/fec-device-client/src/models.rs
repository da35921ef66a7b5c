//! Device models

/// Desired layout for one physical function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    pub pci_address: String,
    /// Rebind the PF to this driver first (left as-is when `None`)
    pub pf_driver: Option<String>,
    pub vf_driver: String,
    pub vf_amount: u32,
    /// Bitstream file name inside the firmware directory
    pub bitstream: Option<String>,
}

impl DeviceTarget {
    /// Target with no PF rebind and no bitstream.
    pub fn new(pci_address: impl Into<String>, vf_driver: impl Into<String>, vf_amount: u32) -> Self {
        Self {
            pci_address: pci_address.into(),
            pf_driver: None,
            vf_driver: vf_driver.into(),
            vf_amount,
            bitstream: None,
        }
    }
}

/// Actual layout of one physical function, read fresh from the device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceSnapshot {
    pub pci_address: String,
    pub pf_driver: Option<String>,
    /// Driver of the first VF; `None` when there are no VFs or it is unbound
    pub vf_driver: Option<String>,
    pub vf_amount: u32,
    /// Bitstream last programmed by this client
    pub bitstream: Option<String>,
}

impl DeviceSnapshot {
    /// Snapshot of a device with no VFs and no bitstream.
    pub fn unconfigured(pci_address: impl Into<String>) -> Self {
        Self {
            pci_address: pci_address.into(),
            ..Default::default()
        }
    }

    /// Whether the device carries any configuration we would have to undo.
    pub fn is_configured(&self) -> bool {
        self.vf_amount > 0 || self.bitstream.is_some()
    }
}

/// An accelerator found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorInfo {
    pub pci_address: String,
    pub vendor_id: String,
    pub device_id: String,
    pub driver: Option<String>,
    pub max_virtual_functions: u32,
    pub virtual_functions: u32,
}

/// Vendor/device IDs of supported FEC accelerators.
pub const SUPPORTED_ACCELERATORS: &[(&str, &str, &str)] = &[
    ("8086", "0d5c", "ACC100"),
    ("8086", "0d8f", "N3000"),
    ("8086", "57c0", "ACC200"),
];

/// Returns the model name for a supported vendor/device pair.
pub fn accelerator_model(vendor_id: &str, device_id: &str) -> Option<&'static str> {
    SUPPORTED_ACCELERATORS
        .iter()
        .find(|(v, d, _)| *v == vendor_id && *d == device_id)
        .map(|(_, _, model)| *model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_configured() {
        assert!(!DeviceSnapshot::unconfigured("0000:18:00.0").is_configured());

        let with_vfs = DeviceSnapshot {
            vf_amount: 1,
            ..DeviceSnapshot::unconfigured("0000:18:00.0")
        };
        assert!(with_vfs.is_configured());

        let with_bitstream = DeviceSnapshot {
            bitstream: Some("acc100.cfg".to_string()),
            ..DeviceSnapshot::unconfigured("0000:18:00.0")
        };
        assert!(with_bitstream.is_configured());
    }

    #[test]
    fn test_accelerator_model() {
        assert_eq!(accelerator_model("8086", "0d5c"), Some("ACC100"));
        assert_eq!(accelerator_model("8086", "1572"), None);
    }
}
