//! SriovFecNodeConfig CRD
//!
//! One record per node. `spec` declares the accelerator layout an operator
//! wants on the node; `status` reflects what the node daemon actually
//! realized.

use crate::condition::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default driver bound to newly created virtual functions.
pub const DEFAULT_VF_DRIVER: &str = "vfio-pci";

fn default_vf_driver() -> String {
    DEFAULT_VF_DRIVER.to_string()
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "sriovfec.intel.com",
    version = "v1",
    kind = "SriovFecNodeConfig",
    namespaced,
    status = "SriovFecNodeConfigStatus",
    shortname = "sfnc"
)]
#[serde(rename_all = "camelCase")]
pub struct SriovFecNodeConfigSpec {
    /// Desired configuration, one entry per accelerator physical function.
    /// Order matters: create and update actions are applied in this order.
    #[serde(default)]
    pub physical_functions: Vec<PhysicalFunctionConfig>,
}

/// Configuration of a single accelerator physical function.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalFunctionConfig {
    /// PCI address of the physical function (e.g. "0000:18:00.0")
    pub pci_address: String,

    /// Driver the physical function should be bound to (left as-is when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pf_driver: Option<String>,

    /// Driver bound to each virtual function
    #[serde(default = "default_vf_driver")]
    pub vf_driver: String,

    /// Number of virtual functions to create
    #[serde(default)]
    pub vf_amount: u32,

    /// Bitstream/firmware file name, resolved inside the daemon's firmware directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitstream: Option<String>,
}

impl PhysicalFunctionConfig {
    /// Creates a config with the default VF driver and no bitstream.
    pub fn new(pci_address: impl Into<String>, vf_amount: u32) -> Self {
        Self {
            pci_address: pci_address.into(),
            pf_driver: None,
            vf_driver: default_vf_driver(),
            vf_amount,
            bitstream: None,
        }
    }
}

/// Observed state of a node's accelerators.
///
/// Vectors are always serialized, even when empty, so that a JSON merge
/// patch replaces the stored lists instead of leaving stale entries behind.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SriovFecNodeConfigStatus {
    /// Physical functions whose configuration was successfully applied
    #[serde(default)]
    pub physical_functions: Vec<PhysicalFunctionConfig>,

    /// Conditions (`ConfigurationApplied`, `ConfigurationDegraded`)
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation of the spec that was fully attempted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Accelerators discovered on the node
    #[serde(default)]
    pub inventory: Vec<AcceleratorInventory>,
}

impl SriovFecNodeConfigStatus {
    /// Returns the applied entry for a PCI address, if any.
    pub fn applied(&self, pci_address: &str) -> Option<&PhysicalFunctionConfig> {
        self.physical_functions
            .iter()
            .find(|pf| pf.pci_address == pci_address)
    }
}

/// Accelerator physical function found on the node.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorInventory {
    /// PCI address of the physical function
    pub pci_address: String,

    /// PCI vendor ID (hex, without 0x prefix)
    pub vendor_id: String,

    /// PCI device ID (hex, without 0x prefix)
    pub device_id: String,

    /// Driver currently bound to the physical function
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,

    /// Value of `sriov_totalvfs`
    pub max_virtual_functions: u32,

    /// Value of `sriov_numvfs`
    pub virtual_functions: u32,
}
