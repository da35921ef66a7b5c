//! Device applier.
//!
//! Executes one `ConfigAction` against the device programmer. Failures are
//! reported as an `ApplyOutcome` and never abort the pass.

use super::comparator::ConfigAction;
use crds::PhysicalFunctionConfig;
use fec_device_client::{DeviceProgrammer, DeviceTarget};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of applying one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Success,
    Failed(String),
    /// Not attempted
    Skipped(String),
}

impl ApplyOutcome {
    /// Label used in metrics
    pub fn label(&self) -> &'static str {
        match self {
            ApplyOutcome::Success => "success",
            ApplyOutcome::Failed(_) => "failed",
            ApplyOutcome::Skipped(_) => "skipped",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ApplyOutcome::Success => None,
            ApplyOutcome::Failed(reason) | ApplyOutcome::Skipped(reason) => Some(reason),
        }
    }
}

/// Device programming target for a physical function config
pub fn device_target(config: &PhysicalFunctionConfig) -> DeviceTarget {
    DeviceTarget {
        pci_address: config.pci_address.clone(),
        pf_driver: config.pf_driver.clone(),
        vf_driver: config.vf_driver.clone(),
        vf_amount: config.vf_amount,
        bitstream: config.bitstream.clone(),
    }
}

/// Applies actions one at a time through a `DeviceProgrammer`
pub struct DeviceApplier {
    programmer: Arc<dyn DeviceProgrammer>,
}

impl DeviceApplier {
    pub fn new(programmer: Arc<dyn DeviceProgrammer>) -> Self {
        Self { programmer }
    }

    pub async fn apply(&self, action: &ConfigAction) -> ApplyOutcome {
        match action {
            ConfigAction::NoOp(config) => {
                debug!("Device {} already configured, nothing to do", config.pci_address);
                ApplyOutcome::Success
            }
            ConfigAction::Create(config) | ConfigAction::Update { desired: config, .. } => {
                self.configure(action.kind(), config).await
            }
            ConfigAction::Delete(actual) => self.reset(&actual.pci_address).await,
            ConfigAction::Reject { pci_address, reason } => {
                error!("Skipping device {}: {}", pci_address, reason);
                ApplyOutcome::Skipped(reason.clone())
            }
        }
    }

    async fn configure(&self, kind: &str, config: &PhysicalFunctionConfig) -> ApplyOutcome {
        info!(
            "Configuring device {} ({}): {} VFs bound to {}",
            config.pci_address, kind, config.vf_amount, config.vf_driver
        );
        match self.programmer.configure(&device_target(config)).await {
            Ok(()) => {
                info!("✅ Configured device {}", config.pci_address);
                ApplyOutcome::Success
            }
            Err(e) => {
                error!("Failed to configure device {}: {}", config.pci_address, e);
                ApplyOutcome::Failed(e.to_string())
            }
        }
    }

    async fn reset(&self, pci_address: &str) -> ApplyOutcome {
        info!("Removing configuration from device {}", pci_address);
        match self.programmer.reset(pci_address).await {
            Ok(()) => {
                info!("✅ Reset device {}", pci_address);
                ApplyOutcome::Success
            }
            Err(e) if e.is_not_found() => {
                warn!("Device {} disappeared, nothing left to remove", pci_address);
                ApplyOutcome::Success
            }
            Err(e) => {
                error!("Failed to reset device {}: {}", pci_address, e);
                ApplyOutcome::Failed(e.to_string())
            }
        }
    }
}
