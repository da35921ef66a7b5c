//! Reconciliation logic for SriovFecNodeConfig.
//!
//! One pass reads the record, queries the devices it mentions, computes the
//! actions with the comparator, applies them one by one and writes back the
//! resulting status. Passes are level-triggered: they never look at what
//! changed, only at the current spec and the current device state.

pub mod applier;
pub mod comparator;
pub mod status;


use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::store::NodeConfigStore;
use applier::{ApplyOutcome, DeviceApplier};
use chrono::{SubsecRound, Utc};
use comparator::DeviceActualState;
use crds::{AcceleratorInventory, PhysicalFunctionConfig, SriovFecNodeConfigStatus};
use fec_device_client::{AcceleratorInfo, DeviceProgrammer};
use status::ActionResult;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Skip reason for actions not attempted because the daemon is stopping
pub const SHUTDOWN_REASON: &str = "daemon shutting down";

/// Identifies the record to reconcile
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReconcileRequest {
    pub name: String,
    pub namespace: String,
}

impl ReconcileRequest {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Counts of a completed pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Stopped early because of shutdown
    pub interrupted: bool,
    /// Whether the status had to be written
    pub status_written: bool,
}

impl PassSummary {
    fn from_results(results: &[ActionResult], interrupted: bool) -> Self {
        let mut summary = Self {
            interrupted,
            ..Default::default()
        };
        for result in results {
            match result.outcome {
                ApplyOutcome::Success => summary.succeeded += 1,
                ApplyOutcome::Failed(_) => summary.failed += 1,
                ApplyOutcome::Skipped(_) => summary.skipped += 1,
            }
        }
        summary
    }
}

/// Result of a reconcile pass that did not hit an infrastructure error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The record does not exist; nothing to do until it reappears
    RecordMissing,
    Completed(PassSummary),
}

/// Reconciler for a node's SriovFecNodeConfig
pub struct Reconciler {
    store: Arc<dyn NodeConfigStore>,
    programmer: Arc<dyn DeviceProgrammer>,
    applier: DeviceApplier,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn NodeConfigStore>,
        programmer: Arc<dyn DeviceProgrammer>,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let applier = DeviceApplier::new(programmer.clone());
        Self {
            store,
            programmer,
            applier,
            metrics,
            shutdown,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run one reconciliation pass for `request`.
    ///
    /// Device failures end up in the returned summary and in the record's
    /// status. Only store failures (including write conflicts) are errors;
    /// the caller retries those with a fresh pass.
    #[instrument(skip(self, request), fields(record = %request))]
    pub async fn reconcile(&self, request: &ReconcileRequest) -> Result<ReconcileOutcome, ControllerError> {
        let _timer = self.metrics.start_reconcile_timer();

        let Some(record) = self.store.get(&request.name).await? else {
            info!("SriovFecNodeConfig {} not found, nothing to reconcile", request);
            return Ok(ReconcileOutcome::RecordMissing);
        };

        let generation = record.metadata.generation;
        let resource_version = record.metadata.resource_version.clone();
        let previous = record.status.clone().unwrap_or_default();
        let desired = &record.spec.physical_functions;

        let actual = self.observe(desired, &previous).await;
        let actions = comparator::compare(desired, &actual);
        info!(
            "Reconciling generation {:?}: {} desired physical function(s), {} action(s)",
            generation,
            desired.len(),
            actions.len()
        );

        let mut results = Vec::with_capacity(actions.len());
        let mut interrupted = false;
        for action in actions {
            let outcome = if action.is_mutation() && (interrupted || self.shutdown_requested()) {
                interrupted = true;
                ApplyOutcome::Skipped(SHUTDOWN_REASON.to_string())
            } else {
                self.applier.apply(&action).await
            };
            self.metrics.record_action(action.kind(), &outcome);
            results.push(ActionResult::new(action, outcome));
        }
        if interrupted {
            warn!("Shutdown requested, remaining device actions were skipped");
        }

        let inventory = match self.programmer.discover().await {
            Ok(found) => Some(found.into_iter().map(inventory_entry).collect()),
            Err(e) => {
                warn!("Accelerator discovery failed, keeping previous inventory: {}", e);
                None
            }
        };

        let new_status = status::build_status(
            &previous,
            &results,
            generation,
            !interrupted,
            inventory,
            Utc::now().trunc_subsecs(0),
        );

        let mut summary = PassSummary::from_results(&results, interrupted);
        if record.status.as_ref() == Some(&new_status) {
            debug!("Status of {} unchanged, skipping update", request);
        } else {
            self.store
                .update_status(&request.name, resource_version.as_deref(), &new_status)
                .await?;
            summary.status_written = true;
            info!(
                "Updated status of {}: {} succeeded, {} failed, {} skipped",
                request, summary.succeeded, summary.failed, summary.skipped
            );
        }

        Ok(ReconcileOutcome::Completed(summary))
    }

    /// Query every device named in the spec or in the last status.
    async fn observe(
        &self,
        desired: &[PhysicalFunctionConfig],
        previous: &SriovFecNodeConfigStatus,
    ) -> DeviceActualState {
        let addresses: BTreeSet<&str> = desired
            .iter()
            .chain(previous.physical_functions.iter())
            .map(|pf| pf.pci_address.as_str())
            .filter(|address| !address.trim().is_empty())
            .collect();

        let mut actual = DeviceActualState::default();
        for address in addresses {
            match self.programmer.query(address).await {
                Ok(snapshot) => actual.insert(snapshot),
                Err(e) if e.is_not_found() => debug!("No device at {}", address),
                Err(e) => {
                    warn!("Could not read state of device {}: {}", address, e);
                    actual.mark_unreadable(address, e.to_string());
                }
            }
        }
        actual
    }
}

fn inventory_entry(info: AcceleratorInfo) -> AcceleratorInventory {
    AcceleratorInventory {
        pci_address: info.pci_address,
        vendor_id: info.vendor_id,
        device_id: info.device_id,
        driver: info.driver,
        max_virtual_functions: info.max_virtual_functions,
        virtual_functions: info.virtual_functions,
    }
}
