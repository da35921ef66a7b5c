//! Status reporter.
//!
//! Builds the new SriovFecNodeConfig status from the outcome of a pass.
//! Only successful actions change the applied list; anything else keeps the
//! last-known-good entry for that device. No per-pass timestamps are stored,
//! so repeating an unchanged pass yields an identical status.

use super::applier::ApplyOutcome;
use super::comparator::ConfigAction;
use chrono::{DateTime, Utc};
use crds::{
    set_condition, AcceleratorInventory, Condition, ConditionStatus, PhysicalFunctionConfig,
    SriovFecNodeConfigStatus,
};
use std::collections::HashSet;

pub const CONDITION_APPLIED: &str = "ConfigurationApplied";
pub const CONDITION_DEGRADED: &str = "ConfigurationDegraded";

pub const REASON_SUCCEEDED: &str = "ConfigurationSucceeded";
pub const REASON_FAILED: &str = "ConfigurationFailed";
pub const REASON_INTERRUPTED: &str = "ConfigurationInterrupted";
pub const REASON_DEVICE_FAILURES: &str = "DeviceFailures";
pub const REASON_NO_DEVICE_FAILURES: &str = "NoDeviceFailures";

/// An action together with how applying it went
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult {
    pub action: ConfigAction,
    pub outcome: ApplyOutcome,
}

impl ActionResult {
    pub fn new(action: ConfigAction, outcome: ApplyOutcome) -> Self {
        Self { action, outcome }
    }

    /// Failed actions and rejected entries degrade the node
    pub fn is_fault(&self) -> bool {
        match &self.outcome {
            ApplyOutcome::Success => false,
            ApplyOutcome::Failed(_) => true,
            ApplyOutcome::Skipped(_) => matches!(self.action, ConfigAction::Reject { .. }),
        }
    }

    /// Skipped because the pass was cut short
    fn is_interrupted(&self) -> bool {
        matches!(self.outcome, ApplyOutcome::Skipped(_)) && !self.is_fault()
    }
}

/// Compute the status after a pass.
///
/// `complete` is false when the pass stopped before attempting every action;
/// `observed_generation` then keeps its previous value. `inventory` of `None`
/// keeps the previous inventory.
pub fn build_status(
    previous: &SriovFecNodeConfigStatus,
    results: &[ActionResult],
    generation: Option<i64>,
    complete: bool,
    inventory: Option<Vec<AcceleratorInventory>>,
    now: DateTime<Utc>,
) -> SriovFecNodeConfigStatus {
    let mut physical_functions: Vec<PhysicalFunctionConfig> = Vec::new();
    let mut emitted: HashSet<&str> = HashSet::new();
    for result in results {
        if !emitted.insert(result.action.pci_address()) {
            continue;
        }
        let entry = match (&result.action, &result.outcome) {
            (ConfigAction::Delete(_), ApplyOutcome::Success) => None,
            (
                ConfigAction::NoOp(config)
                | ConfigAction::Create(config)
                | ConfigAction::Update { desired: config, .. },
                ApplyOutcome::Success,
            ) => Some(config.clone()),
            _ => previous.applied(result.action.pci_address()).cloned(),
        };
        physical_functions.extend(entry);
    }

    let faults: Vec<String> = results
        .iter()
        .filter(|r| r.is_fault())
        .map(|r| {
            format!(
                "{}: {}",
                r.action.pci_address(),
                r.outcome.reason().unwrap_or_default()
            )
        })
        .collect();
    let interrupted = results.iter().filter(|r| r.is_interrupted()).count();

    let (applied_status, applied_reason, applied_message) = if !complete {
        (
            ConditionStatus::False,
            REASON_INTERRUPTED,
            format!(
                "{} of {} action(s) were not attempted before shutdown",
                interrupted,
                results.len()
            ),
        )
    } else if !faults.is_empty() {
        (
            ConditionStatus::False,
            REASON_FAILED,
            format!(
                "{} of {} device(s) could not be configured",
                faults.len(),
                results.len()
            ),
        )
    } else if results.is_empty() {
        (
            ConditionStatus::True,
            REASON_SUCCEEDED,
            "No physical functions declared".to_string(),
        )
    } else {
        (
            ConditionStatus::True,
            REASON_SUCCEEDED,
            format!("{} physical function(s) configured", physical_functions.len()),
        )
    };

    let (degraded_status, degraded_reason, degraded_message) = if faults.is_empty() {
        (
            ConditionStatus::False,
            REASON_NO_DEVICE_FAILURES,
            "No device failures".to_string(),
        )
    } else {
        (ConditionStatus::True, REASON_DEVICE_FAILURES, faults.join("; "))
    };

    let observed_generation = if complete {
        generation
    } else {
        previous.observed_generation
    };

    let mut conditions = previous.conditions.clone();
    set_condition(
        &mut conditions,
        Condition::new(CONDITION_APPLIED, applied_status, applied_reason, applied_message, now)
            .with_observed_generation(observed_generation),
    );
    set_condition(
        &mut conditions,
        Condition::new(CONDITION_DEGRADED, degraded_status, degraded_reason, degraded_message, now)
            .with_observed_generation(observed_generation),
    );

    SriovFecNodeConfigStatus {
        physical_functions,
        conditions,
        observed_generation,
        inventory: inventory.unwrap_or_else(|| previous.inventory.clone()),
    }
}
