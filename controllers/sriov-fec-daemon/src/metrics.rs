//! Prometheus metrics for the reconcile loop.

use crate::reconciler::applier::ApplyOutcome;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};

/// Daemon metrics, registered in their own registry
pub struct Metrics {
    registry: Registry,
    reconcile_total: IntCounterVec,
    device_actions_total: IntCounterVec,
    reconcile_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new("sriov_fec_reconcile_total", "Reconciliation passes by result"),
            &["result"],
        )?;
        let device_actions_total = IntCounterVec::new(
            Opts::new("sriov_fec_device_actions_total", "Device actions by kind and outcome"),
            &["action", "outcome"],
        )?;
        let reconcile_duration = Histogram::with_opts(HistogramOpts::new(
            "sriov_fec_reconcile_duration_seconds",
            "Duration of reconciliation passes",
        ))?;

        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(device_actions_total.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Self {
            registry,
            reconcile_total,
            device_actions_total,
            reconcile_duration,
        })
    }

    /// Count a finished pass (`completed`, `record_missing`, `conflict`, `error`)
    pub fn record_reconcile(&self, result: &str) {
        self.reconcile_total.with_label_values(&[result]).inc();
    }

    pub fn record_action(&self, action: &str, outcome: &ApplyOutcome) {
        self.device_actions_total
            .with_label_values(&[action, outcome.label()])
            .inc();
    }

    /// Start timing a pass; observed when the timer is dropped
    pub fn start_reconcile_timer(&self) -> prometheus::HistogramTimer {
        self.reconcile_duration.start_timer()
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
