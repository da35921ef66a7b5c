//! Main controller implementation.
//!
//! Wires the watcher, the periodic resync, the probe server and a single
//! worker around one work queue. The worker is the only place passes run,
//! so a node's record is never reconciled by two passes at once.

use crate::backoff::ExponentialBackoff;
use crate::bootstrap::{self, BootstrapOutcome};
use crate::config::DaemonConfig;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::probes::{self, ProbeState};
use crate::reconciler::{ReconcileOutcome, ReconcileRequest, Reconciler};
use crate::store::{KubeNodeConfigStore, NodeConfigStore};
use crate::watcher::{resync_loop, Watcher};
use crate::work_queue::WorkQueue;
use crds::SriovFecNodeConfig;
use fec_device_client::DeviceProgrammer;
use kube::{Api, Client};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Retry state of one record
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: ExponentialBackoff,
    error_count: u32,
}

/// Main controller for the node's accelerator configuration.
pub struct Controller {
    config: DaemonConfig,
    api: Api<SriovFecNodeConfig>,
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue<ReconcileRequest>>,
    metrics: Arc<Metrics>,
    ready: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl Controller {
    /// Creates a new controller instance.
    ///
    /// Runs the bootstrap guard, so the node's record exists before any
    /// watch is started.
    pub async fn new(config: DaemonConfig) -> Result<Self, ControllerError> {
        info!("Initializing SR-IOV FEC daemon for node {}", config.node_name);

        let kube_client = Client::try_default().await?;
        let api: Api<SriovFecNodeConfig> = Api::namespaced(kube_client, &config.namespace);
        let store: Arc<dyn NodeConfigStore> = Arc::new(KubeNodeConfigStore::new(api.clone()));
        let programmer: Arc<dyn DeviceProgrammer> = Arc::new(config.device_client());

        match bootstrap::ensure_node_config(store.as_ref(), &config.node_name, &config.namespace).await {
            Ok(BootstrapOutcome::Created) => info!("✅ Bootstrapped SriovFecNodeConfig for node {}", config.node_name),
            Ok(BootstrapOutcome::AlreadyPresent) => {}
            Err(e) => {
                error!("Failed to ensure SriovFecNodeConfig for node {}: {}", config.node_name, e);
                return Err(e);
            }
        }

        let metrics = Arc::new(Metrics::new()?);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler = Arc::new(Reconciler::new(store, programmer, metrics.clone(), shutdown_rx));

        Ok(Self {
            config,
            api,
            reconciler,
            queue: Arc::new(WorkQueue::new()),
            metrics,
            ready: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        })
    }

    /// Runs the controller until SIGTERM/SIGINT or until the watch fails.
    ///
    /// On shutdown the in-flight pass is allowed to finish; device actions it
    /// has not started yet are skipped.
    pub async fn run(self) -> Result<(), ControllerError> {
        let request = ReconcileRequest::new(&self.config.node_name, &self.config.namespace);

        let watcher = Watcher::new(self.api.clone(), request.clone(), self.queue.clone(), self.ready.clone());
        let mut watcher_task = tokio::spawn(async move { watcher.watch_node_config().await });
        let resync_task = tokio::spawn(resync_loop(
            self.queue.clone(),
            request.clone(),
            self.config.resync_interval,
        ));
        let probe_task = self.config.probe_bind_address.map(|addr| {
            let state = ProbeState {
                metrics: self.metrics.clone(),
                ready: self.ready.clone(),
            };
            tokio::spawn(probes::serve(addr, state, self.shutdown_tx.subscribe()))
        });
        let worker_task = tokio::spawn(run_worker(
            self.queue.clone(),
            self.reconciler.clone(),
            self.config.backoff_min,
            self.config.backoff_max,
        ));

        info!("✅ SR-IOV FEC daemon running for {}", request);

        let result = tokio::select! {
            signal = shutdown_signal() => signal,
            watched = &mut watcher_task => {
                let err = match watched {
                    Ok(Ok(())) => ControllerError::Watch("SriovFecNodeConfig watcher exited".to_string()),
                    Ok(Err(e)) => e,
                    Err(e) => ControllerError::Task(format!("watcher task: {}", e)),
                };
                error!("SriovFecNodeConfig watcher stopped: {}", err);
                Err(err)
            }
        };

        info!("Shutting down, waiting for the in-flight reconciliation to finish");
        if !self.queue.is_empty() {
            info!("Dropping {} queued reconcile request(s)", self.queue.len());
        }
        self.shutdown_tx.send_replace(true);
        self.queue.shut_down();
        watcher_task.abort();
        resync_task.abort();

        worker_task
            .await
            .map_err(|e| ControllerError::Task(format!("worker task: {}", e)))?;
        if let Some(probe_task) = probe_task {
            match probe_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Probe server failed: {}", e),
                Err(e) => warn!("Probe server task failed: {}", e),
            }
        }

        info!("SR-IOV FEC daemon stopped");
        result
    }
}

async fn shutdown_signal() -> Result<(), ControllerError> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = terminate.recv() => info!("Received SIGTERM"),
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Worker loop: one pass at a time, retrying failed passes with per-record backoff.
///
/// Returns once the queue is shut down.
pub(crate) async fn run_worker(
    queue: Arc<WorkQueue<ReconcileRequest>>,
    reconciler: Arc<Reconciler>,
    backoff_min: Duration,
    backoff_max: Duration,
) {
    let mut backoff_states: HashMap<ReconcileRequest, BackoffState> = HashMap::new();

    while let Some(request) = queue.next().await {
        let result = reconciler.reconcile(&request).await;
        if let Ok(ReconcileOutcome::Completed(summary)) = &result {
            if let Some(state) = backoff_states.get_mut(&request) {
                state.backoff.reset();
                state.error_count = 0;
            }
            if summary.failed > 0 {
                warn!(
                    "Reconciled {} with {} failed device action(s); status reports the details",
                    request, summary.failed
                );
            }
            reconciler.metrics().record_reconcile("completed");
            queue.done(&request);
            continue;
        }

        let state = backoff_states.entry(request.clone()).or_insert_with(|| BackoffState {
            backoff: ExponentialBackoff::new(backoff_min, backoff_max),
            error_count: 0,
        });
        state.error_count += 1;
        let delay = state.backoff.next_backoff();

        match result {
            Ok(_) => {
                warn!(
                    "SriovFecNodeConfig {} not found (attempt {}), checking again in {:?}",
                    request, state.error_count, delay
                );
                reconciler.metrics().record_reconcile("record_missing");
            }
            Err(e) if e.is_conflict() => {
                warn!(
                    "SriovFecNodeConfig {} changed during reconciliation, retrying in {:?}",
                    request, delay
                );
                reconciler.metrics().record_reconcile("conflict");
            }
            Err(e) => {
                error!(
                    "Failed to reconcile {} (attempt {}): {}, retrying in {:?}",
                    request, state.error_count, e, delay
                );
                reconciler.metrics().record_reconcile("error");
            }
        }
        queue.add_after(request.clone(), delay);
        queue.done(&request);
    }

    info!("Reconcile worker stopped");
}
