//! Kubernetes resource watcher.
//!
//! Watches the node's own SriovFecNodeConfig and turns every notification
//! into a reconcile request on the work queue. The event payload is ignored:
//! the reconciler always reads the latest record itself.

use crate::error::ControllerError;
use crate::reconciler::ReconcileRequest;
use crate::work_queue::WorkQueue;
use crds::SriovFecNodeConfig;
use futures::StreamExt;
use kube::Api;
use kube_runtime::{watcher, WatchStreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Watches the SriovFecNodeConfig named after this node.
pub struct Watcher {
    api: Api<SriovFecNodeConfig>,
    request: ReconcileRequest,
    queue: Arc<WorkQueue<ReconcileRequest>>,
    ready: Arc<AtomicBool>,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        api: Api<SriovFecNodeConfig>,
        request: ReconcileRequest,
        queue: Arc<WorkQueue<ReconcileRequest>>,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            api,
            request,
            queue,
            ready,
        }
    }

    /// Watch until the stream ends.
    ///
    /// Stream errors are retried with the watcher's default backoff; the
    /// function only returns if the stream terminates.
    pub async fn watch_node_config(&self) -> Result<(), ControllerError> {
        info!("Starting SriovFecNodeConfig watcher for {}", self.request);

        let config = watcher::Config::default().fields(&format!("metadata.name={}", self.request.name));
        let mut stream = watcher(self.api.clone(), config).default_backoff().boxed();

        while let Some(result) = stream.next().await {
            match result {
                Ok(event) => handle_event(&event, &self.request, &self.queue, &self.ready),
                Err(e) => warn!("SriovFecNodeConfig watch error (retrying): {}", e),
            }
        }

        Err(ControllerError::Watch(
            "SriovFecNodeConfig watch stream ended".to_string(),
        ))
    }
}

/// Enqueue a reconcile for any event; mark the daemon ready once the initial list is done.
pub fn handle_event(
    event: &watcher::Event<SriovFecNodeConfig>,
    request: &ReconcileRequest,
    queue: &WorkQueue<ReconcileRequest>,
    ready: &AtomicBool,
) {
    match event {
        watcher::Event::Apply(record) | watcher::Event::InitApply(record) => {
            debug!(
                "SriovFecNodeConfig {} changed (generation {:?})",
                request, record.metadata.generation
            );
            queue.add(request.clone());
        }
        watcher::Event::Delete(_) => {
            info!("SriovFecNodeConfig {} deleted", request);
            queue.add(request.clone());
        }
        watcher::Event::Init => {
            debug!("SriovFecNodeConfig watcher (re)listing");
        }
        watcher::Event::InitDone => {
            if !ready.swap(true, Ordering::SeqCst) {
                info!("SriovFecNodeConfig watcher initialization complete");
            }
            queue.add(request.clone());
        }
    }
}

/// Enqueue `request` every `interval`, so device drift is corrected even
/// without record changes.
pub async fn resync_loop(queue: Arc<WorkQueue<ReconcileRequest>>, request: ReconcileRequest, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        debug!("Periodic resync of {}", request);
        queue.add(request.clone());
    }
}
