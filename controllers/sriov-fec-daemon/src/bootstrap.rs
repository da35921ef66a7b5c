//! Bootstrap guard.
//!
//! Makes sure the node's SriovFecNodeConfig exists before the watcher starts,
//! so that every node has a record an operator can fill in.

use crate::error::ControllerError;
use crate::store::{NodeConfigStore, StoreError};
use crds::{SriovFecNodeConfig, SriovFecNodeConfigSpec};
use tracing::info;

/// Result of `ensure_node_config`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// An empty record was created
    Created,
    /// A record already existed and was left untouched
    AlreadyPresent,
}

/// An empty SriovFecNodeConfig for `node_name`
pub fn empty_node_config(node_name: &str, namespace: &str) -> SriovFecNodeConfig {
    let mut record = SriovFecNodeConfig::new(node_name, SriovFecNodeConfigSpec::default());
    record.metadata.namespace = Some(namespace.to_string());
    record
}

/// Create an empty SriovFecNodeConfig for the node unless one exists.
///
/// Losing a creation race to another writer counts as success. Any other
/// store error is returned and should abort startup.
pub async fn ensure_node_config(
    store: &dyn NodeConfigStore,
    node_name: &str,
    namespace: &str,
) -> Result<BootstrapOutcome, ControllerError> {
    if store.get(node_name).await?.is_some() {
        info!("SriovFecNodeConfig {}/{} already exists", namespace, node_name);
        return Ok(BootstrapOutcome::AlreadyPresent);
    }

    match store.create(&empty_node_config(node_name, namespace)).await {
        Ok(_) => {
            info!("Created empty SriovFecNodeConfig {}/{}", namespace, node_name);
            Ok(BootstrapOutcome::Created)
        }
        Err(StoreError::AlreadyExists(_)) => {
            info!("SriovFecNodeConfig {}/{} was created concurrently", namespace, node_name);
            Ok(BootstrapOutcome::AlreadyPresent)
        }
        Err(e) => Err(e.into()),
    }
}
