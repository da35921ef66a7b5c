//! SriovFecNodeConfig record store.
//!
//! `NodeConfigStore` abstracts reads and status writes so the reconciler can
//! be tested against an in-memory store. Status writes are conditional on
//! the resourceVersion observed at read time; a record that changed in
//! between yields `StoreError::Conflict`.

use async_trait::async_trait;
use crds::{SriovFecNodeConfig, SriovFecNodeConfigStatus};
use kube::api::{Patch, PatchParams, PostParams};
use kube::Api;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

/// Errors returned by a `NodeConfigStore`
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SriovFecNodeConfig not found: {0}")]
    NotFound(String),

    #[error("SriovFecNodeConfig already exists: {0}")]
    AlreadyExists(String),

    /// resourceVersion mismatch on a conditional write
    #[error("SriovFecNodeConfig {0} was modified since it was read")]
    Conflict(String),

    #[error("Access to SriovFecNodeConfig {0} denied")]
    Forbidden(String),

    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Persistent store of per-node configuration records
#[async_trait]
pub trait NodeConfigStore: Send + Sync {
    /// Fetch a record by name; `None` when it does not exist
    async fn get(&self, name: &str) -> Result<Option<SriovFecNodeConfig>, StoreError>;

    /// Create a record; `StoreError::AlreadyExists` when the name is taken
    async fn create(&self, record: &SriovFecNodeConfig) -> Result<SriovFecNodeConfig, StoreError>;

    /// Replace the status of a record
    ///
    /// When `resource_version` is set the write only succeeds if the record
    /// still has that version.
    async fn update_status(
        &self,
        name: &str,
        resource_version: Option<&str>,
        status: &SriovFecNodeConfigStatus,
    ) -> Result<SriovFecNodeConfig, StoreError>;
}

/// Store backed by the Kubernetes API
pub struct KubeNodeConfigStore {
    api: Api<SriovFecNodeConfig>,
}

impl KubeNodeConfigStore {
    pub fn new(api: Api<SriovFecNodeConfig>) -> Self {
        Self { api }
    }
}

/// HTTP status code of an API error response
fn api_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

/// Maps a Kubernetes error; a 409 becomes `on_conflict(name)`
fn map_kube_error(err: kube::Error, name: &str, on_conflict: fn(String) -> StoreError) -> StoreError {
    match api_code(&err) {
        Some(404) => StoreError::NotFound(name.to_string()),
        Some(409) => on_conflict(name.to_string()),
        Some(401) | Some(403) => StoreError::Forbidden(name.to_string()),
        _ => StoreError::Kube(err),
    }
}

/// Merge patch body replacing the status, guarded by `resource_version`
///
/// The API server rejects the patch with 409 when `metadata.resourceVersion`
/// no longer matches.
pub fn status_patch(
    resource_version: Option<&str>,
    status: &SriovFecNodeConfigStatus,
) -> Result<serde_json::Value, StoreError> {
    let status = serde_json::to_value(status)?;
    Ok(match resource_version {
        Some(version) => json!({
            "metadata": { "resourceVersion": version },
            "status": status,
        }),
        None => json!({ "status": status }),
    })
}

#[async_trait]
impl NodeConfigStore for KubeNodeConfigStore {
    async fn get(&self, name: &str) -> Result<Option<SriovFecNodeConfig>, StoreError> {
        self.api
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(e, name, StoreError::Conflict))
    }

    async fn create(&self, record: &SriovFecNodeConfig) -> Result<SriovFecNodeConfig, StoreError> {
        let name = record.metadata.name.clone().unwrap_or_default();
        self.api
            .create(&PostParams::default(), record)
            .await
            .map_err(|e| map_kube_error(e, &name, StoreError::AlreadyExists))
    }

    async fn update_status(
        &self,
        name: &str,
        resource_version: Option<&str>,
        status: &SriovFecNodeConfigStatus,
    ) -> Result<SriovFecNodeConfig, StoreError> {
        let patch = status_patch(resource_version, status)?;
        debug!("Patching status of SriovFecNodeConfig {} at resourceVersion {:?}", name, resource_version);
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(e, name, StoreError::Conflict))
    }
}
