//! SR-IOV FEC CRD Definitions
//!
//! Kubernetes Custom Resource Definitions shared by the node daemon and
//! the CRD generator.

pub mod condition;
pub mod node_config;

pub use condition::*;
pub use node_config::*;
