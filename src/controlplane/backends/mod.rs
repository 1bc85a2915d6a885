//! Backend Adapters
//!
//! Concrete implementations of the domain ports:
//! - Kubernetes: clusters, pods, volume claims, workloads, backups, secrets
//! - Jolokia: node management over HTTP/JMX
//! - Sidecar: backup/restore operations over HTTP
//! - Events: Kubernetes events

pub mod events;
pub mod jolokia;
pub mod kubernetes;
pub mod sidecar;

pub use events::*;
pub use jolokia::*;
pub use kubernetes::*;
pub use sidecar::*;

use kube::runtime::events::Reporter;
use kube::Client;
use std::sync::Arc;

use crate::domain::{
    BackupStoreRef, ClusterStoreRef, EventRecorderRef, NodeManagementClientRef, SidecarClientRef,
};
use crate::error::Result;

/// Combined backend configuration
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub jolokia: JolokiaConfig,
    pub sidecar: SidecarConfig,
}

/// Every port implementation the reconcilers need
#[derive(Clone)]
pub struct Backends {
    pub clusters: ClusterStoreRef,
    pub backups: BackupStoreRef,
    pub management: NodeManagementClientRef,
    pub sidecar: SidecarClientRef,
    pub events: EventRecorderRef,
}

/// Factory for the backend adapters
pub struct BackendFactory;

impl BackendFactory {
    /// Build all adapters on top of a Kubernetes client
    pub fn create(client: Client, config: BackendConfig, reporter: Reporter) -> Result<Backends> {
        Ok(Backends {
            clusters: Arc::new(KubeClusterStore::new(client.clone())),
            backups: Arc::new(KubeBackupStore::new(client.clone())),
            management: Arc::new(JolokiaClient::new(config.jolokia)?),
            sidecar: Arc::new(SidecarHttpClient::new(config.sidecar)?),
            events: Arc::new(KubeEventRecorder::new(client, reporter)),
        })
    }
}
