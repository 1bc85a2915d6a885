//! Domain Ports - Core trait definitions for the Cassandra operator
//!
//! These traits define the boundaries between the reconcile/operation engines
//! and external systems: the orchestration platform, the per-node management
//! endpoint and the backup/restore sidecar. Adapters implement these traits
//! to provide concrete functionality.

use crate::crd::{BackRestStatus, CassandraBackup, CassandraCluster, CassandraRestore};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// =============================================================================
// Pod Types
// =============================================================================

/// Lifecycle phase of a pod
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

/// What the engines need to know about a Cassandra pod
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    /// `spec.hostname`
    pub hostname: Option<String>,
    /// `spec.subdomain`
    pub subdomain: Option<String>,
    pub ip: Option<String>,
    pub phase: PodPhase,
    /// Deletion timestamp is set
    pub terminating: bool,
    /// Scheduler reported the pod as unschedulable
    pub unschedulable: bool,
    pub ready: bool,
    pub labels: BTreeMap<String, String>,
}

impl PodInfo {
    /// Address of the pod management endpoints: `<hostname>.<subdomain>`,
    /// falling back to the pod IP
    pub fn host(&self) -> Option<String> {
        match (&self.hostname, &self.subdomain) {
            (Some(h), Some(s)) if !h.is_empty() && !s.is_empty() => Some(format!("{}.{}", h, s)),
            _ => self.ip.clone().filter(|ip| !ip.is_empty()),
        }
    }

    /// Running and not being deleted
    pub fn is_running(&self) -> bool {
        self.phase == PodPhase::Running && !self.terminating
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Ordinal of a workload pod (`<name>-<ordinal>`)
    pub fn ordinal(&self) -> Option<i32> {
        self.name.rsplit_once('-')?.1.parse().ok()
    }
}

/// Replica counts of the workload running a rack
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RackWorkload {
    pub replicas: i32,
    pub ready_replicas: i32,
}

// =============================================================================
// Node Management Types
// =============================================================================

/// Participation of a node in the ring, as reported by its management endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MembershipMode {
    Starting,
    Normal,
    Joining,
    Leaving,
    Decommissioned,
    Moving,
    Draining,
    Drained,
    Unknown,
}

impl MembershipMode {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "STARTING" => MembershipMode::Starting,
            "NORMAL" => MembershipMode::Normal,
            "JOINING" => MembershipMode::Joining,
            "LEAVING" => MembershipMode::Leaving,
            "DECOMMISSIONED" => MembershipMode::Decommissioned,
            "MOVING" => MembershipMode::Moving,
            "DRAINING" => MembershipMode::Draining,
            "DRAINED" => MembershipMode::Drained,
            _ => MembershipMode::Unknown,
        }
    }

    /// The node is gone or going: a decommission must not be re-issued
    pub fn is_leaving_or_gone(&self) -> bool {
        matches!(
            self,
            MembershipMode::Leaving | MembershipMode::Decommissioned | MembershipMode::Unknown
        )
    }
}

impl std::fmt::Display for MembershipMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MembershipMode::Starting => "STARTING",
            MembershipMode::Normal => "NORMAL",
            MembershipMode::Joining => "JOINING",
            MembershipMode::Leaving => "LEAVING",
            MembershipMode::Decommissioned => "DECOMMISSIONED",
            MembershipMode::Moving => "MOVING",
            MembershipMode::Draining => "DRAINING",
            MembershipMode::Drained => "DRAINED",
            MembershipMode::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Options of an SSTable upgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeSSTablesOptions {
    /// Only rewrite SSTables not already on the current format
    pub exclude_current_version: bool,
    /// Parallel jobs, 0 lets the node decide
    pub jobs: i32,
}

impl Default for UpgradeSSTablesOptions {
    fn default() -> Self {
        Self {
            exclude_current_version: true,
            jobs: 0,
        }
    }
}

// =============================================================================
// Node Management Port
// =============================================================================

/// Port for the management endpoint of a Cassandra node.
///
/// Every call targets the node reachable at `host`.
#[async_trait]
pub trait NodeManagementClient: Send + Sync {
    /// Current membership mode of the node
    async fn membership_mode(&self, host: &str) -> Result<MembershipMode>;

    /// Ask the node to leave the ring. `new_signature` selects the 4.0+ call.
    async fn decommission(&self, host: &str, new_signature: bool) -> Result<()>;

    /// Clean up every non-local keyspace
    async fn cleanup(&self, host: &str) -> Result<()>;

    /// Rewrite SSTables of every keyspace
    async fn upgrade_sstables(&self, host: &str, options: UpgradeSSTablesOptions) -> Result<()>;

    /// Stream data from `source_dc`
    async fn rebuild(&self, host: &str, source_dc: &str) -> Result<()>;

    /// Remove the node identified by `host_id` from the ring
    async fn remove(&self, host: &str, host_id: &str) -> Result<()>;

    /// Non-local keyspaces, restricted to those replicated in `datacenter` if set
    async fn non_local_keyspaces(&self, host: &str, datacenter: Option<&str>) -> Result<Vec<String>>;

    /// Host id of every node, keyed by address
    async fn host_id_map(&self, host: &str) -> Result<HashMap<String, String>>;

    async fn has_cleanup_compactions(&self, host: &str) -> Result<bool>;

    async fn has_upgrade_sstables_compactions(&self, host: &str) -> Result<bool>;

    async fn has_streaming_sessions(&self, host: &str) -> Result<bool>;

    async fn has_leaving_nodes(&self, host: &str) -> Result<bool>;

    async fn has_joining_nodes(&self, host: &str) -> Result<bool>;
}

// =============================================================================
// Sidecar Port
// =============================================================================

/// Port for the backup/restore sidecar running next to each node
#[async_trait]
pub trait SidecarClient: Send + Sync {
    /// Start a backup, returning the sidecar operation id
    async fn start_backup(&self, host: &str, backup: &CassandraBackup) -> Result<String>;

    async fn backup_status(&self, host: &str, id: &str) -> Result<BackRestStatus>;

    /// Start a restore of `backup`, returning the initial status
    async fn start_restore(
        &self,
        host: &str,
        restore: &CassandraRestore,
        backup: &CassandraBackup,
    ) -> Result<BackRestStatus>;

    async fn restore_status(&self, host: &str, id: &str) -> Result<BackRestStatus>;
}

// =============================================================================
// Platform Ports
// =============================================================================

/// Port for cluster, pod, volume and workload objects of the orchestration platform
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<CassandraCluster>>;

    /// Write `cluster.status` guarded by its resource version.
    ///
    /// Returns the stored object, or `Error::StatusConflict` if the version is stale.
    async fn replace_cluster_status(&self, cluster: &CassandraCluster) -> Result<CassandraCluster>;

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodInfo>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodInfo>>;

    /// Merge `labels` into the pod labels
    async fn patch_pod_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Delete a pod without grace period
    async fn force_delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn pvc_exists(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()>;

    async fn rack_workload(&self, namespace: &str, name: &str) -> Result<Option<RackWorkload>>;

    async fn scale_rack(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;
}

/// Port for backup, restore and secret objects
#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<CassandraBackup>>;

    async fn list_backups(&self, namespace: &str) -> Result<Vec<CassandraBackup>>;

    async fn patch_backup_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BackRestStatus,
    ) -> Result<()>;

    async fn set_backup_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()>;

    async fn patch_restore_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BackRestStatus,
    ) -> Result<()>;

    /// Keys present in a secret, `None` if it does not exist
    async fn secret_keys(&self, namespace: &str, name: &str) -> Result<Option<Vec<String>>>;
}

/// Port for user-visible events. Fire-and-forget: never fails.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type NodeManagementClientRef = Arc<dyn NodeManagementClient>;
pub type SidecarClientRef = Arc<dyn SidecarClient>;
pub type ClusterStoreRef = Arc<dyn ClusterStore>;
pub type BackupStoreRef = Arc<dyn BackupStore>;
pub type EventRecorderRef = Arc<dyn EventRecorder>;
