//! CassandraCluster CRD
//!
//! Declares a Cassandra cluster as a tree of datacenters and racks, and
//! carries the per-rack status that the reconcile cycle and the pod
//! operation engines mutate.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// CassandraCluster CRD
// =============================================================================

/// CassandraCluster describes the desired topology of a Cassandra cluster
/// and the maintenance behaviour the operator applies to it.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "db.orange.com",
    version = "v2",
    kind = "CassandraCluster",
    plural = "cassandraclusters",
    shortname = "cassc",
    status = "CassandraClusterStatus",
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Action", "type": "string", "jsonPath": ".status.lastClusterAction"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.lastClusterActionStatus"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CassandraClusterSpec {
    /// Number of Cassandra nodes in each rack, unless a datacenter overrides it
    #[serde(default = "default_nodes_per_racks")]
    pub nodes_per_racks: i32,

    /// Cassandra image to run
    #[serde(default)]
    pub cassandra_image: Option<String>,

    /// Cassandra server version, used to pick management call variants
    #[serde(default)]
    pub server_version: Option<String>,

    /// Size of the data volume of each node
    #[serde(default)]
    pub data_capacity: Option<String>,

    /// Storage class of the data volume of each node
    #[serde(default)]
    pub data_storage_class: Option<String>,

    /// Run post-scale operations (cleanup) without waiting for a human
    #[serde(default)]
    pub auto_pilot: bool,

    /// Keep the seed list in sync with the topology
    #[serde(default)]
    pub auto_update_seed_list: bool,

    /// Delete the data volume of a node when it leaves the cluster
    #[serde(default, rename = "deletePVC")]
    pub delete_pvc: bool,

    /// Let the operator proceed with a new operation while one is pending
    #[serde(default)]
    pub unlock_next_operation: bool,

    /// Datacenter/rack tree
    #[serde(default)]
    pub topology: Topology,
}

fn default_nodes_per_racks() -> i32 {
    1
}

// =============================================================================
// Topology
// =============================================================================

/// Declared datacenters of the cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    #[serde(default)]
    pub dc: Vec<Datacenter>,
}

/// A datacenter and its racks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Datacenter {
    pub name: String,

    /// Node selector labels applied to every rack of the datacenter
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub rack: Vec<Rack>,

    /// Overrides the cluster nodesPerRacks for this datacenter
    #[serde(default)]
    pub nodes_per_racks: Option<i32>,

    /// Overrides the cluster dataCapacity for this datacenter
    #[serde(default)]
    pub data_capacity: Option<String>,

    /// Overrides the cluster dataStorageClass for this datacenter
    #[serde(default)]
    pub data_storage_class: Option<String>,
}

/// A rack inside a datacenter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rack {
    pub name: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Ask for a rolling restart of this rack
    #[serde(default)]
    pub rolling_restart: bool,

    /// Partition used for rolling updates of the rack workload
    #[serde(default)]
    pub rolling_partition: i32,
}

// =============================================================================
// Enums
// =============================================================================

/// Phase of a rack or of the whole cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ClusterPhase {
    #[default]
    Initializing,
    Running,
    Pending,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Initializing => write!(f, "Initializing"),
            ClusterPhase::Running => write!(f, "Running"),
            ClusterPhase::Pending => write!(f, "Pending"),
        }
    }
}

/// Status of a cluster action or of a pod operation.
///
/// The same strings are written to the `operation-status` pod label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum OperationStatus {
    ToDo,
    Ongoing,
    Finalizing,
    Continue,
    Done,
    Error,
    Manual,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::ToDo => "ToDo",
            OperationStatus::Ongoing => "Ongoing",
            OperationStatus::Finalizing => "Finalizing",
            OperationStatus::Continue => "Continue",
            OperationStatus::Done => "Done",
            OperationStatus::Error => "Error",
            OperationStatus::Manual => "Manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ToDo" => Some(OperationStatus::ToDo),
            "Ongoing" => Some(OperationStatus::Ongoing),
            "Finalizing" => Some(OperationStatus::Finalizing),
            "Continue" => Some(OperationStatus::Continue),
            "Done" => Some(OperationStatus::Done),
            "Error" => Some(OperationStatus::Error),
            "Manual" => Some(OperationStatus::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural action applied to a rack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ClusterAction {
    Initializing,
    UpdateConfigMap,
    UpdateDockerImage,
    UpdateSeedList,
    RollingRestart,
    UpdateResources,
    UpdateStatefulSet,
    ScaleUp,
    ScaleDown,
    #[serde(rename = "CorrectCRDConfig")]
    CorrectCrdConfig,
    #[serde(rename = "ActionDeleteDC")]
    DeleteDc,
    #[serde(rename = "ActionDeleteRack")]
    DeleteRack,
}

impl std::fmt::Display for ClusterAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClusterAction::Initializing => "Initializing",
            ClusterAction::UpdateConfigMap => "UpdateConfigMap",
            ClusterAction::UpdateDockerImage => "UpdateDockerImage",
            ClusterAction::UpdateSeedList => "UpdateSeedList",
            ClusterAction::RollingRestart => "RollingRestart",
            ClusterAction::UpdateResources => "UpdateResources",
            ClusterAction::UpdateStatefulSet => "UpdateStatefulSet",
            ClusterAction::ScaleUp => "ScaleUp",
            ClusterAction::ScaleDown => "ScaleDown",
            ClusterAction::CorrectCrdConfig => "CorrectCRDConfig",
            ClusterAction::DeleteDc => "ActionDeleteDC",
            ClusterAction::DeleteRack => "ActionDeleteRack",
        };
        f.write_str(s)
    }
}

/// Kind of operation run on individual pods.
///
/// The serialized name is the value of the `operation-name` pod label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Cleanup,
    Rebuild,
    #[serde(rename = "upgradesstables")]
    UpgradeSSTables,
    Remove,
    Decommission,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Cleanup => "cleanup",
            OperationKind::Rebuild => "rebuild",
            OperationKind::UpgradeSSTables => "upgradesstables",
            OperationKind::Remove => "remove",
            OperationKind::Decommission => "decommission",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cleanup" => Some(OperationKind::Cleanup),
            "rebuild" => Some(OperationKind::Rebuild),
            "upgradesstables" => Some(OperationKind::UpgradeSSTables),
            "remove" => Some(OperationKind::Remove),
            "decommission" => Some(OperationKind::Decommission),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status of the CassandraCluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CassandraClusterStatus {
    /// Aggregated phase of all racks
    #[serde(default)]
    pub phase: Option<ClusterPhase>,

    /// Last structural action seen on any rack
    #[serde(default)]
    pub last_cluster_action: Option<ClusterAction>,

    #[serde(default)]
    pub last_cluster_action_status: Option<OperationStatus>,

    /// Seed addresses handed to bootstrapping nodes
    #[serde(default)]
    pub seedlist: Vec<String>,

    /// Host id and IP of each pod, keyed by pod name
    #[serde(default)]
    pub cassandra_node_status: BTreeMap<String, CassandraNodeStatus>,

    /// One entry per declared rack, keyed by `<dc>-<rack>`
    #[serde(default)]
    pub cassandra_rack_status: BTreeMap<String, CassandraRackStatus>,
}

/// Cassandra identity of a pod
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CassandraNodeStatus {
    pub host_id: String,
    pub node_ip: String,
}

/// Status of a single rack
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CassandraRackStatus {
    #[serde(default)]
    pub phase: ClusterPhase,

    #[serde(default)]
    pub cassandra_last_action: LastAction,

    #[serde(default)]
    pub pod_last_operation: PodLastOperation,
}

/// Last structural action applied to a rack
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastAction {
    #[serde(default)]
    pub status: Option<OperationStatus>,

    #[serde(default)]
    pub name: Option<ClusterAction>,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub updated_nodes: Vec<String>,
}

impl LastAction {
    /// True when the action is named `action` and in one of `statuses`
    pub fn is(&self, action: ClusterAction, statuses: &[OperationStatus]) -> bool {
        self.name == Some(action) && self.status.is_some_and(|s| statuses.contains(&s))
    }
}

/// Last operation run on the pods of a rack.
///
/// `pods` holds the in-progress nodes, `pods_ok` and `pods_ko` the nodes that
/// completed with and without success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodLastOperation {
    #[serde(default)]
    pub name: Option<OperationKind>,

    #[serde(default)]
    pub status: Option<OperationStatus>,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub pods: Vec<String>,

    #[serde(default, rename = "podsOK")]
    pub pods_ok: Vec<String>,

    #[serde(default, rename = "podsKO")]
    pub pods_ko: Vec<String>,

    /// Identity of the operator process that started the operation
    #[serde(default)]
    pub operator_name: Option<String>,
}

impl PodLastOperation {
    /// Restart the record for a new round of `kind`
    pub fn reset(&mut self, kind: OperationKind, status: OperationStatus, now: DateTime<Utc>) {
        self.name = Some(kind);
        self.status = Some(status);
        self.start_time = Some(now);
        self.end_time = None;
        self.pods.clear();
        self.pods_ok.clear();
        self.pods_ko.clear();
    }

    /// Mark the round finished
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = Some(OperationStatus::Done);
        self.end_time = Some(now);
    }

    pub fn is(&self, kind: OperationKind, status: OperationStatus) -> bool {
        self.name == Some(kind) && self.status == Some(status)
    }

    /// Record `pod` as in progress, removing any earlier outcome
    pub fn track(&mut self, pod: &str) {
        self.pods_ok.retain(|p| p != pod);
        self.pods_ko.retain(|p| p != pod);
        if !self.pods.iter().any(|p| p == pod) {
            self.pods.push(pod.to_string());
        }
    }

    /// Move `pod` from the in-progress list to the succeeded or failed list
    pub fn settle(&mut self, pod: &str, succeeded: bool) {
        self.pods.retain(|p| p != pod);
        self.pods_ok.retain(|p| p != pod);
        self.pods_ko.retain(|p| p != pod);
        if succeeded {
            self.pods_ok.push(pod.to_string());
        } else {
            self.pods_ko.push(pod.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        let op = PodLastOperation {
            name: Some(OperationKind::UpgradeSSTables),
            status: Some(OperationStatus::ToDo),
            pods_ok: vec!["c-dc1-rack1-0".into()],
            ..Default::default()
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["name"], "upgradesstables");
        assert_eq!(json["status"], "ToDo");
        assert_eq!(json["podsOK"][0], "c-dc1-rack1-0");

        let action = serde_json::to_value(ClusterAction::DeleteDc).unwrap();
        assert_eq!(action, "ActionDeleteDC");
        assert_eq!(ClusterAction::DeleteDc.to_string(), "ActionDeleteDC");
    }

    #[test]
    fn test_spec_defaults() {
        let spec: CassandraClusterSpec = serde_json::from_str(
            r#"{"topology": {"dc": [{"name": "dc1", "rack": [{"name": "rack1"}]}]}, "deletePVC": true}"#,
        )
        .unwrap();
        assert_eq!(spec.nodes_per_racks, 1);
        assert!(spec.delete_pvc);
        assert_eq!(spec.topology.dc[0].rack[0].rolling_partition, 0);
    }

    #[test]
    fn test_settle_moves_pod_once() {
        let mut op = PodLastOperation::default();
        op.reset(OperationKind::Cleanup, OperationStatus::Ongoing, Utc::now());
        op.track("p0");
        op.track("p0");
        op.track("p1");
        assert_eq!(op.pods, vec!["p0", "p1"]);

        op.settle("p0", false);
        op.settle("p1", true);
        assert!(op.pods.is_empty());
        assert_eq!(op.pods_ko, vec!["p0"]);
        assert_eq!(op.pods_ok, vec!["p1"]);

        // A new round on the same pod clears its previous outcome
        op.track("p0");
        assert!(op.pods_ko.is_empty());
    }

    #[test]
    fn test_parse_round_trip_names() {
        for kind in [
            OperationKind::Cleanup,
            OperationKind::Rebuild,
            OperationKind::UpgradeSSTables,
            OperationKind::Remove,
            OperationKind::Decommission,
        ] {
            assert_eq!(OperationKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(OperationStatus::parse("Manual"), Some(OperationStatus::Manual));
        assert_eq!(OperationStatus::parse("manual"), None);
    }
}
