//! Topology Model
//!
//! Pure functions over the declared datacenter/rack tree of a
//! [`CassandraCluster`]: rack identities, per-scope overrides, pod selectors,
//! rack status bookkeeping and seed list derivation.
//!
//! Datacenter-level settings override cluster-level ones. Racks only carry a
//! rolling partition of their own.

mod rack_status;
mod seed_list;

pub use rack_status::*;
pub use seed_list::*;

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::error;

use crate::crd::{CassandraCluster, CassandraClusterSpec, Datacenter, Topology};
use crate::error::{Error, Result};

/// Datacenter used when the topology declares none
pub const DEFAULT_DC_NAME: &str = "dc1";

/// Rack used when a datacenter declares none
pub const DEFAULT_RACK_NAME: &str = "rack1";

/// Label prefix of the topology labels set on every pod
pub const LABEL_PREFIX: &str = "cassandraclusters.db.orange.com";

static DC_RACK_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Build the `<dc>-<rack>` identity of a rack.
///
/// Returns an empty string (and logs) when the identity is not a valid
/// DNS label. Callers must treat an empty identity as fatal for the rack.
pub fn dc_rack_name(dc: &str, rack: &str) -> String {
    let name = format!("{}-{}", dc, rack);
    if DC_RACK_NAME_REGEX.is_match(&name) {
        name
    } else {
        error!(dc = %dc, rack = %rack, "Invalid rack identity {}", name);
        String::new()
    }
}

/// Same as [`dc_rack_name`] but as a `Result`
pub fn checked_dc_rack_name(dc: &str, rack: &str) -> Result<String> {
    let name = dc_rack_name(dc, rack);
    if name.is_empty() {
        return Err(Error::InvalidName {
            dc: dc.to_string(),
            rack: rack.to_string(),
        });
    }
    Ok(name)
}

/// Split a rack identity back into datacenter and rack names
pub fn split_dc_rack(dc_rack: &str) -> Option<(&str, &str)> {
    dc_rack.split_once('-')
}

/// A rack of the declared topology, with defaults resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RackRef {
    pub dc_index: usize,
    pub rack_index: usize,
    pub dc: String,
    pub rack: String,
}

impl RackRef {
    /// `<dc>-<rack>`, empty if invalid
    pub fn dc_rack(&self) -> String {
        dc_rack_name(&self.dc, &self.rack)
    }

    pub fn checked_dc_rack(&self) -> Result<String> {
        checked_dc_rack_name(&self.dc, &self.rack)
    }
}

// =============================================================================
// Spec resolution
// =============================================================================

impl Topology {
    /// Number of datacenters, at least one
    pub fn dc_size(&self) -> usize {
        self.dc.len().max(1)
    }

    /// Number of racks of a datacenter, at least one
    pub fn rack_size(&self, dc_index: usize) -> usize {
        self.dc
            .get(dc_index)
            .map(|dc| dc.rack.len())
            .unwrap_or(0)
            .max(1)
    }

    /// Name of the datacenter at `dc_index`, or the default one
    pub fn dc_name(&self, dc_index: usize) -> String {
        self.dc
            .get(dc_index)
            .map(|dc| dc.name.clone())
            .unwrap_or_else(|| DEFAULT_DC_NAME.to_string())
    }

    /// Name of the rack at `rack_index` in the datacenter at `dc_index`, or the default one
    pub fn rack_name(&self, dc_index: usize, rack_index: usize) -> String {
        self.dc
            .get(dc_index)
            .and_then(|dc| dc.rack.get(rack_index))
            .map(|rack| rack.name.clone())
            .unwrap_or_else(|| DEFAULT_RACK_NAME.to_string())
    }

    pub fn find_dc(&self, dc_name: &str) -> Option<&Datacenter> {
        self.dc.iter().find(|dc| dc.name == dc_name)
    }

    /// Every declared rack in declaration order, synthesizing defaults for
    /// an empty topology or a datacenter without racks
    pub fn racks(&self) -> Vec<RackRef> {
        let mut racks = Vec::new();
        for dc_index in 0..self.dc_size() {
            for rack_index in 0..self.rack_size(dc_index) {
                racks.push(RackRef {
                    dc_index,
                    rack_index,
                    dc: self.dc_name(dc_index),
                    rack: self.rack_name(dc_index, rack_index),
                });
            }
        }
        racks
    }

    /// Valid rack identities of the topology
    pub fn dc_rack_names(&self) -> Vec<String> {
        self.racks()
            .iter()
            .map(RackRef::dc_rack)
            .filter(|name| !name.is_empty())
            .collect()
    }

    pub fn is_valid_dc(&self, dc_name: &str) -> bool {
        if self.dc.is_empty() {
            return dc_name == DEFAULT_DC_NAME;
        }
        self.find_dc(dc_name).is_some()
    }
}

impl CassandraClusterSpec {
    /// Nodes per rack in a datacenter: datacenter override, else cluster value
    pub fn nodes_per_rack(&self, dc_name: &str) -> i32 {
        self.topology
            .find_dc(dc_name)
            .and_then(|dc| dc.nodes_per_racks)
            .unwrap_or(self.nodes_per_racks)
    }

    pub fn data_capacity(&self, dc_name: &str) -> Option<&str> {
        self.topology
            .find_dc(dc_name)
            .and_then(|dc| dc.data_capacity.as_deref())
            .filter(|c| !c.is_empty())
            .or(self.data_capacity.as_deref())
    }

    pub fn data_storage_class(&self, dc_name: &str) -> Option<&str> {
        self.topology
            .find_dc(dc_name)
            .and_then(|dc| dc.data_storage_class.as_deref())
            .filter(|c| !c.is_empty())
            .or(self.data_storage_class.as_deref())
    }

    pub fn rolling_partition(&self, dc_name: &str, rack_name: &str) -> i32 {
        self.topology
            .find_dc(dc_name)
            .and_then(|dc| dc.rack.iter().find(|r| r.name == rack_name))
            .map(|r| r.rolling_partition)
            .unwrap_or(0)
    }

    /// First datacenter scaled down to zero nodes, a candidate for removal
    pub fn dc_with_nodes_to_zero(&self) -> Option<String> {
        self.topology
            .dc
            .iter()
            .find(|dc| self.nodes_per_rack(&dc.name) == 0)
            .map(|dc| dc.name.clone())
    }

    /// Total nodes expected in the cluster
    pub fn total_nodes(&self) -> i32 {
        self.topology
            .racks()
            .iter()
            .map(|r| self.nodes_per_rack(&r.dc))
            .sum()
    }
}

// =============================================================================
// Cluster naming
// =============================================================================

impl CassandraCluster {
    pub fn cluster_name(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    pub fn cluster_namespace(&self) -> String {
        self.metadata.namespace.clone().unwrap_or_default()
    }

    /// Name of the workload running the pods of a rack
    pub fn rack_workload_name(&self, dc_rack: &str) -> String {
        format!("{}-{}", self.cluster_name(), dc_rack)
    }

    /// Name of the pod at `ordinal` in a rack
    pub fn pod_name(&self, dc_rack: &str, ordinal: i32) -> String {
        format!("{}-{}", self.rack_workload_name(dc_rack), ordinal)
    }

    /// Labels shared by every pod of the cluster
    pub fn cluster_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app".to_string(), "cassandracluster".to_string()),
            ("cassandracluster".to_string(), self.cluster_name()),
        ])
    }

    /// Selector of the pods of one rack
    pub fn rack_selector(&self, dc: &str, rack: &str) -> BTreeMap<String, String> {
        let mut labels = self.cluster_labels();
        labels.insert("dc-rack".to_string(), dc_rack_name(dc, rack));
        labels.insert(format!("{}.dc", LABEL_PREFIX), dc.to_string());
        labels.insert(format!("{}.rack", LABEL_PREFIX), rack.to_string());
        labels
    }

    /// Selector of the pods of one datacenter (all pods if `dc` is empty)
    pub fn dc_selector(&self, dc: &str) -> BTreeMap<String, String> {
        let mut labels = self.cluster_labels();
        if !dc.is_empty() {
            labels.insert(format!("{}.dc", LABEL_PREFIX), dc.to_string());
        }
        labels
    }

    /// Datacenter present in the rack status but no longer declared
    pub fn removed_dc_name(&self) -> Option<String> {
        let status = self.status.as_ref()?;
        status
            .cassandra_rack_status
            .keys()
            .filter_map(|dc_rack| split_dc_rack(dc_rack).map(|(dc, _)| dc))
            .find(|dc| !self.spec.topology.is_valid_dc(dc))
            .map(String::from)
    }

    /// True if the pod host `<pod>.<cluster>.<ns>` is one of the seeds
    pub fn is_pod_in_seed_list(&self, pod_name: &str) -> bool {
        let host = format!(
            "{}.{}.{}",
            pod_name,
            self.cluster_name(),
            self.cluster_namespace()
        );
        self.status
            .as_ref()
            .is_some_and(|s| s.seedlist.iter().any(|seed| *seed == host))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crd::{CassandraClusterStatus, CassandraRackStatus, Rack};

    pub(crate) fn dc(name: &str, racks: &[&str]) -> Datacenter {
        Datacenter {
            name: name.to_string(),
            rack: racks
                .iter()
                .map(|r| Rack {
                    name: r.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    pub(crate) fn cluster(name: &str, ns: &str, nodes: i32, dcs: Vec<Datacenter>) -> CassandraCluster {
        let mut c = CassandraCluster::new(
            name,
            CassandraClusterSpec {
                nodes_per_racks: nodes,
                topology: Topology { dc: dcs },
                ..Default::default()
            },
        );
        c.metadata.namespace = Some(ns.to_string());
        c
    }

    #[test]
    fn test_dc_rack_name_validation() {
        assert_eq!(dc_rack_name("dc1", "rack1"), "dc1-rack1");
        assert_eq!(dc_rack_name("DC1", "rack1"), "");
        assert_eq!(dc_rack_name("dc1", "rack_1"), "");
        assert_eq!(dc_rack_name("dc1", "rack-"), "");
        assert!(checked_dc_rack_name("dc1", "Rack1").is_err());
    }

    #[test]
    fn test_defaults_for_empty_topology() {
        let topology = Topology::default();
        assert_eq!(topology.dc_size(), 1);
        assert_eq!(topology.dc_name(0), "dc1");
        assert_eq!(topology.rack_name(0, 0), "rack1");
        assert_eq!(topology.dc_rack_names(), vec!["dc1-rack1"]);
        assert!(topology.is_valid_dc("dc1"));
        assert!(!topology.is_valid_dc("dc2"));
    }

    #[test]
    fn test_racks_synthesize_default_rack() {
        let topology = Topology {
            dc: vec![dc("dc1", &[]), dc("dc2", &["r1", "r2"])],
        };
        assert_eq!(
            topology.dc_rack_names(),
            vec!["dc1-rack1", "dc2-r1", "dc2-r2"]
        );
        assert_eq!(topology.rack_name(5, 5), "rack1");
    }

    #[test]
    fn test_overrides() {
        let mut c = cluster("c", "ns", 3, vec![dc("dc1", &["r1"]), dc("dc2", &["r1"])]);
        c.spec.data_capacity = Some("10Gi".into());
        c.spec.data_storage_class = Some("standard".into());
        c.spec.topology.dc[1].nodes_per_racks = Some(0);
        c.spec.topology.dc[1].data_storage_class = Some("fast".into());
        c.spec.topology.dc[0].rack[0].rolling_partition = 2;

        assert_eq!(c.spec.nodes_per_rack("dc1"), 3);
        assert_eq!(c.spec.nodes_per_rack("dc2"), 0);
        assert_eq!(c.spec.data_capacity("dc2"), Some("10Gi"));
        assert_eq!(c.spec.data_storage_class("dc1"), Some("standard"));
        assert_eq!(c.spec.data_storage_class("dc2"), Some("fast"));
        assert_eq!(c.spec.rolling_partition("dc1", "r1"), 2);
        assert_eq!(c.spec.rolling_partition("dc2", "r1"), 0);
        assert_eq!(c.spec.dc_with_nodes_to_zero(), Some("dc2".into()));
        assert_eq!(c.spec.total_nodes(), 3);
    }

    #[test]
    fn test_selectors() {
        let c = cluster("c", "ns", 1, vec![dc("dc1", &["r1"])]);
        let rack = c.rack_selector("dc1", "r1");
        assert_eq!(rack.get("dc-rack").map(String::as_str), Some("dc1-r1"));
        assert_eq!(
            rack.get("cassandraclusters.db.orange.com.rack").map(String::as_str),
            Some("r1")
        );

        let all = c.dc_selector("");
        assert_eq!(all.len(), 2);
        assert_eq!(c.pod_name("dc1-r1", 2), "c-dc1-r1-2");
    }

    #[test]
    fn test_removed_dc_and_seed_membership() {
        let mut c = cluster("c", "ns", 1, vec![dc("dc1", &["r1"])]);
        c.status = Some(CassandraClusterStatus {
            seedlist: vec!["c-dc1-r1-0.c.ns".into()],
            cassandra_rack_status: BTreeMap::from([
                ("dc1-r1".to_string(), CassandraRackStatus::default()),
                ("dc2-r1".to_string(), CassandraRackStatus::default()),
            ]),
            ..Default::default()
        });
        assert_eq!(c.removed_dc_name(), Some("dc2".into()));
        assert!(c.is_pod_in_seed_list("c-dc1-r1-0"));
        assert!(!c.is_pod_in_seed_list("c-dc1-r1-1"));
    }
}
