//! Seed list derivation
//!
//! Up to three seeds per datacenter. With one or two racks a rack may give
//! several seeds (index cap `4 - racks`); from three racks on, each rack
//! gives at most its first node so seeds spread across racks.

use super::{dc_rack_name, DEFAULT_DC_NAME, DEFAULT_RACK_NAME};
use crate::crd::{CassandraCluster, CassandraClusterSpec};

/// Maximum number of seeds taken from one datacenter
pub const MAX_SEEDS_PER_DC: usize = 3;

/// Address of a seed pod: `<cluster>-<dc>-<rack>-<index>.<cluster>.<namespace>`
pub fn seed_host(cluster: &str, namespace: &str, dc_rack: &str, index: i32) -> String {
    format!("{}-{}-{}.{}.{}", cluster, dc_rack, index, cluster, namespace)
}

/// Compute the seed list of a cluster from its declared topology
pub fn compute_seed_list(cluster: &str, namespace: &str, spec: &CassandraClusterSpec) -> Vec<String> {
    let mut seeds = Vec::new();

    if spec.topology.dc.is_empty() {
        let dc_rack = dc_rack_name(DEFAULT_DC_NAME, DEFAULT_RACK_NAME);
        for index in 0..spec.nodes_per_racks.clamp(0, MAX_SEEDS_PER_DC as i32) {
            seeds.push(seed_host(cluster, namespace, &dc_rack, index));
        }
        return seeds;
    }

    for dc in &spec.topology.dc {
        let nodes = spec.nodes_per_rack(&dc.name);
        let racks: Vec<&str> = if dc.rack.is_empty() {
            vec![DEFAULT_RACK_NAME]
        } else {
            dc.rack.iter().map(|r| r.name.as_str()).collect()
        };
        let mut in_dc = 0usize;

        // 1 rack: indices 0..3, 2 racks: indices 0..2, 3+ racks: index 0 only
        let index_cap = if racks.len() < MAX_SEEDS_PER_DC {
            (MAX_SEEDS_PER_DC + 1 - racks.len()) as i32
        } else {
            1
        };

        for rack in racks {
            let dc_rack = dc_rack_name(&dc.name, rack);
            if dc_rack.is_empty() {
                continue;
            }
            let mut index = 0;
            while index < nodes && index < index_cap && in_dc < MAX_SEEDS_PER_DC {
                seeds.push(seed_host(cluster, namespace, &dc_rack, index));
                in_dc += 1;
                index += 1;
            }
        }
    }

    seeds
}

impl CassandraCluster {
    /// Seed list derived from the current spec
    pub fn seed_list(&self) -> Vec<String> {
        compute_seed_list(&self.cluster_name(), &self.cluster_namespace(), &self.spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::tests::{cluster, dc};

    #[test]
    fn test_single_rack_gives_three_seeds() {
        let c = cluster("c", "ns", 5, vec![dc("dc1", &["r1"])]);
        assert_eq!(
            c.seed_list(),
            vec!["c-dc1-r1-0.c.ns", "c-dc1-r1-1.c.ns", "c-dc1-r1-2.c.ns"]
        );
    }

    #[test]
    fn test_two_racks_cap_two_per_rack() {
        let c = cluster("c", "ns", 2, vec![dc("dc1", &["r1", "r2"])]);
        let seeds = c.seed_list();
        assert_eq!(seeds.len(), 3);
        assert_eq!(seeds.iter().filter(|s| s.starts_with("c-dc1-r1-")).count(), 2);
        assert_eq!(seeds.iter().filter(|s| s.starts_with("c-dc1-r2-")).count(), 1);
    }

    #[test]
    fn test_three_racks_one_seed_each() {
        let c = cluster("c", "ns", 1, vec![dc("dc1", &["r1", "r2", "r3"])]);
        assert_eq!(
            c.seed_list(),
            vec!["c-dc1-r1-0.c.ns", "c-dc1-r2-0.c.ns", "c-dc1-r3-0.c.ns"]
        );

        let c = cluster("c", "ns", 3, vec![dc("dc1", &["r1", "r2", "r3", "r4"])]);
        let seeds = c.seed_list();
        assert_eq!(seeds.len(), 3);
        assert!(seeds.iter().all(|s| s.contains("-0.")));
    }

    #[test]
    fn test_empty_topology_and_small_racks() {
        let c = cluster("c", "ns", 2, vec![]);
        assert_eq!(c.seed_list(), vec!["c-dc1-rack1-0.c.ns", "c-dc1-rack1-1.c.ns"]);

        let c = cluster("c", "ns", 1, vec![dc("dc1", &[])]);
        assert_eq!(c.seed_list(), vec!["c-dc1-rack1-0.c.ns"]);
    }

    #[test]
    fn test_seeds_per_datacenter() {
        let mut c = cluster("c", "ns", 3, vec![dc("dc1", &["r1"]), dc("dc2", &["r1"])]);
        c.spec.topology.dc[1].nodes_per_racks = Some(0);
        let seeds = c.seed_list();
        assert_eq!(seeds.len(), 3);
        assert!(seeds.iter().all(|s| s.starts_with("c-dc1-")));
    }

    #[test]
    fn test_invalid_rack_is_skipped() {
        let c = cluster("c", "ns", 3, vec![dc("dc1", &["R1", "r2"])]);
        assert_eq!(c.seed_list(), vec!["c-dc1-r2-0.c.ns", "c-dc1-r2-1.c.ns"]);
    }
}
