//! Rack status bookkeeping
//!
//! Keeps `status.cassandraRackStatus` in one-to-one correspondence with the
//! declared racks and folds rack statuses into the cluster-level phase.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::crd::{
    CassandraClusterSpec, CassandraClusterStatus, CassandraRackStatus, ClusterAction,
    ClusterPhase, LastAction, OperationStatus,
};

/// Status of a rack that was just declared
pub fn initial_rack_status(now: DateTime<Utc>) -> CassandraRackStatus {
    CassandraRackStatus {
        phase: ClusterPhase::Initializing,
        cassandra_last_action: LastAction {
            name: Some(ClusterAction::Initializing),
            status: Some(OperationStatus::Ongoing),
            start_time: Some(now),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Add a status entry for every declared rack missing one.
///
/// Returns the identities of the racks added. Invalid rack identities are
/// skipped; the reconcile cycle reports them.
pub fn init_rack_statuses(
    spec: &CassandraClusterSpec,
    status: &mut CassandraClusterStatus,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut added = Vec::new();
    for dc_rack in spec.topology.dc_rack_names() {
        if !status.cassandra_rack_status.contains_key(&dc_rack) {
            info!(rack = %dc_rack, "Initializing rack status");
            status
                .cassandra_rack_status
                .insert(dc_rack.clone(), initial_rack_status(now));
            added.push(dc_rack);
        }
    }
    if !added.is_empty() && status.phase.is_none() {
        status.phase = Some(ClusterPhase::Initializing);
        status.last_cluster_action = Some(ClusterAction::Initializing);
        status.last_cluster_action_status = Some(OperationStatus::Ongoing);
    }
    added
}

/// Remove status entries of racks no longer declared, returning their identities
pub fn prune_rack_statuses(
    spec: &CassandraClusterSpec,
    status: &mut CassandraClusterStatus,
) -> Vec<String> {
    let declared = spec.topology.dc_rack_names();
    let stale: Vec<String> = status
        .cassandra_rack_status
        .keys()
        .filter(|k| !declared.contains(k))
        .cloned()
        .collect();
    for dc_rack in &stale {
        info!(rack = %dc_rack, "Removing status of undeclared rack");
        status.cassandra_rack_status.remove(dc_rack);
    }
    stale
}

/// Fold rack statuses into the cluster phase and last cluster action.
///
/// The first rack (in declaration order) with an unfinished action gives the
/// cluster action; the first rack not running gives the cluster phase.
pub fn update_cluster_phase(spec: &CassandraClusterSpec, status: &mut CassandraClusterStatus) {
    let mut action_set = false;
    let mut phase = ClusterPhase::Running;

    for dc_rack in spec.topology.dc_rack_names() {
        let Some(rack) = status.cassandra_rack_status.get(&dc_rack) else {
            continue;
        };
        let last = &rack.cassandra_last_action;
        if !action_set && last.status.is_some() && last.status != Some(OperationStatus::Done) {
            status.last_cluster_action = last.name;
            status.last_cluster_action_status = last.status;
            action_set = true;
        }
        if phase == ClusterPhase::Running && rack.phase != ClusterPhase::Running {
            phase = rack.phase;
        }
    }

    if !action_set {
        status.last_cluster_action_status = Some(OperationStatus::Done);
    }
    status.phase = Some(phase);
}
