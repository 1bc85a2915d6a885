//! Cluster reconcile cycle
//!
//! One pass over a CassandraCluster:
//!
//! 1. keep one rack status per declared rack
//! 2. keep the seed list in sync with the topology
//! 3. per rack: follow the workload, detect scaling, drive scale-up and the
//!    decommission path of scale-down
//! 4. with no structural change running: finalize finished pod operations
//!    and advance a random one
//! 5. fold rack statuses into the cluster phase and persist

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::Resource;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::crd::{
    CassandraCluster, ClusterAction, ClusterPhase, OperationKind, OperationStatus,
};
use crate::domain::{ClusterStoreRef, NodeManagementClientRef, RackWorkload};
use crate::error::{Error, Result};
use crate::operations::labels::queued_labels;
use crate::operations::{
    ClusterState, CompletionQueues, DecommissionEngine, DecommissionStep, OperationRound,
    PersistPolicy, PodOperationEngine,
};
use crate::topology::{init_rack_statuses, prune_rack_statuses, update_cluster_phase, RackRef};

/// Rack action statuses during which no new scaling is detected
const ACTION_RUNNING: [OperationStatus; 4] = [
    OperationStatus::ToDo,
    OperationStatus::Ongoing,
    OperationStatus::Finalizing,
    OperationStatus::Continue,
];

/// Configuration of the cluster reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Delay before the next pass over a cluster
    pub resync_period: Duration,
    /// Retry behaviour of cluster status writes
    pub persist: PersistPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(10),
            persist: PersistPolicy::default(),
        }
    }
}

/// Cluster reconciler
pub struct ClusterReconciler {
    config: ReconcilerConfig,
    store: ClusterStoreRef,
    management: NodeManagementClientRef,
    operations: Arc<PodOperationEngine>,
    decommission: DecommissionEngine,
    queues: Arc<CompletionQueues>,
}

impl ClusterReconciler {
    pub fn new(
        config: ReconcilerConfig,
        store: ClusterStoreRef,
        management: NodeManagementClientRef,
        operations: Arc<PodOperationEngine>,
        decommission: DecommissionEngine,
        queues: Arc<CompletionQueues>,
    ) -> Self {
        Self {
            config,
            store,
            management,
            operations,
            decommission,
            queues,
        }
    }

    pub async fn reconcile(&self, cluster: Arc<CassandraCluster>) -> Result<Action> {
        let mut state = ClusterState::new(
            (*cluster).clone(),
            self.store.clone(),
            self.config.persist.clone(),
        );
        info!(cluster = %state.key(), "Reconciling CassandraCluster");

        if cluster.meta().deletion_timestamp.is_some() {
            info!(cluster = %state.key(), "Cluster is being deleted");
            self.queues.remove(&state.key());
            return Ok(Action::await_change());
        }

        if self.fix_rack_statuses(&mut state) {
            state.persist().await?;
            return Ok(Action::requeue(self.config.resync_period));
        }

        self.update_seed_list(&mut state);

        let racks = state.cluster().spec.topology.racks();
        for rack in &racks {
            match self.reconcile_rack(&mut state, rack).await {
                Ok(()) => {}
                Err(e @ Error::ResourceNotReady(_)) => {
                    debug!(cluster = %state.key(), rack = %rack.dc_rack(), error = %e, "Rack not ready");
                }
                Err(e) => {
                    error!(cluster = %state.key(), rack = %rack.dc_rack(), error = %e, "Rack reconciliation failed");
                }
            }
        }

        let spec = state.cluster().spec.clone();
        update_cluster_phase(&spec, state.status_mut());

        if state.status().last_cluster_action_status == Some(OperationStatus::Done) {
            self.run_pod_operations(&mut state, &racks).await?;
        }

        state.persist().await?;
        Ok(Action::requeue(self.config.resync_period))
    }

    /// Add and prune rack statuses. True if racks were added.
    fn fix_rack_statuses(&self, state: &mut ClusterState) -> bool {
        let spec = state.cluster().spec.clone();
        let now = Utc::now();
        let added = init_rack_statuses(&spec, state.status_mut(), now);
        let pruned = prune_rack_statuses(&spec, state.status_mut());
        if !pruned.is_empty() {
            info!(cluster = %state.key(), racks = ?pruned, "Pruned rack statuses");
        }
        !added.is_empty()
    }

    fn update_seed_list(&self, state: &mut ClusterState) {
        let computed = state.cluster().seed_list();
        let auto_update = state.cluster().spec.auto_update_seed_list;
        let status = state.status_mut();
        if status.seedlist.is_empty() {
            info!(seeds = ?computed, "Initializing seed list");
            status.seedlist = computed;
        } else if auto_update && status.seedlist != computed {
            info!(old = ?status.seedlist, new = ?computed, "Updating seed list");
            status.seedlist = computed;
            status.last_cluster_action = Some(ClusterAction::UpdateSeedList);
        }
    }

    async fn reconcile_rack(&self, state: &mut ClusterState, rack: &RackRef) -> Result<()> {
        let dc_rack = match rack.checked_dc_rack() {
            Ok(dc_rack) => dc_rack,
            Err(e) => {
                warn!(cluster = %state.key(), error = %e, "Skipping rack with an invalid name");
                return Ok(());
            }
        };
        let namespace = state.namespace();
        let workload_name = state.cluster().rack_workload_name(&dc_rack);
        let mut workload = self
            .store
            .rack_workload(&namespace, &workload_name)
            .await?
            .ok_or_else(|| Error::ResourceNotReady(format!("workload {} not found", workload_name)))?;
        let desired = state.cluster().spec.nodes_per_rack(&rack.dc);

        self.update_rack_phase(state, &dc_rack, &workload, desired)?;

        let now = Utc::now();
        let last_action = state.rack_mut(&dc_rack)?.cassandra_last_action.clone();
        let running = last_action.status.is_some_and(|s| ACTION_RUNNING.contains(&s));
        if !running && desired != workload.replicas {
            let rack_status = state.rack_mut(&dc_rack)?;
            let action = &mut rack_status.cassandra_last_action;
            action.status = Some(OperationStatus::ToDo);
            action.start_time = Some(now);
            action.end_time = None;
            if desired > workload.replicas {
                info!(rack = %dc_rack, from = workload.replicas, to = desired, "Scale up detected");
                action.name = Some(ClusterAction::ScaleUp);
            } else {
                info!(rack = %dc_rack, from = workload.replicas, to = desired, "Scale down detected");
                action.name = Some(ClusterAction::ScaleDown);
                rack_status.pod_last_operation.reset(
                    OperationKind::Decommission,
                    OperationStatus::ToDo,
                    now,
                );
            }
        }

        let last_action = state.rack_mut(&dc_rack)?.cassandra_last_action.clone();
        if last_action.is(ClusterAction::ScaleUp, &ACTION_RUNNING) {
            self.scale_up(state, rack, &dc_rack, &workload_name, &workload, desired)
                .await?;
        } else if last_action.is(ClusterAction::ScaleDown, &ACTION_RUNNING) {
            self.scale_down(state, rack, &dc_rack, &workload_name, &mut workload, desired)
                .await?;
        }
        Ok(())
    }

    /// Initializing → Running once every node is ready; Running ↔ Pending
    /// while nodes are missing
    fn update_rack_phase(
        &self,
        state: &mut ClusterState,
        dc_rack: &str,
        workload: &RackWorkload,
        desired: i32,
    ) -> Result<()> {
        let ready = workload.ready_replicas == workload.replicas;
        let rack_status = state.rack_mut(dc_rack)?;
        match rack_status.phase {
            ClusterPhase::Initializing if ready && workload.replicas == desired => {
                info!(rack = %dc_rack, "Rack is running");
                rack_status.phase = ClusterPhase::Running;
                let action = &mut rack_status.cassandra_last_action;
                if action.is(ClusterAction::Initializing, &ACTION_RUNNING) {
                    action.status = Some(OperationStatus::Done);
                    action.end_time = Some(Utc::now());
                }
            }
            ClusterPhase::Running if !ready => rack_status.phase = ClusterPhase::Pending,
            ClusterPhase::Pending if ready => rack_status.phase = ClusterPhase::Running,
            _ => {}
        }
        Ok(())
    }

    async fn scale_up(
        &self,
        state: &mut ClusterState,
        rack: &RackRef,
        dc_rack: &str,
        workload_name: &str,
        workload: &RackWorkload,
        desired: i32,
    ) -> Result<()> {
        if workload.replicas < desired {
            self.store
                .scale_rack(&state.namespace(), workload_name, desired)
                .await?;
            state.rack_mut(dc_rack)?.cassandra_last_action.status = Some(OperationStatus::Ongoing);
            return Ok(());
        }
        if workload.replicas != desired || workload.ready_replicas != desired {
            debug!(rack = %dc_rack, ready = workload.ready_replicas, desired, "Waiting for new nodes");
            return Ok(());
        }

        let auto_pilot = state.cluster().spec.auto_pilot;
        let status = if auto_pilot {
            OperationStatus::ToDo
        } else {
            OperationStatus::Manual
        };
        let selector = state.cluster().rack_selector(&rack.dc, &rack.rack);
        let labels = queued_labels(OperationKind::Cleanup, status);
        for pod in self
            .store
            .list_pods(&state.namespace(), &selector)
            .await?
            .into_iter()
            .filter(|p| p.is_running())
        {
            if let Err(e) = self
                .store
                .patch_pod_labels(&pod.namespace, &pod.name, &labels)
                .await
            {
                warn!(pod = %pod.name, error = %e, "Could not queue cleanup");
            }
        }

        info!(rack = %dc_rack, cleanup = %status, "Scale up done");
        let action = &mut state.rack_mut(dc_rack)?.cassandra_last_action;
        action.status = Some(OperationStatus::Done);
        action.end_time = Some(Utc::now());
        Ok(())
    }

    async fn scale_down(
        &self,
        state: &mut ClusterState,
        rack: &RackRef,
        dc_rack: &str,
        workload_name: &str,
        workload: &mut RackWorkload,
        desired: i32,
    ) -> Result<()> {
        let decommissioned = state
            .rack(dc_rack)
            .is_some_and(|r| r.pod_last_operation.is(OperationKind::Decommission, OperationStatus::Done));
        if decommissioned && workload.replicas == desired {
            info!(rack = %dc_rack, "Scale down done");
            let action = &mut state.rack_mut(dc_rack)?.cassandra_last_action;
            action.status = Some(OperationStatus::Done);
            action.end_time = Some(Utc::now());
            return Ok(());
        }

        match self.decommission.ensure_decommission(state, rack).await? {
            DecommissionStep::Shrink(replicas) if workload.replicas > replicas => {
                info!(rack = %dc_rack, replicas, "Shrinking rack workload");
                self.store
                    .scale_rack(&state.namespace(), workload_name, replicas)
                    .await?;
                workload.replicas = replicas;
            }
            step => debug!(rack = %dc_rack, ?step, "Decommission step"),
        }
        Ok(())
    }

    /// Record finished pod operations, then advance one on every rack unless
    /// a node is joining the ring
    async fn run_pod_operations(&self, state: &mut ClusterState, racks: &[RackRef]) -> Result<()> {
        let finalized = self.operations.finalize_operations(state).await?;
        if finalized > 0 {
            debug!(cluster = %state.key(), finalized, "Pod operations finalized");
        }

        if self.has_joining_nodes(state).await {
            info!(cluster = %state.key(), "Nodes are joining, pod operations deferred");
            return Ok(());
        }

        for rack in racks {
            if rack.checked_dc_rack().is_err() {
                continue;
            }
            match self.operations.ensure_random_operation(state, rack).await {
                Ok(OperationRound::Idle) => {}
                Ok(round) => debug!(rack = %rack.dc_rack(), ?round, "Pod operation round"),
                Err(e) => {
                    warn!(rack = %rack.dc_rack(), error = %e, "Pod operation round failed");
                }
            }
        }
        Ok(())
    }

    /// Asks the first running node of the cluster. Unknown counts as joining.
    async fn has_joining_nodes(&self, state: &ClusterState) -> bool {
        let selector = state.cluster().cluster_labels();
        let pods = match self.store.list_pods(&state.namespace(), &selector).await {
            Ok(pods) => pods,
            Err(e) => {
                debug!(cluster = %state.key(), error = %e, "Could not list pods");
                return true;
            }
        };
        let Some(host) = pods.iter().filter(|p| p.is_running()).find_map(|p| p.host()) else {
            return false;
        };
        match self.management.has_joining_nodes(&host).await {
            Ok(joining) => joining,
            Err(e) => {
                debug!(host = %host, error = %e, "Could not read joining nodes");
                true
            }
        }
    }
}

impl std::fmt::Debug for ClusterReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterReconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
