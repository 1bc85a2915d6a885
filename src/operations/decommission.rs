//! Decommission Engine
//!
//! Removes the highest-ordinal node of a rack from the ring, one node at a
//! time, before the rack workload is shrunk:
//!
//! ```text
//!   ToDo/Continue ──► Ongoing ──► Finalizing ──► Continue (more to remove)
//!        ▲              │                    └──► Done
//!        └── grace ─────┘
//! ```
//!
//! The remote decommission call is fire-and-forget: membership mode polls are
//! what move the machine forward.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::catalog::{pod_host, pvc_name, wait_pvc_deleted, OperationContext};
use super::labels::{started_labels, PodLabelState};
use super::state::ClusterState;
use crate::crd::{OperationKind, OperationStatus};
use crate::domain::{MembershipMode, PodInfo, PodPhase};
use crate::error::{Error, Result};
use crate::metrics::DECOMMISSION_TRANSITIONS;
use crate::topology::RackRef;

/// Configuration of the decommission engine
#[derive(Debug, Clone)]
pub struct DecommissionConfig {
    /// How long a node may stay Normal after the decommission call before
    /// the call is considered lost
    pub grace_period: Duration,
}

impl Default for DecommissionConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(120),
        }
    }
}

/// Result of one decommission step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecommissionStep {
    /// Skip structural updates of the rack this cycle
    Break,
    /// Structural updates may go on
    Continue,
    /// The node left the ring: the rack workload must be shrunk to this
    /// many replicas so the platform deletes it
    Shrink(i32),
}

impl DecommissionStep {
    pub fn breaks(&self) -> bool {
        !matches!(self, DecommissionStep::Continue)
    }
}

/// Decommission Engine
pub struct DecommissionEngine {
    config: DecommissionConfig,
    context: std::sync::Arc<OperationContext>,
}

impl DecommissionEngine {
    pub fn new(config: DecommissionConfig, context: std::sync::Arc<OperationContext>) -> Self {
        Self { config, context }
    }

    /// Advance the decommission of `rack` by one step
    pub async fn ensure_decommission(
        &self,
        state: &mut ClusterState,
        rack: &RackRef,
    ) -> Result<DecommissionStep> {
        let dc_rack = rack.checked_dc_rack()?;
        let last = state.rack_mut(&dc_rack)?.pod_last_operation.clone();

        if last.name != Some(OperationKind::Decommission) {
            warn!(rack = %dc_rack, operation = ?last.name, "Another operation than decommission is recorded");
            return Ok(DecommissionStep::Continue);
        }

        match last.status {
            Some(OperationStatus::ToDo) | Some(OperationStatus::Continue) => {
                self.start(state, rack, &dc_rack).await
            }
            Some(OperationStatus::Ongoing) => {
                let pod = last.pods.first().filter(|p| !p.is_empty()).ok_or_else(|| {
                    Error::Internal(format!("decommission of {} is Ongoing without a pod", dc_rack))
                })?;
                self.poll(state, &dc_rack, pod).await
            }
            Some(OperationStatus::Finalizing) => {
                let pod = last.pods.first().filter(|p| !p.is_empty()).ok_or_else(|| {
                    Error::Internal(format!("decommission of {} is Finalizing without a pod", dc_rack))
                })?;
                self.finalize(state, rack, &dc_rack, pod).await
            }
            Some(OperationStatus::Done) => {
                if last.pods_ok.first().map_or(true, |p| p.is_empty()) {
                    return Err(Error::Internal(format!(
                        "decommission of {} is Done without a decommissioned pod",
                        dc_rack
                    )));
                }
                state.rack_mut(&dc_rack)?.cassandra_last_action.status =
                    Some(OperationStatus::Continue);
                Ok(DecommissionStep::Break)
            }
            other => {
                error!(rack = %dc_rack, status = ?other, "Unexpected decommission status");
                Ok(DecommissionStep::Continue)
            }
        }
    }

    /// ToDo/Continue: decommission the last pod of the rack
    async fn start(
        &self,
        state: &mut ClusterState,
        rack: &RackRef,
        dc_rack: &str,
    ) -> Result<DecommissionStep> {
        let selector = state.cluster().rack_selector(&rack.dc, &rack.rack);
        let pod = state
            .store()
            .list_pods(&state.namespace(), &selector)
            .await?
            .into_iter()
            .max_by_key(|p| p.ordinal().unwrap_or(-1))
            .ok_or_else(|| Error::ResourceNotReady(format!("no pod in rack {}", dc_rack)))?;

        if state.cluster().is_pod_in_seed_list(&pod.name) {
            warn!(rack = %dc_rack, pod = %pod.name, "Decommissioning a seed node");
        }

        if pod.phase == PodPhase::Pending && pod.unschedulable {
            warn!(rack = %dc_rack, pod = %pod.name, "Scale down on a pending pod, skipping decommission");
            let rack_status = state.rack_mut(dc_rack)?;
            let last = &mut rack_status.pod_last_operation;
            last.status = Some(OperationStatus::Finalizing);
            last.pods = vec![pod.name.clone()];
            last.pods_ok.clear();
            last.pods_ko.clear();
            rack_status.cassandra_last_action.status = Some(OperationStatus::Continue);
            transition(OperationStatus::Finalizing);
            return Ok(DecommissionStep::Shrink(shrunk_replicas(&pod)?));
        }

        if !pod.is_running() {
            return Err(Error::ResourceNotReady(format!("pod {} is not running", pod.name)));
        }

        let host = pod_host(&pod)?;
        let mode = self.context.management.membership_mode(&host).await?;
        if mode.is_leaving_or_gone() {
            info!(rack = %dc_rack, pod = %pod.name, mode = %mode, "Node is leaving or already gone");
            return Ok(DecommissionStep::Break);
        }

        let now = Utc::now();
        if let Err(e) = state
            .store()
            .patch_pod_labels(&pod.namespace, &pod.name, &started_labels(OperationKind::Decommission, now))
            .await
        {
            debug!(pod = %pod.name, error = %e, "Could not label pod");
        }

        let last = &mut state.rack_mut(dc_rack)?.pod_last_operation;
        last.status = Some(OperationStatus::Ongoing);
        last.pods = vec![pod.name.clone()];
        last.pods_ok.clear();
        last.pods_ko.clear();
        transition(OperationStatus::Ongoing);

        info!(rack = %dc_rack, pod = %pod.name, "Scale down detected, decommissioning node");
        let management = self.context.management.clone();
        let new_signature = uses_new_decommission(state.cluster().spec.server_version.as_deref());
        let pod_name = pod.name;
        tokio::spawn(async move {
            if let Err(e) = management.decommission(&host, new_signature).await {
                debug!(pod = %pod_name, error = %e, "Decommission call failed");
            }
        });

        Ok(DecommissionStep::Break)
    }

    /// Ongoing: follow the membership mode of the leaving node
    async fn poll(
        &self,
        state: &mut ClusterState,
        dc_rack: &str,
        pod_name: &str,
    ) -> Result<DecommissionStep> {
        let pod = state
            .store()
            .get_pod(&state.namespace(), pod_name)
            .await?
            .ok_or_else(|| Error::not_found("Pod", pod_name))?;
        let host = pod_host(&pod)?;
        let mode = self.context.management.membership_mode(&host).await?;

        match mode {
            MembershipMode::Normal => {
                let started = PodLabelState::of(&pod).start;
                if within_grace(started, Utc::now(), self.config.grace_period) {
                    info!(rack = %dc_rack, pod = %pod.name, "Decommission requested recently, waiting");
                } else {
                    info!(rack = %dc_rack, pod = %pod.name, "Decommission seems lost, trying again");
                    state.rack_mut(dc_rack)?.pod_last_operation.status = Some(OperationStatus::ToDo);
                    transition(OperationStatus::ToDo);
                }
                Ok(DecommissionStep::Break)
            }
            MembershipMode::Decommissioned | MembershipMode::Unknown => {
                info!(rack = %dc_rack, pod = %pod.name, mode = %mode, "Node left the ring");
                state.rack_mut(dc_rack)?.pod_last_operation.status =
                    Some(OperationStatus::Finalizing);
                transition(OperationStatus::Finalizing);
                state.persist().await?;
                Ok(DecommissionStep::Shrink(shrunk_replicas(&pod)?))
            }
            _ => {
                info!(rack = %dc_rack, pod = %pod.name, mode = %mode, "Node is decommissioning, waiting");
                Ok(DecommissionStep::Break)
            }
        }
    }

    /// Finalizing: once the pod is gone, drop its data claim
    async fn finalize(
        &self,
        state: &mut ClusterState,
        rack: &RackRef,
        dc_rack: &str,
        pod_name: &str,
    ) -> Result<DecommissionStep> {
        let namespace = state.namespace();
        if let Some(pod) = state.store().get_pod(&namespace, pod_name).await? {
            info!(rack = %dc_rack, pod = %pod.name, "Waiting for the workload to scale down");
            return Ok(DecommissionStep::Shrink(shrunk_replicas(&pod)?));
        }

        let claim = pvc_name(pod_name);
        match state.store().delete_pvc(&namespace, &claim).await {
            Ok(()) => match wait_pvc_deleted(&self.context, &namespace, &claim).await {
                Ok(()) => info!(rack = %dc_rack, pvc = %claim, "Volume claim deleted"),
                Err(e) => error!(rack = %dc_rack, pvc = %claim, error = %e, "Volume claim not deleted, manual action needed"),
            },
            Err(e) if e.is_not_found() => debug!(pvc = %claim, "Volume claim already gone"),
            Err(e) => error!(rack = %dc_rack, pvc = %claim, error = %e, "Error deleting volume claim, manual action needed"),
        }

        let remaining = ordinal_of(pod_name)?;
        let desired = state.cluster().spec.nodes_per_rack(&rack.dc);
        let status = if remaining > desired {
            OperationStatus::Continue
        } else {
            OperationStatus::Done
        };

        let last = &mut state.rack_mut(dc_rack)?.pod_last_operation;
        last.status = Some(status);
        last.pods_ok = vec![pod_name.to_string()];
        last.pods.clear();
        last.end_time = Some(Utc::now());
        transition(status);
        info!(rack = %dc_rack, pod = %pod_name, status = %status, "Decommission finalized");
        Ok(DecommissionStep::Break)
    }
}

fn transition(status: OperationStatus) {
    DECOMMISSION_TRANSITIONS
        .with_label_values(&[status.as_str()])
        .inc();
}

fn ordinal_of(pod_name: &str) -> Result<i32> {
    pod_name
        .rsplit_once('-')
        .and_then(|(_, ordinal)| ordinal.parse().ok())
        .ok_or_else(|| Error::Internal(format!("pod {} has no ordinal", pod_name)))
}

/// Replicas left once `pod` is removed from its workload
fn shrunk_replicas(pod: &PodInfo) -> Result<i32> {
    ordinal_of(&pod.name)
}

/// True while a decommission started at `started` is within its grace period.
/// An unknown start is treated as expired.
fn within_grace(started: Option<DateTime<Utc>>, now: DateTime<Utc>, grace: Duration) -> bool {
    let Some(started) = started else {
        return false;
    };
    match chrono::Duration::from_std(grace) {
        Ok(grace) => started + grace > now,
        Err(_) => false,
    }
}

/// Cassandra 4 changed the decommission operation signature
fn uses_new_decommission(server_version: Option<&str>) -> bool {
    server_version
        .and_then(|v| v.split('.').next())
        .and_then(|major| major.trim_start_matches('v').parse::<u32>().ok())
        .map_or(false, |major| major >= 4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::PodLastOperation;
    use crate::domain::fakes::{rack_pod, FakeClusterStore, FakeNodeManagement};
    use crate::operations::labels::{format_label_time, OPERATION_START};
    use crate::operations::state::PersistPolicy;
    use crate::topology::init_rack_statuses;
    use crate::topology::tests::{cluster, dc};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    const LAST: &str = "c-dc1-rack1-2";
    const LAST_HOST: &str = "c-dc1-rack1-2.c";

    struct Harness {
        store: Arc<FakeClusterStore>,
        management: Arc<FakeNodeManagement>,
        engine: DecommissionEngine,
        rack: RackRef,
    }

    /// Rack of three pods scaled down to two
    fn harness() -> Harness {
        let mut c = cluster("c", "ns", 2, vec![dc("dc1", &["rack1"])]);
        let mut status = Default::default();
        init_rack_statuses(&c.spec, &mut status, Utc::now());
        c.status = Some(status);
        c.status
            .as_mut()
            .unwrap()
            .cassandra_rack_status
            .get_mut("dc1-rack1")
            .unwrap()
            .pod_last_operation
            .reset(OperationKind::Decommission, OperationStatus::ToDo, Utc::now());

        let store = Arc::new(FakeClusterStore::with_cluster(c.clone()));
        for ordinal in 0..3 {
            store.put_pod(rack_pod(&c, "dc1", "rack1", ordinal));
        }
        store.pvcs.lock().insert(pvc_name(LAST));
        let management = Arc::new(FakeNodeManagement::default());
        let context = Arc::new(OperationContext {
            management: management.clone(),
            store: store.clone(),
            pvc_deletion_timeout: Duration::from_millis(50),
            pvc_poll_interval: Duration::from_millis(5),
        });
        Harness {
            store,
            management,
            engine: DecommissionEngine::new(DecommissionConfig::default(), context),
            rack: c.spec.topology.racks().remove(0),
        }
    }

    impl Harness {
        fn state(&self) -> ClusterState {
            ClusterState::new(
                self.store.cluster("c"),
                self.store.clone(),
                PersistPolicy::default(),
            )
        }

        fn set_start_label(&self, at: DateTime<Utc>) {
            let mut pod = self.store.pod(LAST).unwrap();
            pod.labels.insert(OPERATION_START.into(), format_label_time(at));
            self.store.put_pod(pod);
        }
    }

    fn last_operation(state: &ClusterState) -> PodLastOperation {
        state.rack("dc1-rack1").unwrap().pod_last_operation.clone()
    }

    #[tokio::test]
    async fn test_decommission_sequence() {
        let h = harness();
        let mut state = h.state();

        // ToDo -> Ongoing on the highest ordinal
        let step = h.engine.ensure_decommission(&mut state, &h.rack).await.unwrap();
        assert_eq!(step, DecommissionStep::Break);
        let last = last_operation(&state);
        assert_eq!(last.status, Some(OperationStatus::Ongoing));
        assert_eq!(last.pods, vec![LAST]);
        let labels = PodLabelState::of(&h.store.pod(LAST).unwrap());
        assert!(labels.is(OperationKind::Decommission, OperationStatus::Ongoing));

        // Normal within the grace period: wait
        let step = h.engine.ensure_decommission(&mut state, &h.rack).await.unwrap();
        assert_eq!(step, DecommissionStep::Break);
        assert_eq!(last_operation(&state).status, Some(OperationStatus::Ongoing));

        // Normal after the grace period: retry
        h.set_start_label(Utc::now() - chrono::Duration::seconds(300));
        h.engine.ensure_decommission(&mut state, &h.rack).await.unwrap();
        assert_eq!(last_operation(&state).status, Some(OperationStatus::ToDo));

        h.engine.ensure_decommission(&mut state, &h.rack).await.unwrap();
        assert_eq!(last_operation(&state).status, Some(OperationStatus::Ongoing));

        // Left the ring -> Finalizing, workload shrinks to 2
        h.management.set_mode(LAST_HOST, MembershipMode::Decommissioned);
        let step = h.engine.ensure_decommission(&mut state, &h.rack).await.unwrap();
        assert_eq!(step, DecommissionStep::Shrink(2));
        assert_eq!(last_operation(&state).status, Some(OperationStatus::Finalizing));
        assert_eq!(
            h.store.cluster("c").status.unwrap().cassandra_rack_status["dc1-rack1"]
                .pod_last_operation
                .status,
            Some(OperationStatus::Finalizing)
        );

        // Pod still there: wait
        let step = h.engine.ensure_decommission(&mut state, &h.rack).await.unwrap();
        assert_eq!(step, DecommissionStep::Shrink(2));

        // Pod gone -> Done
        h.store.remove_pod(LAST);
        let step = h.engine.ensure_decommission(&mut state, &h.rack).await.unwrap();
        assert_eq!(step, DecommissionStep::Break);
        let last = last_operation(&state);
        assert_eq!(last.status, Some(OperationStatus::Done));
        assert_eq!(last.pods_ok, vec![LAST]);
        assert!(last.pods.is_empty());
        assert!(last.end_time.is_some());
        assert!(h.store.pvcs.lock().is_empty());

        // Done hands the rack back
        h.engine.ensure_decommission(&mut state, &h.rack).await.unwrap();
        assert_eq!(
            state.rack("dc1-rack1").unwrap().cassandra_last_action.status,
            Some(OperationStatus::Continue)
        );
    }

    #[tokio::test]
    async fn test_leaving_node_is_not_decommissioned_again() {
        let h = harness();
        h.management.set_mode(LAST_HOST, MembershipMode::Leaving);
        let mut state = h.state();
        let step = h.engine.ensure_decommission(&mut state, &h.rack).await.unwrap();
        assert_eq!(step, DecommissionStep::Break);
        assert_eq!(last_operation(&state).status, Some(OperationStatus::ToDo));
    }

    #[tokio::test]
    async fn test_pending_pod_skips_to_finalizing() {
        let h = harness();
        let mut pod = h.store.pod(LAST).unwrap();
        pod.phase = PodPhase::Pending;
        pod.unschedulable = true;
        h.store.put_pod(pod);

        let mut state = h.state();
        let step = h.engine.ensure_decommission(&mut state, &h.rack).await.unwrap();
        assert_eq!(step, DecommissionStep::Shrink(2));
        assert_eq!(last_operation(&state).status, Some(OperationStatus::Finalizing));
        assert!(h.management.calls().is_empty());
    }

    #[tokio::test]
    async fn test_more_decommissions_continue() {
        let h = harness();
        let mut c = h.store.cluster("c");
        c.spec.nodes_per_racks = 1;
        let last = &mut c
            .status
            .as_mut()
            .unwrap()
            .cassandra_rack_status
            .get_mut("dc1-rack1")
            .unwrap()
            .pod_last_operation;
        last.status = Some(OperationStatus::Finalizing);
        last.pods = vec![LAST.into()];
        h.store.put_cluster(c);
        h.store.remove_pod(LAST);

        let mut state = h.state();
        h.engine.ensure_decommission(&mut state, &h.rack).await.unwrap();
        assert_eq!(last_operation(&state).status, Some(OperationStatus::Continue));
    }

    #[tokio::test]
    async fn test_ongoing_without_pod_is_an_error() {
        let h = harness();
        let mut state = h.state();
        state.rack_mut("dc1-rack1").unwrap().pod_last_operation.status =
            Some(OperationStatus::Ongoing);
        let err = h.engine.ensure_decommission(&mut state, &h.rack).await.unwrap_err();
        assert_matches!(err, Error::Internal(_));
    }

    #[test]
    fn test_grace_and_version() {
        let now = Utc::now();
        let grace = Duration::from_secs(120);
        assert!(within_grace(Some(now - chrono::Duration::seconds(10)), now, grace));
        assert!(!within_grace(Some(now - chrono::Duration::seconds(130)), now, grace));
        assert!(!within_grace(None, now, grace));

        assert!(uses_new_decommission(Some("4.0.1")));
        assert!(!uses_new_decommission(Some("3.11.9")));
        assert!(!uses_new_decommission(None));
    }
}
