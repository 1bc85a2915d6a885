//! Pod Operation Engine
//!
//! Drives cataloged operations over the pods of a rack:
//!
//! ```text
//!   label ToDo ──► ensure_operation ──► label Ongoing, track, persist
//!                                            │
//!                                  spawn action / monitor task
//!                                            │
//!                                   CompletedOperation ──► queue
//!                                                            │
//!   next cycle: finalize_operations ◄────────────────────────┘
//!               label Done/Error, settle, persist (never gives up)
//! ```
//!
//! Tasks never write the cluster status; only the reconcile cycle does.

use backoff::backoff::{Backoff, Constant};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::catalog::{OperationCatalog, OperationContext, PodOperationRef};
use super::completion::{CompletedOperation, CompletionQueue, CompletionQueues};
use super::labels::{converge, finished_labels, started_labels, todo_selector, Convergence};
use super::state::ClusterState;
use crate::crd::{OperationKind, OperationStatus};
use crate::domain::PodInfo;
use crate::error::{Error, Result};
use crate::metrics::POD_OPERATIONS_FINALIZED;
use crate::topology::RackRef;

/// Configuration of the pod operation engine
#[derive(Debug, Clone)]
pub struct PodOperationConfig {
    /// Identity of this operator process, recorded on started operations
    pub operator_name: String,
    /// Poll interval of resumed operations
    pub monitor_interval: Duration,
}

impl Default for PodOperationConfig {
    fn default() -> Self {
        Self {
            operator_name: String::new(),
            monitor_interval: Duration::from_secs(10),
        }
    }
}

/// What `ensure_operation` did for a rack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRound {
    /// Nothing to do
    Idle,
    /// Actions launched on these pods
    Started(Vec<String>),
    /// In-flight pods of a previous operator re-attached in monitor-only mode
    Resumed(Vec<String>),
    /// No pod left: the operation was marked Done
    Completed,
    /// Another operation kind is still in progress on the rack
    Busy(OperationKind),
}

/// Pod Operation Engine
pub struct PodOperationEngine {
    config: PodOperationConfig,
    catalog: OperationCatalog,
    context: Arc<OperationContext>,
    queues: Arc<CompletionQueues>,
}

impl PodOperationEngine {
    pub fn new(
        config: PodOperationConfig,
        catalog: OperationCatalog,
        context: Arc<OperationContext>,
        queues: Arc<CompletionQueues>,
    ) -> Self {
        Self {
            config,
            catalog,
            context,
            queues,
        }
    }

    pub fn catalog(&self) -> &OperationCatalog {
        &self.catalog
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Advance a uniformly picked operation on the rack
    pub async fn ensure_random_operation(
        &self,
        state: &mut ClusterState,
        rack: &RackRef,
    ) -> Result<OperationRound> {
        let kind = {
            let mut rng = rand::thread_rng();
            self.catalog.pick(&mut rng)
        };
        match kind {
            Some(kind) => self.ensure_operation(state, rack, kind).await,
            None => Ok(OperationRound::Idle),
        }
    }

    /// Start `kind` on the pods of the rack waiting for it, or resume the
    /// pods a previous operator left in flight
    pub async fn ensure_operation(
        &self,
        state: &mut ClusterState,
        rack: &RackRef,
        kind: OperationKind,
    ) -> Result<OperationRound> {
        let operation = self.catalog.get(kind).ok_or_else(|| {
            Error::Internal(format!("operation {} is not cataloged", kind))
        })?;
        let dc_rack = rack.checked_dc_rack()?;

        if let Some(pods) = self.resumable_pods(state, rack, &dc_rack, kind).await? {
            if pods.is_empty() {
                return Ok(OperationRound::Completed);
            }
            let names = pods.iter().map(|p| p.name.clone()).collect();
            let queue = self.queues.for_cluster(&state.key());
            for pod in pods {
                info!(pod = %pod.name, operation = %kind, "Monitoring operation started by another operator");
                self.spawn_monitor(operation.clone(), queue.clone(), dc_rack.clone(), pod);
            }
            return Ok(OperationRound::Resumed(names));
        }

        let pods = match self.init_operation(state, rack, &dc_rack, kind).await? {
            InitOutcome::Pods(pods) => pods,
            InitOutcome::Round(round) => return Ok(round),
        };

        let queue = self.queues.for_cluster(&state.key());
        let mut started = Vec::new();
        for pod in pods {
            match self.start_operation(state, &dc_rack, kind, &pod).await {
                Ok(()) => {
                    started.push(pod.name.clone());
                    self.spawn_action(operation.clone(), queue.clone(), dc_rack.clone(), pod);
                }
                Err(e) => {
                    error!(pod = %pod.name, operation = %kind, error = %e, "Could not start operation");
                }
            }
        }
        Ok(OperationRound::Started(started))
    }

    /// Pods to re-attach when the operation was started by another operator
    /// process. `None` when there is nothing to resume.
    async fn resumable_pods(
        &self,
        state: &mut ClusterState,
        rack: &RackRef,
        dc_rack: &str,
        kind: OperationKind,
    ) -> Result<Option<Vec<PodInfo>>> {
        let Some(rack_status) = state.rack(dc_rack) else {
            return Ok(None);
        };
        let last = &rack_status.pod_last_operation;
        let owner = last.operator_name.as_deref().unwrap_or_default();
        if !last.is(kind, OperationStatus::Ongoing)
            || owner.is_empty()
            || owner == self.config.operator_name
        {
            return Ok(None);
        }

        let in_flight = last.pods.clone();
        let previous = owner.to_string();
        let selector = state.cluster().rack_selector(&rack.dc, &rack.rack);
        let rack_pods = state
            .store()
            .list_pods(&state.namespace(), &selector)
            .await?;
        let pods: Vec<PodInfo> = rack_pods
            .into_iter()
            .filter(|p| in_flight.contains(&p.name) && p.is_running())
            .collect();

        if let Some(rack_status) = state.rack(dc_rack) {
            for pod in &pods {
                if let Convergence::Diverged { expected, observed } =
                    converge(pod, &rack_status.pod_last_operation)
                {
                    warn!(pod = %pod.name, ?expected, ?observed, "Pod labels disagree with rack status");
                }
            }
        }

        info!(
            rack = %dc_rack,
            operation = %kind,
            previous_operator = %previous,
            "Taking over operation in monitor-only mode"
        );
        let operator = self.config.operator_name.clone();
        let last = &mut state.rack_mut(dc_rack)?.pod_last_operation;
        last.operator_name = Some(operator);
        if pods.is_empty() {
            last.complete(Utc::now());
        }
        state.persist().await?;
        Ok(Some(pods))
    }

    async fn init_operation(
        &self,
        state: &mut ClusterState,
        rack: &RackRef,
        dc_rack: &str,
        kind: OperationKind,
    ) -> Result<InitOutcome> {
        let selector = todo_selector(state.cluster().rack_selector(&rack.dc, &rack.rack), kind);
        let todo = state
            .store()
            .list_pods(&state.namespace(), &selector)
            .await?;

        let last = state.rack_mut(dc_rack)?.pod_last_operation.clone();

        if todo.is_empty() {
            if last.is(kind, OperationStatus::Ongoing) && last.pods.is_empty() {
                info!(rack = %dc_rack, operation = %kind, "Operation done on every pod");
                state
                    .rack_mut(dc_rack)?
                    .pod_last_operation
                    .complete(Utc::now());
                state.persist().await?;
                return Ok(InitOutcome::Round(OperationRound::Completed));
            }
            return Ok(InitOutcome::Round(OperationRound::Idle));
        }

        if let Some(other) = last.name.filter(|n| *n != kind) {
            if last.status == Some(OperationStatus::Ongoing) && !last.pods.is_empty() {
                debug!(rack = %dc_rack, operation = %kind, busy_with = %other, "Rack busy");
                return Ok(InitOutcome::Round(OperationRound::Busy(other)));
            }
        }

        if !last.is(kind, OperationStatus::Ongoing) {
            info!(rack = %dc_rack, operation = %kind, pods = todo.len(), "Starting operation round");
            state.rack_mut(dc_rack)?.pod_last_operation.reset(
                kind,
                OperationStatus::Ongoing,
                Utc::now(),
            );
            state.persist().await?;
        }

        Ok(InitOutcome::Pods(
            todo.into_iter().filter(PodInfo::is_running).collect(),
        ))
    }

    /// Label the pod Ongoing and record it as in progress
    async fn start_operation(
        &self,
        state: &mut ClusterState,
        dc_rack: &str,
        kind: OperationKind,
        pod: &PodInfo,
    ) -> Result<()> {
        let now = Utc::now();
        state
            .store()
            .patch_pod_labels(&pod.namespace, &pod.name, &started_labels(kind, now))
            .await?;

        let operator = self.config.operator_name.clone();
        let last = &mut state.rack_mut(dc_rack)?.pod_last_operation;
        last.operator_name = Some(operator);
        last.track(&pod.name);
        state.persist().await
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    fn spawn_action(
        &self,
        operation: PodOperationRef,
        queue: Arc<CompletionQueue>,
        dc_rack: String,
        pod: PodInfo,
    ) {
        let ctx = self.context.clone();
        tokio::spawn(async move {
            let kind = operation.kind();
            let mut result = operation.action(&ctx, &pod).await;
            if let Err(e) = &result {
                warn!(pod = %pod.name, operation = %kind, error = %e, "Operation failed");
            } else {
                result = operation.post_action(&ctx, &pod).await;
                if let Err(e) = &result {
                    warn!(pod = %pod.name, operation = %kind, error = %e, "Post-operation step failed");
                }
            }
            queue
                .report(CompletedOperation {
                    dc_rack,
                    pod: pod.name,
                    operation: kind,
                    error: result.err().map(|e| e.to_string()),
                })
                .await;
        });
    }

    fn spawn_monitor(
        &self,
        operation: PodOperationRef,
        queue: Arc<CompletionQueue>,
        dc_rack: String,
        pod: PodInfo,
    ) {
        let ctx = self.context.clone();
        let interval = self.config.monitor_interval;
        tokio::spawn(async move {
            let kind = operation.kind();
            loop {
                match operation.monitor(&ctx, &pod).await {
                    Ok(false) => break,
                    Ok(true) => debug!(pod = %pod.name, operation = %kind, "Operation still running"),
                    Err(e) => {
                        debug!(pod = %pod.name, operation = %kind, error = %e, "Monitor failed, assuming still running")
                    }
                }
                tokio::time::sleep(interval).await;
            }
            let result = operation.post_action(&ctx, &pod).await;
            if let Err(e) = &result {
                warn!(pod = %pod.name, operation = %kind, error = %e, "Post-operation step failed");
            }
            queue
                .report(CompletedOperation {
                    dc_rack,
                    pod: pod.name,
                    operation: kind,
                    error: result.err().map(|e| e.to_string()),
                })
                .await;
        });
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Drain the completion queue of the cluster and record every outcome.
    ///
    /// Returns the number of completions finalized.
    pub async fn finalize_operations(&self, state: &mut ClusterState) -> Result<usize> {
        let completions = self.queues.for_cluster(&state.key()).drain();
        let count = completions.len();
        for completion in completions {
            self.finalize_operation(state, completion).await;
        }
        Ok(count)
    }

    /// Relabel the pod and move it to the succeeded or failed list. Label and
    /// status writes are retried at a fixed interval until both went through.
    async fn finalize_operation(&self, state: &mut ClusterState, completion: CompletedOperation) {
        let succeeded = completion.succeeded();
        let labels = finished_labels(succeeded, Utc::now());
        let namespace = state.namespace();
        let policy = state.policy().clone();
        let mut delay = Constant::new(policy.retry_interval);
        let mut attempt: u32 = 0;
        let mut labelled = false;

        info!(
            pod = %completion.pod,
            operation = %completion.operation,
            error = completion.error.as_deref().unwrap_or(""),
            "Finalizing operation"
        );

        loop {
            attempt += 1;

            if !labelled {
                match state
                    .store()
                    .patch_pod_labels(&namespace, &completion.pod, &labels)
                    .await
                {
                    Ok(()) => labelled = true,
                    Err(e) if e.is_not_found() => {
                        debug!(pod = %completion.pod, "Pod gone, skipping labels");
                        labelled = true;
                    }
                    Err(e) => {
                        log_retry(attempt, policy.warn_after, &completion, &e);
                        wait(&mut delay).await;
                        continue;
                    }
                }
            }

            match state.rack_mut(&completion.dc_rack) {
                Ok(rack) => rack.pod_last_operation.settle(&completion.pod, succeeded),
                Err(_) => {
                    warn!(rack = %completion.dc_rack, pod = %completion.pod, "Rack no longer exists, dropping completion");
                    return;
                }
            }

            match state.persist().await {
                Ok(()) => break,
                Err(e) => {
                    log_retry(attempt, policy.warn_after, &completion, &e);
                    wait(&mut delay).await;
                }
            }
        }

        POD_OPERATIONS_FINALIZED
            .with_label_values(&[
                completion.operation.as_str(),
                if succeeded { "success" } else { "failure" },
            ])
            .inc();
    }
}

enum InitOutcome {
    Pods(Vec<PodInfo>),
    Round(OperationRound),
}

fn log_retry(attempt: u32, warn_after: u32, completion: &CompletedOperation, e: &Error) {
    if attempt >= warn_after {
        warn!(pod = %completion.pod, attempt, error = %e, "Finalization still failing, retrying");
    } else {
        debug!(pod = %completion.pod, attempt, error = %e, "Finalization failed, retrying");
    }
}

async fn wait(delay: &mut Constant) {
    if let Some(d) = delay.next_backoff() {
        tokio::time::sleep(d).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CassandraCluster, CassandraRackStatus, PodLastOperation};
    use crate::domain::fakes::{rack_pod, FakeClusterStore, FakeNodeManagement};
    use crate::operations::labels::{queued_labels, PodLabelState};
    use crate::operations::state::PersistPolicy;
    use crate::topology::tests::{cluster, dc};
    use crate::topology::{init_rack_statuses, RackRef};
    use std::sync::atomic::Ordering;

    struct Harness {
        store: Arc<FakeClusterStore>,
        management: Arc<FakeNodeManagement>,
        queues: Arc<CompletionQueues>,
        rack: RackRef,
    }

    impl Harness {
        fn new(pods: i32) -> Self {
            let mut c = cluster("c", "ns", pods, vec![dc("dc1", &["rack1"])]);
            let mut status = Default::default();
            init_rack_statuses(&c.spec, &mut status, Utc::now());
            c.status = Some(status);

            let store = Arc::new(FakeClusterStore::with_cluster(c.clone()));
            for ordinal in 0..pods {
                store.put_pod(rack_pod(&c, "dc1", "rack1", ordinal));
            }
            Self {
                store,
                management: Arc::new(FakeNodeManagement::default()),
                queues: Arc::new(CompletionQueues::default()),
                rack: c.spec.topology.racks().remove(0),
            }
        }

        fn engine(&self, operator: &str) -> PodOperationEngine {
            let context = Arc::new(OperationContext {
                management: self.management.clone(),
                store: self.store.clone(),
                pvc_deletion_timeout: Duration::from_millis(50),
                pvc_poll_interval: Duration::from_millis(5),
            });
            PodOperationEngine::new(
                PodOperationConfig {
                    operator_name: operator.into(),
                    monitor_interval: Duration::from_millis(5),
                },
                OperationCatalog::new(),
                context,
                self.queues.clone(),
            )
        }

        fn state(&self) -> ClusterState {
            ClusterState::new(
                self.store.cluster("c"),
                self.store.clone(),
                PersistPolicy {
                    retry_interval: Duration::from_millis(1),
                    warn_after: 3,
                },
            )
        }

        fn queue_on(&self, pod: &str, kind: OperationKind) {
            let mut p = self.store.pod(pod).unwrap();
            p.labels.extend(queued_labels(kind, OperationStatus::ToDo));
            self.store.put_pod(p);
        }

        fn cluster(&self) -> CassandraCluster {
            self.store.cluster("c")
        }

        fn last_operation(&self) -> PodLastOperation {
            self.cluster().status.unwrap().cassandra_rack_status["dc1-rack1"]
                .pod_last_operation
                .clone()
        }

        async fn wait_completions(&self, n: usize) -> Vec<CompletedOperation> {
            let queue = self.queues.for_cluster("ns/c");
            let mut drained = Vec::new();
            for _ in 0..200 {
                drained.extend(queue.drain());
                if drained.len() >= n {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            // Put them back for finalize_operations
            for c in drained.iter().cloned() {
                queue.report(c).await;
            }
            drained
        }
    }

    #[tokio::test]
    async fn test_no_todo_pods_is_idle() {
        let h = Harness::new(2);
        let engine = h.engine("op-a");
        let mut state = h.state();
        let round = engine
            .ensure_operation(&mut state, &h.rack, OperationKind::Cleanup)
            .await
            .unwrap();
        assert_eq!(round, OperationRound::Idle);
        assert!(h.management.calls().is_empty());
    }

    #[tokio::test]
    async fn test_operation_lifecycle_success_and_failure() {
        let h = Harness::new(3);
        h.queue_on("c-dc1-rack1-0", OperationKind::Cleanup);
        h.queue_on("c-dc1-rack1-1", OperationKind::Cleanup);
        h.management
            .failing
            .lock()
            .insert("c-dc1-rack1-1.c".into());

        let engine = h.engine("op-a");
        let mut state = h.state();
        let round = engine
            .ensure_operation(&mut state, &h.rack, OperationKind::Cleanup)
            .await
            .unwrap();
        assert_eq!(
            round,
            OperationRound::Started(vec!["c-dc1-rack1-0".into(), "c-dc1-rack1-1".into()])
        );

        let last = h.last_operation();
        assert!(last.is(OperationKind::Cleanup, OperationStatus::Ongoing));
        assert_eq!(last.pods.len(), 2);
        assert_eq!(last.operator_name.as_deref(), Some("op-a"));
        let labels = PodLabelState::of(&h.store.pod("c-dc1-rack1-0").unwrap());
        assert!(labels.is(OperationKind::Cleanup, OperationStatus::Ongoing));

        h.wait_completions(2).await;
        let mut state = h.state();
        assert_eq!(engine.finalize_operations(&mut state).await.unwrap(), 2);

        let last = h.last_operation();
        assert!(last.pods.is_empty());
        assert_eq!(last.pods_ok, vec!["c-dc1-rack1-0"]);
        assert_eq!(last.pods_ko, vec!["c-dc1-rack1-1"]);
        let failed = PodLabelState::of(&h.store.pod("c-dc1-rack1-1").unwrap());
        assert_eq!(failed.status, Some(OperationStatus::Error));
        assert!(failed.end.is_some());

        // Nothing left: the round completes regardless of the failure
        let mut state = h.state();
        let round = engine
            .ensure_operation(&mut state, &h.rack, OperationKind::Cleanup)
            .await
            .unwrap();
        assert_eq!(round, OperationRound::Completed);
        let last = h.last_operation();
        assert_eq!(last.status, Some(OperationStatus::Done));
        assert!(last.end_time.is_some());
    }

    #[tokio::test]
    async fn test_finalize_retries_until_persisted() {
        let h = Harness::new(1);
        h.queue_on("c-dc1-rack1-0", OperationKind::UpgradeSSTables);
        let engine = h.engine("op-a");
        let mut state = h.state();
        engine
            .ensure_operation(&mut state, &h.rack, OperationKind::UpgradeSSTables)
            .await
            .unwrap();
        h.wait_completions(1).await;

        h.store.label_failures.store(2, Ordering::SeqCst);
        h.store.conflicts.store(4, Ordering::SeqCst);
        let mut state = h.state();
        engine.finalize_operations(&mut state).await.unwrap();

        let last = h.last_operation();
        assert_eq!(last.pods_ok, vec!["c-dc1-rack1-0"]);
        assert!(last.pods.is_empty());
    }

    #[tokio::test]
    async fn test_resume_after_operator_change() {
        let h = Harness::new(2);
        let mut c = h.cluster();
        let status = c.status.as_mut().unwrap();
        let rack: &mut CassandraRackStatus = status.cassandra_rack_status.get_mut("dc1-rack1").unwrap();
        rack.pod_last_operation.reset(OperationKind::Cleanup, OperationStatus::Ongoing, Utc::now());
        rack.pod_last_operation.track("c-dc1-rack1-0");
        rack.pod_last_operation.operator_name = Some("op-old".into());
        h.store.put_cluster(c);
        let mut pod = h.store.pod("c-dc1-rack1-0").unwrap();
        pod.labels.extend(started_labels(OperationKind::Cleanup, Utc::now()));
        h.store.put_pod(pod);
        h.management.busy.lock().insert("c-dc1-rack1-0.c".into());

        let engine = h.engine("op-new");
        let mut state = h.state();
        let round = engine
            .ensure_operation(&mut state, &h.rack, OperationKind::Cleanup)
            .await
            .unwrap();
        assert_eq!(round, OperationRound::Resumed(vec!["c-dc1-rack1-0".into()]));
        assert_eq!(h.last_operation().operator_name.as_deref(), Some("op-new"));
        // Monitor-only: no new action issued
        assert!(h.management.calls().is_empty());

        h.management.busy.lock().clear();
        h.wait_completions(1).await;
        let mut state = h.state();
        engine.finalize_operations(&mut state).await.unwrap();
        assert_eq!(h.last_operation().pods_ok, vec!["c-dc1-rack1-0"]);
    }

    #[tokio::test]
    async fn test_resume_without_running_pods_completes() {
        let h = Harness::new(1);
        let mut c = h.cluster();
        let rack = c
            .status
            .as_mut()
            .unwrap()
            .cassandra_rack_status
            .get_mut("dc1-rack1")
            .unwrap();
        rack.pod_last_operation.reset(OperationKind::Rebuild, OperationStatus::Ongoing, Utc::now());
        rack.pod_last_operation.track("c-dc1-rack1-9");
        rack.pod_last_operation.operator_name = Some("op-old".into());
        h.store.put_cluster(c);

        let engine = h.engine("op-new");
        let mut state = h.state();
        let round = engine
            .ensure_operation(&mut state, &h.rack, OperationKind::Rebuild)
            .await
            .unwrap();
        assert_eq!(round, OperationRound::Completed);
        assert_eq!(h.last_operation().status, Some(OperationStatus::Done));
    }

    #[tokio::test]
    async fn test_rack_busy_with_other_operation() {
        let h = Harness::new(2);
        h.queue_on("c-dc1-rack1-0", OperationKind::Cleanup);
        let mut c = h.cluster();
        let rack = c
            .status
            .as_mut()
            .unwrap()
            .cassandra_rack_status
            .get_mut("dc1-rack1")
            .unwrap();
        rack.pod_last_operation.reset(OperationKind::Rebuild, OperationStatus::Ongoing, Utc::now());
        rack.pod_last_operation.track("c-dc1-rack1-1");
        rack.pod_last_operation.operator_name = Some("op-a".into());
        h.store.put_cluster(c);

        let engine = h.engine("op-a");
        let mut state = h.state();
        let round = engine
            .ensure_operation(&mut state, &h.rack, OperationKind::Cleanup)
            .await
            .unwrap();
        assert_eq!(round, OperationRound::Busy(OperationKind::Rebuild));
    }
}
