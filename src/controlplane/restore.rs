//! Restore reconciler
//!
//! One state machine per CassandraRestore:
//!
//! ```text
//!   (no coordinator) ──► REQUIRED ──► PENDING/RUNNING ──► COMPLETED
//!                                            └──────────► FAILED/CANCELED
//! ```
//!
//! The coordinator is a random running pod of the backed-up datacenter; its
//! sidecar drives the restore on every node.

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use rand::seq::IteratorRandom;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::crd::{
    BackRestCondition, BackRestStatus, CassandraBackup, CassandraCluster, CassandraRestore,
    ConditionType,
};
use crate::domain::{BackupStoreRef, ClusterStoreRef, EventRecorderRef, PodInfo, SidecarClientRef};
use crate::error::{Error, Result, NOT_READY_REQUEUE, RUNNING_REQUEUE};

const ACTION: &str = "Restore";

/// Restore reconciler
pub struct RestoreReconciler {
    clusters: ClusterStoreRef,
    backups: BackupStoreRef,
    sidecar: SidecarClientRef,
    events: EventRecorderRef,
}

impl RestoreReconciler {
    pub fn new(
        clusters: ClusterStoreRef,
        backups: BackupStoreRef,
        sidecar: SidecarClientRef,
        events: EventRecorderRef,
    ) -> Self {
        Self {
            clusters,
            backups,
            sidecar,
            events,
        }
    }

    async fn event(&self, restore: &CassandraRestore, type_: EventType, reason: &str, note: String) {
        self.events
            .publish(&restore.object_ref(&()), type_, reason, ACTION, Some(note))
            .await;
    }

    pub async fn reconcile(&self, restore: Arc<CassandraRestore>) -> Result<Action> {
        let name = restore.name_any();
        let namespace = restore.namespace().unwrap_or_default();
        info!(restore = %name, namespace = %namespace, "Reconciling CassandraRestore");

        let Some(cluster) = self
            .clusters
            .get_cluster(&namespace, &restore.spec.cassandra_cluster)
            .await?
        else {
            if restore.meta().deletion_timestamp.is_some() {
                info!(restore = %name, "Cluster is already gone");
                return Ok(Action::await_change());
            }
            self.event(
                &restore,
                EventType::Warning,
                "CassandraClusterNotFound",
                format!("Cassandra Cluster {} to restore not found", restore.spec.cassandra_cluster),
            )
            .await;
            return Err(Error::not_found("CassandraCluster", &restore.spec.cassandra_cluster));
        };

        let Some(backup) = self
            .backups
            .get_backup(&namespace, &restore.spec.cassandra_backup)
            .await?
        else {
            self.event(
                &restore,
                EventType::Warning,
                "BackupNotFound",
                format!("Backup {} to restore not found", restore.spec.cassandra_backup),
            )
            .await;
            return Err(Error::not_found("CassandraBackup", &restore.spec.cassandra_backup));
        };

        let Some(coordinator) = restore.coordinator().map(String::from) else {
            return match self.assign_coordinator(&restore, &cluster, &backup).await {
                Ok(()) => {
                    self.event(
                        &restore,
                        EventType::Normal,
                        "RestoreRequired",
                        event_message(&restore, &backup, ""),
                    )
                    .await;
                    Ok(Action::await_change())
                }
                Err(Error::ResourceNotReady(reason)) => {
                    debug!(restore = %name, reason = %reason, "No coordinator available yet");
                    Ok(Action::requeue(NOT_READY_REQUEUE))
                }
                Err(e) => Err(e),
            };
        };

        if restore.is_required() {
            return match self.start(&restore, &cluster, &backup, &coordinator).await {
                Ok(()) => {
                    self.event(
                        &restore,
                        EventType::Normal,
                        "RestoreInitiated",
                        event_message(&restore, &backup, ""),
                    )
                    .await;
                    Ok(Action::await_change())
                }
                Err(e @ (Error::SidecarUnreachable { .. } | Error::ResourceNotReady(_))) => {
                    warn!(restore = %name, error = %e, "Restore could not be started");
                    self.event(
                        &restore,
                        EventType::Warning,
                        "PerformRestoreOperationFailed",
                        event_message(&restore, &backup, " failed to run, will retry"),
                    )
                    .await;
                    Ok(Action::requeue(NOT_READY_REQUEUE))
                }
                Err(e) => Err(e),
            };
        }

        if restore.is_in_progress() {
            return match self.check(&restore, &cluster, &coordinator).await {
                Ok(()) => {
                    self.event(
                        &restore,
                        EventType::Normal,
                        "RestoreCompleted",
                        event_message(&restore, &backup, ""),
                    )
                    .await;
                    Ok(Action::await_change())
                }
                Err(Error::SidecarUnreachable { .. } | Error::ResourceNotReady(_)) => {
                    Ok(Action::requeue(NOT_READY_REQUEUE))
                }
                Err(Error::OperationRunning(_)) => Ok(Action::requeue(RUNNING_REQUEUE)),
                Err(Error::OperationFailed { reason, .. }) => {
                    self.event(
                        &restore,
                        EventType::Normal,
                        "RestoreFailed",
                        event_message(&restore, &backup, &reason),
                    )
                    .await;
                    Ok(Action::await_change())
                }
                Err(e) => Err(e),
            };
        }

        debug!(restore = %name, condition = ?restore.condition_type(), "Nothing to do");
        Ok(Action::await_change())
    }

    /// Pick a random running pod of the backed-up datacenter and mark the
    /// restore Required
    async fn assign_coordinator(
        &self,
        restore: &CassandraRestore,
        cluster: &CassandraCluster,
        backup: &CassandraBackup,
    ) -> Result<()> {
        let namespace = restore.namespace().unwrap_or_default();
        let pods = self
            .clusters
            .list_pods(&namespace, &cluster.dc_selector(&backup.spec.datacenter))
            .await
            .map_err(|e| Error::ResourceNotReady(format!("no pods found for this dc: {}", e)))?;

        let coordinator = {
            let mut rng = rand::thread_rng();
            pods.into_iter().filter(PodInfo::is_running).choose(&mut rng)
        }
        .ok_or_else(|| {
            Error::ResourceNotReady(format!(
                "no running pod in datacenter {}",
                backup.spec.datacenter
            ))
        })?;

        info!(restore = %restore.name_any(), coordinator = %coordinator.name, "Restore coordinator assigned");
        let status = BackRestStatus {
            coordinator_member: Some(coordinator.name),
            condition: Some(BackRestCondition::new(ConditionType::Required, Utc::now())),
            ..Default::default()
        };
        self.backups
            .patch_restore_status(&namespace, &restore.name_any(), &status)
            .await
    }

    async fn coordinator_host(&self, namespace: &str, coordinator: &str) -> Result<String> {
        let pod = self
            .clusters
            .get_pod(namespace, coordinator)
            .await?
            .ok_or_else(|| Error::ResourceNotReady(format!("coordinator {} not found", coordinator)))?;
        pod.host()
            .ok_or_else(|| Error::ResourceNotReady(format!("coordinator {} has no address", coordinator)))
    }

    /// Ask the coordinator's sidecar to start the restore
    async fn start(
        &self,
        restore: &CassandraRestore,
        cluster: &CassandraCluster,
        backup: &CassandraBackup,
        coordinator: &str,
    ) -> Result<()> {
        let namespace = cluster.cluster_namespace();
        let host = self.coordinator_host(&namespace, coordinator).await?;
        let mut status = self.sidecar.start_restore(&host, restore, backup).await?;
        status.coordinator_member = Some(coordinator.to_string());
        self.backups
            .patch_restore_status(&namespace, &restore.name_any(), &status)
            .await
    }

    /// Poll the restore and record its status.
    ///
    /// `Ok` once completed; `OperationRunning` or `OperationFailed` otherwise.
    async fn check(
        &self,
        restore: &CassandraRestore,
        cluster: &CassandraCluster,
        coordinator: &str,
    ) -> Result<()> {
        let id = restore
            .status
            .as_ref()
            .and_then(|s| s.id.as_deref())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::InvalidBackup("no restore operation id to check".into()))?;

        let namespace = cluster.cluster_namespace();
        let host = self.coordinator_host(&namespace, coordinator).await?;
        let mut status = self.sidecar.restore_status(&host, id).await?;
        status.coordinator_member = Some(coordinator.to_string());
        self.backups
            .patch_restore_status(&namespace, &restore.name_any(), &status)
            .await?;

        match status.condition_type() {
            Some(c) if c.is_in_error() => Err(Error::OperationFailed {
                operation: format!("restore {}", id),
                reason: status.failure_message().unwrap_or_default().to_string(),
            }),
            Some(ConditionType::Completed) => Ok(()),
            _ => {
                info!(restore = %restore.name_any(), operation_id = %id, "Restore still running");
                Err(Error::OperationRunning(format!("restore {}", id)))
            }
        }
    }
}

fn event_message(restore: &CassandraRestore, backup: &CassandraBackup, detail: &str) -> String {
    format!(
        "Restore of backup {} of datacenter {} of cluster {} to {} under snapshot {}. {}",
        backup.name_any(),
        restore.spec.datacenter.as_deref().unwrap_or_default(),
        backup.spec.cassandra_cluster,
        backup.spec.storage_location,
        backup.spec.snapshot_tag,
        detail
    )
}
