//! Backup reconciler
//!
//! Validates a CassandraBackup, then either registers it with the
//! [`BackupScheduler`] or triggers it at once. A triggered backup is started
//! on the sidecar of a random pod of the datacenter and polled until the
//! sidecar reports a terminal condition.

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use chrono::Utc;
use kube::{Resource, ResourceExt};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::scheduler::{BackupScheduler, BackupTask};
use crate::crd::{
    BackRestCondition, BackRestStatus, CassandraBackup, CassandraCluster, ConditionType,
    FailureCause, StorageProvider, UNSCHEDULE_FINALIZER,
};
use crate::domain::{BackupStoreRef, ClusterStoreRef, EventRecorderRef, SidecarClientRef};
use crate::error::{Error, Result};
use crate::metrics::BACKUPS_TRIGGERED;

const ACTION: &str = "Backup";

/// Durations such as `90s`, `1h30m` or `500ms`
static DURATION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+(\.[0-9]+)?(ns|us|µs|ms|s|m|h))+$").unwrap());

/// Configuration of the backup reconciler
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Interval between two sidecar status polls
    pub poll_interval: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Check that `keys` hold the credentials needed by `provider`
pub fn validate_backup_secret(
    secret: &str,
    keys: &[String],
    provider: Option<StorageProvider>,
) -> Result<()> {
    let has = |key: &str| keys.iter().any(|k| k == key);
    let invalid = |reason: &str| Error::InvalidBackupSecret {
        secret: secret.to_string(),
        reason: reason.to_string(),
    };

    match provider {
        Some(StorageProvider::Gcp) if !has("gcp") => Err(invalid("gcp key is not set")),
        Some(StorageProvider::Azure) if !has("azurestorageaccount") => {
            Err(invalid("azurestorageaccount key is not set"))
        }
        Some(StorageProvider::Azure) if !has("azurestoragekey") => {
            Err(invalid("azurestoragekey key is not set"))
        }
        Some(StorageProvider::S3) => {
            if !has("awssecretaccesskey") || !has("awsaccesskeyid") {
                info!(secret = %secret, "AWS keys not set, nodes will use their own credentials");
            }
            if has("awssecretaccesskey") && has("awsaccesskeyid") && !has("awsregion") {
                return Err(invalid(
                    "awsregion is required when awssecretaccesskey and awsaccesskeyid are set",
                ));
            }
            if has("awsendpoint") && !has("awsregion") {
                return Err(invalid("awsendpoint is set without awsregion"));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Backup reconciler
pub struct BackupReconciler {
    config: BackupConfig,
    clusters: ClusterStoreRef,
    backups: BackupStoreRef,
    sidecar: SidecarClientRef,
    events: EventRecorderRef,
    scheduler: Arc<BackupScheduler>,
    /// `<namespace>/<name>` of backups started and still followed
    in_flight: Mutex<HashSet<String>>,
    this: Weak<BackupReconciler>,
}

impl BackupReconciler {
    pub fn new(
        config: BackupConfig,
        clusters: ClusterStoreRef,
        backups: BackupStoreRef,
        sidecar: SidecarClientRef,
        events: EventRecorderRef,
        scheduler: Arc<BackupScheduler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            clusters,
            backups,
            sidecar,
            events,
            scheduler,
            in_flight: Mutex::new(HashSet::new()),
            this: this.clone(),
        })
    }

    pub fn scheduler(&self) -> &Arc<BackupScheduler> {
        &self.scheduler
    }

    pub fn is_in_flight(&self, namespace: &str, name: &str) -> bool {
        self.in_flight.lock().contains(&backup_key(namespace, name))
    }

    async fn event(&self, backup: &CassandraBackup, type_: EventType, reason: &str, note: String) {
        self.events
            .publish(&backup.object_ref(&()), type_, reason, ACTION, Some(note))
            .await;
    }

    async fn warn(&self, backup: &CassandraBackup, reason: &str, note: String) {
        self.event(backup, EventType::Warning, reason, note).await;
    }

    pub async fn reconcile(&self, backup: Arc<CassandraBackup>) -> Result<Action> {
        let name = backup.name_any();
        let namespace = backup.namespace().unwrap_or_default();
        info!(backup = %name, namespace = %namespace, "Reconciling CassandraBackup");

        if backup.meta().deletion_timestamp.is_some() {
            self.unschedule(&backup).await?;
            return Ok(Action::await_change());
        }

        if !backup.is_scheduled() {
            if has_finalizer(&backup) {
                self.unschedule(&backup).await?;
            }
            if backup.ran() || self.is_in_flight(&namespace, &name) {
                debug!(backup = %name, "Backup already ran");
                return Ok(Action::await_change());
            }
        } else if self
            .scheduler
            .entry(&name)
            .is_some_and(|(_, schedule)| Some(schedule.as_str()) == backup.spec.schedule.as_deref())
        {
            debug!(backup = %name, "Backup already scheduled");
            return Ok(Action::await_change());
        }

        let existing = self.backups.list_backups(&namespace).await?;
        if existing
            .iter()
            .any(|other| other.name_any() != name && backup.duplicates(other))
        {
            self.warn(
                &backup,
                "BackupSkipped",
                format!(
                    "Datacenter {} in cluster {} was not backed up to {} under snapshot {} because such backup already exists",
                    backup.spec.datacenter, backup.spec.cassandra_cluster,
                    backup.spec.storage_location, backup.spec.snapshot_tag
                ),
            )
            .await;
            return Ok(Action::await_change());
        }

        if let Some(secret) = backup.spec.secret.as_deref().filter(|s| !s.is_empty()) {
            let Some(keys) = self.backups.secret_keys(&namespace, secret).await? else {
                self.warn(
                    &backup,
                    "BackupFailedSecretNotFound",
                    format!("Secret {} used for backups was not found", secret),
                )
                .await;
                return Ok(Action::await_change());
            };
            if let Err(e) = validate_backup_secret(secret, &keys, backup.storage_provider()) {
                error!(backup = %name, error = %e, "Backup secret is not valid");
                self.warn(&backup, "BackupNotInitiated", e.to_string()).await;
                return Err(e);
            }
        }

        if let Some(duration) = backup.spec.duration.as_deref().filter(|d| !d.is_empty()) {
            if !DURATION_REGEX.is_match(duration) {
                self.warn(
                    &backup,
                    "BackupFailedDurationParseError",
                    format!("Duration {} can't be parsed", duration),
                )
                .await;
                return Ok(Action::await_change());
            }
        }

        let Some(cluster) = self
            .clusters
            .get_cluster(&namespace, &backup.spec.cassandra_cluster)
            .await?
        else {
            self.warn(
                &backup,
                "CassandraClusterNotFound",
                format!(
                    "Datacenter {} of cluster {} to backup not found",
                    backup.spec.datacenter, backup.spec.cassandra_cluster
                ),
            )
            .await;
            return Ok(Action::await_change());
        };

        if let Some(schedule) = backup.spec.schedule.as_deref().filter(|_| backup.is_scheduled()) {
            return self.schedule(&backup, schedule).await;
        }

        self.trigger(&backup, &cluster).await?;
        Ok(Action::await_change())
    }

    /// Register the backup with the scheduler and guard it with the finalizer
    async fn schedule(&self, backup: &CassandraBackup, schedule: &str) -> Result<Action> {
        let name = backup.name_any();
        let namespace = backup.namespace().unwrap_or_default();
        let task = self.scheduled_task(namespace.clone(), name.clone());

        match self.scheduler.add_or_update(&name, schedule, task) {
            Ok(true) => return Ok(Action::await_change()),
            Ok(false) => {}
            Err(e) => {
                self.warn(
                    backup,
                    "BackupScheduleError",
                    format!("Wasn't able to schedule job {}: {}", name, e),
                )
                .await;
                return Err(e);
            }
        }

        self.event(
            backup,
            EventType::Normal,
            "BackupTaskScheduled",
            format!(
                "Controller scheduled task {} to back up cluster {} under snapshot {} with schedule {}",
                name, backup.spec.cassandra_cluster, backup.spec.snapshot_tag, schedule
            ),
        )
        .await;

        if !has_finalizer(backup) {
            let mut finalizers = backup.finalizers().to_vec();
            finalizers.push(UNSCHEDULE_FINALIZER.to_string());
            self.backups
                .set_backup_finalizers(&namespace, &name, finalizers)
                .await?;
        }
        Ok(Action::await_change())
    }

    /// Drop the scheduler entry and the finalizer
    async fn unschedule(&self, backup: &CassandraBackup) -> Result<()> {
        let name = backup.name_any();
        if self.scheduler.remove(&name) {
            self.event(
                backup,
                EventType::Normal,
                "BackupTaskUnscheduled",
                format!(
                    "Controller unscheduled cron task {} to back up cluster {} under snapshot {}",
                    name, backup.spec.cassandra_cluster, backup.spec.snapshot_tag
                ),
            )
            .await;
        }
        if has_finalizer(backup) {
            let finalizers = backup
                .finalizers()
                .iter()
                .filter(|f| *f != UNSCHEDULE_FINALIZER)
                .cloned()
                .collect();
            self.backups
                .set_backup_finalizers(&backup.namespace().unwrap_or_default(), &name, finalizers)
                .await?;
        }
        Ok(())
    }

    /// Task re-reading the backup and its cluster before triggering it
    fn scheduled_task(&self, namespace: String, name: String) -> BackupTask {
        let this = self.this.clone();
        Arc::new(move || {
            let this = this.clone();
            let namespace = namespace.clone();
            let name = name.clone();
            Box::pin(async move {
                let Some(reconciler) = this.upgrade() else {
                    return;
                };
                if let Err(e) = reconciler.trigger_stored(&namespace, &name).await {
                    error!(backup = %name, error = %e, "Scheduled backup failed to start");
                }
            })
        })
    }

    async fn trigger_stored(&self, namespace: &str, name: &str) -> Result<()> {
        let backup = self
            .backups
            .get_backup(namespace, name)
            .await?
            .ok_or_else(|| Error::not_found("CassandraBackup", name))?;
        let cluster = self
            .clusters
            .get_cluster(namespace, &backup.spec.cassandra_cluster)
            .await?
            .ok_or_else(|| Error::not_found("CassandraCluster", &backup.spec.cassandra_cluster))?;
        self.trigger(&backup, &cluster).await
    }

    /// Start the backup on a random pod of the datacenter and poll it in the
    /// background.
    ///
    /// The backup is marked Pending with its coordinator before the sidecar
    /// is called, so the status write it causes never triggers it again.
    pub async fn trigger(&self, backup: &CassandraBackup, cluster: &CassandraCluster) -> Result<()> {
        let name = backup.name_any();
        let namespace = backup.namespace().unwrap_or_default();
        let key = backup_key(&namespace, &name);
        if self.in_flight.lock().contains(&key) {
            debug!(backup = %name, "Backup still running, not triggered again");
            return Ok(());
        }

        let pods = self
            .clusters
            .list_pods(&namespace, &cluster.dc_selector(&backup.spec.datacenter))
            .await?;

        let coordinator = {
            let mut rng = rand::thread_rng();
            pods.into_iter()
                .filter_map(|p| p.host().map(|host| (p.name, host)))
                .choose(&mut rng)
        };
        let Some((pod, host)) = coordinator else {
            BACKUPS_TRIGGERED.with_label_values(&["no_pod"]).inc();
            self.warn(
                backup,
                "BackupNotInitiated",
                format!(
                    "No pods found in datacenter {} of cluster {}, snapshot {} failed.",
                    backup.spec.datacenter, backup.spec.cassandra_cluster, backup.spec.snapshot_tag
                ),
            )
            .await;
            return Ok(());
        };

        let Some(this) = self.this.upgrade() else {
            return Err(Error::Internal("backup reconciler dropped".into()));
        };
        if !self.in_flight.lock().insert(key.clone()) {
            return Ok(());
        }

        let pending = BackRestStatus {
            coordinator_member: Some(pod.clone()),
            condition: Some(BackRestCondition::new(ConditionType::Pending, Utc::now())),
            ..Default::default()
        };
        if let Err(e) = self
            .backups
            .patch_backup_status(&namespace, &name, &pending)
            .await
        {
            self.in_flight.lock().remove(&key);
            return Err(e);
        }

        info!(backup = %name, coordinator = %pod, "Triggering backup");
        let backup = backup.clone();
        tokio::spawn(async move {
            this.run_backup(backup, pod, host).await;
            this.in_flight.lock().remove(&key);
        });
        Ok(())
    }

    /// Start the backup and follow it until a terminal condition or a poll error
    async fn run_backup(&self, backup: CassandraBackup, coordinator: String, host: String) {
        let name = backup.name_any();
        let namespace = backup.namespace().unwrap_or_default();
        let spec = &backup.spec;

        let id = match self.sidecar.start_backup(&host, &backup).await {
            Ok(id) => id,
            Err(e) => {
                error!(backup = %name, error = %e, "Error while starting backup operation");
                BACKUPS_TRIGGERED.with_label_values(&["failure"]).inc();
                let mut condition = BackRestCondition::new(ConditionType::Failed, Utc::now());
                condition.failure_cause.push(FailureCause {
                    source: Some(coordinator.clone()),
                    message: e.to_string(),
                });
                let failed = BackRestStatus {
                    coordinator_member: Some(coordinator.clone()),
                    condition: Some(condition),
                    ..Default::default()
                };
                if let Err(e) = self
                    .backups
                    .patch_backup_status(&namespace, &name, &failed)
                    .await
                {
                    warn!(backup = %name, error = %e, "Could not update backup status");
                }
                self.warn(
                    &backup,
                    "BackupNotInitiated",
                    format!(
                        "Backup of datacenter {} of cluster {} to {} under snapshot {} failed.",
                        spec.datacenter, spec.cassandra_cluster, spec.storage_location, spec.snapshot_tag
                    ),
                )
                .await;
                return;
            }
        };

        BACKUPS_TRIGGERED.with_label_values(&["success"]).inc();
        self.event(
            &backup,
            EventType::Normal,
            "BackupInitiated",
            format!(
                "Task initiated to backup datacenter {} of cluster {} to {} under snapshot {}",
                spec.datacenter, spec.cassandra_cluster, spec.storage_location, spec.snapshot_tag
            ),
        )
        .await;

        let mut last = BackRestStatus {
            id: Some(id.clone()),
            coordinator_member: Some(coordinator.clone()),
            ..Default::default()
        };
        loop {
            tokio::time::sleep(self.config.poll_interval).await;

            let mut status = match self.sidecar.backup_status(&host, &id).await {
                Ok(status) => status,
                Err(e) => {
                    error!(backup = %name, operation_id = %id, error = %e, "Error while polling backup operation");
                    break;
                }
            };
            status.id.get_or_insert_with(|| id.clone());
            if status.coordinator_member.as_deref().map_or(true, str::is_empty) {
                status.coordinator_member = Some(coordinator.clone());
            }

            if status != last {
                if let Err(e) = self
                    .backups
                    .patch_backup_status(&namespace, &name, &status)
                    .await
                {
                    warn!(backup = %name, error = %e, "Could not update backup status");
                    continue;
                }
                last = status.clone();
            }

            match status.condition_type() {
                Some(ConditionType::Failed) => {
                    self.warn(
                        &backup,
                        "BackupFailed",
                        format!("Backup operation {} on node {} has failed", id, coordinator),
                    )
                    .await;
                    break;
                }
                Some(ConditionType::Completed) => {
                    self.event(
                        &backup,
                        EventType::Normal,
                        "BackupCompleted",
                        format!("Backup operation {} on node {} was completed.", id, coordinator),
                    )
                    .await;
                    break;
                }
                other => debug!(backup = %name, condition = ?other, progress = ?status.progress, "Backup in progress"),
            }
        }
    }
}

fn backup_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

fn has_finalizer(backup: &CassandraBackup) -> bool {
    backup.finalizers().iter().any(|f| f == UNSCHEDULE_FINALIZER)
}
