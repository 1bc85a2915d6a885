//! In-memory port implementations for tests

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::ports::*;
use crate::crd::{BackRestStatus, CassandraBackup, CassandraCluster, CassandraRestore};
use crate::error::{Error, Result};

// =============================================================================
// Cluster store
// =============================================================================

#[derive(Default)]
pub struct FakeClusterStore {
    pub clusters: Mutex<HashMap<String, CassandraCluster>>,
    pub pods: Mutex<BTreeMap<String, PodInfo>>,
    pub pvcs: Mutex<BTreeSet<String>>,
    pub workloads: Mutex<BTreeMap<String, RackWorkload>>,
    /// Next N status writes fail with a conflict
    pub conflicts: AtomicUsize,
    /// Next N label patches fail
    pub label_failures: AtomicUsize,
    pub status_writes: AtomicUsize,
    pub deleted_pods: Mutex<Vec<String>>,
}

impl FakeClusterStore {
    pub fn with_cluster(cluster: CassandraCluster) -> Self {
        let store = Self::default();
        store.put_cluster(cluster);
        store
    }

    pub fn put_cluster(&self, mut cluster: CassandraCluster) {
        if cluster.metadata.resource_version.is_none() {
            cluster.metadata.resource_version = Some("1".into());
        }
        self.clusters
            .lock()
            .insert(cluster.metadata.name.clone().unwrap_or_default(), cluster);
    }

    pub fn cluster(&self, name: &str) -> CassandraCluster {
        self.clusters.lock()[name].clone()
    }

    pub fn put_pod(&self, pod: PodInfo) {
        self.pods.lock().insert(pod.name.clone(), pod);
    }

    pub fn pod(&self, name: &str) -> Option<PodInfo> {
        self.pods.lock().get(name).cloned()
    }

    pub fn remove_pod(&self, name: &str) {
        self.pods.lock().remove(name);
    }
}

#[async_trait]
impl ClusterStore for FakeClusterStore {
    async fn get_cluster(&self, _namespace: &str, name: &str) -> Result<Option<CassandraCluster>> {
        Ok(self.clusters.lock().get(name).cloned())
    }

    async fn replace_cluster_status(&self, cluster: &CassandraCluster) -> Result<CassandraCluster> {
        let name = cluster.metadata.name.clone().unwrap_or_default();
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::StatusConflict {
                kind: "CassandraCluster".into(),
                name,
            });
        }
        let mut clusters = self.clusters.lock();
        let stored = clusters
            .get_mut(&name)
            .ok_or_else(|| Error::not_found("CassandraCluster", &name))?;
        if stored.metadata.resource_version != cluster.metadata.resource_version {
            return Err(Error::StatusConflict {
                kind: "CassandraCluster".into(),
                name,
            });
        }
        let version: u64 = stored
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        stored.status = cluster.status.clone();
        stored.metadata.resource_version = Some((version + 1).to_string());
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored.clone())
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodInfo>> {
        Ok(self
            .pods
            .lock()
            .values()
            .filter(|p| selector.iter().all(|(k, v)| p.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Option<PodInfo>> {
        Ok(self.pod(name))
    }

    async fn patch_pod_labels(
        &self,
        _namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        if self
            .label_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Internal("label patch failed".into()));
        }
        let mut pods = self.pods.lock();
        let pod = pods
            .get_mut(name)
            .ok_or_else(|| Error::not_found("Pod", name))?;
        pod.labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn force_delete_pod(&self, _namespace: &str, name: &str) -> Result<()> {
        self.pods.lock().remove(name);
        self.deleted_pods.lock().push(name.to_string());
        Ok(())
    }

    async fn pvc_exists(&self, _namespace: &str, name: &str) -> Result<bool> {
        Ok(self.pvcs.lock().contains(name))
    }

    async fn delete_pvc(&self, _namespace: &str, name: &str) -> Result<()> {
        if self.pvcs.lock().remove(name) {
            Ok(())
        } else {
            Err(Error::not_found("PersistentVolumeClaim", name))
        }
    }

    async fn rack_workload(&self, _namespace: &str, name: &str) -> Result<Option<RackWorkload>> {
        Ok(self.workloads.lock().get(name).copied())
    }

    async fn scale_rack(&self, _namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let mut workloads = self.workloads.lock();
        let workload = workloads.entry(name.to_string()).or_default();
        workload.replicas = replicas;
        workload.ready_replicas = workload.ready_replicas.min(replicas);
        Ok(())
    }
}

// =============================================================================
// Node management
// =============================================================================

#[derive(Default)]
pub struct FakeNodeManagement {
    pub modes: Mutex<HashMap<String, MembershipMode>>,
    /// Hosts whose calls fail
    pub failing: Mutex<HashSet<String>>,
    /// Hosts still reporting activity to monitors
    pub busy: Mutex<HashSet<String>>,
    pub joining: AtomicBool,
    pub host_ids: Mutex<HashMap<String, String>>,
    pub keyspaces: Mutex<HashMap<String, Vec<String>>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeNodeManagement {
    pub fn set_mode(&self, host: &str, mode: MembershipMode) {
        self.modes.lock().insert(host.to_string(), mode);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn call(&self, host: &str, what: String) -> Result<()> {
        self.calls.lock().push(what);
        if self.failing.lock().contains(host) {
            return Err(Error::ManagementEndpoint {
                host: host.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NodeManagementClient for FakeNodeManagement {
    async fn membership_mode(&self, host: &str) -> Result<MembershipMode> {
        Ok(self
            .modes
            .lock()
            .get(host)
            .copied()
            .unwrap_or(MembershipMode::Normal))
    }

    async fn decommission(&self, host: &str, new_signature: bool) -> Result<()> {
        self.call(host, format!("decommission:{}:{}", host, new_signature))
    }

    async fn cleanup(&self, host: &str) -> Result<()> {
        self.call(host, format!("cleanup:{}", host))
    }

    async fn upgrade_sstables(&self, host: &str, options: UpgradeSSTablesOptions) -> Result<()> {
        self.call(host, format!("upgradesstables:{}:{}", host, options.jobs))
    }

    async fn rebuild(&self, host: &str, source_dc: &str) -> Result<()> {
        self.call(host, format!("rebuild:{}:{}", host, source_dc))
    }

    async fn remove(&self, host: &str, host_id: &str) -> Result<()> {
        self.call(host, format!("remove:{}:{}", host, host_id))
    }

    async fn non_local_keyspaces(&self, _host: &str, datacenter: Option<&str>) -> Result<Vec<String>> {
        Ok(self
            .keyspaces
            .lock()
            .get(datacenter.unwrap_or(""))
            .cloned()
            .unwrap_or_default())
    }

    async fn host_id_map(&self, _host: &str) -> Result<HashMap<String, String>> {
        Ok(self.host_ids.lock().clone())
    }

    async fn has_cleanup_compactions(&self, host: &str) -> Result<bool> {
        Ok(self.busy.lock().contains(host))
    }

    async fn has_upgrade_sstables_compactions(&self, host: &str) -> Result<bool> {
        Ok(self.busy.lock().contains(host))
    }

    async fn has_streaming_sessions(&self, host: &str) -> Result<bool> {
        Ok(self.busy.lock().contains(host))
    }

    async fn has_leaving_nodes(&self, host: &str) -> Result<bool> {
        Ok(self.busy.lock().contains(host))
    }

    async fn has_joining_nodes(&self, _host: &str) -> Result<bool> {
        Ok(self.joining.load(Ordering::SeqCst))
    }
}

// =============================================================================
// Sidecar
// =============================================================================

/// Failure injected into the fake sidecar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidecarFailure {
    Unreachable,
    NotReady,
}

impl SidecarFailure {
    fn error(self, host: &str) -> Error {
        match self {
            SidecarFailure::Unreachable => Error::SidecarUnreachable {
                host: host.to_string(),
                reason: "connection refused".into(),
            },
            SidecarFailure::NotReady => Error::ResourceNotReady(format!("sidecar on {}", host)),
        }
    }
}

#[derive(Default)]
pub struct FakeSidecar {
    pub failure: Mutex<Option<SidecarFailure>>,
    /// Statuses returned by successive status polls; the last one repeats
    pub statuses: Mutex<VecDeque<BackRestStatus>>,
    pub started: Mutex<Vec<String>>,
}

impl FakeSidecar {
    pub fn push_status(&self, status: BackRestStatus) {
        self.statuses.lock().push_back(status);
    }

    fn next_status(&self, host: &str) -> Result<BackRestStatus> {
        if let Some(failure) = *self.failure.lock() {
            return Err(failure.error(host));
        }
        let mut statuses = self.statuses.lock();
        if statuses.len() > 1 {
            Ok(statuses.pop_front().unwrap_or_default())
        } else {
            Ok(statuses.front().cloned().unwrap_or_default())
        }
    }
}

#[async_trait]
impl SidecarClient for FakeSidecar {
    async fn start_backup(&self, host: &str, backup: &CassandraBackup) -> Result<String> {
        if let Some(failure) = *self.failure.lock() {
            return Err(failure.error(host));
        }
        self.started
            .lock()
            .push(format!("backup:{}:{}", host, backup.spec.snapshot_tag));
        Ok("op-backup-1".into())
    }

    async fn backup_status(&self, host: &str, _id: &str) -> Result<BackRestStatus> {
        self.next_status(host)
    }

    async fn start_restore(
        &self,
        host: &str,
        restore: &CassandraRestore,
        _backup: &CassandraBackup,
    ) -> Result<BackRestStatus> {
        if let Some(failure) = *self.failure.lock() {
            return Err(failure.error(host));
        }
        self.started.lock().push(format!(
            "restore:{}:{}",
            host,
            restore.metadata.name.clone().unwrap_or_default()
        ));
        self.next_status(host)
    }

    async fn restore_status(&self, host: &str, _id: &str) -> Result<BackRestStatus> {
        self.next_status(host)
    }
}

// =============================================================================
// Backup store
// =============================================================================

#[derive(Default)]
pub struct FakeBackupStore {
    pub backups: Mutex<BTreeMap<String, CassandraBackup>>,
    pub backup_statuses: Mutex<Vec<(String, BackRestStatus)>>,
    pub restore_statuses: Mutex<Vec<(String, BackRestStatus)>>,
    pub secrets: Mutex<HashMap<String, Vec<String>>>,
}

impl FakeBackupStore {
    pub fn put_backup(&self, backup: CassandraBackup) {
        self.backups
            .lock()
            .insert(backup.metadata.name.clone().unwrap_or_default(), backup);
    }

    pub fn last_restore_status(&self) -> Option<BackRestStatus> {
        self.restore_statuses.lock().last().map(|(_, s)| s.clone())
    }

    pub fn last_backup_status(&self) -> Option<BackRestStatus> {
        self.backup_statuses.lock().last().map(|(_, s)| s.clone())
    }
}

#[async_trait]
impl BackupStore for FakeBackupStore {
    async fn get_backup(&self, _namespace: &str, name: &str) -> Result<Option<CassandraBackup>> {
        Ok(self.backups.lock().get(name).cloned())
    }

    async fn list_backups(&self, _namespace: &str) -> Result<Vec<CassandraBackup>> {
        Ok(self.backups.lock().values().cloned().collect())
    }

    async fn patch_backup_status(
        &self,
        _namespace: &str,
        name: &str,
        status: &BackRestStatus,
    ) -> Result<()> {
        if let Some(backup) = self.backups.lock().get_mut(name) {
            backup.status = Some(status.clone());
        }
        self.backup_statuses
            .lock()
            .push((name.to_string(), status.clone()));
        Ok(())
    }

    async fn set_backup_finalizers(
        &self,
        _namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        if let Some(backup) = self.backups.lock().get_mut(name) {
            backup.metadata.finalizers = Some(finalizers);
        }
        Ok(())
    }

    async fn patch_restore_status(
        &self,
        _namespace: &str,
        name: &str,
        status: &BackRestStatus,
    ) -> Result<()> {
        self.restore_statuses
            .lock()
            .push((name.to_string(), status.clone()));
        Ok(())
    }

    async fn secret_keys(&self, _namespace: &str, name: &str) -> Result<Option<Vec<String>>> {
        Ok(self.secrets.lock().get(name).cloned())
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Default)]
pub struct RecordingEvents {
    pub events: Mutex<Vec<(bool, String, Option<String>)>>,
}

impl RecordingEvents {
    /// Reasons of the recorded events, in order
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|(_, r, _)| r.clone()).collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(warning, _, _)| *warning)
            .map(|(_, r, _)| r.clone())
            .collect()
    }
}

#[async_trait]
impl EventRecorder for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        let warning = matches!(type_, EventType::Warning);
        self.events.lock().push((warning, reason.to_string(), note));
    }
}

/// Running pod of a rack, labelled like the workload labels it
pub fn rack_pod(cluster: &CassandraCluster, dc: &str, rack: &str, ordinal: i32) -> PodInfo {
    let dc_rack = format!("{}-{}", dc, rack);
    let name = cluster.pod_name(&dc_rack, ordinal);
    PodInfo {
        hostname: Some(name.clone()),
        subdomain: Some(cluster.cluster_name()),
        ip: Some(format!("10.0.0.{}", ordinal + 1)),
        name,
        namespace: cluster.cluster_namespace(),
        phase: PodPhase::Running,
        ready: true,
        labels: cluster.rack_selector(dc, rack),
        ..Default::default()
    }
}
