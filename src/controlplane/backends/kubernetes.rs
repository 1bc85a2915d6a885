//! Kubernetes adapters
//!
//! [`KubeClusterStore`] and [`KubeBackupStore`] implement the platform ports
//! with kube-rs typed APIs.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

use crate::crd::{BackRestStatus, CassandraBackup, CassandraCluster, CassandraRestore};
use crate::domain::ports::{BackupStore, ClusterStore, PodInfo, PodPhase, RackWorkload};
use crate::error::{Error, Result};

/// Field manager of every patch sent by the operator
const FIELD_MANAGER: &str = "cassandra-operator";

/// `k1=v1,k2=v2` label selector
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// What the engines need from a Pod object
pub fn pod_info(pod: &Pod) -> PodInfo {
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();
    let conditions = status.and_then(|s| s.conditions.as_deref()).unwrap_or_default();
    let condition = |type_: &str, value: &str| {
        conditions
            .iter()
            .any(|c| c.type_ == type_ && c.status == value)
    };

    PodInfo {
        name: pod.name_any(),
        namespace: pod.namespace().unwrap_or_default(),
        hostname: spec.and_then(|s| s.hostname.clone()),
        subdomain: spec.and_then(|s| s.subdomain.clone()),
        ip: status.and_then(|s| s.pod_ip.clone()),
        phase: status
            .and_then(|s| s.phase.as_deref())
            .map(PodPhase::parse)
            .unwrap_or_default(),
        terminating: pod.metadata.deletion_timestamp.is_some(),
        unschedulable: conditions.iter().any(|c| {
            c.type_ == "PodScheduled"
                && c.status == "False"
                && c.reason.as_deref() == Some("Unschedulable")
        }),
        ready: condition("Ready", "True"),
        labels: pod.labels().clone(),
    }
}

fn status_conflict(e: kube::Error, kind: &str, name: &str) -> Error {
    match e {
        kube::Error::Api(ref resp) if resp.code == 409 => Error::StatusConflict {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        e => Error::Kube(e),
    }
}

// =============================================================================
// Cluster Store
// =============================================================================

/// Clusters, pods, volume claims and rack workloads
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<CassandraCluster>> {
        let api: Api<CassandraCluster> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_cluster_status(&self, cluster: &CassandraCluster) -> Result<CassandraCluster> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();
        let api: Api<CassandraCluster> = Api::namespaced(self.client.clone(), &namespace);
        let data = serde_json::to_vec(cluster)?;
        api.replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| status_conflict(e, "CassandraCluster", &name))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<PodInfo>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(&label_selector(selector)))
            .await?;
        Ok(pods.items.iter().map(pod_info).collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodInfo>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.as_ref().map(pod_info))
    }

    async fn patch_pod_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "metadata": { "labels": labels } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        debug!(pod = %name, labels = ?labels, "Pod labels patched");
        Ok(())
    }

    async fn force_delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        api.delete(name, &params).await?;
        Ok(())
    }

    async fn pvc_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn rack_workload(&self, namespace: &str, name: &str) -> Result<Option<RackWorkload>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.map(|sts| RackWorkload {
            replicas: sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            ready_replicas: sts
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
        }))
    }

    async fn scale_rack(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "spec": { "replicas": replicas } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

// =============================================================================
// Backup Store
// =============================================================================

/// Backups, restores and their secrets
pub struct KubeBackupStore {
    client: Client,
}

impl KubeBackupStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BackupStore for KubeBackupStore {
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<CassandraBackup>> {
        let api: Api<CassandraBackup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_backups(&self, namespace: &str) -> Result<Vec<CassandraBackup>> {
        let api: Api<CassandraBackup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_backup_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BackRestStatus,
    ) -> Result<()> {
        let api: Api<CassandraBackup> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_backup_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let api: Api<CassandraBackup> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_restore_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BackRestStatus,
    ) -> Result<()> {
        let api: Api<CassandraRestore> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn secret_keys(&self, namespace: &str, name: &str) -> Result<Option<Vec<String>>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.map(|secret| {
            let mut keys: Vec<String> = secret
                .data
                .unwrap_or_default()
                .into_keys()
                .chain(secret.string_data.unwrap_or_default().into_keys())
                .collect();
            keys.sort();
            keys.dedup();
            keys
        }))
    }
}
