//! Backup/restore sidecar client
//!
//! The sidecar of every Cassandra pod exposes an `/operations` API. A backup or
//! a restore is submitted once to the coordinator pod as a global request and
//! then polled by id.

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::crd::{
    BackRestCondition, BackRestStatus, CassandraBackup, CassandraRestore, ConditionType,
    FailureCause,
};
use crate::domain::ports::SidecarClient;
use crate::error::{Error, Result};

/// Where downloaded SSTables are imported from during a restore
const DOWNLOADED_SSTABLES_DIR: &str = "/var/lib/cassandra/data/downloadedsstables";

static BANDWIDTH_FORMAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(\d+)([kmg]?)$").unwrap());

/// Sidecar client configuration
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub port: u16,
    pub timeout: Duration,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            port: 4567,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Upload rate limit understood by the sidecar
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataRate {
    pub value: i64,
    pub unit: String,
}

/// Parse `<n>[k|m|g]` into a [`DataRate`]; an empty string means unlimited
pub fn data_rate_from_bandwidth(bandwidth: &str) -> Result<Option<DataRate>> {
    let normalized = bandwidth.replace(' ', "").to_uppercase();
    if normalized.is_empty() {
        return Ok(None);
    }

    let captures = BANDWIDTH_FORMAT
        .captures(&normalized)
        .ok_or_else(|| Error::InvalidBackup(format!("format of bandwidth {} not supported", bandwidth)))?;
    let value = captures[1]
        .parse()
        .map_err(|_| Error::InvalidBackup(format!("bandwidth {} out of range", bandwidth)))?;

    Ok(Some(DataRate {
        value,
        unit: format!("{}BPS", &captures[2]),
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BackupRequest<'a> {
    #[serde(rename = "type")]
    type_: &'static str,
    storage_location: &'a str,
    snapshot_tag: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bandwidth: Option<DataRate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    concurrent_connections: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entities: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    k8s_secret_name: Option<&'a str>,
    dc: &'a str,
    global_request: bool,
    k8s_namespace: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImportSpec {
    #[serde(rename = "type")]
    type_: &'static str,
    source_dir: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RestoreRequest<'a> {
    #[serde(rename = "type")]
    type_: &'static str,
    storage_location: &'a str,
    snapshot_tag: &'a str,
    no_delete_truncates: bool,
    exact_schema_version: bool,
    restoration_phase: &'static str,
    global_request: bool,
    import: ImportSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    entities: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    k8s_secret_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cassandra_directory: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema_version: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    restoration_strategy_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    concurrent_connections: Option<i64>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn backup_request(backup: &CassandraBackup) -> Result<BackupRequest<'_>> {
    let spec = &backup.spec;
    Ok(BackupRequest {
        type_: "backup",
        storage_location: &spec.storage_location,
        snapshot_tag: &spec.snapshot_tag,
        duration: non_empty(&spec.duration),
        bandwidth: match spec.bandwidth.as_deref() {
            Some(bandwidth) => data_rate_from_bandwidth(bandwidth)?,
            None => None,
        },
        concurrent_connections: spec.concurrent_connections,
        entities: non_empty(&spec.entities),
        k8s_secret_name: non_empty(&spec.secret),
        dc: &spec.datacenter,
        global_request: true,
        k8s_namespace: backup.metadata.namespace.clone().unwrap_or_default(),
    })
}

fn restore_request<'a>(
    restore: &'a CassandraRestore,
    backup: &'a CassandraBackup,
) -> RestoreRequest<'a> {
    let spec = &restore.spec;
    RestoreRequest {
        type_: "restore",
        storage_location: &backup.spec.storage_location,
        snapshot_tag: &backup.spec.snapshot_tag,
        no_delete_truncates: spec.no_delete_truncates,
        exact_schema_version: spec.exact_schema_version,
        restoration_phase: "DOWNLOAD",
        global_request: true,
        import: ImportSpec {
            type_: "import",
            source_dir: DOWNLOADED_SSTABLES_DIR,
        },
        entities: non_empty(&spec.entities).or(non_empty(&backup.spec.entities)),
        k8s_secret_name: non_empty(&spec.secret).or(non_empty(&backup.spec.secret)),
        cassandra_directory: non_empty(&spec.cassandra_directory),
        schema_version: non_empty(&spec.schema_version),
        restoration_strategy_type: non_empty(&spec.restoration_strategy_type),
        concurrent_connections: spec.concurrent_connection,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SidecarError {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    message: String,
}

/// Operation as returned by the sidecar
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationResponse {
    id: String,
    state: ConditionType,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    creation_time: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    completion_time: Option<String>,
    #[serde(default)]
    errors: Vec<SidecarError>,
}

/// `0.42` becomes `42%`
fn progress_percentage(progress: f64) -> String {
    format!("{}%", (progress * 100.0) as i64)
}

impl From<OperationResponse> for BackRestStatus {
    fn from(op: OperationResponse) -> Self {
        let mut condition = BackRestCondition::new(op.state, Utc::now());
        condition.failure_cause = op
            .errors
            .into_iter()
            .map(|e| FailureCause {
                source: e.source,
                message: e.message,
            })
            .collect();

        BackRestStatus {
            id: Some(op.id),
            coordinator_member: None,
            progress: Some(progress_percentage(op.progress)),
            time_created: op.creation_time,
            time_started: op.start_time,
            time_completed: op.completion_time,
            condition: Some(condition),
        }
    }
}

/// [`SidecarClient`] over HTTP
pub struct SidecarHttpClient {
    http: Client,
    config: SidecarConfig,
}

impl SidecarHttpClient {
    pub fn new(config: SidecarConfig) -> Result<Self> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    fn url(&self, host: &str, path: &str) -> String {
        format!("http://{}:{}{}", host, self.config.port, path)
    }

    fn unreachable(host: &str, reason: impl Into<String>) -> Error {
        Error::SidecarUnreachable {
            host: host.to_string(),
            reason: reason.into(),
        }
    }

    async fn submit<T: Serialize>(&self, host: &str, request: &T) -> Result<OperationResponse> {
        let response = self
            .http
            .post(self.url(host, "/operations"))
            .json(request)
            .send()
            .await
            .map_err(|e| Self::unreachable(host, e.to_string()))?;

        match response.status() {
            StatusCode::CREATED => Ok(response.json().await?),
            status => Err(Self::unreachable(
                host,
                format!("operation submission returned {}", status),
            )),
        }
    }

    async fn operation(&self, host: &str, id: &str) -> Result<OperationResponse> {
        let response = self
            .http
            .get(self.url(host, &format!("/operations/{}", id)))
            .send()
            .await
            .map_err(|e| Self::unreachable(host, e.to_string()))?;

        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(Error::not_found("SidecarOperation", id)),
            status => Err(Self::unreachable(
                host,
                format!("operation {} returned {}", id, status),
            )),
        }
    }
}

#[async_trait]
impl SidecarClient for SidecarHttpClient {
    async fn start_backup(&self, host: &str, backup: &CassandraBackup) -> Result<String> {
        let request = backup_request(backup)?;
        let op = self.submit(host, &request).await?;
        info!(host = %host, operation_id = %op.id, snapshot = %backup.spec.snapshot_tag, "Backup submitted");
        Ok(op.id)
    }

    async fn backup_status(&self, host: &str, id: &str) -> Result<BackRestStatus> {
        let op = self.operation(host, id).await?;
        debug!(host = %host, operation_id = %id, state = %op.state, progress = op.progress, "Backup status");
        Ok(op.into())
    }

    async fn start_restore(
        &self,
        host: &str,
        restore: &CassandraRestore,
        backup: &CassandraBackup,
    ) -> Result<BackRestStatus> {
        let request = restore_request(restore, backup);
        let op = self.submit(host, &request).await?;
        info!(host = %host, operation_id = %op.id, snapshot = %backup.spec.snapshot_tag, "Restore submitted");
        Ok(op.into())
    }

    async fn restore_status(&self, host: &str, id: &str) -> Result<BackRestStatus> {
        let op = self.operation(host, id).await?;
        debug!(host = %host, operation_id = %id, state = %op.state, progress = op.progress, "Restore status");
        Ok(op.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CassandraBackupSpec, CassandraRestoreSpec};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn backup() -> CassandraBackup {
        let mut backup = CassandraBackup::new(
            "b1",
            CassandraBackupSpec {
                cassandra_cluster: "c".into(),
                datacenter: "dc1".into(),
                storage_location: "s3://bucket".into(),
                snapshot_tag: "snap1".into(),
                bandwidth: Some("10 m".into()),
                entities: Some("k1.t1".into()),
                secret: Some("s3-creds".into()),
                ..Default::default()
            },
        );
        backup.metadata.namespace = Some("ns".into());
        backup
    }

    #[test]
    fn test_data_rate_from_bandwidth() {
        assert_eq!(
            data_rate_from_bandwidth("10M").unwrap(),
            Some(DataRate {
                value: 10,
                unit: "MBPS".into()
            })
        );
        assert_eq!(
            data_rate_from_bandwidth(" 3 g").unwrap(),
            Some(DataRate {
                value: 3,
                unit: "GBPS".into()
            })
        );
        assert_eq!(
            data_rate_from_bandwidth("512").unwrap().map(|r| r.unit),
            Some("BPS".to_string())
        );
        assert_eq!(data_rate_from_bandwidth("").unwrap(), None);
        assert_matches!(data_rate_from_bandwidth("10T"), Err(Error::InvalidBackup(_)));
        assert_matches!(data_rate_from_bandwidth("fast"), Err(Error::InvalidBackup(_)));
    }

    #[test]
    fn test_backup_request_body() {
        let backup = backup();
        let body = serde_json::to_value(backup_request(&backup).unwrap()).unwrap();
        assert_eq!(body["type"], "backup");
        assert_eq!(body["storageLocation"], "s3://bucket");
        assert_eq!(body["bandwidth"], json!({"value": 10, "unit": "MBPS"}));
        assert_eq!(body["k8sSecretName"], "s3-creds");
        assert_eq!(body["k8sNamespace"], "ns");
        assert_eq!(body["dc"], "dc1");
        assert_eq!(body["globalRequest"], true);
        assert!(body.get("duration").is_none());
    }

    #[test]
    fn test_restore_request_falls_back_to_backup() {
        let backup = backup();
        let restore = CassandraRestore::new(
            "r1",
            CassandraRestoreSpec {
                cassandra_cluster: "c".into(),
                cassandra_backup: "b1".into(),
                schema_version: Some("v1".into()),
                ..Default::default()
            },
        );
        let body = serde_json::to_value(restore_request(&restore, &backup)).unwrap();
        assert_eq!(body["type"], "restore");
        assert_eq!(body["restorationPhase"], "DOWNLOAD");
        assert_eq!(body["snapshotTag"], "snap1");
        assert_eq!(body["entities"], "k1.t1");
        assert_eq!(body["k8sSecretName"], "s3-creds");
        assert_eq!(body["schemaVersion"], "v1");
        assert_eq!(
            body["import"],
            json!({"type": "import", "sourceDir": DOWNLOADED_SSTABLES_DIR})
        );
    }

    #[test]
    fn test_status_from_operation() {
        let op: OperationResponse = serde_json::from_value(json!({
            "id": "d3262073-8101-450f-9a11-c851760abd57",
            "state": "FAILED",
            "progress": 0.42,
            "creationTime": "2020-06-10T04:53:05.976Z",
            "errors": [{"source": "c-dc1-rack1-0", "message": "download failed"}]
        }))
        .unwrap();
        let status = BackRestStatus::from(op);
        assert_eq!(status.id.as_deref(), Some("d3262073-8101-450f-9a11-c851760abd57"));
        assert_eq!(status.progress.as_deref(), Some("42%"));
        assert_eq!(status.condition_type(), Some(ConditionType::Failed));
        assert_eq!(status.failure_message(), Some("download failed"));
        assert_eq!(status.time_created.as_deref(), Some("2020-06-10T04:53:05.976Z"));
    }

    #[test]
    fn test_progress_percentage() {
        assert_eq!(progress_percentage(0.0), "0%");
        assert_eq!(progress_percentage(1.0), "100%");
        assert_eq!(progress_percentage(0.999), "99%");
    }
}
