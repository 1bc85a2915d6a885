//! CassandraBackup CRD
//!
//! A backup of one datacenter of a CassandraCluster, run by the sidecar of
//! each node. A backup with a cron schedule is re-triggered by the backup
//! scheduler.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer kept on scheduled backups until their cron entry is removed
pub const UNSCHEDULE_FINALIZER: &str = "kubernetes.io/unschedule-needed";

/// Format of `condition.lastTransitionTime`
pub const TRANSITION_TIME_FORMAT: &str = "%a, %-d %b %Y %H:%M:%S GMT";

// =============================================================================
// CassandraBackup CRD
// =============================================================================

/// CassandraBackup requests a snapshot of a datacenter uploaded to a storage location
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "db.orange.com",
    version = "v2alpha1",
    kind = "CassandraBackup",
    plural = "cassandrabackups",
    shortname = "cassbackup",
    status = "BackRestStatus",
    printcolumn = r#"{"name": "Cluster", "type": "string", "jsonPath": ".spec.cassandraCluster"}"#,
    printcolumn = r#"{"name": "Condition", "type": "string", "jsonPath": ".status.condition.type"}"#,
    printcolumn = r#"{"name": "Progress", "type": "string", "jsonPath": ".status.progress"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CassandraBackupSpec {
    /// Name of the CassandraCluster to back up
    pub cassandra_cluster: String,

    /// Datacenter to back up
    pub datacenter: String,

    /// Destination, prefixed with s3://, azure://, gcp:// or file://
    pub storage_location: String,

    /// Cron expression re-triggering the backup
    #[serde(default)]
    pub schedule: Option<String>,

    /// Name of the snapshot taken on every node
    pub snapshot_tag: String,

    /// Maximum duration of the upload, e.g. "1h"
    #[serde(default)]
    pub duration: Option<String>,

    /// Upload bandwidth per node, e.g. "10M"
    #[serde(default)]
    pub bandwidth: Option<String>,

    #[serde(default)]
    pub concurrent_connections: Option<i64>,

    /// Keyspaces/tables to back up, empty for all
    #[serde(default)]
    pub entities: Option<String>,

    /// Secret holding the storage provider credentials
    #[serde(default)]
    pub secret: Option<String>,
}

/// Storage provider deduced from the storage location scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageProvider {
    S3,
    Azure,
    Gcp,
    File,
}

impl StorageProvider {
    pub fn from_location(location: &str) -> Option<Self> {
        [
            ("s3://", StorageProvider::S3),
            ("azure://", StorageProvider::Azure),
            ("gcp://", StorageProvider::Gcp),
            ("file://", StorageProvider::File),
        ]
        .into_iter()
        .find(|(prefix, _)| location.starts_with(prefix))
        .map(|(_, provider)| provider)
    }
}

impl CassandraBackup {
    pub fn is_scheduled(&self) -> bool {
        self.spec
            .schedule
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
    }

    /// True once the sidecar has reported at least one condition
    pub fn ran(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.condition.is_some())
    }

    pub fn condition_type(&self) -> Option<ConditionType> {
        self.status
            .as_ref()
            .and_then(|s| s.condition.as_ref())
            .map(|c| c.condition_type)
    }

    pub fn is_terminal(&self) -> bool {
        self.condition_type().is_some_and(|c| c.is_terminal())
    }

    pub fn storage_provider(&self) -> Option<StorageProvider> {
        StorageProvider::from_location(&self.spec.storage_location)
    }

    /// True if `other` is an unscheduled backup that already produced the same snapshot
    pub fn duplicates(&self, other: &CassandraBackup) -> bool {
        !other.is_scheduled()
            && other.ran()
            && other.spec.snapshot_tag == self.spec.snapshot_tag
            && other.spec.storage_location == self.spec.storage_location
            && other.spec.cassandra_cluster == self.spec.cassandra_cluster
            && other.spec.datacenter == self.spec.datacenter
    }
}

// =============================================================================
// Status (shared with CassandraRestore)
// =============================================================================

/// Condition of a backup or a restore as reported by the sidecar.
///
/// Backups only use Running, Completed and Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionType {
    Required,
    Pending,
    Running,
    Completed,
    Failed,
    #[serde(alias = "CANCELLED")]
    Canceled,
}

impl ConditionType {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, ConditionType::Pending | ConditionType::Running)
    }

    pub fn is_in_error(&self) -> bool {
        matches!(self, ConditionType::Failed | ConditionType::Canceled)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_in_error() || *self == ConditionType::Completed
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::Required => write!(f, "REQUIRED"),
            ConditionType::Pending => write!(f, "PENDING"),
            ConditionType::Running => write!(f, "RUNNING"),
            ConditionType::Completed => write!(f, "COMPLETED"),
            ConditionType::Failed => write!(f, "FAILED"),
            ConditionType::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// Status of a backup or a restore
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackRestStatus {
    /// Sidecar operation id
    #[serde(default)]
    pub id: Option<String>,

    /// Pod driving the operation
    #[serde(default)]
    pub coordinator_member: Option<String>,

    #[serde(default)]
    pub progress: Option<String>,

    #[serde(default)]
    pub time_created: Option<String>,

    #[serde(default)]
    pub time_started: Option<String>,

    #[serde(default)]
    pub time_completed: Option<String>,

    #[serde(default)]
    pub condition: Option<BackRestCondition>,
}

impl BackRestStatus {
    pub fn condition_type(&self) -> Option<ConditionType> {
        self.condition.as_ref().map(|c| c.condition_type)
    }

    /// First failure message reported by the sidecar
    pub fn failure_message(&self) -> Option<&str> {
        self.condition
            .as_ref()
            .and_then(|c| c.failure_cause.first())
            .map(|f| f.message.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackRestCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    #[serde(default)]
    pub last_transition_time: Option<String>,

    #[serde(default)]
    pub failure_cause: Vec<FailureCause>,
}

impl BackRestCondition {
    pub fn new(condition_type: ConditionType, at: DateTime<Utc>) -> Self {
        Self {
            condition_type,
            last_transition_time: Some(at.format(TRANSITION_TIME_FORMAT).to_string()),
            failure_cause: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailureCause {
    #[serde(default)]
    pub source: Option<String>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn backup(name: &str, schedule: Option<&str>, ran: bool) -> CassandraBackup {
        let mut b = CassandraBackup::new(
            name,
            CassandraBackupSpec {
                cassandra_cluster: "c".into(),
                datacenter: "dc1".into(),
                storage_location: "s3://bucket".into(),
                schedule: schedule.map(String::from),
                snapshot_tag: "snap1".into(),
                ..Default::default()
            },
        );
        if ran {
            b.status = Some(BackRestStatus {
                condition: Some(BackRestCondition::new(ConditionType::Completed, Utc::now())),
                ..Default::default()
            });
        }
        b
    }

    #[test]
    fn test_storage_provider() {
        assert_eq!(
            StorageProvider::from_location("gcp://bucket/path"),
            Some(StorageProvider::Gcp)
        );
        assert_eq!(StorageProvider::from_location("ftp://nope"), None);
    }

    #[test]
    fn test_duplicates() {
        let new = backup("b2", None, false);
        assert!(new.duplicates(&backup("b1", None, true)));
        assert!(!new.duplicates(&backup("b1", None, false)));
        assert!(!new.duplicates(&backup("b1", Some("0 * * * *"), true)));
    }

    #[test]
    fn test_condition_groups() {
        assert!(ConditionType::Pending.is_in_progress());
        assert!(ConditionType::Canceled.is_in_error());
        assert!(!ConditionType::Required.is_terminal());
        let parsed: ConditionType = serde_json::from_str(r#""CANCELLED""#).unwrap();
        assert_eq!(parsed, ConditionType::Canceled);
    }

    #[test]
    fn test_transition_time_format() {
        let at = Utc.with_ymd_and_hms(2006, 1, 2, 15, 4, 5).unwrap();
        let condition = BackRestCondition::new(ConditionType::Running, at);
        assert_eq!(
            condition.last_transition_time.as_deref(),
            Some("Mon, 2 Jan 2006 15:04:05 GMT")
        );
    }
}
