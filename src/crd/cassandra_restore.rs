//! CassandraRestore CRD
//!
//! Restores a CassandraBackup into a datacenter through the sidecar of a
//! coordinator pod.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::cassandra_backup::{BackRestStatus, ConditionType};

/// CassandraRestore restores a previous backup
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "db.orange.com",
    version = "v2alpha1",
    kind = "CassandraRestore",
    plural = "cassandrarestores",
    shortname = "cassrestore",
    status = "BackRestStatus",
    printcolumn = r#"{"name": "Backup", "type": "string", "jsonPath": ".spec.cassandraBackup"}"#,
    printcolumn = r#"{"name": "Coordinator", "type": "string", "jsonPath": ".status.coordinatorMember"}"#,
    printcolumn = r#"{"name": "Condition", "type": "string", "jsonPath": ".status.condition.type"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CassandraRestoreSpec {
    /// Name of the CassandraCluster to restore into
    pub cassandra_cluster: String,

    /// Name of the CassandraBackup to restore
    pub cassandra_backup: String,

    #[serde(default)]
    pub datacenter: Option<String>,

    #[serde(default)]
    pub concurrent_connection: Option<i64>,

    /// Cassandra data directory on the nodes
    #[serde(default)]
    pub cassandra_directory: Option<String>,

    #[serde(default)]
    pub no_delete_truncates: bool,

    #[serde(default)]
    pub schema_version: Option<String>,

    #[serde(default)]
    pub exact_schema_version: bool,

    #[serde(default)]
    pub restoration_strategy_type: Option<String>,

    /// Credentials secret, defaults to the backup's
    #[serde(default)]
    pub secret: Option<String>,

    /// Keyspaces/tables to restore, defaults to the backup's
    #[serde(default)]
    pub entities: Option<String>,
}

/// Phase of a restore on the sidecar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum RestorationPhase {
    Download,
    Import,
    Truncate,
    Cleanup,
    Unknown,
}

impl CassandraRestore {
    pub fn coordinator(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.coordinator_member.as_deref())
            .filter(|c| !c.is_empty())
    }

    pub fn condition_type(&self) -> Option<ConditionType> {
        self.status.as_ref().and_then(BackRestStatus::condition_type)
    }

    pub fn is_required(&self) -> bool {
        self.condition_type() == Some(ConditionType::Required)
    }

    pub fn is_in_progress(&self) -> bool {
        self.condition_type().is_some_and(|c| c.is_in_progress())
    }

    pub fn is_completed(&self) -> bool {
        self.condition_type() == Some(ConditionType::Completed)
    }

    pub fn is_in_error(&self) -> bool {
        self.condition_type().is_some_and(|c| c.is_in_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::BackRestCondition;
    use chrono::Utc;

    #[test]
    fn test_restore_state_predicates() {
        let mut restore = CassandraRestore::new(
            "r1",
            CassandraRestoreSpec {
                cassandra_cluster: "c".into(),
                cassandra_backup: "b1".into(),
                ..Default::default()
            },
        );
        assert!(restore.coordinator().is_none());
        assert!(!restore.is_required());

        restore.status = Some(BackRestStatus {
            coordinator_member: Some("c-dc1-rack1-0".into()),
            condition: Some(BackRestCondition::new(ConditionType::Pending, Utc::now())),
            ..Default::default()
        });
        assert_eq!(restore.coordinator(), Some("c-dc1-rack1-0"));
        assert!(restore.is_in_progress());
        assert!(!restore.is_in_error());
    }
}
