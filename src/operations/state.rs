//! Cluster status handle
//!
//! The reconcile cycle is the only writer of a cluster status. It works on a
//! [`ClusterState`] holding the last stored object, mutates the status in
//! place and persists it with an optimistic concurrency check. Conflicts are
//! resolved by re-reading the resource version and writing again, without
//! ever giving up.

use backoff::backoff::{Backoff, Constant};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::crd::{CassandraCluster, CassandraClusterStatus, CassandraRackStatus};
use crate::domain::ClusterStoreRef;
use crate::error::{Error, Result};
use crate::metrics::STATUS_PERSIST_RETRIES;

/// Retry behaviour of status writes
#[derive(Debug, Clone)]
pub struct PersistPolicy {
    /// Fixed delay between two attempts
    pub retry_interval: Duration,
    /// Attempts after which every retry is logged as a warning
    pub warn_after: u32,
}

impl Default for PersistPolicy {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            warn_after: 10,
        }
    }
}

static EMPTY_STATUS: CassandraClusterStatus = CassandraClusterStatus {
    phase: None,
    last_cluster_action: None,
    last_cluster_action_status: None,
    seedlist: Vec::new(),
    cassandra_node_status: BTreeMap::new(),
    cassandra_rack_status: BTreeMap::new(),
};

/// Working copy of a cluster during a reconcile cycle
pub struct ClusterState {
    cluster: CassandraCluster,
    stored: Option<CassandraClusterStatus>,
    store: ClusterStoreRef,
    policy: PersistPolicy,
}

impl ClusterState {
    pub fn new(mut cluster: CassandraCluster, store: ClusterStoreRef, policy: PersistPolicy) -> Self {
        let stored = cluster.status.clone();
        cluster.status.get_or_insert_with(Default::default);
        Self {
            stored,
            cluster,
            store,
            policy,
        }
    }

    pub fn cluster(&self) -> &CassandraCluster {
        &self.cluster
    }

    pub fn name(&self) -> String {
        self.cluster.cluster_name()
    }

    pub fn namespace(&self) -> String {
        self.cluster.cluster_namespace()
    }

    /// `<namespace>/<name>`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    pub fn store(&self) -> &ClusterStoreRef {
        &self.store
    }

    pub fn policy(&self) -> &PersistPolicy {
        &self.policy
    }

    pub fn status(&self) -> &CassandraClusterStatus {
        self.cluster.status.as_ref().unwrap_or(&EMPTY_STATUS)
    }

    pub fn status_mut(&mut self) -> &mut CassandraClusterStatus {
        self.cluster.status.get_or_insert_with(Default::default)
    }

    pub fn rack(&self, dc_rack: &str) -> Option<&CassandraRackStatus> {
        self.status().cassandra_rack_status.get(dc_rack)
    }

    pub fn rack_mut(&mut self, dc_rack: &str) -> Result<&mut CassandraRackStatus> {
        self.status_mut()
            .cassandra_rack_status
            .get_mut(dc_rack)
            .ok_or_else(|| Error::Internal(format!("no status for rack {}", dc_rack)))
    }

    /// True if the status differs from the last stored one
    pub fn is_dirty(&self) -> bool {
        self.status() != self.stored.as_ref().unwrap_or(&EMPTY_STATUS)
    }

    /// Write the status if it changed, retrying conflicts forever.
    ///
    /// Other errors are returned to the caller.
    pub async fn persist(&mut self) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }

        let mut delay = Constant::new(self.policy.retry_interval);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.store.replace_cluster_status(&self.cluster).await {
                Ok(stored) => {
                    debug!(cluster = %self.key(), attempt, "Cluster status persisted");
                    self.stored = stored.status.clone();
                    self.cluster = stored;
                    self.cluster.status.get_or_insert_with(Default::default);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    STATUS_PERSIST_RETRIES.inc();
                    if attempt >= self.policy.warn_after {
                        warn!(cluster = %self.key(), attempt, "Status update still conflicting");
                    } else {
                        debug!(cluster = %self.key(), attempt, "Status update conflict, refetching");
                    }
                    self.refresh_version().await?;
                    if let Some(d) = delay.next_backoff() {
                        tokio::time::sleep(d).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Take the resource version of the stored object, keeping our status
    async fn refresh_version(&mut self) -> Result<()> {
        let latest = self
            .store
            .get_cluster(&self.namespace(), &self.name())
            .await?
            .ok_or_else(|| Error::not_found("CassandraCluster", self.name()))?;
        self.cluster.metadata.resource_version = latest.metadata.resource_version;
        Ok(())
    }
}
