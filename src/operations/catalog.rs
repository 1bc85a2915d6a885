//! Operation Catalog
//!
//! Maps each pod operation to an action (start it on a node), a monitor
//! (is it still running there?) and an optional post-action run once the
//! operation is over.

use async_trait::async_trait;
use rand::seq::IteratorRandom;
use rand::Rng;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::labels::OPERATION_ARGUMENT;
use crate::crd::OperationKind;
use crate::domain::{ClusterStoreRef, NodeManagementClientRef, PodInfo, UpgradeSSTablesOptions};
use crate::error::{Error, Result};

/// Collaborators available to operations
pub struct OperationContext {
    pub management: NodeManagementClientRef,
    pub store: ClusterStoreRef,
    /// How long the remove post-action waits for a volume claim to disappear
    pub pvc_deletion_timeout: Duration,
    pub pvc_poll_interval: Duration,
}

/// Name of the data volume claim of a pod
pub fn pvc_name(pod: &str) -> String {
    format!("data-{}", pod)
}

/// Management address of a pod, or a not-ready error
pub fn pod_host(pod: &PodInfo) -> Result<String> {
    pod.host()
        .ok_or_else(|| Error::ResourceNotReady(format!("pod {} has no address", pod.name)))
}

fn argument_error(kind: OperationKind, pod: &PodInfo, reason: impl Into<String>) -> Error {
    Error::OperationArgument {
        operation: kind.to_string(),
        pod: pod.name.clone(),
        reason: reason.into(),
    }
}

/// One cataloged pod operation
#[async_trait]
pub trait PodOperation: Send + Sync {
    fn kind(&self) -> OperationKind;

    /// Start the operation on the pod. Returns once the call is accepted.
    async fn action(&self, ctx: &OperationContext, pod: &PodInfo) -> Result<()>;

    /// True while the operation is still active on the pod
    async fn monitor(&self, ctx: &OperationContext, pod: &PodInfo) -> Result<bool>;

    /// Runs once after the action succeeded or the monitor saw the end
    async fn post_action(&self, _ctx: &OperationContext, _pod: &PodInfo) -> Result<()> {
        Ok(())
    }
}

pub type PodOperationRef = Arc<dyn PodOperation>;

// =============================================================================
// Cleanup
// =============================================================================

pub struct Cleanup;

#[async_trait]
impl PodOperation for Cleanup {
    fn kind(&self) -> OperationKind {
        OperationKind::Cleanup
    }

    async fn action(&self, ctx: &OperationContext, pod: &PodInfo) -> Result<()> {
        let host = pod_host(pod)?;
        info!(pod = %pod.name, "Running cleanup");
        ctx.management.cleanup(&host).await
    }

    async fn monitor(&self, ctx: &OperationContext, pod: &PodInfo) -> Result<bool> {
        ctx.management.has_cleanup_compactions(&pod_host(pod)?).await
    }
}

// =============================================================================
// Rebuild
// =============================================================================

/// Streams data from the datacenter named by the `operation-argument` label
pub struct Rebuild;

#[async_trait]
impl PodOperation for Rebuild {
    fn kind(&self) -> OperationKind {
        OperationKind::Rebuild
    }

    async fn action(&self, ctx: &OperationContext, pod: &PodInfo) -> Result<()> {
        let source_dc = pod
            .label(OPERATION_ARGUMENT)
            .filter(|dc| !dc.is_empty())
            .ok_or_else(|| argument_error(self.kind(), pod, "source datacenter is missing"))?;
        let host = pod_host(pod)?;

        let keyspaces = ctx
            .management
            .non_local_keyspaces(&host, Some(source_dc))
            .await?;
        if keyspaces.is_empty() {
            return Err(argument_error(
                self.kind(),
                pod,
                format!("no keyspace replicated in datacenter {}", source_dc),
            ));
        }

        info!(pod = %pod.name, source_dc = %source_dc, "Running rebuild");
        ctx.management.rebuild(&host, source_dc).await
    }

    async fn monitor(&self, ctx: &OperationContext, pod: &PodInfo) -> Result<bool> {
        ctx.management.has_streaming_sessions(&pod_host(pod)?).await
    }
}

// =============================================================================
// Upgrade SSTables
// =============================================================================

pub struct UpgradeSSTables;

#[async_trait]
impl PodOperation for UpgradeSSTables {
    fn kind(&self) -> OperationKind {
        OperationKind::UpgradeSSTables
    }

    async fn action(&self, ctx: &OperationContext, pod: &PodInfo) -> Result<()> {
        let host = pod_host(pod)?;
        info!(pod = %pod.name, "Running upgradesstables");
        ctx.management
            .upgrade_sstables(&host, UpgradeSSTablesOptions::default())
            .await
    }

    async fn monitor(&self, ctx: &OperationContext, pod: &PodInfo) -> Result<bool> {
        ctx.management
            .has_upgrade_sstables_compactions(&pod_host(pod)?)
            .await
    }
}

// =============================================================================
// Remove
// =============================================================================

/// Removes another node from the ring.
///
/// The argument is `<podName>_<ip>`; either part may be empty, not both.
pub struct Remove;

/// Target of a remove operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveTarget {
    pub pod: Option<String>,
    pub ip: Option<IpAddr>,
}

impl RemoveTarget {
    pub fn parse(argument: &str) -> std::result::Result<Self, String> {
        let (name, ip) = argument.split_once('_').unwrap_or((argument, ""));
        if name.is_empty() && ip.is_empty() {
            return Err("a pod name or an IP is required".into());
        }
        let ip = if ip.is_empty() {
            None
        } else {
            Some(
                ip.parse::<IpAddr>()
                    .map_err(|_| format!("{} is not a valid IP", ip))?,
            )
        };
        Ok(Self {
            pod: Some(name.to_string()).filter(|n| !n.is_empty()),
            ip,
        })
    }
}

impl Remove {
    fn target(&self, pod: &PodInfo) -> Result<RemoveTarget> {
        let argument = pod.label(OPERATION_ARGUMENT).unwrap_or_default();
        RemoveTarget::parse(argument).map_err(|reason| argument_error(self.kind(), pod, reason))
    }
}

#[async_trait]
impl PodOperation for Remove {
    fn kind(&self) -> OperationKind {
        OperationKind::Remove
    }

    async fn action(&self, ctx: &OperationContext, pod: &PodInfo) -> Result<()> {
        let target = self.target(pod)?;

        let ip = match (target.ip, &target.pod) {
            (Some(ip), _) => ip.to_string(),
            (None, Some(name)) => {
                let removed = ctx
                    .store
                    .get_pod(&pod.namespace, name)
                    .await?
                    .ok_or_else(|| argument_error(self.kind(), pod, format!("pod {} not found", name)))?;
                removed
                    .ip
                    .filter(|ip| !ip.is_empty())
                    .ok_or_else(|| argument_error(self.kind(), pod, format!("pod {} has no IP", name)))?
            }
            (None, None) => return Err(argument_error(self.kind(), pod, "nothing to remove")),
        };

        let host = pod_host(pod)?;
        let host_ids = ctx.management.host_id_map(&host).await?;
        let host_id = host_ids
            .get(&ip)
            .ok_or_else(|| argument_error(self.kind(), pod, format!("no host id for {}", ip)))?;

        info!(pod = %pod.name, ip = %ip, host_id = %host_id, "Removing node");
        ctx.management.remove(&host, host_id).await
    }

    async fn monitor(&self, ctx: &OperationContext, pod: &PodInfo) -> Result<bool> {
        ctx.management.has_leaving_nodes(&pod_host(pod)?).await
    }

    /// Delete the volume claim and the pod object of the removed node
    async fn post_action(&self, ctx: &OperationContext, pod: &PodInfo) -> Result<()> {
        let Some(name) = self.target(pod)?.pod else {
            return Ok(());
        };
        let claim = pvc_name(&name);

        match ctx.store.delete_pvc(&pod.namespace, &claim).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(pvc = %claim, "Volume claim already gone"),
            Err(e) => return Err(e),
        }
        wait_pvc_deleted(ctx, &pod.namespace, &claim).await?;

        match ctx.store.force_delete_pod(&pod.namespace, &name).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }
}

/// Poll until the claim is gone or the deletion timeout elapses
pub async fn wait_pvc_deleted(ctx: &OperationContext, namespace: &str, claim: &str) -> Result<()> {
    let deadline = tokio::time::Instant::now() + ctx.pvc_deletion_timeout;
    loop {
        if !ctx.store.pvc_exists(namespace, claim).await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(pvc = %claim, "Volume claim still present after {:?}", ctx.pvc_deletion_timeout);
            return Err(Error::Internal(format!(
                "volume claim {} not deleted after {:?}",
                claim, ctx.pvc_deletion_timeout
            )));
        }
        tokio::time::sleep(ctx.pvc_poll_interval).await;
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// Registry of the pod operations the engine can run
#[derive(Clone)]
pub struct OperationCatalog {
    operations: BTreeMap<OperationKind, PodOperationRef>,
}

impl Default for OperationCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationCatalog {
    /// Catalog with cleanup, rebuild, upgradesstables and remove
    pub fn new() -> Self {
        let operations: [PodOperationRef; 4] = [
            Arc::new(Cleanup),
            Arc::new(Rebuild),
            Arc::new(UpgradeSSTables),
            Arc::new(Remove),
        ];
        Self {
            operations: operations.into_iter().map(|op| (op.kind(), op)).collect(),
        }
    }

    /// Catalog restricted to `operations`
    pub fn with_operations(operations: impl IntoIterator<Item = PodOperationRef>) -> Self {
        Self {
            operations: operations.into_iter().map(|op| (op.kind(), op)).collect(),
        }
    }

    pub fn get(&self, kind: OperationKind) -> Option<PodOperationRef> {
        self.operations.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<OperationKind> {
        self.operations.keys().copied().collect()
    }

    /// Uniform pick among the cataloged operations
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<OperationKind> {
        self.operations.keys().copied().choose(rng)
    }
}
