//! Cassandra Operator - Control Plane
//!
//! A Kubernetes operator running Apache Cassandra clusters: rack topology,
//! seed lists, scale up/down with node decommission, long-running node
//! operations driven through pod labels, and backup/restore through a sidecar.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               Reconcilers                                    │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │ CassandraCluster│  │ CassandraBackup │  │      CassandraRestore       │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │ cron                    │                   │
//! ├───────────┼────────────────────┼─────────────────────────┼───────────────────┤
//! │  ┌────────┴────────┐  ┌────────┴────────┐                │                   │
//! │  │ Pod Operations  │  │ Backup Scheduler│                │                   │
//! │  │ + Decommission  │  └─────────────────┘                │                   │
//! │  └────────┬────────┘                                     │                   │
//! ├───────────┼──────────────────────────────────────────────┼───────────────────┤
//! │           │                  Domain Ports                │                   │
//! │  ┌────────┴─────────┐  ┌────────────────┐  ┌─────────────┴───────────────┐  │
//! │  │ Node Management  │  │ Cluster/Backup │  │       Sidecar Client        │  │
//! │  │   (Jolokia)      │  │ Store (kube)   │  │          (HTTP)             │  │
//! │  └──────────────────┘  └────────────────┘  └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Reconcilers, backup scheduler and backend adapters
//! - [`operations`]: Pod operation and decommission engines
//! - [`topology`]: Rack identities, selectors, rack status and seed list
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Port traits
//! - [`error`]: Error types and handling
//! - [`metrics`]: Prometheus metrics

pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod operations;
pub mod topology;

// Re-export commonly used types
pub use controlplane::{
    BackendConfig, BackendFactory, Backends, BackupConfig, BackupReconciler, BackupScheduler,
    ClusterReconciler, ReconcilerConfig, RestoreReconciler,
};

pub use crd::{
    BackRestStatus, CassandraBackup, CassandraBackupSpec, CassandraCluster, CassandraClusterSpec,
    CassandraClusterStatus, CassandraRestore, CassandraRestoreSpec, ConditionType,
};

pub use domain::ports::{
    BackupStore, ClusterStore, EventRecorder, MembershipMode, NodeManagementClient, PodInfo,
    SidecarClient,
};

pub use error::{Error, ErrorAction, Result};

pub use operations::{
    CompletionQueues, DecommissionConfig, DecommissionEngine, OperationCatalog,
    OperationContext, PersistPolicy, PodOperationConfig, PodOperationEngine,
};

pub use topology::{compute_seed_list, dc_rack_name, RackRef};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
