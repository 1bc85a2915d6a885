//! Control Plane Module
//!
//! Reconcilers of the three resource kinds, the backup scheduler, and the
//! adapters that connect them to Kubernetes, Jolokia and the sidecars.

pub mod backends;
pub mod backup;
pub mod cluster;
pub mod restore;
pub mod scheduler;

pub use backends::{BackendConfig, BackendFactory, Backends};
pub use backup::{BackupConfig, BackupReconciler};
pub use cluster::{ClusterReconciler, ReconcilerConfig};
pub use restore::RestoreReconciler;
pub use scheduler::{BackupScheduler, BackupTask};
