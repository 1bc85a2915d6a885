//! Custom Resource Definitions for the Cassandra operator
//!
//! This module contains all CRD types:
//! - CassandraCluster: Datacenter/rack topology and per-rack operation status
//! - CassandraBackup: Snapshot of a datacenter uploaded by the sidecars
//! - CassandraRestore: Restore of a backup driven by a coordinator pod

pub mod cassandra_backup;
pub mod cassandra_cluster;
pub mod cassandra_restore;

pub use cassandra_backup::*;
pub use cassandra_cluster::*;
pub use cassandra_restore::*;
