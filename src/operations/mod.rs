//! Pod operations
//!
//! Long-running maintenance operations on Cassandra nodes, driven through
//! pod labels and the rack status, plus the decommission path of scale-down.

pub mod catalog;
pub mod completion;
pub mod decommission;
pub mod engine;
pub mod labels;
pub mod state;

pub use catalog::{OperationCatalog, OperationContext, PodOperation, PodOperationRef};
pub use completion::{CompletedOperation, CompletionQueue, CompletionQueues};
pub use decommission::{DecommissionConfig, DecommissionEngine, DecommissionStep};
pub use engine::{OperationRound, PodOperationConfig, PodOperationEngine};
pub use state::{ClusterState, PersistPolicy};
