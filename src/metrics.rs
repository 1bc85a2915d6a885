//! Prometheus metrics
//!
//! Registered in the default registry on first use and exposed by the
//! metrics server in `main`.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec,
};

/// Reconciliations by resource kind and outcome
pub static RECONCILIATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cassandra_operator_reconciliations_total",
        "Reconciliations by resource kind and result",
        &["kind", "result"]
    )
    .unwrap()
});

/// Pod operations finalized, by operation and result
pub static POD_OPERATIONS_FINALIZED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cassandra_operator_pod_operations_finalized_total",
        "Pod operations finalized by operation and result",
        &["operation", "result"]
    )
    .unwrap()
});

/// Status writes retried after a conflict or an API failure
pub static STATUS_PERSIST_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "cassandra_operator_status_persist_retries_total",
        "Cluster status writes retried after a conflict or API failure"
    )
    .unwrap()
});

/// Decommission state transitions by target status
pub static DECOMMISSION_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cassandra_operator_decommission_transitions_total",
        "Decommission state transitions by target status",
        &["status"]
    )
    .unwrap()
});

/// Backups triggered, by result
pub static BACKUPS_TRIGGERED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cassandra_operator_backups_triggered_total",
        "Backups triggered by result",
        &["result"]
    )
    .unwrap()
});

/// Force registration so every metric shows up before its first event
pub fn init() {
    Lazy::force(&RECONCILIATIONS);
    Lazy::force(&POD_OPERATIONS_FINALIZED);
    Lazy::force(&STATUS_PERSIST_RETRIES);
    Lazy::force(&DECOMMISSION_TRANSITIONS);
    Lazy::force(&BACKUPS_TRIGGERED);
}
