//! Cassandra Operator
//!
//! Runs the CassandraCluster, CassandraBackup and CassandraRestore controllers
//! together with the backup scheduler, a health server and a metrics server.

use clap::Parser;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, CustomResourceExt, Resource, ResourceExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cassandra_operator::controlplane::backends::{JolokiaConfig, KubeEventRecorder, SidecarConfig};
use cassandra_operator::metrics::{self, RECONCILIATIONS};
use cassandra_operator::{
    BackendConfig, BackendFactory, BackupConfig, BackupReconciler, BackupScheduler,
    CassandraBackup, CassandraCluster, CassandraRestore, ClusterReconciler, CompletionQueues,
    DecommissionConfig, DecommissionEngine, Error, ErrorAction, OperationCatalog,
    OperationContext, PersistPolicy, PodOperationConfig, PodOperationEngine, ReconcilerConfig,
    RestoreReconciler, Result,
};

/// Requeue delay of transient errors
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

// =============================================================================
// CLI Arguments
// =============================================================================

/// Cassandra Operator - Cassandra clusters, backups and restores on Kubernetes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace to watch, all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Identity of this operator instance, recorded on started pod operations
    #[arg(long, env = "POD_NAME", default_value = "cassandra-operator")]
    operator_name: String,

    /// Delay between two reconciliations of a cluster, in seconds
    #[arg(long, env = "RESYNC_PERIOD", default_value = "10")]
    resync_period_secs: u64,

    /// How long a node may stay Normal after a decommission call, in seconds
    #[arg(long, env = "DECOMMISSION_GRACE_PERIOD", default_value = "120")]
    decommission_grace_secs: u64,

    /// Poll interval of resumed pod operations, in seconds
    #[arg(long, env = "MONITOR_INTERVAL", default_value = "10")]
    monitor_interval_secs: u64,

    /// Delay between two attempts to persist a finalized operation, in milliseconds
    #[arg(long, env = "FINALIZE_RETRY_INTERVAL", default_value = "1000")]
    finalize_retry_ms: u64,

    /// Attempts after which persist retries are logged as warnings
    #[arg(long, env = "FINALIZE_WARN_AFTER", default_value = "10")]
    finalize_warn_after: u32,

    /// How long the remove operation waits for a volume claim deletion, in seconds
    #[arg(long, env = "PVC_DELETION_TIMEOUT", default_value = "30")]
    pvc_deletion_timeout_secs: u64,

    /// Poll interval of running backups, in seconds
    #[arg(long, env = "BACKUP_POLL_INTERVAL", default_value = "2")]
    backup_poll_secs: u64,

    /// Jolokia agent port on Cassandra pods
    #[arg(long, env = "JOLOKIA_PORT", default_value = "8778")]
    jolokia_port: u16,

    /// Jolokia user
    #[arg(long, env = "JOLOKIA_USER")]
    jolokia_user: Option<String>,

    /// Jolokia password
    #[arg(long, env = "JOLOKIA_PASSWORD", hide_env_values = true)]
    jolokia_password: Option<String>,

    /// Backup/restore sidecar port on Cassandra pods
    #[arg(long, env = "SIDECAR_PORT", default_value = "4567")]
    sidecar_port: u16,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the custom resource definitions as YAML and exit
    #[arg(long)]
    print_crds: bool,
}

impl Args {
    fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            jolokia: JolokiaConfig {
                port: self.jolokia_port,
                username: self.jolokia_user.clone(),
                password: self.jolokia_password.clone(),
                ..Default::default()
            },
            sidecar: SidecarConfig {
                port: self.sidecar_port,
                ..Default::default()
            },
        }
    }

    fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            resync_period: Duration::from_secs(self.resync_period_secs),
            persist: PersistPolicy {
                retry_interval: Duration::from_millis(self.finalize_retry_ms),
                warn_after: self.finalize_warn_after,
            },
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crds {
        return print_crds();
    }

    init_logging(&args)?;

    info!("Starting Cassandra Operator");
    info!("  Version: {}", cassandra_operator::VERSION);
    info!("  Operator name: {}", args.operator_name);
    info!(
        "  Namespace: {}",
        args.namespace.as_deref().unwrap_or("<all>")
    );

    metrics::init();

    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let client = Client::try_default().await?;
    let reporter = KubeEventRecorder::reporter(
        cassandra_operator::NAME,
        Some(args.operator_name.clone()),
    );
    let backends = BackendFactory::create(client.clone(), args.backend_config(), reporter)?;

    // Pod operations
    let queues = Arc::new(CompletionQueues::default());
    let context = Arc::new(OperationContext {
        management: backends.management.clone(),
        store: backends.clusters.clone(),
        pvc_deletion_timeout: Duration::from_secs(args.pvc_deletion_timeout_secs),
        pvc_poll_interval: Duration::from_secs(1),
    });
    let engine = Arc::new(PodOperationEngine::new(
        PodOperationConfig {
            operator_name: args.operator_name.clone(),
            monitor_interval: Duration::from_secs(args.monitor_interval_secs),
        },
        OperationCatalog::new(),
        context.clone(),
        queues.clone(),
    ));
    let decommission = DecommissionEngine::new(
        DecommissionConfig {
            grace_period: Duration::from_secs(args.decommission_grace_secs),
        },
        context,
    );

    // Reconcilers
    let cluster_reconciler = Arc::new(ClusterReconciler::new(
        args.reconciler_config(),
        backends.clusters.clone(),
        backends.management.clone(),
        engine,
        decommission,
        queues,
    ));

    let scheduler = Arc::new(BackupScheduler::default());
    let backup_reconciler = BackupReconciler::new(
        BackupConfig {
            poll_interval: Duration::from_secs(args.backup_poll_secs),
        },
        backends.clusters.clone(),
        backends.backups.clone(),
        backends.sidecar.clone(),
        backends.events.clone(),
        scheduler.clone(),
    );

    let restore_reconciler = Arc::new(RestoreReconciler::new(
        backends.clusters.clone(),
        backends.backups.clone(),
        backends.sidecar.clone(),
        backends.events.clone(),
    ));

    tokio::spawn(scheduler.clone().run());

    info!("Starting controllers");

    let cluster_controller = Controller::new(
        watched::<CassandraCluster>(&client, &args),
        WatcherConfig::default(),
    )
    .shutdown_on_signal()
    .run(reconcile_cluster, error_policy, cluster_reconciler)
    .for_each(|result| async move {
        match result {
            Ok(object) => debug!(?object, "CassandraCluster reconciled"),
            Err(e) => warn!(error = %e, "CassandraCluster controller error"),
        }
    });

    let backup_controller = Controller::new(
        watched::<CassandraBackup>(&client, &args),
        WatcherConfig::default(),
    )
    .shutdown_on_signal()
    .run(reconcile_backup, error_policy, backup_reconciler)
    .for_each(|result| async move {
        match result {
            Ok(object) => debug!(?object, "CassandraBackup reconciled"),
            Err(e) => warn!(error = %e, "CassandraBackup controller error"),
        }
    });

    let restore_controller = Controller::new(
        watched::<CassandraRestore>(&client, &args),
        WatcherConfig::default(),
    )
    .shutdown_on_signal()
    .run(reconcile_restore, error_policy, restore_reconciler)
    .for_each(|result| async move {
        match result {
            Ok(object) => debug!(?object, "CassandraRestore reconciled"),
            Err(e) => warn!(error = %e, "CassandraRestore controller error"),
        }
    });

    tokio::join!(cluster_controller, backup_controller, restore_controller);

    scheduler.shutdown();
    info!("Operator shutdown complete");
    Ok(())
}

fn watched<K>(client: &Client, args: &Args) -> Api<K>
where
    K: Resource<Scope = kube::core::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match &args.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn print_crds() -> Result<()> {
    for crd in [
        CassandraCluster::crd(),
        CassandraBackup::crd(),
        CassandraRestore::crd(),
    ] {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| Error::Internal(format!("CRD serialization failed: {}", e)))?;
        println!("---\n{}", yaml);
    }
    Ok(())
}

// =============================================================================
// Controller Glue
// =============================================================================

fn record(kind: &str, result: &Result<Action>) {
    let outcome = if result.is_ok() { "success" } else { "error" };
    RECONCILIATIONS.with_label_values(&[kind, outcome]).inc();
}

async fn reconcile_cluster(
    cluster: Arc<CassandraCluster>,
    reconciler: Arc<ClusterReconciler>,
) -> Result<Action> {
    let result = reconciler.reconcile(cluster).await;
    record("CassandraCluster", &result);
    result
}

async fn reconcile_backup(
    backup: Arc<CassandraBackup>,
    reconciler: Arc<BackupReconciler>,
) -> Result<Action> {
    let result = reconciler.reconcile(backup).await;
    record("CassandraBackup", &result);
    result
}

async fn reconcile_restore(
    restore: Arc<CassandraRestore>,
    reconciler: Arc<RestoreReconciler>,
) -> Result<Action> {
    let result = reconciler.reconcile(restore).await;
    record("CassandraRestore", &result);
    result
}

fn error_policy<K: ResourceExt, C>(object: Arc<K>, error: &Error, _ctx: Arc<C>) -> Action {
    let name = object.name_any();
    match error.action() {
        ErrorAction::RequeueAfter(delay) => {
            debug!(object = %name, error = %error, ?delay, "Reconciliation postponed");
            Action::requeue(delay)
        }
        ErrorAction::NoRequeue => {
            warn!(object = %name, error = %error, "Reconciliation failed, waiting for a change");
            Action::await_change()
        }
        ErrorAction::RequeueWithBackoff => {
            error!(object = %name, error = %error, "Reconciliation failed");
            Action::requeue(ERROR_REQUEUE)
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(directive("hyper=warn")?)
        .add_directive(directive("kube=info")?)
        .add_directive(directive("reqwest=warn")?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

fn directive(value: &str) -> Result<Directive> {
    value
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid log directive '{}': {}", value, e)))
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let (status, body) = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => (StatusCode::OK, "ok"),
                _ => (StatusCode::NOT_FOUND, "not found"),
            };
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => {
                            let mut response = Response::new(Body::from(e.to_string()));
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            response
                        }
                    }
                }
                _ => {
                    let mut response = Response::new(Body::from("not found"));
                    *response.status_mut() = StatusCode::NOT_FOUND;
                    response
                }
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_log_directives() {
        assert!(directive("hyper=warn").is_ok());
        assert_matches!(directive("hyper=loudest"), Err(Error::Configuration(_)));
    }
}
