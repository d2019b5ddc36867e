use futures::StreamExt;
use gateway_cd::controller::canary::{KubeRolloutStore, KubeRouteStore};
use gateway_cd::controller::clock::SystemClock;
use gateway_cd::controller::prometheus::{HttpPrometheusClient, MetricsQuerier};
use gateway_cd::controller::{reconcile, Context, ReconcileError};
use gateway_cd::crd::canary::CanaryDeployment;
use gateway_cd::server::{
    create_metrics, parse_bind_address, run_health_server, run_leader_election,
    run_metrics_server, shutdown_channel, wait_for_signal, LeaderConfig, LeaderState,
    ReadinessState,
};
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Bind address for `/metrics` (controller-manager style, ":port" allowed)
const DEFAULT_METRICS_BIND_ADDRESS: &str = ":8080";

/// Bind address for `/healthz` and `/readyz`
const DEFAULT_HEALTH_PROBE_BIND_ADDRESS: &str = ":8081";

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Check if leader election is enabled via env var
fn is_leader_election_enabled() -> bool {
    std::env::var("GATEWAY_CD_LEADER_ELECTION")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// Error policy for the controller: requeue with a short delay.
///
/// Uses `warn!` since reconciliation errors are expected and retried.
pub fn error_policy(
    _rollout: Arc<CanaryDeployment>,
    error: &ReconcileError,
    ctx: Arc<Context>,
) -> Action {
    warn!("Reconcile error (will retry): {:?}", error);

    if let Some(ref metrics) = ctx.metrics {
        metrics.record_reconciliation_error();
    }

    Action::requeue(Duration::from_secs(10))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting gateway-cd canary rollout controller");

    // Coordinated shutdown + readiness for the probe endpoints
    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();

    let metrics = match create_metrics() {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "Failed to create metrics registry");
            return Err(e.into());
        }
    };

    let leader_state = LeaderState::new();

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    // Probe and metrics servers; shared listener when the addresses match
    let metrics_bind = env_or("GATEWAY_CD_METRICS_BIND_ADDRESS", DEFAULT_METRICS_BIND_ADDRESS);
    let health_bind = env_or(
        "GATEWAY_CD_HEALTH_PROBE_BIND_ADDRESS",
        DEFAULT_HEALTH_PROBE_BIND_ADDRESS,
    );
    let metrics_addr = parse_bind_address(&metrics_bind)
        .ok_or_else(|| anyhow::anyhow!("invalid GATEWAY_CD_METRICS_BIND_ADDRESS: {metrics_bind}"))?;
    let health_addr = parse_bind_address(&health_bind).ok_or_else(|| {
        anyhow::anyhow!("invalid GATEWAY_CD_HEALTH_PROBE_BIND_ADDRESS: {health_bind}")
    })?;

    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_handle = if health_addr == metrics_addr {
        tokio::spawn(async move {
            if let Err(e) =
                run_health_server(health_addr, health_readiness, Some(health_metrics)).await
            {
                warn!(error = %e, "Health server failed");
            }
        })
    } else {
        let metrics_handle_metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics_addr, metrics_handle_metrics).await {
                warn!(error = %e, "Metrics server failed");
            }
        });
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_addr, health_readiness, None).await {
                warn!(error = %e, "Health server failed");
            }
        })
    };
    info!(health = %health_addr, metrics = %metrics_addr, "Server tasks spawned");

    // Leader election keeps at most one replica's reconcilers active
    let leader_election_enabled = is_leader_election_enabled();
    let leader_handle = if leader_election_enabled {
        let leader_client = client.clone();
        let leader_config = LeaderConfig::from_env();
        let leader_state_clone = leader_state.clone();
        let leader_shutdown = shutdown_signal.clone();

        info!(holder_id = %leader_config.holder_id, "Leader election enabled");

        Some(tokio::spawn(async move {
            run_leader_election(
                leader_client,
                leader_config,
                leader_state_clone,
                leader_shutdown,
            )
            .await;
        }))
    } else {
        info!("Leader election disabled - running as single instance");
        leader_state.set_leader(true);
        None
    };

    // Metrics backend is optional; without it the analyzer passes every step
    let metrics_backend_url = env_or("GATEWAY_CD_METRICS_BACKEND_URL", "");
    let metrics_backend: Option<Arc<dyn MetricsQuerier>> = if metrics_backend_url.is_empty() {
        info!("Metrics backend not configured - analysis will pass unconditionally");
        None
    } else {
        info!(url = %metrics_backend_url, "Metrics backend configured");
        Some(Arc::new(HttpPrometheusClient::new(metrics_backend_url)))
    };

    let rollouts_store = Arc::new(KubeRolloutStore::new(client.clone()));
    let routes_store = Arc::new(KubeRouteStore::new(client.clone()));

    let ctx = if leader_election_enabled {
        Arc::new(Context::new_with_leader(
            rollouts_store,
            routes_store,
            metrics_backend,
            Arc::new(SystemClock),
            leader_state.clone(),
            Some(metrics.clone()),
        ))
    } else {
        Arc::new(Context::new(
            rollouts_store,
            routes_store,
            metrics_backend,
            Arc::new(SystemClock),
            Some(metrics.clone()),
        ))
    };

    readiness.set_ready();
    info!("Controller ready, starting reconciliation loop");

    let rollouts = Api::<CanaryDeployment>::all(client.clone());
    let controller = Controller::new(rollouts, watcher::Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Ok(o) = res {
                info!("Reconciled: {:?}", o);
            }
            // Errors are already logged in error_policy
        });

    tokio::select! {
        _ = controller => {
            info!("Controller stream ended");
        }
        signal = wait_for_signal() => {
            info!(signal = signal, "Initiating graceful shutdown");
            readiness.set_not_ready();
        }
    }

    shutdown_controller.shutdown();
    info!("Stopping components...");

    if let Some(handle) = leader_handle {
        handle.abort();
    }
    health_handle.abort();

    info!("gateway-cd controller shut down gracefully");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
