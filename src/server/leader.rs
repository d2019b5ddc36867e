//! Lease-based leader election for replicated deployments
//!
//! Uses the coordination.k8s.io/v1 Lease API directly so that at most one
//! replica's reconcilers are active at a time. Non-leaders skip
//! reconciliation and keep polling the lease.

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long leadership is valid
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15);

/// How often leadership is renewed (~1/3 of the TTL)
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Leader election configuration
#[derive(Clone)]
pub struct LeaderConfig {
    /// Unique identifier for this instance (usually the pod name)
    pub holder_id: String,
    /// Name of the Lease resource
    pub lease_name: String,
    /// Namespace of the Lease resource
    pub lease_namespace: String,
    /// How long leadership is valid, in seconds
    pub lease_duration_seconds: i32,
    /// How often to renew
    pub renew_interval: Duration,
}

impl LeaderConfig {
    /// Build from environment: `POD_NAME` (falling back to hostname or a
    /// random id) and `POD_NAMESPACE` (falling back to "gateway-cd-system").
    pub fn from_env() -> Self {
        let holder_id = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("gateway-cd-{}", uuid::Uuid::new_v4()));

        let lease_namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "gateway-cd-system".to_string());

        Self {
            holder_id,
            lease_name: "gateway-cd-controller-leader".to_string(),
            lease_namespace,
            lease_duration_seconds: DEFAULT_LEASE_TTL.as_secs() as i32,
            renew_interval: DEFAULT_RENEW_INTERVAL,
        }
    }
}

/// Shared leadership flag, read by the reconciler
#[derive(Clone, Default)]
pub struct LeaderState {
    is_leader: Arc<AtomicBool>,
}

impl LeaderState {
    /// New state, initially not leader
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Updated by the election loop, and by main() in single-instance mode
    pub fn set_leader(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::SeqCst);
    }
}

/// Try to acquire or renew leadership; true when we now hold the lease
async fn try_acquire_or_renew(
    api: &Api<Lease>,
    config: &LeaderConfig,
) -> Result<bool, kube::Error> {
    let now = Utc::now();
    let now_micro = MicroTime(now);

    match api.get(&config.lease_name).await {
        Ok(existing) => {
            let spec = existing.spec.as_ref();
            let current_holder = spec.and_then(|s| s.holder_identity.as_ref());
            let renew_time = spec.and_then(|s| s.renew_time.as_ref());
            let lease_duration = spec.and_then(|s| s.lease_duration_seconds);

            if current_holder == Some(&config.holder_id) {
                debug!(holder_id = %config.holder_id, "Renewing lease");
                let patch = serde_json::json!({
                    "spec": {
                        "renewTime": now_micro,
                        "leaseDurationSeconds": config.lease_duration_seconds
                    }
                });
                api.patch(
                    &config.lease_name,
                    &PatchParams::default(),
                    &Patch::Merge(&patch),
                )
                .await?;
                return Ok(true);
            }

            // No renew time or duration counts as expired
            let is_expired = match (renew_time, lease_duration) {
                (Some(MicroTime(renew)), Some(duration)) => {
                    now > *renew + chrono::Duration::seconds(duration as i64)
                }
                _ => true,
            };

            if is_expired {
                debug!(holder_id = %config.holder_id, "Lease expired, attempting to acquire");
                let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);

                let patch = serde_json::json!({
                    "spec": {
                        "holderIdentity": config.holder_id,
                        "acquireTime": now_micro,
                        "renewTime": now_micro,
                        "leaseDurationSeconds": config.lease_duration_seconds,
                        "leaseTransitions": transitions + 1
                    }
                });
                api.patch(
                    &config.lease_name,
                    &PatchParams::default(),
                    &Patch::Merge(&patch),
                )
                .await?;
                return Ok(true);
            }

            debug!(
                holder_id = %config.holder_id,
                current_holder = ?current_holder,
                "Lease held by another instance"
            );
            Ok(false)
        }
        Err(kube::Error::Api(err)) if err.code == 404 => {
            info!(holder_id = %config.holder_id, "Creating new lease");
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(config.lease_name.clone()),
                    namespace: Some(config.lease_namespace.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(config.holder_id.clone()),
                    acquire_time: Some(now_micro.clone()),
                    renew_time: Some(now_micro),
                    lease_duration_seconds: Some(config.lease_duration_seconds),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };

            match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                // Lost the creation race; retry on the next interval
                Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
                    info!(
                        holder_id = %config.holder_id,
                        "Lease created by another holder, retrying next interval"
                    );
                    Ok(false)
                }
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

/// Run the election loop until shutdown
///
/// Keeps `state` current. On errors leadership is dropped (the safe
/// fallback). The lease is not released on shutdown; it expires naturally
/// after `lease_duration_seconds`.
pub async fn run_leader_election(
    client: Client,
    config: LeaderConfig,
    state: LeaderState,
    mut shutdown: crate::server::ShutdownSignal,
) {
    let api: Api<Lease> = Api::namespaced(client, &config.lease_namespace);

    info!(
        holder_id = %config.holder_id,
        lease_name = %config.lease_name,
        lease_namespace = %config.lease_namespace,
        "Starting leader election"
    );

    // The first tick fires immediately so we contend for the lease at
    // startup; renew_interval applies from then on.
    let mut renew_interval = tokio::time::interval(config.renew_interval);

    loop {
        tokio::select! {
            _ = renew_interval.tick() => {
                match try_acquire_or_renew(&api, &config).await {
                    Ok(is_leader) => {
                        let was_leader = state.is_leader();
                        state.set_leader(is_leader);

                        if is_leader && !was_leader {
                            info!(holder_id = %config.holder_id, "Acquired leadership");
                        } else if !is_leader && was_leader {
                            warn!(holder_id = %config.holder_id, "Lost leadership");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Leader election error");
                        if state.is_leader() {
                            warn!(holder_id = %config.holder_id, "Dropping leadership after error");
                            state.set_leader(false);
                        }
                    }
                }
            }
            _ = shutdown.wait() => {
                info!("Leader election shutting down");
                break;
            }
        }
    }
}
