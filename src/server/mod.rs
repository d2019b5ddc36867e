//! Process-level plumbing around the reconciler
//!
//! Kubernetes probes and controller metrics:
//! - `/healthz` - liveness (process is running)
//! - `/readyz` - readiness (controller is initialized)
//! - `/metrics` - Prometheus text format
//!
//! Plus graceful SIGTERM/SIGINT shutdown and Lease-based leader election
//! for replicated deployments.

mod health;
pub mod leader;
pub mod metrics;
pub mod shutdown;

pub use health::{parse_bind_address, run_health_server, run_metrics_server, ReadinessState};
pub use leader::{run_leader_election, LeaderConfig, LeaderState};
pub use metrics::{create_metrics, ControllerMetrics, SharedMetrics};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};

#[cfg(test)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;

#[cfg(test)]
#[path = "leader_test.rs"]
mod leader_tests;

#[cfg(test)]
#[path = "metrics_test.rs"]
mod metrics_tests;
