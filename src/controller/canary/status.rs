//! Pure status computations for the reconciler
//!
//! Everything here is a function of `(spec, status, clock)` with no I/O so
//! the phase logic can be tested without a cluster.

use crate::crd::canary::{
    CanaryDeployment, CanaryDeploymentStatus, Condition, Phase, TrafficStep,
};
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::validation::parse_duration;

/// Requeue after init and ordinary phase transitions
pub const REQUEUE_FAST: Duration = Duration::from_secs(5);

/// Requeue while paused with no intent, and after a transient mutator error
pub const REQUEUE_POLL: Duration = Duration::from_secs(30);

/// Requeue while a rollback mutation keeps failing
pub const REQUEUE_ROLLBACK_RETRY: Duration = Duration::from_secs(10);

/// Dwell when a step has no (parseable) duration
pub const DEFAULT_STEP_DWELL: Duration = Duration::from_secs(30);

/// Condition types and reasons surfaced to external consumers
pub const COND_READY: &str = "Ready";
pub const COND_PAUSED: &str = "Paused";
pub const COND_DEGRADED: &str = "Degraded";

pub const REASON_VALIDATION: &str = "ValidationError";
pub const REASON_ANALYSIS_FAILED: &str = "AnalysisFailed";
pub const REASON_ABORTED: &str = "Aborted";
pub const REASON_ROUTE_LOST: &str = "RouteLost";
pub const REASON_STEP_PAUSE: &str = "StepPause";
pub const REASON_RESUMED: &str = "Resumed";
pub const REASON_COMPLETED: &str = "Completed";
pub const REASON_ROLLED_BACK: &str = "RolledBack";

/// Initial status written on first observation
pub fn pending_status(now: DateTime<Utc>) -> CanaryDeploymentStatus {
    CanaryDeploymentStatus {
        phase: Some(Phase::Pending),
        current_step: 0,
        canary_weight: 0,
        stable_weight: 100,
        message: Some("Awaiting validation".to_string()),
        last_transition_time: Some(now.to_rfc3339()),
        analysis_run: None,
        conditions: Vec::new(),
    }
}

/// Move the status to a new phase
///
/// `lastTransitionTime` is stamped only when the phase actually changes;
/// the message is always replaced.
pub fn transition(
    status: &mut CanaryDeploymentStatus,
    phase: Phase,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    if status.phase.as_ref() != Some(&phase) {
        status.last_transition_time = Some(now.to_rfc3339());
    }
    status.phase = Some(phase);
    status.message = Some(message.into());
}

/// Record the enacted weights; the pair always sums to 100
pub fn set_weights(status: &mut CanaryDeploymentStatus, canary_weight: i32) {
    status.canary_weight = canary_weight;
    status.stable_weight = 100 - canary_weight;
}

/// Upsert a condition, replacing any previous observation of the same type
pub fn set_condition(
    status: &mut CanaryDeploymentStatus,
    type_: &str,
    truthy: bool,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    let condition = Condition {
        type_: type_.to_string(),
        status: (if truthy { "True" } else { "False" }).to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: now.to_rfc3339(),
    };
    match status.conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => *existing = condition,
        None => status.conditions.push(condition),
    }
}

pub fn condition_is_true(status: &CanaryDeploymentStatus, type_: &str) -> bool {
    status
        .conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == "True")
}

pub fn condition_message(status: &CanaryDeploymentStatus, type_: &str) -> Option<String> {
    status
        .conditions
        .iter()
        .find(|c| c.type_ == type_)
        .map(|c| c.message.clone())
}

/// Dwell after enacting a step: its parsed duration, or 30 s
pub fn step_dwell(step: &TrafficStep) -> Duration {
    step.duration
        .as_deref()
        .and_then(parse_duration)
        .unwrap_or(DEFAULT_STEP_DWELL)
}

/// Whether the step holds for a human, honoring `spec.autoPromote`
pub fn step_pauses(rollout: &CanaryDeployment, step: &TrafficStep) -> bool {
    step.pause && !rollout.spec.auto_promote
}
