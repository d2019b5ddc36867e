use crate::controller::analysis::{failure_reason, run_analysis};
use crate::controller::clock::Clock;
use crate::controller::prometheus::MetricsQuerier;
use crate::crd::canary::{
    CanaryDeployment, CanaryDeploymentStatus, Phase, ANNOTATION_ABORT, ANNOTATION_PAUSE,
    ANNOTATION_PROMOTE, ANNOTATION_RESUME, FINALIZER,
};
use crate::server::LeaderState;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::status::{
    condition_is_true, condition_message, pending_status, set_condition, set_weights, step_dwell,
    step_pauses, transition, COND_DEGRADED, COND_PAUSED, COND_READY, REASON_ABORTED,
    REASON_ANALYSIS_FAILED, REASON_COMPLETED, REASON_RESUMED, REASON_ROLLED_BACK,
    REASON_ROUTE_LOST, REASON_STEP_PAUSE, REASON_VALIDATION, REQUEUE_FAST, REQUEUE_POLL,
    REQUEUE_ROLLBACK_RETRY,
};
use super::store::RolloutStore;
use super::traffic::{cleanup, is_not_found, update_traffic_split, RouteStore};
use super::validation::validate_spec;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("CanaryDeployment missing namespace")]
    MissingNamespace,

    #[error("invariant violation: {0}")]
    Internal(String),
}

/// How a phase handler ended, so the self-metrics label the result
enum Outcome {
    /// The pass completed its decision
    Clean(Action),
    /// The pass hit a transient external error and is retrying
    Transient(Action),
}

/// Shared dependencies for every reconcile invocation
///
/// The engine keeps no per-rollout state here; the rollout object itself
/// is the state. Everything external sits behind a trait so the state
/// machine runs against in-memory stores in tests.
pub struct Context {
    pub rollouts: Arc<dyn RolloutStore>,
    pub routes: Arc<dyn RouteStore>,
    /// Absent means the analyzer short-circuits to pass
    pub metrics_backend: Option<Arc<dyn MetricsQuerier>>,
    pub clock: Arc<dyn Clock>,
    /// When set, reconciliation is skipped unless this replica holds the lease
    pub leader_state: Option<LeaderState>,
    /// Controller self-metrics; recorded when present
    pub metrics: Option<crate::server::SharedMetrics>,
}

impl Context {
    pub fn new(
        rollouts: Arc<dyn RolloutStore>,
        routes: Arc<dyn RouteStore>,
        metrics_backend: Option<Arc<dyn MetricsQuerier>>,
        clock: Arc<dyn Clock>,
        metrics: Option<crate::server::SharedMetrics>,
    ) -> Self {
        Context {
            rollouts,
            routes,
            metrics_backend,
            clock,
            leader_state: None,
            metrics,
        }
    }

    pub fn new_with_leader(
        rollouts: Arc<dyn RolloutStore>,
        routes: Arc<dyn RouteStore>,
        metrics_backend: Option<Arc<dyn MetricsQuerier>>,
        clock: Arc<dyn Clock>,
        leader_state: LeaderState,
        metrics: Option<crate::server::SharedMetrics>,
    ) -> Self {
        Context {
            rollouts,
            routes,
            metrics_backend,
            clock,
            leader_state: Some(leader_state),
            metrics,
        }
    }

    /// False only when leader election is on and the lease is held elsewhere
    pub fn should_reconcile(&self) -> bool {
        match &self.leader_state {
            None => true,
            Some(state) => state.is_leader(),
        }
    }

    async fn write_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CanaryDeploymentStatus,
    ) -> Result<(), ReconcileError> {
        self.rollouts.patch_status(namespace, name, status).await?;
        if let Some(metrics) = &self.metrics {
            metrics.set_canary_weight(namespace, name, status.canary_weight as i64);
        }
        Ok(())
    }

    /// Consume an intent annotation. Runs after the status write so a crash
    /// between the two at worst replays the intent, never loses it.
    async fn consume_annotation(&self, namespace: &str, name: &str, key: &str) {
        if let Err(e) = self.rollouts.clear_annotation(namespace, name, key).await {
            warn!(
                rollout = name,
                annotation = key,
                error = %e,
                "Failed to remove intent annotation (will be re-processed)"
            );
        }
    }
}

/// Reconcile one CanaryDeployment
///
/// Level-triggered: reads the object, dispatches on `status.phase`, emits
/// at most one route mutation and one status update, and requests its next
/// wake-up. The route mutation happens before the status write; status is
/// never advanced past an un-enacted weight.
pub async fn reconcile(
    rollout: Arc<CanaryDeployment>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    if !ctx.should_reconcile() {
        debug!(rollout = ?rollout.name_any(), "Skipping reconciliation - not leader");
        if let Some(metrics) = &ctx.metrics {
            metrics.record_reconciliation_skipped();
        }
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    let start_time = std::time::Instant::now();

    let namespace = rollout.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let name = rollout.name_any();
    let route_namespace = rollout.route_namespace().unwrap_or_else(|| namespace.clone());

    info!(rollout = ?name, namespace = ?namespace, "Reconciling CanaryDeployment");

    let phase = rollout
        .status
        .as_ref()
        .and_then(|s| s.phase.clone());

    let outcome = if rollout.meta().deletion_timestamp.is_some() {
        // Deletion: reset the route to 100% stable before letting go
        finalize_deletion(&rollout, &ctx, &route_namespace).await?
    } else {
        match phase {
            None => initialize(&rollout, &ctx, &namespace, &name).await?,
            Some(Phase::Pending) => {
                reconcile_pending(&rollout, &ctx, &namespace, &name, &route_namespace).await?
            }
            Some(Phase::Progressing) => {
                reconcile_progressing(&rollout, &ctx, &namespace, &name, &route_namespace).await?
            }
            Some(Phase::Paused) => reconcile_paused(&rollout, &ctx, &namespace, &name).await?,
            Some(Phase::RollingBack) => {
                reconcile_rolling_back(&rollout, &ctx, &namespace, &name, &route_namespace).await?
            }
            // Terminal: no status write, no external calls beyond the read
            Some(Phase::Succeeded) | Some(Phase::Failed) => Outcome::Clean(Action::await_change()),
        }
    };

    let action = match outcome {
        Outcome::Clean(action) => {
            if let Some(metrics) = &ctx.metrics {
                metrics.record_reconciliation_success(start_time.elapsed().as_secs_f64());
            }
            action
        }
        Outcome::Transient(action) => {
            if let Some(metrics) = &ctx.metrics {
                metrics.record_reconciliation_error();
            }
            action
        }
    };

    Ok(action)
}

/// First observation: claim the finalizer and write the Pending status
async fn initialize(
    rollout: &CanaryDeployment,
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Outcome, ReconcileError> {
    ctx.rollouts.ensure_finalizer(rollout).await?;

    let status = pending_status(ctx.clock.now());
    ctx.write_status(namespace, name, &status).await?;

    info!(rollout = ?name, "Initialized CanaryDeployment status");
    Ok(Outcome::Clean(Action::requeue(REQUEUE_FAST)))
}

/// Pending: gate on spec well-formedness and route existence
async fn reconcile_pending(
    rollout: &CanaryDeployment,
    ctx: &Context,
    namespace: &str,
    name: &str,
    route_namespace: &str,
) -> Result<Outcome, ReconcileError> {
    let now = ctx.clock.now();
    let mut status = rollout.status.clone().unwrap_or_default();

    if let Err(validation_error) = validate_spec(rollout) {
        error!(rollout = ?name, error = %validation_error, "Spec validation failed");
        transition(
            &mut status,
            Phase::Failed,
            format!("Invalid spec: {}", validation_error),
            now,
        );
        set_condition(
            &mut status,
            COND_READY,
            false,
            REASON_VALIDATION,
            &validation_error,
            now,
        );
        ctx.write_status(namespace, name, &status).await?;
        return Ok(Outcome::Clean(Action::await_change()));
    }

    // The first mutation touches the route, so its existence is part of the
    // validation gate. Workload and services may still be created later.
    match ctx
        .routes
        .get(route_namespace, &rollout.spec.gateway.http_route)
        .await
    {
        Ok(_) => {}
        Err(e) if is_not_found(&e) => {
            let message = format!(
                "HTTPRoute {}/{} not found",
                route_namespace, rollout.spec.gateway.http_route
            );
            error!(rollout = ?name, %message, "Spec validation failed");
            transition(&mut status, Phase::Failed, format!("Invalid spec: {}", message), now);
            set_condition(&mut status, COND_READY, false, REASON_VALIDATION, &message, now);
            ctx.write_status(namespace, name, &status).await?;
            return Ok(Outcome::Clean(Action::await_change()));
        }
        Err(e) => {
            warn!(rollout = ?name, error = %e, "HTTPRoute read failed, will retry");
            status.message = Some(format!("HTTPRoute read failed (will retry): {}", e));
            ctx.write_status(namespace, name, &status).await?;
            return Ok(Outcome::Transient(Action::requeue(REQUEUE_ROLLBACK_RETRY)));
        }
    }

    transition(&mut status, Phase::Progressing, "Starting rollout", now);
    ctx.write_status(namespace, name, &status).await?;

    info!(rollout = ?name, "CanaryDeployment validated, starting rollout");
    Ok(Outcome::Clean(Action::requeue(REQUEUE_FAST)))
}

/// Progressing: enact the current step, analyze it, advance
async fn reconcile_progressing(
    rollout: &CanaryDeployment,
    ctx: &Context,
    namespace: &str,
    name: &str,
    route_namespace: &str,
) -> Result<Outcome, ReconcileError> {
    let now = ctx.clock.now();
    let mut status = rollout.status.clone().unwrap_or_default();
    let total_steps = rollout.step_count();

    // Intents, in precedence order. `resume` is only meaningful while
    // Paused and is deliberately left in place here.
    if rollout.has_intent(ANNOTATION_ABORT) {
        set_condition(
            &mut status,
            COND_DEGRADED,
            true,
            REASON_ABORTED,
            "rollout aborted by author",
            now,
        );
        transition(&mut status, Phase::RollingBack, "Aborting: rolling back to stable", now);
        ctx.write_status(namespace, name, &status).await?;
        ctx.consume_annotation(namespace, name, ANNOTATION_ABORT).await;
        return Ok(Outcome::Clean(Action::requeue(REQUEUE_FAST)));
    }

    if rollout.has_intent(ANNOTATION_PROMOTE) {
        status.current_step = total_steps;
        set_condition(&mut status, COND_PAUSED, false, REASON_RESUMED, "promoted", now);
        status.message = Some("Promoted: skipping remaining steps".to_string());
        ctx.write_status(namespace, name, &status).await?;
        ctx.consume_annotation(namespace, name, ANNOTATION_PROMOTE).await;
        return Ok(Outcome::Clean(Action::requeue(Duration::ZERO)));
    }

    if status.current_step < 0 || status.current_step > total_steps {
        return Err(ReconcileError::Internal(format!(
            "currentStep {} out of bounds for {} steps",
            status.current_step, total_steps
        )));
    }

    // All steps done: make sure the route carries 100% canary, then finish
    if status.current_step == total_steps {
        if status.canary_weight != 100 {
            if let Some(outcome) = enact_weight(
                rollout, ctx, namespace, name, route_namespace, &mut status, 100, now,
            )
            .await?
            {
                return Ok(outcome);
            }
        }
        set_weights(&mut status, 100);
        transition(
            &mut status,
            Phase::Succeeded,
            "Rollout succeeded: 100% traffic to canary",
            now,
        );
        set_condition(
            &mut status,
            COND_READY,
            true,
            REASON_COMPLETED,
            "all traffic steps completed",
            now,
        );
        ctx.write_status(namespace, name, &status).await?;
        info!(rollout = ?name, "Rollout succeeded");
        return Ok(Outcome::Clean(Action::await_change()));
    }

    let step_index = status.current_step;
    let step = rollout.spec.traffic_split[step_index as usize].clone();
    let pause_intent = rollout.has_intent(ANNOTATION_PAUSE);
    let holds = step_pauses(rollout, &step) || pause_intent;

    // Returning from Paused via resume: the step's weight is already on the
    // route, so advance exactly once without re-pausing.
    if holds
        && !pause_intent
        && condition_is_true(&status, COND_PAUSED)
        && status.canary_weight == step.weight
    {
        status.current_step = step_index + 1;
        set_condition(
            &mut status,
            COND_PAUSED,
            false,
            REASON_RESUMED,
            &format!("resumed past step {}", step_index),
            now,
        );
        status.message = Some(format!("Resumed: step {} complete", step_index));
        ctx.write_status(namespace, name, &status).await?;
        return Ok(Outcome::Clean(Action::requeue(Duration::ZERO)));
    }

    // Enact the step's weight; status only moves if the route write lands
    if let Some(outcome) = enact_weight(
        rollout, ctx, namespace, name, route_namespace, &mut status, step.weight, now,
    )
    .await?
    {
        return Ok(outcome);
    }
    set_weights(&mut status, step.weight);

    if holds {
        transition(
            &mut status,
            Phase::Paused,
            format!("Paused at step {}", step_index),
            now,
        );
        set_condition(
            &mut status,
            COND_PAUSED,
            true,
            REASON_STEP_PAUSE,
            &format!("paused at step {} ({}% canary)", step_index, step.weight),
            now,
        );
        ctx.write_status(namespace, name, &status).await?;
        if pause_intent {
            ctx.consume_annotation(namespace, name, ANNOTATION_PAUSE).await;
        }
        info!(rollout = ?name, step = step_index, "Rollout paused");
        return Ok(Outcome::Clean(Action::await_change()));
    }

    // Analysis runs right after the weight change, before the dwell timer
    if !rollout.spec.skip_analysis {
        let run = run_analysis(rollout, ctx.metrics_backend.as_deref(), ctx.clock.as_ref()).await;
        let verdict_failed = !run.passed;
        let reason = verdict_failed.then(|| failure_reason(rollout, &run));
        status.analysis_run = Some(run);

        if let Some(reason) = reason {
            warn!(rollout = ?name, step = step_index, %reason, "Analysis failed, rolling back");
            set_condition(&mut status, COND_DEGRADED, true, REASON_ANALYSIS_FAILED, &reason, now);
            transition(
                &mut status,
                Phase::RollingBack,
                format!("Analysis failed: {}", reason),
                now,
            );
            ctx.write_status(namespace, name, &status).await?;
            return Ok(Outcome::Clean(Action::requeue(REQUEUE_FAST)));
        }
    }

    status.current_step = step_index + 1;
    // An annotation-pause on a non-pause step leaves the Paused condition
    // latched True after resume; a stale latch would let the skip-advance
    // guard bypass a later equal-weight pause step.
    if condition_is_true(&status, COND_PAUSED) {
        set_condition(
            &mut status,
            COND_PAUSED,
            false,
            REASON_RESUMED,
            &format!("resumed past step {}", step_index),
            now,
        );
    }
    status.message = Some(format!(
        "Step {} complete ({}% canary)",
        step_index, step.weight
    ));
    ctx.write_status(namespace, name, &status).await?;

    let dwell = step_dwell(&step);
    info!(
        rollout = ?name,
        step = step_index,
        weight = step.weight,
        dwell_secs = dwell.as_secs(),
        "Step enacted"
    );
    Ok(Outcome::Clean(Action::requeue(dwell)))
}

/// Enact a canary weight on the route
///
/// `Ok(None)` means the write landed and the caller may advance status.
/// `Ok(Some(outcome))` means the caller must return: either a transient
/// retry (status message updated, step kept) or a transition to
/// RollingBack because the route is gone mid-rollout.
#[allow(clippy::too_many_arguments)]
async fn enact_weight(
    rollout: &CanaryDeployment,
    ctx: &Context,
    namespace: &str,
    name: &str,
    route_namespace: &str,
    status: &mut CanaryDeploymentStatus,
    weight: i32,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Option<Outcome>, ReconcileError> {
    match update_traffic_split(ctx.routes.as_ref(), rollout, route_namespace, weight).await {
        Ok(()) => Ok(None),
        Err(e) if is_not_found(&e) => {
            let message = format!(
                "HTTPRoute {}/{} disappeared mid-rollout",
                route_namespace, rollout.spec.gateway.http_route
            );
            error!(rollout = ?name, %message, "Rolling back");
            set_condition(status, COND_DEGRADED, true, REASON_ROUTE_LOST, &message, now);
            transition(status, Phase::RollingBack, message, now);
            ctx.write_status(namespace, name, status).await?;
            Ok(Some(Outcome::Clean(Action::requeue(REQUEUE_FAST))))
        }
        Err(e) => {
            warn!(rollout = ?name, error = %e, "HTTPRoute update failed, will retry");
            status.message = Some(format!("HTTPRoute update failed (will retry): {}", e));
            ctx.write_status(namespace, name, status).await?;
            Ok(Some(Outcome::Transient(Action::requeue(REQUEUE_POLL))))
        }
    }
}

/// Paused: wait for an author intent
async fn reconcile_paused(
    rollout: &CanaryDeployment,
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<Outcome, ReconcileError> {
    let now = ctx.clock.now();
    let mut status = rollout.status.clone().unwrap_or_default();

    if rollout.has_intent(ANNOTATION_ABORT) {
        set_condition(
            &mut status,
            COND_DEGRADED,
            true,
            REASON_ABORTED,
            "rollout aborted by author",
            now,
        );
        transition(&mut status, Phase::RollingBack, "Aborting: rolling back to stable", now);
        ctx.write_status(namespace, name, &status).await?;
        ctx.consume_annotation(namespace, name, ANNOTATION_ABORT).await;
        info!(rollout = ?name, "Abort requested while paused");
        return Ok(Outcome::Clean(Action::requeue(REQUEUE_FAST)));
    }

    if rollout.has_intent(ANNOTATION_PROMOTE) {
        status.current_step = rollout.step_count();
        set_condition(&mut status, COND_PAUSED, false, REASON_RESUMED, "promoted", now);
        transition(
            &mut status,
            Phase::Progressing,
            "Promoted: skipping remaining steps",
            now,
        );
        ctx.write_status(namespace, name, &status).await?;
        ctx.consume_annotation(namespace, name, ANNOTATION_PROMOTE).await;
        info!(rollout = ?name, "Promote requested while paused");
        return Ok(Outcome::Clean(Action::requeue(Duration::ZERO)));
    }

    if rollout.has_intent(ANNOTATION_RESUME) {
        // Advancement past the paused step happens on the next Progressing
        // tick; the Paused condition stays True until then.
        transition(&mut status, Phase::Progressing, "Resumed by author", now);
        ctx.write_status(namespace, name, &status).await?;
        ctx.consume_annotation(namespace, name, ANNOTATION_RESUME).await;
        info!(rollout = ?name, "Resume requested while paused");
        return Ok(Outcome::Clean(Action::requeue(REQUEUE_FAST)));
    }

    debug!(rollout = ?name, "Still paused, no intent");
    Ok(Outcome::Clean(Action::requeue(REQUEUE_POLL)))
}

/// RollingBack: keep trying to reset the route until it lands
async fn reconcile_rolling_back(
    rollout: &CanaryDeployment,
    ctx: &Context,
    namespace: &str,
    name: &str,
    route_namespace: &str,
) -> Result<Outcome, ReconcileError> {
    let now = ctx.clock.now();
    let mut status = rollout.status.clone().unwrap_or_default();

    match update_traffic_split(ctx.routes.as_ref(), rollout, route_namespace, 0).await {
        Ok(()) => {
            set_weights(&mut status, 0);
            let reason = condition_message(&status, COND_DEGRADED)
                .unwrap_or_else(|| "rollout aborted".to_string());
            transition(
                &mut status,
                Phase::Failed,
                format!("Rolled back to stable: {}", reason),
                now,
            );
            set_condition(&mut status, COND_READY, false, REASON_ROLLED_BACK, &reason, now);
            ctx.write_status(namespace, name, &status).await?;
            info!(rollout = ?name, "Rollback complete, rollout failed");
            Ok(Outcome::Clean(Action::await_change()))
        }
        Err(e) => {
            // Failed is only entered after a successful reset; loop until
            // the route write clears.
            warn!(rollout = ?name, error = %e, "Rollback route update failed, will retry");
            status.message = Some(format!("Rollback HTTPRoute update failed (will retry): {}", e));
            ctx.write_status(namespace, name, &status).await?;
            Ok(Outcome::Transient(Action::requeue(REQUEUE_ROLLBACK_RETRY)))
        }
    }
}

/// Deletion: reset the route, then release the finalizer
async fn finalize_deletion(
    rollout: &CanaryDeployment,
    ctx: &Context,
    route_namespace: &str,
) -> Result<Outcome, ReconcileError> {
    let name = rollout.name_any();

    if !rollout.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(Outcome::Clean(Action::await_change()));
    }

    match cleanup(ctx.routes.as_ref(), rollout, route_namespace).await {
        Ok(()) => {}
        Err(e) if is_not_found(&e) => {
            debug!(rollout = ?name, "HTTPRoute already gone, nothing to clean up");
        }
        Err(e) => {
            warn!(rollout = ?name, error = %e, "Cleanup failed, keeping finalizer");
            return Ok(Outcome::Transient(Action::requeue(REQUEUE_ROLLBACK_RETRY)));
        }
    }

    ctx.rollouts.remove_finalizer(rollout).await?;
    info!(rollout = ?name, "Cleanup complete, finalizer removed");
    Ok(Outcome::Clean(Action::await_change()))
}
