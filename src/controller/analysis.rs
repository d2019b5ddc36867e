//! Step-health analysis against the metrics backend
//!
//! Runs once per unpaused step, immediately after the weight change. Every
//! configured criterion must hold for the step to pass; a query error is a
//! failed analysis, not a transient reconcile error — an unreachable
//! metrics backend must not let a bad canary through.

use crate::controller::clock::Clock;
use crate::controller::prometheus::MetricsQuerier;
use crate::crd::canary::{
    AnalysisPhase, AnalysisRun, CanaryDeployment, MetricResult,
};
use kube::ResourceExt;
use tracing::{debug, warn};

/// Substitute the query placeholders with the rollout's identifiers
///
/// `{{.Service}}`, `{{.CanaryService}}`, `{{.Namespace}}` and `{{.Name}}`
/// are replaced; anything else is passed through untouched.
pub fn substitute_placeholders(query: &str, rollout: &CanaryDeployment) -> String {
    let namespace = rollout.namespace().unwrap_or_default();
    query
        .replace("{{.Service}}", &rollout.spec.service.name)
        .replace("{{.CanaryService}}", &rollout.canary_service_name())
        .replace("{{.Namespace}}", &namespace)
        .replace("{{.Name}}", &rollout.name_any())
}

/// PromQL for the canary success rate: non-5xx over total, 5 m window
fn build_success_rate_query(canary_service: &str) -> String {
    format!(
        r#"sum(rate(http_requests_total{{service="{}",status!~"5.."}}[5m])) / sum(rate(http_requests_total{{service="{}"}}[5m]))"#,
        canary_service, canary_service
    )
}

/// PromQL for the canary p95 latency in milliseconds, 5 m window
fn build_latency_p95_query(canary_service: &str) -> String {
    format!(
        r#"histogram_quantile(0.95, sum(rate(http_request_duration_seconds_bucket{{service="{}"}}[5m])) by (le)) * 1000"#,
        canary_service
    )
}

fn passing_run(started_at: String, completed_at: String) -> AnalysisRun {
    AnalysisRun {
        phase: AnalysisPhase::Successful,
        success_rate: None,
        average_latency_ms: None,
        metric_results: Vec::new(),
        started_at,
        completed_at: Some(completed_at),
        passed: true,
    }
}

/// Evaluate the rollout's analysis criteria and return the verdict
///
/// With no backend configured, or no criteria declared, the verdict is an
/// unconditional pass with empty measurements. Evaluation stops at the
/// first query error; the resulting run is `Failed`.
pub async fn run_analysis(
    rollout: &CanaryDeployment,
    backend: Option<&dyn MetricsQuerier>,
    clock: &dyn Clock,
) -> AnalysisRun {
    let started_at = clock.now().to_rfc3339();

    let (analysis, backend) = match (&rollout.spec.analysis, backend) {
        (Some(analysis), Some(backend)) => {
            let has_criteria = !analysis.metrics.is_empty()
                || analysis.success_rate.unwrap_or(0.0) > 0.0
                || analysis.max_latency.unwrap_or(0.0) > 0.0;
            if !has_criteria {
                return passing_run(started_at, clock.now().to_rfc3339());
            }
            (analysis, backend)
        }
        _ => return passing_run(started_at, clock.now().to_rfc3339()),
    };

    let canary_service = rollout.canary_service_name();
    let mut metric_results = Vec::new();
    let mut success_rate = None;
    let mut average_latency_ms = None;
    let mut passed = true;

    // User-defined criteria first, in declaration order
    for criterion in &analysis.metrics {
        let expression = substitute_placeholders(&criterion.query, rollout);
        match backend.query(&expression).await {
            Ok(value) => {
                let ok = criterion.operator.compare(value, criterion.threshold);
                debug!(
                    rollout = rollout.name_any(),
                    metric = %criterion.name,
                    value,
                    threshold = criterion.threshold,
                    passed = ok,
                    "Evaluated metric criterion"
                );
                metric_results.push(MetricResult {
                    name: criterion.name.clone(),
                    value,
                    threshold: criterion.threshold,
                    passed: ok,
                });
                passed = passed && ok;
            }
            Err(e) => {
                warn!(
                    rollout = rollout.name_any(),
                    metric = %criterion.name,
                    error = %e,
                    "Metric query failed, treating analysis as failed"
                );
                passed = false;
            }
        }
        if !passed {
            break;
        }
    }

    // Built-in success-rate check
    if passed {
        if let Some(min) = analysis.success_rate.filter(|m| *m > 0.0) {
            match backend.query(&build_success_rate_query(&canary_service)).await {
                Ok(value) => {
                    success_rate = Some(value);
                    passed = value >= min;
                }
                Err(e) => {
                    warn!(
                        rollout = rollout.name_any(),
                        error = %e,
                        "Success-rate query failed, treating analysis as failed"
                    );
                    passed = false;
                }
            }
        }
    }

    // Built-in latency check
    if passed {
        if let Some(max) = analysis.max_latency.filter(|m| *m > 0.0) {
            match backend.query(&build_latency_p95_query(&canary_service)).await {
                Ok(value) => {
                    average_latency_ms = Some(value);
                    passed = value <= max;
                }
                Err(e) => {
                    warn!(
                        rollout = rollout.name_any(),
                        error = %e,
                        "Latency query failed, treating analysis as failed"
                    );
                    passed = false;
                }
            }
        }
    }

    AnalysisRun {
        phase: if passed {
            AnalysisPhase::Successful
        } else {
            AnalysisPhase::Failed
        },
        success_rate,
        average_latency_ms,
        metric_results,
        started_at,
        completed_at: Some(clock.now().to_rfc3339()),
        passed,
    }
}

/// Human wording for a failed run, used in `status.message`
pub fn failure_reason(rollout: &CanaryDeployment, run: &AnalysisRun) -> String {
    if let Some(result) = run.metric_results.iter().find(|r| !r.passed) {
        return format!(
            "metric {} measured {} against threshold {}",
            result.name, result.value, result.threshold
        );
    }

    let analysis = rollout.spec.analysis.as_ref();

    if let Some(rate) = run.success_rate {
        let min = analysis.and_then(|a| a.success_rate).unwrap_or(0.0);
        if rate < min {
            return format!("success rate {:.2} below minimum {:.2}", rate, min);
        }
    }

    if let Some(latency) = run.average_latency_ms {
        let max = analysis.and_then(|a| a.max_latency).unwrap_or(0.0);
        if latency > max {
            return format!("p95 latency {:.0}ms above maximum {:.0}ms", latency, max);
        }
    }

    "metrics backend query failed".to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::controller::clock::MockClock;
    use crate::controller::prometheus::{MockMetricsBackend, PrometheusError};
    use crate::crd::canary::{
        AnalysisSpec, CanaryDeploymentSpec, ComparisonOperator, GatewayRef, MetricCriterion,
        ServiceRef, TargetRef,
    };
    use chrono::Utc;
    use kube::api::ObjectMeta;

    fn rollout_with_analysis(analysis: Option<AnalysisSpec>) -> CanaryDeployment {
        CanaryDeployment {
            metadata: ObjectMeta {
                name: Some("checkout".to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            spec: CanaryDeploymentSpec {
                target_ref: TargetRef {
                    api_version: "apps/v1".to_string(),
                    kind: "Deployment".to_string(),
                    name: "checkout".to_string(),
                },
                service: ServiceRef {
                    name: "checkout".to_string(),
                    port: 80,
                },
                gateway: GatewayRef {
                    http_route: "checkout-route".to_string(),
                    gateway: None,
                    namespace: None,
                },
                traffic_split: vec![],
                analysis,
                auto_promote: false,
                skip_analysis: false,
            },
            status: None,
        }
    }

    fn criterion(name: &str, op: ComparisonOperator, threshold: f64) -> MetricCriterion {
        MetricCriterion {
            name: name.to_string(),
            query: r#"rate(errors{service="{{.CanaryService}}"}[5m])"#.to_string(),
            threshold,
            operator: op,
        }
    }

    #[test]
    fn placeholders_are_substituted() {
        let rollout = rollout_with_analysis(None);
        let query = substitute_placeholders(
            "{{.Service}} {{.CanaryService}} {{.Namespace}} {{.Name}}",
            &rollout,
        );
        assert_eq!(query, "checkout checkout-canary shop checkout");
    }

    #[tokio::test]
    async fn no_backend_is_an_unconditional_pass() {
        let rollout = rollout_with_analysis(Some(AnalysisSpec {
            metrics: vec![criterion("error-rate", ComparisonOperator::LessThan, 0.05)],
            success_rate: Some(0.99),
            max_latency: None,
            analysis_interval: None,
        }));
        let clock = MockClock::new(Utc::now());

        let run = run_analysis(&rollout, None, &clock).await;

        assert!(run.passed);
        assert_eq!(run.phase, AnalysisPhase::Successful);
        assert!(run.metric_results.is_empty());
    }

    #[tokio::test]
    async fn empty_criteria_issue_no_queries() {
        let rollout = rollout_with_analysis(Some(AnalysisSpec {
            metrics: vec![],
            success_rate: None,
            max_latency: None,
            analysis_interval: None,
        }));
        let backend = MockMetricsBackend::new();
        let clock = MockClock::new(Utc::now());

        let run = run_analysis(&rollout, Some(&backend), &clock).await;

        assert!(run.passed);
        assert!(backend.executed_queries().is_empty());
    }

    #[tokio::test]
    async fn user_criterion_pass_and_fail() {
        let rollout = rollout_with_analysis(Some(AnalysisSpec {
            metrics: vec![criterion("error-rate", ComparisonOperator::LessThan, 0.05)],
            success_rate: None,
            max_latency: None,
            analysis_interval: None,
        }));
        let clock = MockClock::new(Utc::now());

        let backend = MockMetricsBackend::new();
        backend.enqueue_value(0.01);
        let run = run_analysis(&rollout, Some(&backend), &clock).await;
        assert!(run.passed);
        assert_eq!(run.metric_results.len(), 1);
        assert!(run.metric_results[0].passed);

        let backend = MockMetricsBackend::new();
        backend.enqueue_value(0.20);
        let run = run_analysis(&rollout, Some(&backend), &clock).await;
        assert!(!run.passed);
        assert_eq!(run.phase, AnalysisPhase::Failed);
        assert!(!run.metric_results[0].passed);
    }

    #[tokio::test]
    async fn success_rate_below_minimum_fails() {
        let rollout = rollout_with_analysis(Some(AnalysisSpec {
            metrics: vec![],
            success_rate: Some(0.99),
            max_latency: None,
            analysis_interval: None,
        }));
        let backend = MockMetricsBackend::new();
        backend.enqueue_value(0.80);
        let clock = MockClock::new(Utc::now());

        let run = run_analysis(&rollout, Some(&backend), &clock).await;

        assert!(!run.passed);
        assert_eq!(run.success_rate, Some(0.80));

        let reason = failure_reason(&rollout, &run);
        assert!(reason.contains("success rate"), "got: {}", reason);

        // The standard query targets the canary service
        let queries = backend.executed_queries();
        assert!(queries[0].contains("checkout-canary"));
        assert!(queries[0].contains("[5m]"));
    }

    #[tokio::test]
    async fn latency_above_maximum_fails() {
        let rollout = rollout_with_analysis(Some(AnalysisSpec {
            metrics: vec![],
            success_rate: None,
            max_latency: Some(250.0),
            analysis_interval: None,
        }));
        let backend = MockMetricsBackend::new();
        backend.enqueue_value(412.0);
        let clock = MockClock::new(Utc::now());

        let run = run_analysis(&rollout, Some(&backend), &clock).await;

        assert!(!run.passed);
        assert_eq!(run.average_latency_ms, Some(412.0));
        assert!(failure_reason(&rollout, &run).contains("latency"));
    }

    #[tokio::test]
    async fn query_error_is_a_failed_analysis() {
        let rollout = rollout_with_analysis(Some(AnalysisSpec {
            metrics: vec![],
            success_rate: Some(0.99),
            max_latency: None,
            analysis_interval: None,
        }));
        let backend = MockMetricsBackend::new();
        backend.enqueue_error(PrometheusError::HttpError("connection refused".to_string()));
        let clock = MockClock::new(Utc::now());

        let run = run_analysis(&rollout, Some(&backend), &clock).await;

        assert!(!run.passed);
        assert_eq!(run.phase, AnalysisPhase::Failed);
        assert_eq!(
            failure_reason(&rollout, &run),
            "metrics backend query failed"
        );
    }

    #[tokio::test]
    async fn all_checks_must_pass() {
        let rollout = rollout_with_analysis(Some(AnalysisSpec {
            metrics: vec![criterion("error-rate", ComparisonOperator::LessThan, 0.05)],
            success_rate: Some(0.95),
            max_latency: Some(300.0),
            analysis_interval: None,
        }));
        let backend = MockMetricsBackend::new();
        backend.enqueue_value(0.01); // criterion: pass
        backend.enqueue_value(0.99); // success rate: pass
        backend.enqueue_value(120.0); // latency: pass
        let clock = MockClock::new(Utc::now());

        let run = run_analysis(&rollout, Some(&backend), &clock).await;

        assert!(run.passed);
        assert_eq!(run.success_rate, Some(0.99));
        assert_eq!(run.average_latency_ms, Some(120.0));
        assert_eq!(backend.executed_queries().len(), 3);
    }
}
