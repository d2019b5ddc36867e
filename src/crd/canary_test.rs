#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity
#![allow(clippy::expect_used)]

use super::*;
use kube::CustomResourceExt;

#[test]
fn canary_deployment_deserializes_from_yaml() {
    let yaml = r#"
apiVersion: gateway-cd.io/v1alpha1
kind: CanaryDeployment
metadata:
  name: checkout
  namespace: shop
spec:
  targetRef:
    apiVersion: apps/v1
    kind: Deployment
    name: checkout
  service:
    name: checkout
    port: 8080
  gateway:
    httpRoute: checkout-route
    gateway: main-gateway
  trafficSplit:
    - weight: 10
      duration: 1m
    - weight: 50
      duration: 5m
      pause: true
    - weight: 100
  analysis:
    successRate: 0.99
    maxLatency: 500
    metrics:
      - name: error-rate
        query: sum(rate(errors{service="{{.CanaryService}}"}[5m]))
        threshold: 0.05
        operator: "<"
  autoPromote: false
  skipAnalysis: false
"#;

    let rollout: CanaryDeployment = serde_yaml::from_str(yaml).expect("should deserialize");

    assert_eq!(rollout.metadata.name.as_deref(), Some("checkout"));
    assert_eq!(rollout.spec.target_ref.kind, "Deployment");
    assert_eq!(rollout.spec.service.name, "checkout");
    assert_eq!(rollout.spec.service.port, 8080);
    assert_eq!(rollout.spec.gateway.http_route, "checkout-route");
    assert_eq!(rollout.spec.gateway.gateway.as_deref(), Some("main-gateway"));

    let steps = &rollout.spec.traffic_split;
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[0].weight, 10);
    assert_eq!(steps[0].duration.as_deref(), Some("1m"));
    assert!(!steps[0].pause, "pause defaults to false");
    assert!(steps[1].pause);
    assert_eq!(steps[2].weight, 100);
    assert!(steps[2].duration.is_none());

    let analysis = rollout.spec.analysis.unwrap();
    assert_eq!(analysis.success_rate, Some(0.99));
    assert_eq!(analysis.max_latency, Some(500.0));
    assert_eq!(analysis.metrics.len(), 1);
    assert_eq!(
        analysis.metrics[0].operator,
        ComparisonOperator::LessThan,
        "operator is parsed from its symbol"
    );
}

#[test]
fn service_port_defaults_to_80() {
    let yaml = r#"
name: checkout
"#;
    let service: ServiceRef = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(service.port, 80);
}

#[test]
fn comparison_operators_roundtrip_and_compare() {
    let cases = [
        (ComparisonOperator::GreaterThan, ">", 2.0, 1.0, true),
        (ComparisonOperator::GreaterOrEqual, ">=", 1.0, 1.0, true),
        (ComparisonOperator::LessThan, "<", 2.0, 1.0, false),
        (ComparisonOperator::LessOrEqual, "<=", 1.0, 1.0, true),
        (ComparisonOperator::Equal, "==", 1.0, 1.0, true),
        (ComparisonOperator::NotEqual, "!=", 1.0, 1.0, false),
    ];

    for (op, symbol, value, threshold, expected) in cases {
        let serialized = serde_json::to_string(&op).unwrap();
        assert_eq!(serialized, format!("\"{}\"", symbol));
        let parsed: ComparisonOperator = serde_json::from_str(&serialized).unwrap();
        assert_eq!(parsed, op);
        assert_eq!(op.compare(value, threshold), expected);
    }
}

#[test]
fn status_serializes_with_stable_field_names() {
    let status = CanaryDeploymentStatus {
        phase: Some(Phase::Progressing),
        current_step: 1,
        canary_weight: 30,
        stable_weight: 70,
        message: Some("Step 0 complete (30% canary)".to_string()),
        last_transition_time: Some("2026-01-01T00:00:00+00:00".to_string()),
        analysis_run: Some(AnalysisRun {
            phase: AnalysisPhase::Successful,
            success_rate: Some(0.997),
            average_latency_ms: None,
            metric_results: vec![MetricResult {
                name: "error-rate".to_string(),
                value: 0.01,
                threshold: 0.05,
                passed: true,
            }],
            started_at: "2026-01-01T00:00:00+00:00".to_string(),
            completed_at: Some("2026-01-01T00:00:01+00:00".to_string()),
            passed: true,
        }),
        conditions: vec![],
    };

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["currentStep"], 1);
    assert_eq!(json["canaryWeight"], 30);
    assert_eq!(json["stableWeight"], 70);
    assert_eq!(json["phase"], "Progressing");
    assert_eq!(json["analysisRun"]["successRate"], 0.997);
    assert_eq!(json["analysisRun"]["metricResults"][0]["name"], "error-rate");
    assert_eq!(json["analysisRun"]["startedAt"], "2026-01-01T00:00:00+00:00");
}

#[test]
fn default_status_weights_sum_to_100() {
    let status = CanaryDeploymentStatus::default();
    assert_eq!(status.canary_weight + status.stable_weight, 100);
    assert_eq!(status.current_step, 0);
}

#[test]
fn terminal_phases() {
    assert!(Phase::Succeeded.is_terminal());
    assert!(Phase::Failed.is_terminal());
    assert!(!Phase::Pending.is_terminal());
    assert!(!Phase::Progressing.is_terminal());
    assert!(!Phase::Paused.is_terminal());
    assert!(!Phase::RollingBack.is_terminal());
}

#[test]
fn canary_service_name_uses_suffix_convention() {
    let rollout = minimal_rollout();
    assert_eq!(rollout.canary_service_name(), "checkout-canary");
}

#[test]
fn route_namespace_defaults_to_rollout_namespace() {
    let mut rollout = minimal_rollout();
    assert_eq!(rollout.route_namespace().as_deref(), Some("shop"));

    rollout.spec.gateway.namespace = Some("gateways".to_string());
    assert_eq!(rollout.route_namespace().as_deref(), Some("gateways"));

    // Empty string behaves like unset
    rollout.spec.gateway.namespace = Some(String::new());
    assert_eq!(rollout.route_namespace().as_deref(), Some("shop"));
}

#[test]
fn intent_annotations_require_the_true_value() {
    let mut rollout = minimal_rollout();
    assert!(!rollout.has_intent(ANNOTATION_RESUME));

    rollout.metadata.annotations = Some(
        [
            (ANNOTATION_RESUME.to_string(), "true".to_string()),
            (ANNOTATION_ABORT.to_string(), "false".to_string()),
        ]
        .into_iter()
        .collect(),
    );
    assert!(rollout.has_intent(ANNOTATION_RESUME));
    assert!(!rollout.has_intent(ANNOTATION_ABORT));
    assert!(!rollout.has_intent(ANNOTATION_PROMOTE));
}

#[test]
fn crd_manifest_has_expected_identity() {
    let crd = CanaryDeployment::crd();
    assert_eq!(crd.spec.group, "gateway-cd.io");
    assert_eq!(crd.spec.names.kind, "CanaryDeployment");
    assert_eq!(crd.spec.versions.len(), 1);
    assert_eq!(crd.spec.versions[0].name, "v1alpha1");
    assert!(
        crd.spec.versions[0].subresources.as_ref().unwrap().status.is_some(),
        "status subresource must be enabled"
    );
}

fn minimal_rollout() -> CanaryDeployment {
    CanaryDeployment {
        metadata: kube::api::ObjectMeta {
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
            traffic_split: vec![TrafficStep {
                weight: 100,
                duration: None,
                pause: false,
            }],
            analysis: None,
            auto_promote: false,
            skip_analysis: false,
        },
        status: None,
    }
}
