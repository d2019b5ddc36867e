use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation prefix for author intents. The controller consumes (removes)
/// each annotation in the reconcile that acts on it.
pub const ANNOTATION_PAUSE: &str = "gateway-cd.io/pause";
pub const ANNOTATION_RESUME: &str = "gateway-cd.io/resume";
pub const ANNOTATION_ABORT: &str = "gateway-cd.io/abort";
pub const ANNOTATION_PROMOTE: &str = "gateway-cd.io/promote";

/// Finalizer that keeps the object around until the HTTPRoute has been
/// reset to 100% stable.
pub const FINALIZER: &str = "gateway-cd.io/cleanup";

/// Suffix appended to the stable service name to locate the canary service.
pub const CANARY_SUFFIX: &str = "-canary";

/// CanaryDeployment declares a progressive rollout of a workload behind a
/// Gateway API HTTPRoute.
///
/// The spec is author-owned; the status is written only by the controller.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "gateway-cd.io",
    version = "v1alpha1",
    kind = "CanaryDeployment",
    namespaced,
    status = "CanaryDeploymentStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Step", "type":"integer", "jsonPath":".status.currentStep"}"#,
    printcolumn = r#"{"name":"Weight", "type":"integer", "jsonPath":".status.canaryWeight"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct CanaryDeploymentSpec {
    /// Reference to the workload being rolled out. Carried for provenance;
    /// the controller never reads the workload itself.
    #[serde(rename = "targetRef")]
    pub target_ref: TargetRef,

    /// The stable service. The canary service is `<name>-canary` on the
    /// same port; the deployment pipeline must provision it accordingly.
    pub service: ServiceRef,

    /// Locates the HTTPRoute whose backend weights are rewritten.
    pub gateway: GatewayRef,

    /// Ordered traffic-weight steps the rollout progresses through.
    #[serde(rename = "trafficSplit", default)]
    pub traffic_split: Vec<TrafficStep>,

    /// Health criteria evaluated between steps. Absent means every step
    /// passes unconditionally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisSpec>,

    /// Treat `pause: true` steps as unpaused: the rollout flows through
    /// them after their dwell instead of waiting for a resume.
    #[serde(rename = "autoPromote", default)]
    pub auto_promote: bool,

    /// Skip analysis entirely; the analyzer is never invoked.
    #[serde(rename = "skipAnalysis", default)]
    pub skip_analysis: bool,
}

/// Workload identifier tuple
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct TargetRef {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

/// Stable service reference
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct ServiceRef {
    pub name: String,

    /// Service port (default: 80)
    #[serde(default = "default_service_port")]
    pub port: i32,
}

fn default_service_port() -> i32 {
    80
}

/// HTTPRoute reference
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct GatewayRef {
    /// Name of the HTTPRoute to manipulate
    #[serde(rename = "httpRoute")]
    pub http_route: String,

    /// Name of the Gateway the route is attached to (informational)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    /// Namespace of the HTTPRoute. Defaults to the rollout's own namespace.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// One traffic-weight step
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct TrafficStep {
    /// Percentage of traffic routed to the canary (0-100)
    pub weight: i32,

    /// Dwell time after enacting this step (e.g. "30s", "5m").
    /// Missing or unparseable falls back to 30s.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    /// Hold at this step until a resume/promote/abort intent arrives
    #[serde(default)]
    pub pause: bool,
}

/// Health criteria evaluated after each unpaused step
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct AnalysisSpec {
    /// User-defined metric criteria, each a PromQL query with placeholders
    #[serde(default)]
    pub metrics: Vec<MetricCriterion>,

    /// Minimum acceptable canary success rate in [0,1]. Zero disables the
    /// built-in success-rate check.
    #[serde(rename = "successRate", skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,

    /// Maximum acceptable canary p95 latency in milliseconds. Zero disables
    /// the built-in latency check.
    #[serde(rename = "maxLatency", skip_serializing_if = "Option::is_none")]
    pub max_latency: Option<f64>,

    /// Reserved for windowed sampling within a step; accepted but the
    /// analyzer currently runs once per step.
    #[serde(rename = "analysisInterval", skip_serializing_if = "Option::is_none")]
    pub analysis_interval: Option<String>,
}

/// A named metric criterion
///
/// The query may reference `{{.Service}}`, `{{.CanaryService}}`,
/// `{{.Namespace}}` and `{{.Name}}`; the analyzer substitutes them before
/// executing the query.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct MetricCriterion {
    pub name: String,
    pub query: String,
    pub threshold: f64,
    pub operator: ComparisonOperator,
}

/// Comparison operator for metric criteria
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ComparisonOperator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

impl ComparisonOperator {
    /// Evaluate `value <op> threshold`
    pub fn compare(&self, value: f64, threshold: f64) -> bool {
        match self {
            ComparisonOperator::GreaterThan => value > threshold,
            ComparisonOperator::GreaterOrEqual => value >= threshold,
            ComparisonOperator::LessThan => value < threshold,
            ComparisonOperator::LessOrEqual => value <= threshold,
            ComparisonOperator::Equal => value == threshold,
            ComparisonOperator::NotEqual => value != threshold,
        }
    }
}

/// Phase of a CanaryDeployment
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    /// Observed but not yet validated
    #[default]
    Pending,
    /// Actively stepping through the traffic split
    Progressing,
    /// Holding at a step, waiting for an author intent
    Paused,
    /// 100% of traffic on the canary; terminal
    Succeeded,
    /// Rolled back or rejected; terminal
    Failed,
    /// Resetting the route to 100% stable
    RollingBack,
}

impl Phase {
    /// Terminal phases are never left and never written to again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }
}

/// Verdict of one analyzer invocation
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum AnalysisPhase {
    Running,
    Successful,
    Failed,
}

/// Result of a single metric criterion
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct MetricResult {
    pub name: String,
    pub value: f64,
    pub threshold: f64,
    pub passed: bool,
}

/// A single invocation of the analyzer, captured into status
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct AnalysisRun {
    pub phase: AnalysisPhase,

    /// Measured canary success rate, when the built-in check ran
    #[serde(rename = "successRate", skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,

    /// Measured canary latency in milliseconds, when the built-in check ran
    #[serde(rename = "averageLatencyMs", skip_serializing_if = "Option::is_none")]
    pub average_latency_ms: Option<f64>,

    /// Per-criterion results for user-defined metrics
    #[serde(rename = "metricResults", default, skip_serializing_if = "Vec::is_empty")]
    pub metric_results: Vec<MetricResult>,

    /// RFC3339 timestamps
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,

    /// Conjunction of every individual check
    pub passed: bool,
}

/// Structured observation for external consumers
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    /// "True" or "False"
    pub status: String,

    pub reason: String,
    pub message: String,

    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: String,
}

/// Status of a CanaryDeployment. Written only by the controller.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct CanaryDeploymentStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    /// Index of the next step to enact; equals `len(trafficSplit)` once the
    /// rollout has succeeded.
    #[serde(rename = "currentStep", default)]
    pub current_step: i32,

    /// Last enacted canary weight. Always sums to 100 with `stableWeight`.
    #[serde(rename = "canaryWeight", default)]
    pub canary_weight: i32,

    #[serde(rename = "stableWeight", default = "default_stable_weight")]
    pub stable_weight: i32,

    /// One-line description of the last transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC3339 timestamp of the last phase change
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Verdict of the most recent analyzer invocation
    #[serde(rename = "analysisRun", skip_serializing_if = "Option::is_none")]
    pub analysis_run: Option<AnalysisRun>,

    /// Structured observations for external consumers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

fn default_stable_weight() -> i32 {
    100
}

impl Default for CanaryDeploymentStatus {
    fn default() -> Self {
        Self {
            phase: None,
            current_step: 0,
            canary_weight: 0,
            stable_weight: 100,
            message: None,
            last_transition_time: None,
            analysis_run: None,
            conditions: Vec::new(),
        }
    }
}

impl CanaryDeployment {
    /// Name of the canary service, derived from the stable service
    pub fn canary_service_name(&self) -> String {
        format!("{}{}", self.spec.service.name, CANARY_SUFFIX)
    }

    /// Namespace of the HTTPRoute: `spec.gateway.namespace` when set,
    /// otherwise the rollout's own namespace.
    pub fn route_namespace(&self) -> Option<String> {
        self.spec
            .gateway
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .or_else(|| self.metadata.namespace.clone())
    }

    /// Whether the given intent annotation is present with value "true"
    pub fn has_intent(&self, key: &str) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(|value| value == "true")
            .unwrap_or(false)
    }

    /// Number of declared traffic steps
    pub fn step_count(&self) -> i32 {
        self.spec.traffic_split.len() as i32
    }
}

#[cfg(test)]
#[path = "canary_test.rs"]
mod tests;
