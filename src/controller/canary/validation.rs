use crate::crd::canary::CanaryDeployment;
use std::time::Duration;

/// Validate a CanaryDeployment spec
///
/// Well-formedness only; existence of the referenced route is checked
/// separately by the reconciler because it needs the cluster.
///
/// Rules:
/// - `service.name` must not be empty
/// - `gateway.httpRoute` must not be empty
/// - `trafficSplit` must have at least one step
/// - every step weight must be 0-100, non-decreasing across steps
/// - `analysis.successRate` must be within [0,1], `analysis.maxLatency` >= 0
pub fn validate_spec(rollout: &CanaryDeployment) -> Result<(), String> {
    if rollout.spec.service.name.is_empty() {
        return Err("spec.service.name cannot be empty".to_string());
    }

    if rollout.spec.gateway.http_route.is_empty() {
        return Err("spec.gateway.httpRoute cannot be empty".to_string());
    }

    let steps = &rollout.spec.traffic_split;
    if steps.is_empty() {
        return Err("spec.trafficSplit must have at least one step".to_string());
    }

    let mut previous = 0;
    for (i, step) in steps.iter().enumerate() {
        if !(0..=100).contains(&step.weight) {
            return Err(format!(
                "spec.trafficSplit[{}].weight must be 0-100, got {}",
                i, step.weight
            ));
        }
        if step.weight < previous {
            return Err(format!(
                "spec.trafficSplit[{}].weight {} decreases from previous step's {}",
                i, step.weight, previous
            ));
        }
        previous = step.weight;
    }

    if let Some(analysis) = &rollout.spec.analysis {
        if let Some(rate) = analysis.success_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(format!(
                    "spec.analysis.successRate must be within [0,1], got {}",
                    rate
                ));
            }
        }
        if let Some(latency) = analysis.max_latency {
            if latency < 0.0 {
                return Err(format!(
                    "spec.analysis.maxLatency must be >= 0, got {}",
                    latency
                ));
            }
        }
    }

    Ok(())
}

/// Parse a human duration like "30s", "5m", "2h" into std::time::Duration
///
/// Zero and out-of-range values are rejected:
/// - seconds up to 24h (86400s)
/// - minutes up to 24h (1440m)
/// - hours up to one week (168h)
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let duration_str = duration_str.trim();

    if duration_str.is_empty() {
        return None;
    }

    let unit = duration_str.chars().last()?;
    let number: u64 = duration_str[..duration_str.len() - 1].parse().ok()?;

    if number == 0 {
        return None;
    }

    match unit {
        's' if number <= 86_400 => Some(Duration::from_secs(number)),
        'm' if number <= 1_440 => number.checked_mul(60).map(Duration::from_secs),
        'h' if number <= 168 => number.checked_mul(3_600).map(Duration::from_secs),
        _ => None,
    }
}
