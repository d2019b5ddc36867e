//! HTTPRoute backend-weight mutation
//!
//! Stateless: given a desired canary weight, rewrite the referenced route
//! so the stable backend receives `100 - w` and the canary backend `w`.
//! Only `backendRefs` are touched; match predicates and everything else on
//! the route are preserved. Retry policy belongs to the reconciler, so
//! errors propagate verbatim.

use crate::crd::canary::CanaryDeployment;
use async_trait::async_trait;
use gateway_api::apis::standard::httproutes::{HTTPRoute, HTTPRouteRulesBackendRefs};
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use tracing::info;

/// Read/write access to HTTPRoute objects
///
/// Production uses the cluster via `KubeRouteStore`; tests use an
/// in-memory store.
#[async_trait]
pub trait RouteStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<HTTPRoute, kube::Error>;
    async fn update(&self, namespace: &str, route: &HTTPRoute) -> Result<(), kube::Error>;
}

/// Cluster-backed route store
#[derive(Clone)]
pub struct KubeRouteStore {
    client: kube::Client,
}

impl KubeRouteStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RouteStore for KubeRouteStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<HTTPRoute, kube::Error> {
        let api: Api<HTTPRoute> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await
    }

    async fn update(&self, namespace: &str, route: &HTTPRoute) -> Result<(), kube::Error> {
        let api: Api<HTTPRoute> = Api::namespaced(self.client.clone(), namespace);
        // replace() carries the fetched resourceVersion, so a concurrent
        // writer surfaces as a 409 conflict for the reconciler to retry
        api.replace(&route.name_any(), &PostParams::default(), route)
            .await?;
        Ok(())
    }
}

/// True when the error is a 404 from the API server
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(e) if e.code == 404)
}

/// Build the weighted backend pair for a canary weight
///
/// - `w == 0`: only the stable backend (no canary entry)
/// - `w == 100`: only the canary backend (no stable entry)
/// - otherwise: stable first, then canary
pub fn build_backend_refs(
    rollout: &CanaryDeployment,
    canary_weight: i32,
) -> Vec<HTTPRouteRulesBackendRefs> {
    let port = rollout.spec.service.port;

    let stable = HTTPRouteRulesBackendRefs {
        name: rollout.spec.service.name.clone(),
        port: Some(port),
        weight: Some(100 - canary_weight),
        kind: Some("Service".to_string()),
        group: Some(String::new()),
        namespace: None,
        filters: None,
    };
    let canary = HTTPRouteRulesBackendRefs {
        name: rollout.canary_service_name(),
        port: Some(port),
        weight: Some(canary_weight),
        kind: Some("Service".to_string()),
        group: Some(String::new()),
        namespace: None,
        filters: None,
    };

    match canary_weight {
        0 => vec![HTTPRouteRulesBackendRefs {
            weight: Some(100),
            ..stable
        }],
        100 => vec![canary],
        _ => vec![stable, canary],
    }
}

/// Rewrite every rule's backendRefs to the given pair
///
/// All rules of the route receive the same split. A rule with no match
/// predicate is match-all; predicates are left untouched either way.
pub fn apply_traffic_split(route: &mut HTTPRoute, refs: &[HTTPRouteRulesBackendRefs]) {
    if let Some(rules) = route.spec.rules.as_mut() {
        for rule in rules.iter_mut() {
            rule.backend_refs = Some(refs.to_vec());
        }
    }
}

/// Point `canary_weight`% of the route's traffic at the canary service
///
/// Reads the referenced route, rewrites the weights, and writes it back.
/// Route-not-found and write conflicts propagate to the caller.
pub async fn update_traffic_split(
    routes: &dyn RouteStore,
    rollout: &CanaryDeployment,
    namespace: &str,
    canary_weight: i32,
) -> Result<(), kube::Error> {
    let route_name = &rollout.spec.gateway.http_route;

    let mut route = routes.get(namespace, route_name).await?;
    let refs = build_backend_refs(rollout, canary_weight);
    apply_traffic_split(&mut route, &refs);
    routes.update(namespace, &route).await?;

    info!(
        rollout = rollout.name_any(),
        httproute = %route_name,
        canary_weight,
        stable_weight = 100 - canary_weight,
        "HTTPRoute weights updated"
    );
    Ok(())
}

/// Reset the route to 100% stable; used on rollback and deletion
pub async fn cleanup(
    routes: &dyn RouteStore,
    rollout: &CanaryDeployment,
    namespace: &str,
) -> Result<(), kube::Error> {
    update_traffic_split(routes, rollout, namespace, 0).await
}

/// In-memory route store for tests
///
/// Records every written route so tests can assert the exact sequence of
/// canary weights, and supports injecting errors for get/update.
#[cfg(test)]
#[derive(Default)]
pub struct MockRouteStore {
    routes: std::sync::Mutex<std::collections::HashMap<(String, String), HTTPRoute>>,
    writes: std::sync::Mutex<Vec<HTTPRoute>>,
    get_errors: std::sync::Mutex<Vec<kube::core::ErrorResponse>>,
    update_errors: std::sync::Mutex<Vec<kube::core::ErrorResponse>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockRouteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, namespace: &str, route: HTTPRoute) {
        let name = route.name_any();
        self.routes
            .lock()
            .expect("MockRouteStore lock poisoned")
            .insert((namespace.to_string(), name), route);
    }

    pub fn route(&self, namespace: &str, name: &str) -> Option<HTTPRoute> {
        self.routes
            .lock()
            .expect("MockRouteStore lock poisoned")
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Canary weight of each write, in order. A write with no canary
    /// backend counts as weight 0.
    pub fn written_canary_weights(&self) -> Vec<i32> {
        self.writes
            .lock()
            .expect("MockRouteStore lock poisoned")
            .iter()
            .map(|route| {
                route
                    .spec
                    .rules
                    .as_ref()
                    .and_then(|rules| rules.first())
                    .and_then(|rule| rule.backend_refs.as_ref())
                    .and_then(|refs| {
                        refs.iter()
                            .find(|r| r.name.ends_with("-canary"))
                            .and_then(|r| r.weight)
                    })
                    .unwrap_or(0)
            })
            .collect()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().expect("MockRouteStore lock poisoned").len()
    }

    /// Make the next `get` fail with the given API error
    pub fn fail_next_get(&self, code: u16, reason: &str) {
        self.get_errors
            .lock()
            .expect("MockRouteStore lock poisoned")
            .push(api_error(code, reason));
    }

    /// Make the next `update` fail with the given API error
    pub fn fail_next_update(&self, code: u16, reason: &str) {
        self.update_errors
            .lock()
            .expect("MockRouteStore lock poisoned")
            .push(api_error(code, reason));
    }
}

#[cfg(test)]
fn api_error(code: u16, reason: &str) -> kube::core::ErrorResponse {
    kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::expect_used)]
impl RouteStore for MockRouteStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<HTTPRoute, kube::Error> {
        if let Some(err) = self
            .get_errors
            .lock()
            .expect("MockRouteStore lock poisoned")
            .pop()
        {
            return Err(kube::Error::Api(err));
        }
        self.route(namespace, name)
            .ok_or_else(|| kube::Error::Api(api_error(404, "NotFound")))
    }

    async fn update(&self, namespace: &str, route: &HTTPRoute) -> Result<(), kube::Error> {
        if let Some(err) = self
            .update_errors
            .lock()
            .expect("MockRouteStore lock poisoned")
            .pop()
        {
            return Err(kube::Error::Api(err));
        }
        self.insert(namespace, route.clone());
        self.writes
            .lock()
            .expect("MockRouteStore lock poisoned")
            .push(route.clone());
        Ok(())
    }
}
