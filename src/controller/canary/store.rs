//! Write access to CanaryDeployment objects
//!
//! The rollout object is the engine's only state, so everything the engine
//! persists goes through this trait: status patches, consumption of intent
//! annotations, and finalizer management. Production talks to the cluster;
//! tests use an in-memory store that records every write.

use crate::crd::canary::{CanaryDeployment, CanaryDeploymentStatus, FINALIZER};
use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;

#[async_trait]
pub trait RolloutStore: Send + Sync {
    /// Patch the status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CanaryDeploymentStatus,
    ) -> Result<(), kube::Error>;

    /// Remove an intent annotation (consume it)
    async fn clear_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<(), kube::Error>;

    /// Add the cleanup finalizer if it is not present yet
    async fn ensure_finalizer(&self, rollout: &CanaryDeployment) -> Result<(), kube::Error>;

    /// Drop the cleanup finalizer, letting the object disappear
    async fn remove_finalizer(&self, rollout: &CanaryDeployment) -> Result<(), kube::Error>;
}

/// Cluster-backed rollout store
#[derive(Clone)]
pub struct KubeRolloutStore {
    client: kube::Client,
}

impl KubeRolloutStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<CanaryDeployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl RolloutStore for KubeRolloutStore {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CanaryDeploymentStatus,
    ) -> Result<(), kube::Error> {
        self.api(namespace)
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Merge(&serde_json::json!({ "status": status })),
            )
            .await?;
        Ok(())
    }

    async fn clear_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<(), kube::Error> {
        self.api(namespace)
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(&serde_json::json!({
                    "metadata": {
                        "annotations": {
                            key: serde_json::Value::Null
                        }
                    }
                })),
            )
            .await?;
        Ok(())
    }

    async fn ensure_finalizer(&self, rollout: &CanaryDeployment) -> Result<(), kube::Error> {
        let mut finalizers = rollout.finalizers().to_vec();
        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        finalizers.push(FINALIZER.to_string());

        let namespace = rollout.namespace().unwrap_or_default();
        self.api(&namespace)
            .patch(
                &rollout.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&serde_json::json!({
                    "metadata": { "finalizers": finalizers }
                })),
            )
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, rollout: &CanaryDeployment) -> Result<(), kube::Error> {
        let finalizers: Vec<String> = rollout
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();

        let namespace = rollout.namespace().unwrap_or_default();
        self.api(&namespace)
            .patch(
                &rollout.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&serde_json::json!({
                    "metadata": { "finalizers": finalizers }
                })),
            )
            .await?;
        Ok(())
    }
}

/// In-memory rollout store for tests
///
/// Keeps the full status history and the list of consumed annotations so
/// multi-tick scenario tests can replay engine effects onto the object.
#[cfg(test)]
#[derive(Default)]
pub struct MockRolloutStore {
    statuses: std::sync::Mutex<Vec<CanaryDeploymentStatus>>,
    cleared_annotations: std::sync::Mutex<Vec<String>>,
    finalized: std::sync::Mutex<bool>,
    status_errors: std::sync::Mutex<Vec<kube::core::ErrorResponse>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockRolloutStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_status(&self) -> Option<CanaryDeploymentStatus> {
        self.statuses
            .lock()
            .expect("MockRolloutStore lock poisoned")
            .last()
            .cloned()
    }

    pub fn status_write_count(&self) -> usize {
        self.statuses
            .lock()
            .expect("MockRolloutStore lock poisoned")
            .len()
    }

    /// Annotations consumed since the last call, in order
    pub fn take_cleared_annotations(&self) -> Vec<String> {
        std::mem::take(
            &mut *self
                .cleared_annotations
                .lock()
                .expect("MockRolloutStore lock poisoned"),
        )
    }

    pub fn has_finalizer(&self) -> bool {
        *self.finalized.lock().expect("MockRolloutStore lock poisoned")
    }

    pub fn fail_next_status_patch(&self, code: u16, reason: &str) {
        self.status_errors
            .lock()
            .expect("MockRolloutStore lock poisoned")
            .push(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: reason.to_string(),
                reason: reason.to_string(),
                code,
            });
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::expect_used)]
impl RolloutStore for MockRolloutStore {
    async fn patch_status(
        &self,
        _namespace: &str,
        _name: &str,
        status: &CanaryDeploymentStatus,
    ) -> Result<(), kube::Error> {
        if let Some(err) = self
            .status_errors
            .lock()
            .expect("MockRolloutStore lock poisoned")
            .pop()
        {
            return Err(kube::Error::Api(err));
        }
        self.statuses
            .lock()
            .expect("MockRolloutStore lock poisoned")
            .push(status.clone());
        Ok(())
    }

    async fn clear_annotation(
        &self,
        _namespace: &str,
        _name: &str,
        key: &str,
    ) -> Result<(), kube::Error> {
        self.cleared_annotations
            .lock()
            .expect("MockRolloutStore lock poisoned")
            .push(key.to_string());
        Ok(())
    }

    async fn ensure_finalizer(&self, _rollout: &CanaryDeployment) -> Result<(), kube::Error> {
        *self.finalized.lock().expect("MockRolloutStore lock poisoned") = true;
        Ok(())
    }

    async fn remove_finalizer(&self, _rollout: &CanaryDeployment) -> Result<(), kube::Error> {
        *self.finalized.lock().expect("MockRolloutStore lock poisoned") = false;
        Ok(())
    }
}
