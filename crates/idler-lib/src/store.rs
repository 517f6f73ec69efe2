//! Collaborator interface to the cluster
//!
//! The idling flow only ever needs five operations against the apiserver,
//! captured by [`ObjectStore`] so tests can substitute an in-memory fake.
//! [`KubeStore`] is the live implementation on top of a [`kube::Client`].

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Pod};
use kube::api::{Api, Patch, PatchParams};
use kube::core::DynamicObject;
use kube::discovery::{self, ApiResource};
use kube::Client;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::refs::{CrossGroupObjectReference, EndpointId, NamespacedOwnerRef};

/// Cluster operations consumed by the idling flow.
///
/// `None` returns encode NotFound: an endpoint may legitimately point at a
/// pod that no longer exists, and an owner reference at a controller that
/// was already deleted.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a pod by namespace and name.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Fetch the object named by a (normalized) owner reference.
    async fn get_controller(&self, owner: &NamespacedOwnerRef) -> Result<Option<DynamicObject>>;

    /// Read the current replica count of a scalable resource through its
    /// scale subresource.
    async fn get_scale(
        &self,
        reference: &CrossGroupObjectReference,
        namespace: &str,
    ) -> Result<i32>;

    /// Set the desired replica count of a scalable resource, first stamping
    /// the given annotations onto the object itself.
    async fn set_scale(
        &self,
        reference: &CrossGroupObjectReference,
        namespace: &str,
        replicas: i32,
        annotations: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Merge the given annotations onto an Endpoints object. Only the listed
    /// keys are touched, so concurrent unrelated annotation changes survive.
    async fn patch_endpoints_annotations(
        &self,
        endpoint: &EndpointId,
        annotations: BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Live [`ObjectStore`] backed by the apiserver.
///
/// Group/kind discovery results are memoized for the lifetime of the store,
/// amortizing the discovery round-trip across the many controllers of the
/// same kind one run typically touches.
pub struct KubeStore {
    client: Client,
    resources: Mutex<HashMap<(String, String), ApiResource>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resources: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a group/kind pair to its preferred-version [`ApiResource`].
    async fn api_resource(&self, group: &str, kind: &str) -> Result<ApiResource> {
        let key = (group.to_string(), kind.to_string());
        if let Some(resource) = self.resources.lock().await.get(&key) {
            return Ok(resource.clone());
        }

        let apigroup = discovery::group(&self.client, group).await?;
        let (resource, _caps) = apigroup.recommended_kind(kind).ok_or_else(|| Error::Discovery {
            group: group.to_string(),
            kind: kind.to_string(),
        })?;
        debug!(group, kind, version = %resource.version, "resolved server mapping");

        self.resources.lock().await.insert(key, resource.clone());
        Ok(resource)
    }

    async fn dynamic_api(
        &self,
        group: &str,
        kind: &str,
        namespace: &str,
    ) -> Result<Api<DynamicObject>> {
        let resource = self.api_resource(group, kind).await?;
        Ok(Api::namespaced_with(self.client.clone(), namespace, &resource))
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.get_opt(name).await?)
    }

    async fn get_controller(&self, owner: &NamespacedOwnerRef) -> Result<Option<DynamicObject>> {
        let api = self
            .dynamic_api(&owner.group, &owner.kind, &owner.namespace)
            .await?;
        Ok(api.get_opt(&owner.name).await?)
    }

    async fn get_scale(
        &self,
        reference: &CrossGroupObjectReference,
        namespace: &str,
    ) -> Result<i32> {
        let api = self
            .dynamic_api(&reference.group, &reference.kind, namespace)
            .await?;
        let scale = api.get_scale(&reference.name).await?;
        Ok(scale.spec.and_then(|spec| spec.replicas).unwrap_or(0))
    }

    async fn set_scale(
        &self,
        reference: &CrossGroupObjectReference,
        namespace: &str,
        replicas: i32,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let api = self
            .dynamic_api(&reference.group, &reference.kind, namespace)
            .await?;
        let params = PatchParams::default();

        if !annotations.is_empty() {
            let patch = json!({ "metadata": { "annotations": annotations } });
            api.patch(&reference.name, &params, &Patch::Merge(&patch))
                .await?;
        }

        let scale = json!({ "spec": { "replicas": replicas } });
        api.patch_scale(&reference.name, &params, &Patch::Merge(&scale))
            .await?;
        debug!(scale_target = %reference, namespace, replicas, "updated scale");

        Ok(())
    }

    async fn patch_endpoints_annotations(
        &self,
        endpoint: &EndpointId,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &endpoint.namespace);
        let patch = json!({ "metadata": { "annotations": annotations } });
        api.patch(&endpoint.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
