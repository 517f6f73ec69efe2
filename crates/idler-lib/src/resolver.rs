//! Endpoint address to top-level controller resolution
//!
//! Walks a fixed two-hop ownership chain: endpoint address → pod → the
//! pod's controlling owner → (optionally) that controller's own controlling
//! owner. The extra hop covers platforms that interpose exactly one
//! generated controller between the pod and the user-facing scalable object,
//! e.g. a DeploymentConfig driving a ReplicationController.

use std::collections::{HashMap, HashSet};

use k8s_openapi::api::core::v1::{Endpoints, Pod};
use kube::core::DynamicObject;
use tracing::debug;

use crate::error::{Error, Result};
use crate::refs::{
    controller_of, cross_group_ref, NamespacedCrossGroupObjectReference, NamespacedOwnerRef,
};
use crate::store::ObjectStore;

/// Resolves the scalable controllers behind endpoint addresses, memoizing
/// pod and controller lookups for the duration of one run. A pod referenced
/// from several endpoint subsets is fetched once, keyed by its raw object
/// reference rather than by endpoint.
pub struct ControllerResolver<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    pods: HashMap<(String, String), Option<Pod>>,
    controllers: HashMap<NamespacedOwnerRef, Option<DynamicObject>>,
}

impl<'a, S: ObjectStore + ?Sized> ControllerResolver<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            pods: HashMap::new(),
            controllers: HashMap::new(),
        }
    }

    /// Compute the deduplicated set of top-level controller references for
    /// every pod an Endpoints object routes to. Two pods owned by the same
    /// controller collapse to a single entry.
    pub async fn scalable_resources_for(
        &mut self,
        endpoints: &Endpoints,
    ) -> Result<HashSet<NamespacedCrossGroupObjectReference>> {
        let endpoints_namespace = endpoints.metadata.namespace.clone().unwrap_or_default();

        // First, the pods the endpoint addresses point at. A missing pod is
        // a tolerable absence: the endpoint just lags behind reality.
        let mut pod_refs: HashMap<(String, String), Pod> = HashMap::new();
        for subset in endpoints.subsets.iter().flatten() {
            for address in subset.addresses.iter().flatten() {
                let Some(target) = address.target_ref.as_ref() else {
                    continue;
                };
                if target.kind.as_deref() != Some("Pod") {
                    continue;
                }
                let Some(name) = target.name.clone() else {
                    continue;
                };
                let namespace = target
                    .namespace
                    .clone()
                    .unwrap_or_else(|| endpoints_namespace.clone());

                if let Some(pod) = self.pod(&namespace, &name).await? {
                    pod_refs.insert((namespace, name), pod);
                }
            }
        }

        // Then the immediate controllers of those pods. A pod without a
        // creator cannot be idled, so that is a hard error.
        let mut immediate: HashSet<NamespacedOwnerRef> = HashSet::new();
        for ((namespace, name), pod) in &pod_refs {
            let owner = controller_of(&pod.metadata).ok_or_else(|| Error::NoController {
                namespace: namespace.clone(),
                name: name.clone(),
            })?;
            immediate.insert(NamespacedOwnerRef::from_owner(namespace, owner));
        }

        // Finally the controllers themselves, following one more ownership
        // hop when the fetched controller is itself owned.
        let mut resolved: HashSet<NamespacedCrossGroupObjectReference> = HashSet::new();
        for owner in immediate {
            let Some(controller) = self.controller(&owner).await? else {
                continue;
            };

            let reference = match controller_of(&controller.metadata) {
                Some(parent) => cross_group_ref(parent),
                None => owner.to_cross_group(),
            };
            debug!(
                namespace = %owner.namespace,
                immediate = %owner.name,
                scale_target = %reference,
                "resolved scalable resource"
            );
            resolved.insert(NamespacedCrossGroupObjectReference {
                reference,
                namespace: owner.namespace.clone(),
            });
        }

        Ok(resolved)
    }

    async fn pod(&mut self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let key = (namespace.to_string(), name.to_string());
        if let Some(pod) = self.pods.get(&key) {
            return Ok(pod.clone());
        }

        let pod = self
            .store
            .get_pod(namespace, name)
            .await
            .map_err(|source| Error::Pod {
                namespace: namespace.to_string(),
                name: name.to_string(),
                source: Box::new(source),
            })?;

        self.pods.insert(key, pod.clone());
        Ok(pod)
    }

    async fn controller(&mut self, owner: &NamespacedOwnerRef) -> Result<Option<DynamicObject>> {
        if let Some(controller) = self.controllers.get(owner) {
            return Ok(controller.clone());
        }

        let controller =
            self.store
                .get_controller(owner)
                .await
                .map_err(|source| Error::Controller {
                    kind: owner.kind.clone(),
                    name: owner.name.clone(),
                    source: Box::new(source),
                })?;

        self.controllers.insert(owner.clone(), controller.clone());
        Ok(controller)
    }
}
