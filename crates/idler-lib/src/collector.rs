//! Aggregation of scale targets across a set of endpoints
//!
//! For every Endpoints object this resolves the backing controllers and
//! builds the two indexes the orchestrator works from: per-endpoint state
//! and the reverse map from controller reference to the endpoint claiming
//! it. Resolution failures are collected per endpoint; whatever resolved
//! successfully is still returned.

use std::collections::{BTreeMap, HashMap, HashSet};

use k8s_openapi::api::core::v1::Endpoints;
use tracing::warn;

use crate::error::Error;
use crate::refs::{CrossGroupObjectReference, EndpointId, NamespacedCrossGroupObjectReference};
use crate::resolver::ControllerResolver;
use crate::store::ObjectStore;

/// Per-endpoint working state: the object itself (its annotations feed the
/// scale-memory merge, and the patch targets its identity) plus the set of
/// controller references discovered for it.
pub struct IdleUpdateInfo {
    pub endpoints: Endpoints,
    pub scale_refs: HashSet<CrossGroupObjectReference>,
}

/// Output of target collection.
///
/// If two endpoints claim the same controller, the reverse index keeps the
/// last writer. One controller backing two services is an accepted edge
/// case, not rejected here.
pub struct ScaleTargets {
    pub endpoints_info: BTreeMap<EndpointId, IdleUpdateInfo>,
    pub target_scale_refs: HashMap<NamespacedCrossGroupObjectReference, EndpointId>,
    pub errors: Vec<Error>,
}

/// Resolve scale targets for every given Endpoints object, continuing past
/// per-endpoint failures. Pod and controller memoization is shared across
/// the whole collection.
pub async fn collect_scale_targets<S: ObjectStore + ?Sized>(
    store: &S,
    endpoints_list: &[Endpoints],
) -> ScaleTargets {
    let mut resolver = ControllerResolver::new(store);

    let mut endpoints_info: BTreeMap<EndpointId, IdleUpdateInfo> = BTreeMap::new();
    let mut target_scale_refs: HashMap<NamespacedCrossGroupObjectReference, EndpointId> =
        HashMap::new();
    let mut errors = Vec::new();

    for endpoints in endpoints_list {
        let Some(endpoint) = EndpointId::from_endpoints(endpoints) else {
            continue;
        };

        let namespaced_refs = match resolver.scalable_resources_for(endpoints).await {
            Ok(refs) => refs,
            Err(source) => {
                warn!(endpoint = %endpoint, error = %source, "failed to resolve scalable resources");
                errors.push(Error::ResolveEndpoints {
                    endpoint,
                    source: Box::new(source),
                });
                continue;
            }
        };

        let mut scale_refs = HashSet::with_capacity(namespaced_refs.len());
        for namespaced in namespaced_refs {
            scale_refs.insert(namespaced.reference.clone());
            target_scale_refs.insert(namespaced, endpoint.clone());
        }

        endpoints_info.insert(
            endpoint,
            IdleUpdateInfo {
                endpoints: endpoints.clone(),
                scale_refs,
            },
        );
    }

    ScaleTargets {
        endpoints_info,
        target_scale_refs,
        errors,
    }
}
