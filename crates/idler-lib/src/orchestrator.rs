//! The idling flow itself
//!
//! Sequences resolve → scale collection → scale-memory merge → annotation
//! patch → scale-down, tolerating per-resource failures and aggregating an
//! overall success/failure signal. The ordering is load-bearing: an
//! endpoint's annotation must be durable before any of its targets is
//! scaled to zero, otherwise traffic could arrive at zero replicas with no
//! recorded intent to restore them. A target whose endpoint failed to
//! annotate is therefore never scaled down.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Endpoints;
use tracing::{debug, warn};

use crate::collector::collect_scale_targets;
use crate::error::{Error, Result};
use crate::merge::{idle_annotations, pair_scales_with_scale_refs};
use crate::refs::{
    CrossGroupObjectReference, EndpointId, NamespacedCrossGroupObjectReference,
    IDLED_AT_ANNOTATION, PREVIOUS_SCALE_ANNOTATION, UNIDLE_TARGET_ANNOTATION,
};
use crate::store::ObjectStore;

/// Per-target working state for the scale-down step.
struct ScaleInfo {
    namespace: String,
    replicas: i32,
    claimed_by: EndpointId,
}

/// User-facing outcome of one run. The library does no terminal output;
/// the caller renders these events and turns `had_error` into an exit code.
#[derive(Debug)]
pub struct IdleReport {
    pub events: Vec<IdleEvent>,
    pub had_error: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleEvent {
    /// A recoverable problem; the run continued with what it had.
    Warning(String),
    /// A per-resource failure; the run continued with other resources.
    Failed(String),
    /// The endpoint's unidle-targets annotation was written (or would be).
    Marked { endpoint: EndpointId },
    /// One entry of the endpoint's recorded restore list.
    WillUnidle {
        endpoint: EndpointId,
        reference: CrossGroupObjectReference,
        replicas: i32,
    },
    /// A controller was scaled to zero (or would be).
    Idled {
        namespace: String,
        reference: CrossGroupObjectReference,
    },
}

/// Drives one idling pass over a set of Endpoints objects.
pub struct IdleOrchestrator<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    dry_run: bool,
    now: DateTime<Utc>,
}

impl<'a, S: ObjectStore + ?Sized> IdleOrchestrator<'a, S> {
    pub fn new(store: &'a S, dry_run: bool) -> Self {
        Self::at(store, dry_run, Utc::now())
    }

    /// Construct with an explicit timestamp, used by tests to pin the
    /// idled-at annotations.
    pub fn at(store: &'a S, dry_run: bool, now: DateTime<Utc>) -> Self {
        Self {
            store,
            dry_run,
            now,
        }
    }

    /// Run the full flow. In dry-run mode discovery, scale collection and
    /// merging happen fully so the preview is accurate, but no write ever
    /// reaches the cluster.
    pub async fn run(&self, endpoints_list: &[Endpoints]) -> Result<IdleReport> {
        let mut events = Vec::new();
        let mut had_error = false;

        let mut targets = collect_scale_targets(self.store, endpoints_list).await;
        let resolve_errors = std::mem::take(&mut targets.errors);
        if !resolve_errors.is_empty() {
            if targets.endpoints_info.is_empty() || targets.target_scale_refs.is_empty() {
                let mut resolve_errors = resolve_errors;
                return Err(Error::NothingToIdle {
                    source: Box::new(resolve_errors.swap_remove(0)),
                });
            }
            had_error = true;
            for error in &resolve_errors {
                events.push(IdleEvent::Warning(format!(
                    "continuing on for valid scalable resources, but an error occurred while finding scalable resources to idle: {error}"
                )));
            }
        }

        // Collect the live scale of every discovered target. A failure here
        // drops that single target from its endpoint rather than aborting
        // the run.
        let mut ordered_targets: Vec<(&NamespacedCrossGroupObjectReference, &EndpointId)> =
            targets.target_scale_refs.iter().collect();
        ordered_targets.sort_by_key(|(scale_ref, _)| {
            (
                scale_ref.namespace.clone(),
                scale_ref.reference.group.clone(),
                scale_ref.reference.kind.clone(),
                scale_ref.reference.name.clone(),
            )
        });

        let mut replicas: HashMap<NamespacedCrossGroupObjectReference, i32> = HashMap::new();
        let mut to_scale: Vec<(NamespacedCrossGroupObjectReference, ScaleInfo)> = Vec::new();
        let mut dropped: Vec<(EndpointId, CrossGroupObjectReference)> = Vec::new();

        for (scale_ref, endpoint) in ordered_targets {
            match self
                .store
                .get_scale(&scale_ref.reference, &scale_ref.namespace)
                .await
            {
                Ok(current) => {
                    replicas.insert(scale_ref.clone(), current);
                    to_scale.push((
                        scale_ref.clone(),
                        ScaleInfo {
                            namespace: scale_ref.namespace.clone(),
                            replicas: current,
                            claimed_by: endpoint.clone(),
                        },
                    ));
                }
                Err(error) => {
                    warn!(scale_target = %scale_ref.reference, error = %error, "unable to get scale");
                    events.push(IdleEvent::Failed(format!(
                        "unable to get scale for {} {}/{}, not marking that scalable as idled: {error}",
                        scale_ref.reference.kind, scale_ref.namespace, scale_ref.reference.name
                    )));
                    dropped.push((endpoint.clone(), scale_ref.reference.clone()));
                    had_error = true;
                }
            }
        }
        for (endpoint, reference) in dropped {
            if let Some(info) = targets.endpoints_info.get_mut(&endpoint) {
                info.scale_refs.remove(&reference);
            }
        }

        // Annotate each endpoint with its merged scale memory. Targets of an
        // endpoint that does not make it through this step must not be
        // scaled down later.
        let mut annotated: HashSet<EndpointId> = HashSet::new();

        for (endpoint, info) in &targets.endpoints_info {
            let existing = info
                .endpoints
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(UNIDLE_TARGET_ANNOTATION))
                .map(String::as_str);

            let refs_with_scale = match pair_scales_with_scale_refs(
                endpoint,
                existing,
                &info.scale_refs,
                &mut replicas,
            ) {
                Ok(refs) => refs,
                Err(error) => {
                    events.push(IdleEvent::Failed(format!(
                        "unable to mark service {endpoint} as idled: {error}"
                    )));
                    had_error = true;
                    continue;
                }
            };

            if info.scale_refs.is_empty() {
                events.push(IdleEvent::Failed(format!(
                    "unable to mark service {endpoint} as idled: make sure that the service is not already idled and that it is associated with resources that can be scaled"
                )));
                had_error = true;
                continue;
            }

            if !self.dry_run {
                let annotations = match idle_annotations(&refs_with_scale, self.now) {
                    Ok(annotations) => annotations,
                    Err(error) => {
                        events.push(IdleEvent::Failed(format!(
                            "unable to mark service {endpoint} as idled: {error}"
                        )));
                        had_error = true;
                        continue;
                    }
                };
                if let Err(error) = self
                    .store
                    .patch_endpoints_annotations(endpoint, annotations)
                    .await
                {
                    events.push(IdleEvent::Failed(format!(
                        "unable to mark service {endpoint} as idled: {error}"
                    )));
                    had_error = true;
                    continue;
                }
            }
            debug!(endpoint = %endpoint, targets = refs_with_scale.len(), "marked as idled");

            annotated.insert(endpoint.clone());
            events.push(IdleEvent::Marked {
                endpoint: endpoint.clone(),
            });
            for scale_ref in &refs_with_scale {
                events.push(IdleEvent::WillUnidle {
                    endpoint: endpoint.clone(),
                    reference: scale_ref.reference.clone(),
                    replicas: scale_ref.replicas,
                });
            }
        }

        // Scale down to zero, only after the annotation is durable so no
        // traffic window is missed.
        for (scale_ref, info) in &to_scale {
            if !annotated.contains(&info.claimed_by) {
                continue;
            }

            if !self.dry_run {
                let mut annotations = BTreeMap::new();
                annotations.insert(
                    IDLED_AT_ANNOTATION.to_string(),
                    self.now.to_rfc3339_opts(SecondsFormat::Secs, true),
                );
                annotations.insert(
                    PREVIOUS_SCALE_ANNOTATION.to_string(),
                    info.replicas.to_string(),
                );

                if let Err(error) = self
                    .store
                    .set_scale(&scale_ref.reference, &info.namespace, 0, annotations)
                    .await
                {
                    events.push(IdleEvent::Failed(format!(
                        "unable to scale {} {}/{} to 0, but still listed as target for unidling: {error}",
                        scale_ref.reference.kind, info.namespace, scale_ref.reference.name
                    )));
                    had_error = true;
                    continue;
                }
            }

            events.push(IdleEvent::Idled {
                namespace: info.namespace.clone(),
                reference: scale_ref.reference.clone(),
            });
        }

        Ok(IdleReport {
            events,
            had_error,
            dry_run: self.dry_run,
        })
    }
}
