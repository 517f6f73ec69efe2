//! Scale-memory reconciliation
//!
//! Merges the controller set just discovered for an endpoint with whatever
//! the previous run persisted in its unidle-targets annotation. The rules
//! make repeated idling a fixed point: a second run against an already-idled
//! service (live replicas now 0) reproduces the originally recorded scale
//! instead of collapsing it to 0 or 1.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Error, Result};
use crate::refs::{
    CrossGroupObjectReference, EndpointId, NamespacedCrossGroupObjectReference,
    RecordedScaleReference, IDLED_AT_ANNOTATION, UNIDLE_TARGET_ANNOTATION,
};

/// Merge freshly discovered controller references with the previously
/// recorded annotation value, producing the new annotation payload.
///
/// - fresh references start at a replica sentinel of 0 ("unknown yet");
/// - a previously recorded reference matching a fresh one feeds its replica
///   count into `scales` when the live observation is absent or 0;
/// - previously recorded references absent from the fresh set are stale but
///   retained unmodified, removal belongs to a separate lifecycle;
/// - anything still unresolved defaults to 1, never 0.
///
/// `scales` is shared mutable state across endpoints in one run; recovered
/// prior counts are written back into it so later endpoints sharing a
/// controller see them too.
pub fn pair_scales_with_scale_refs(
    endpoint: &EndpointId,
    existing_annotation: Option<&str>,
    fresh_refs: &HashSet<CrossGroupObjectReference>,
    scales: &mut HashMap<NamespacedCrossGroupObjectReference, i32>,
) -> Result<Vec<RecordedScaleReference>> {
    let mut scale_refs: Vec<RecordedScaleReference> = fresh_refs
        .iter()
        .cloned()
        .map(|reference| RecordedScaleReference {
            reference,
            replicas: 0,
        })
        .collect();
    // deterministic output order for the fresh portion
    scale_refs.sort_by(|a, b| {
        (&a.reference.group, &a.reference.kind, &a.reference.name).cmp(&(
            &b.reference.group,
            &b.reference.kind,
            &b.reference.name,
        ))
    });

    if let Some(raw) = existing_annotation {
        let old_targets: Vec<RecordedScaleReference> =
            serde_json::from_str(raw).map_err(|source| Error::CorruptScaleAnnotation {
                endpoint: endpoint.clone(),
                source,
            })?;

        let mut old_index: HashMap<CrossGroupObjectReference, usize> = old_targets
            .iter()
            .enumerate()
            .map(|(i, target)| (target.reference.clone(), i))
            .collect();

        // previously recorded counts win over an absent or zero live scale
        for new_ref in &scale_refs {
            if let Some(&i) = old_index.get(&new_ref.reference) {
                let key = NamespacedCrossGroupObjectReference {
                    reference: new_ref.reference.clone(),
                    namespace: endpoint.namespace.clone(),
                };
                let live = scales.get(&key).copied();
                if live.is_none() || live == Some(0) {
                    scales.insert(key, old_targets[i].replicas);
                }
                old_index.remove(&new_ref.reference);
            }
        }

        // stale records are appended in their recorded order
        let mut stale: Vec<usize> = old_index.into_values().collect();
        stale.sort_unstable();
        for i in stale {
            scale_refs.push(old_targets[i].clone());
        }
    }

    for scale_ref in &mut scale_refs {
        let key = NamespacedCrossGroupObjectReference {
            reference: scale_ref.reference.clone(),
            namespace: endpoint.namespace.clone(),
        };
        let new_scale = match scales.get(&key) {
            Some(&live) if live != 0 => live,
            _ if scale_ref.replicas != 0 => scale_ref.replicas,
            _ => 1,
        };
        scale_ref.replicas = new_scale;
    }

    Ok(scale_refs)
}

/// Build the annotation map persisted on the Endpoints object: the merged
/// reference list as JSON plus the idled-at timestamp.
pub fn idle_annotations(
    scale_refs: &[RecordedScaleReference],
    now: DateTime<Utc>,
) -> serde_json::Result<BTreeMap<String, String>> {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        UNIDLE_TARGET_ANNOTATION.to_string(),
        serde_json::to_string(scale_refs)?,
    );
    annotations.insert(
        IDLED_AT_ANNOTATION.to_string(),
        now.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    Ok(annotations)
}
