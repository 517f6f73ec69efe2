//! Reference key types and annotation constants
//!
//! Owner references carry transient fields (`controller`,
//! `blockOwnerDeletion`, `uid`) that vary without semantic meaning, so they
//! are normalized into plain comparable key types before being used in maps
//! or sets.

use std::fmt;

use k8s_openapi::api::core::v1::Endpoints;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::{Deserialize, Serialize};

/// Annotation on an Endpoints object listing the scalable resources to
/// restore when traffic arrives, as a JSON array of [`RecordedScaleReference`].
pub const UNIDLE_TARGET_ANNOTATION: &str = "idling.alpha.kidle.dev/unidle-targets";

/// Annotation recording when idling happened (RFC3339), written on both the
/// Endpoints object and each scaled-down controller.
pub const IDLED_AT_ANNOTATION: &str = "idling.alpha.kidle.dev/idled-at";

/// Annotation on a scaled-down controller recording its pre-idle replica
/// count as a decimal string.
pub const PREVIOUS_SCALE_ANNOTATION: &str = "idling.alpha.kidle.dev/previous-scale";

/// Identity of an Endpoints object (and therefore of its service).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId {
    pub namespace: String,
    pub name: String,
}

impl EndpointId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Read the identity off an Endpoints object. Returns `None` when the
    /// object has no name, which cannot happen for objects read from the
    /// apiserver.
    pub fn from_endpoints(endpoints: &Endpoints) -> Option<Self> {
        let name = endpoints.metadata.name.clone()?;
        let namespace = endpoints.metadata.namespace.clone().unwrap_or_default();
        Some(Self { namespace, name })
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Canonical, namespace-free identity of a scalable controller. Used as the
/// key inside the unidle-targets annotation payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrossGroupObjectReference {
    pub group: String,
    pub kind: String,
    pub name: String,
}

impl fmt::Display for CrossGroupObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{} {}", self.kind, self.name)
        } else {
            write!(f, "{}.{} {}", self.kind, self.group, self.name)
        }
    }
}

/// A [`CrossGroupObjectReference`] with namespace information attached, so
/// that objects with the same name in different namespaces stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacedCrossGroupObjectReference {
    pub reference: CrossGroupObjectReference,
    pub namespace: String,
}

/// One entry of the unidle-targets annotation: a controller reference plus
/// the replica count to restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedScaleReference {
    #[serde(flatten)]
    pub reference: CrossGroupObjectReference,
    pub replicas: i32,
}

/// An owner reference normalized for use as a map key: the apiVersion is
/// reduced to its group and the transient flags are dropped. Owner
/// references carry no namespace of their own, so the owning pod's namespace
/// is attached here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacedOwnerRef {
    pub group: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl NamespacedOwnerRef {
    pub fn from_owner(namespace: &str, owner: &OwnerReference) -> Self {
        Self {
            group: api_group(&owner.api_version),
            kind: owner.kind.clone(),
            name: owner.name.clone(),
            namespace: namespace.to_string(),
        }
    }

    pub fn to_cross_group(&self) -> CrossGroupObjectReference {
        CrossGroupObjectReference {
            group: self.group.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
        }
    }
}

/// Build a [`CrossGroupObjectReference`] straight from an owner reference.
pub fn cross_group_ref(owner: &OwnerReference) -> CrossGroupObjectReference {
    CrossGroupObjectReference {
        group: api_group(&owner.api_version),
        kind: owner.kind.clone(),
        name: owner.name.clone(),
    }
}

/// Find the controlling owner reference of an object, if any.
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|owner| owner.controller == Some(true))
}

/// Extract the group from an apiVersion string. Core-group objects carry a
/// bare version ("v1") and map to the empty group.
fn api_group(api_version: &str) -> String {
    match api_version.split_once('/') {
        Some((group, _version)) => group.to_string(),
        None => String::new(),
    }
}
