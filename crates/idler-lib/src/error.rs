//! Error taxonomy for the idling flow
//!
//! NotFound on pod or controller lookups is a tolerable absence and never
//! surfaces here; the store encodes it as `Option::None`. Everything else is
//! either a structural problem with a single resource (no creator reference,
//! corrupt persisted annotation) or a transport failure, both reported per
//! resource without aborting the batch.

use thiserror::Error;

use crate::refs::EndpointId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A pod reached through an endpoint address has no controlling owner,
    /// so there is nothing to scale down.
    #[error("unable to find controller for pod {namespace}/{name}: no creator reference listed")]
    NoController { namespace: String, name: String },

    #[error("unable to find controller for pod {namespace}/{name}: {source}")]
    Pod {
        namespace: String,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("unable to load {kind} {name:?}: {source}")]
    Controller {
        kind: String,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("unable to calculate scalable resources for service {endpoint}: {source}")]
    ResolveEndpoints {
        endpoint: EndpointId,
        #[source]
        source: Box<Error>,
    },

    /// The previously persisted unidle-targets annotation does not parse.
    /// Corrupt recorded state must not be silently discarded.
    #[error("unable to extract existing scale information from endpoints {endpoint}: {source}")]
    CorruptScaleAnnotation {
        endpoint: EndpointId,
        #[source]
        source: serde_json::Error,
    },

    /// Discovery produced no usable mapping for a controller's group/kind.
    #[error("no server mapping found for {group}/{kind}")]
    Discovery { group: String, kind: String },

    /// Resolution failed before anything was collected, so there is nothing
    /// to proceed with.
    #[error("no valid scalable resources found to idle: {source}")]
    NothingToIdle {
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Kube(#[from] kube::Error),
}
