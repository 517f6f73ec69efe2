//! Core library for idling the scalable resources behind Kubernetes services
//!
//! This crate provides the pieces of the idling flow:
//! - Resolution from endpoint addresses to top-level scalable controllers
//! - Aggregation of scale targets across many endpoints
//! - Reconciliation of freshly discovered targets with previously persisted
//!   scale memory
//! - The annotate-then-scale-down orchestration, with dry-run support
//!
//! All cluster access goes through the [`store::ObjectStore`] trait; the
//! wake-on-traffic side that restores replicas lives elsewhere and reads
//! back the annotations written here.

pub mod collector;
pub mod error;
pub mod merge;
pub mod orchestrator;
pub mod refs;
pub mod resolver;
pub mod store;

pub use error::{Error, Result};
pub use orchestrator::{IdleEvent, IdleOrchestrator, IdleReport};
pub use refs::{
    CrossGroupObjectReference, EndpointId, NamespacedCrossGroupObjectReference,
    RecordedScaleReference, IDLED_AT_ANNOTATION, PREVIOUS_SCALE_ANNOTATION,
    UNIDLE_TARGET_ANNOTATION,
};
pub use store::{KubeStore, ObjectStore};
