//! End-to-end idling scenarios against an in-memory fake store
//!
//! These drive the orchestrator through resolution, merging, annotation and
//! scale-down with recorded cluster calls, so ordering and payloads can be
//! asserted exactly.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointSubset, Endpoints, ObjectReference, Pod,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};

use idler_lib::refs::NamespacedOwnerRef;
use idler_lib::{
    CrossGroupObjectReference, EndpointId, Error, IdleEvent, IdleOrchestrator, ObjectStore,
    Result, IDLED_AT_ANNOTATION, PREVIOUS_SCALE_ANNOTATION, UNIDLE_TARGET_ANNOTATION,
};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    PatchedEndpoints {
        endpoint: String,
        annotations: BTreeMap<String, String>,
    },
    SetScale {
        namespace: String,
        name: String,
        replicas: i32,
        annotations: BTreeMap<String, String>,
    },
}

#[derive(Default)]
struct FakeStore {
    pods: HashMap<(String, String), Pod>,
    controllers: HashMap<(String, String, String, String), DynamicObject>,
    scales: HashMap<(String, String, String, String), i32>,
    fail_scale: HashSet<(String, String)>,
    fail_annotate: HashSet<(String, String)>,
    calls: Mutex<Vec<Call>>,
    pod_fetches: Mutex<Vec<(String, String)>>,
    controller_fetches: Mutex<Vec<(String, String)>>,
}

fn transport_error() -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: "injected failure".to_string(),
        reason: "Testing".to_string(),
        code: 500,
    }))
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.pod_fetches
            .lock()
            .unwrap()
            .push((namespace.to_string(), name.to_string()));
        Ok(self
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_controller(&self, owner: &NamespacedOwnerRef) -> Result<Option<DynamicObject>> {
        self.controller_fetches
            .lock()
            .unwrap()
            .push((owner.namespace.clone(), owner.name.clone()));
        let key = (
            owner.namespace.clone(),
            owner.group.clone(),
            owner.kind.clone(),
            owner.name.clone(),
        );
        Ok(self.controllers.get(&key).cloned())
    }

    async fn get_scale(
        &self,
        reference: &CrossGroupObjectReference,
        namespace: &str,
    ) -> Result<i32> {
        if self
            .fail_scale
            .contains(&(namespace.to_string(), reference.name.clone()))
        {
            return Err(transport_error());
        }
        let key = (
            namespace.to_string(),
            reference.group.clone(),
            reference.kind.clone(),
            reference.name.clone(),
        );
        self.scales.get(&key).copied().ok_or_else(transport_error)
    }

    async fn set_scale(
        &self,
        reference: &CrossGroupObjectReference,
        namespace: &str,
        replicas: i32,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(Call::SetScale {
            namespace: namespace.to_string(),
            name: reference.name.clone(),
            replicas,
            annotations,
        });
        Ok(())
    }

    async fn patch_endpoints_annotations(
        &self,
        endpoint: &EndpointId,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        if self
            .fail_annotate
            .contains(&(endpoint.namespace.clone(), endpoint.name.clone()))
        {
            return Err(transport_error());
        }
        self.calls.lock().unwrap().push(Call::PatchedEndpoints {
            endpoint: endpoint.to_string(),
            annotations,
        });
        Ok(())
    }
}

fn owner_ref(api_version: &str, kind: &str, name: &str) -> OwnerReference {
    OwnerReference {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: format!("uid-{name}"),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn pod(namespace: &str, name: &str, owner: Option<OwnerReference>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: owner.map(|o| vec![o]),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn controller(
    namespace: &str,
    group: &str,
    version: &str,
    kind: &str,
    name: &str,
    owner: Option<OwnerReference>,
) -> DynamicObject {
    let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind));
    let mut object = DynamicObject::new(name, &resource).within(namespace);
    object.metadata.owner_references = owner.map(|o| vec![o]);
    object
}

fn endpoints(
    namespace: &str,
    name: &str,
    pod_names: &[&str],
    annotations: Option<BTreeMap<String, String>>,
) -> Endpoints {
    let addresses: Vec<EndpointAddress> = pod_names
        .iter()
        .enumerate()
        .map(|(i, pod_name)| EndpointAddress {
            ip: format!("10.0.0.{}", i + 1),
            target_ref: Some(ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some(pod_name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations,
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(addresses),
            ..Default::default()
        }]),
    }
}

fn fixed_now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// A store with one service backed by a pod whose ReplicationController is
/// owned by an apps/DeploymentConfig running 3 replicas.
fn two_hop_store() -> FakeStore {
    let mut store = FakeStore::default();
    store.pods.insert(
        ("ns".to_string(), "app-pod-1".to_string()),
        pod(
            "ns",
            "app-pod-1",
            Some(owner_ref("v1", "ReplicationController", "app-1")),
        ),
    );
    store.controllers.insert(
        (
            "ns".to_string(),
            String::new(),
            "ReplicationController".to_string(),
            "app-1".to_string(),
        ),
        controller(
            "ns",
            "",
            "v1",
            "ReplicationController",
            "app-1",
            Some(owner_ref("apps/v1", "DeploymentConfig", "app")),
        ),
    );
    store.scales.insert(
        (
            "ns".to_string(),
            "apps".to_string(),
            "DeploymentConfig".to_string(),
            "app".to_string(),
        ),
        3,
    );
    store
}

const APP_TARGET_JSON: &str =
    r#"[{"group":"apps","kind":"DeploymentConfig","name":"app","replicas":3}]"#;

#[tokio::test]
async fn test_idles_service_and_records_previous_scale() {
    let store = two_hop_store();
    let eps = endpoints("ns", "svc", &["app-pod-1"], None);

    let report = IdleOrchestrator::at(&store, false, fixed_now())
        .run(&[eps])
        .await
        .unwrap();

    assert!(!report.had_error);

    let calls = store.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);

    match &calls[0] {
        Call::PatchedEndpoints {
            endpoint,
            annotations,
        } => {
            assert_eq!(endpoint, "ns/svc");
            assert_eq!(
                annotations.get(UNIDLE_TARGET_ANNOTATION).unwrap(),
                APP_TARGET_JSON
            );
            assert_eq!(
                annotations.get(IDLED_AT_ANNOTATION).unwrap(),
                "2024-05-01T12:00:00Z"
            );
        }
        other => panic!("expected endpoints patch first, got {other:?}"),
    }

    match &calls[1] {
        Call::SetScale {
            namespace,
            name,
            replicas,
            annotations,
        } => {
            assert_eq!(namespace, "ns");
            assert_eq!(name, "app");
            assert_eq!(*replicas, 0);
            assert_eq!(annotations.get(PREVIOUS_SCALE_ANNOTATION).unwrap(), "3");
            assert_eq!(
                annotations.get(IDLED_AT_ANNOTATION).unwrap(),
                "2024-05-01T12:00:00Z"
            );
        }
        other => panic!("expected scale-down second, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reidle_preserves_recorded_scale() {
    let mut store = two_hop_store();
    // already idled: live replicas are 0, the annotation remembers 3
    store.scales.insert(
        (
            "ns".to_string(),
            "apps".to_string(),
            "DeploymentConfig".to_string(),
            "app".to_string(),
        ),
        0,
    );
    let mut annotations = BTreeMap::new();
    annotations.insert(UNIDLE_TARGET_ANNOTATION.to_string(), APP_TARGET_JSON.to_string());
    let eps = endpoints("ns", "svc", &["app-pod-1"], Some(annotations));

    let report = IdleOrchestrator::at(&store, false, fixed_now())
        .run(&[eps])
        .await
        .unwrap();

    assert!(!report.had_error);
    let calls = store.calls.lock().unwrap().clone();
    match &calls[0] {
        Call::PatchedEndpoints { annotations, .. } => {
            assert_eq!(
                annotations.get(UNIDLE_TARGET_ANNOTATION).unwrap(),
                APP_TARGET_JSON
            );
        }
        other => panic!("expected endpoints patch first, got {other:?}"),
    }
    // the controller-side record keeps the observed (already zero) scale
    match &calls[1] {
        Call::SetScale { annotations, .. } => {
            assert_eq!(annotations.get(PREVIOUS_SCALE_ANNOTATION).unwrap(), "0");
        }
        other => panic!("expected scale-down second, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pods_sharing_a_controller_resolve_once() {
    let mut store = two_hop_store();
    store.pods.insert(
        ("ns".to_string(), "app-pod-2".to_string()),
        pod(
            "ns",
            "app-pod-2",
            Some(owner_ref("v1", "ReplicationController", "app-1")),
        ),
    );
    let eps = endpoints("ns", "svc", &["app-pod-1", "app-pod-2"], None);

    let report = IdleOrchestrator::at(&store, false, fixed_now())
        .run(&[eps])
        .await
        .unwrap();

    let unidle_events: Vec<_> = report
        .events
        .iter()
        .filter(|event| matches!(event, IdleEvent::WillUnidle { .. }))
        .collect();
    assert_eq!(unidle_events.len(), 1);

    let scale_calls = store
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|call| matches!(call, Call::SetScale { .. }))
        .count();
    assert_eq!(scale_calls, 1);
}

#[tokio::test]
async fn test_shared_pod_is_fetched_once() {
    let store = two_hop_store();
    // the same pod appears in two subsets of one service and in a second
    // service entirely
    let mut first = endpoints("ns", "svc", &["app-pod-1"], None);
    let extra_subset = first.subsets.as_ref().unwrap()[0].clone();
    first.subsets.as_mut().unwrap().push(extra_subset);
    let second = endpoints("ns", "svc-alt", &["app-pod-1"], None);

    let report = IdleOrchestrator::at(&store, false, fixed_now())
        .run(&[first, second])
        .await
        .unwrap();

    assert!(!report.had_error);
    assert_eq!(
        store.pod_fetches.lock().unwrap().as_slice(),
        &[("ns".to_string(), "app-pod-1".to_string())]
    );
    assert_eq!(
        store.controller_fetches.lock().unwrap().as_slice(),
        &[("ns".to_string(), "app-1".to_string())]
    );
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let store = two_hop_store();
    let eps = endpoints("ns", "svc", &["app-pod-1"], None);

    let report = IdleOrchestrator::at(&store, true, fixed_now())
        .run(&[eps])
        .await
        .unwrap();

    assert!(report.dry_run);
    assert!(!report.had_error);
    assert!(store.calls.lock().unwrap().is_empty());

    // the preview still reports the full outcome
    assert!(report
        .events
        .iter()
        .any(|event| matches!(event, IdleEvent::Marked { .. })));
    assert!(report.events.iter().any(|event| matches!(
        event,
        IdleEvent::WillUnidle { replicas: 3, .. }
    )));
    assert!(report
        .events
        .iter()
        .any(|event| matches!(event, IdleEvent::Idled { .. })));
}

#[tokio::test]
async fn test_missing_pod_is_tolerated() {
    let store = two_hop_store();
    // the second address points at a pod that no longer exists
    let eps = endpoints("ns", "svc", &["app-pod-1", "gone-pod"], None);

    let report = IdleOrchestrator::at(&store, false, fixed_now())
        .run(&[eps])
        .await
        .unwrap();

    assert!(!report.had_error);
    assert_eq!(store.calls.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_pod_without_creator_fails_the_run_when_nothing_collected() {
    let mut store = FakeStore::default();
    store.pods.insert(
        ("ns".to_string(), "orphan-pod".to_string()),
        pod("ns", "orphan-pod", None),
    );
    let eps = endpoints("ns", "svc", &["orphan-pod"], None);

    let err = IdleOrchestrator::at(&store, false, fixed_now())
        .run(&[eps])
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NothingToIdle { .. }));
    assert!(err
        .to_string()
        .contains("no valid scalable resources found to idle"));
}

#[tokio::test]
async fn test_partial_failure_continues_with_valid_endpoints() {
    let mut store = two_hop_store();
    store.pods.insert(
        ("ns".to_string(), "orphan-pod".to_string()),
        pod("ns", "orphan-pod", None),
    );
    let good = endpoints("ns", "svc", &["app-pod-1"], None);
    let bad = endpoints("ns", "broken-svc", &["orphan-pod"], None);

    let report = IdleOrchestrator::at(&store, false, fixed_now())
        .run(&[bad, good])
        .await
        .unwrap();

    assert!(report.had_error);
    assert!(report
        .events
        .iter()
        .any(|event| matches!(event, IdleEvent::Warning(_))));
    // the healthy endpoint was still idled
    assert_eq!(store.calls.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_scale_fetch_failure_drops_the_target() {
    let mut store = two_hop_store();
    store
        .fail_scale
        .insert(("ns".to_string(), "app".to_string()));
    let eps = endpoints("ns", "svc", &["app-pod-1"], None);

    let report = IdleOrchestrator::at(&store, false, fixed_now())
        .run(&[eps])
        .await
        .unwrap();

    assert!(report.had_error);
    assert!(report.events.iter().any(|event| matches!(
        event,
        IdleEvent::Failed(msg) if msg.contains("unable to get scale")
    )));
    // its endpoint lost its only target, so nothing was written at all
    assert!(store.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_annotation_blocks_scale_down() {
    let mut store = two_hop_store();
    store
        .fail_annotate
        .insert(("ns".to_string(), "svc".to_string()));
    let eps = endpoints("ns", "svc", &["app-pod-1"], None);

    let report = IdleOrchestrator::at(&store, false, fixed_now())
        .run(&[eps])
        .await
        .unwrap();

    assert!(report.had_error);
    let calls = store.calls.lock().unwrap().clone();
    assert!(
        calls.iter().all(|call| !matches!(call, Call::SetScale { .. })),
        "scale-down must not run without a durable annotation"
    );
}

#[tokio::test]
async fn test_controller_without_parent_is_the_target() {
    let mut store = FakeStore::default();
    store.pods.insert(
        ("ns".to_string(), "web-pod".to_string()),
        pod("ns", "web-pod", Some(owner_ref("apps/v1", "StatefulSet", "web"))),
    );
    store.controllers.insert(
        (
            "ns".to_string(),
            "apps".to_string(),
            "StatefulSet".to_string(),
            "web".to_string(),
        ),
        controller("ns", "apps", "v1", "StatefulSet", "web", None),
    );
    store.scales.insert(
        (
            "ns".to_string(),
            "apps".to_string(),
            "StatefulSet".to_string(),
            "web".to_string(),
        ),
        2,
    );
    let eps = endpoints("ns", "web", &["web-pod"], None);

    let report = IdleOrchestrator::at(&store, false, fixed_now())
        .run(&[eps])
        .await
        .unwrap();

    assert!(!report.had_error);
    let calls = store.calls.lock().unwrap().clone();
    match &calls[0] {
        Call::PatchedEndpoints { annotations, .. } => {
            assert_eq!(
                annotations.get(UNIDLE_TARGET_ANNOTATION).unwrap(),
                r#"[{"group":"apps","kind":"StatefulSet","name":"web","replicas":2}]"#
            );
        }
        other => panic!("expected endpoints patch first, got {other:?}"),
    }
}
