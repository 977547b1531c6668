#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::reflector::store::Writer;
use kube::runtime::watcher::Event;
use kube::ResourceExt;

use fleetwatch_core::ResourceKind;
use fleetwatch_store::{AggregatedStore, LocalStore};

fn pod_resource() -> ApiResource {
    ApiResource::erase::<Pod>(&())
}

fn service_resource() -> ApiResource {
    ApiResource::erase::<Service>(&())
}

fn obj(namespace: &str, name: &str, resource: &ApiResource) -> DynamicObject {
    DynamicObject::new(name, resource).within(namespace)
}

/// A local store pre-filled as if the initial list already happened.
fn seeded(
    cluster: &str,
    kind: ResourceKind,
    namespace: &str,
    resource: &ApiResource,
    names: &[&str],
) -> LocalStore {
    let mut writer: Writer<DynamicObject> = Writer::new(resource.clone());
    let objects: Vec<DynamicObject> = names.iter().map(|n| obj(namespace, n, resource)).collect();
    writer.apply_watcher_event(&Event::Restarted(objects));
    LocalStore::new(
        cluster,
        kind,
        namespace,
        resource.clone(),
        writer.as_reader(),
    )
}

#[test]
fn local_store_keys_and_lookup() {
    let ar = pod_resource();
    let store = seeded("east", ResourceKind::Pods, "default", &ar, &["web-1", "web-2"]);
    assert_eq!(store.cluster(), "east");
    assert_eq!(store.kind(), ResourceKind::Pods);
    assert_eq!(store.namespace(), "default");

    let mut keys = store.keys();
    keys.sort();
    assert_eq!(keys, vec!["default/web-1", "default/web-2"]);

    let hit = store.get("default/web-1").unwrap();
    assert_eq!(hit.name_any(), "web-1");
    assert!(store.get("default/web-3").is_none());
    assert!(store.get("other/web-1").is_none());
}

#[test]
fn aggregate_unions_stores_of_one_kind() {
    let ar = pod_resource();
    let mut agg = AggregatedStore::new();
    agg.register(seeded("east", ResourceKind::Pods, "default", &ar, &["web-1"]));
    agg.register(seeded(
        "west",
        ResourceKind::Pods,
        "default",
        &ar,
        &["web-1", "web-2"],
    ));
    assert_eq!(agg.len(), 2);
    assert_eq!(agg.list(Some(ResourceKind::Pods)).len(), 3);

    let mut keys = agg.list_keys(Some(ResourceKind::Pods));
    keys.sort();
    // The same key in two clusters is two entries, not one.
    assert_eq!(keys, vec!["default/web-1", "default/web-1", "default/web-2"]);
}

#[test]
fn aggregate_all_kinds_spans_every_store() {
    let pods = pod_resource();
    let services = service_resource();
    let mut agg = AggregatedStore::new();
    agg.register(seeded("east", ResourceKind::Pods, "default", &pods, &["web-1"]));
    agg.register(seeded(
        "east",
        ResourceKind::Services,
        "default",
        &services,
        &["api"],
    ));
    assert_eq!(agg.list(None).len(), 2);

    let mut keys = agg.list_keys(None);
    keys.sort();
    assert_eq!(keys, vec!["default/api", "default/web-1"]);
}

#[test]
fn get_by_key_reports_every_match() {
    let ar = pod_resource();
    let mut agg = AggregatedStore::new();
    agg.register(seeded("east", ResourceKind::Pods, "default", &ar, &["web-1"]));
    agg.register(seeded("west", ResourceKind::Pods, "default", &ar, &["web-1"]));

    let (hits, found) = agg.get_by_key(Some(ResourceKind::Pods), "default/web-1");
    assert!(found);
    assert_eq!(hits.len(), 2);

    let (hits, found) = agg.get_by_key(None, "default/web-1");
    assert!(found);
    assert_eq!(hits.len(), 2);

    let (hits, found) = agg.get_by_key(Some(ResourceKind::Pods), "default/missing");
    assert!(!found);
    assert!(hits.is_empty());
}

#[test]
fn unknown_kind_selector_is_empty_not_an_error() {
    let ar = pod_resource();
    let mut agg = AggregatedStore::new();
    agg.register(seeded("east", ResourceKind::Pods, "default", &ar, &["web-1"]));
    assert!(agg.list(Some(ResourceKind::Secrets)).is_empty());
    assert!(agg.local_stores(ResourceKind::Secrets).is_empty());
    let (hits, found) = agg.get_by_key(Some(ResourceKind::Secrets), "default/web-1");
    assert!(!found);
    assert!(hits.is_empty());
}

#[tokio::test]
async fn wait_ready_resolves_after_initial_sync() {
    let ar = pod_resource();
    let store = seeded("east", ResourceKind::Pods, "default", &ar, &[]);
    store.wait_ready().await.unwrap();
    assert!(store.items().is_empty());
}
