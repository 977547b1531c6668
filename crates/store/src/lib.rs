#![forbid(unsafe_code)]
//! Fleetwatch store: read-only aggregation over per-subscription caches.
//!
//! Every watch subscription replicates its slice of a cluster into a
//! `reflector::Store`. [`AggregatedStore`] fans reads out across all of
//! them, per resource kind or over everything at once.

use std::sync::Arc;

use kube::core::{ApiResource, DynamicObject};
use kube::runtime::reflector::store::WriterDropped;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use rustc_hash::FxHashMap;
use tracing::debug;

use fleetwatch_core::{object_key, split_key, ResourceKind};

/// Read view over the objects replicated by one watch subscription.
#[derive(Clone)]
pub struct LocalStore {
    cluster: String,
    kind: ResourceKind,
    namespace: String,
    resource: ApiResource,
    store: Store<DynamicObject>,
}

impl LocalStore {
    pub fn new(
        cluster: impl Into<String>,
        kind: ResourceKind,
        namespace: impl Into<String>,
        resource: ApiResource,
        store: Store<DynamicObject>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            kind,
            namespace: namespace.into(),
            resource,
            store,
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Snapshot of every object currently replicated.
    pub fn items(&self) -> Vec<Arc<DynamicObject>> {
        self.store.state()
    }

    /// `namespace/name` keys of every object currently replicated.
    pub fn keys(&self) -> Vec<String> {
        self.store
            .state()
            .iter()
            .map(|o| object_key(o.namespace().as_deref(), &o.name_any()))
            .collect()
    }

    /// Point lookup by `namespace/name` key. Absent objects come back as
    /// `None`, never as an error.
    pub fn get(&self, key: &str) -> Option<Arc<DynamicObject>> {
        let (namespace, name) = split_key(key);
        let mut obj_ref = ObjectRef::new_with(name, self.resource.clone());
        if let Some(ns) = namespace {
            obj_ref = obj_ref.within(ns);
        }
        self.store.get(&obj_ref)
    }

    /// Resolves once the underlying reflector has completed its initial
    /// list, or fails if the watch task dropped the writer first.
    pub async fn wait_ready(&self) -> Result<(), WriterDropped> {
        self.store.wait_until_ready().await
    }
}

/// Fan-out read surface over every registered [`LocalStore`].
///
/// Registration happens once during setup; afterwards the aggregate is
/// shared read-only. `None` as a kind selector means every kind.
#[derive(Default)]
pub struct AggregatedStore {
    by_kind: FxHashMap<ResourceKind, Vec<LocalStore>>,
}

impl AggregatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, store: LocalStore) {
        debug!(
            cluster = %store.cluster(),
            kind = %store.kind(),
            ns = %store.namespace(),
            "registered local store"
        );
        self.by_kind.entry(store.kind()).or_default().push(store);
    }

    /// Number of registered local stores.
    pub fn len(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.values().all(Vec::is_empty)
    }

    pub fn local_stores(&self, kind: ResourceKind) -> &[LocalStore] {
        self.by_kind
            .get(&kind)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Union of objects across matching local stores. Objects sharing a
    /// key in different clusters all appear.
    pub fn list(&self, kind: Option<ResourceKind>) -> Vec<Arc<DynamicObject>> {
        let mut out = Vec::new();
        for store in self.stores_for(kind) {
            out.extend(store.items());
        }
        out
    }

    pub fn list_keys(&self, kind: Option<ResourceKind>) -> Vec<String> {
        let mut out = Vec::new();
        for store in self.stores_for(kind) {
            out.extend(store.keys());
        }
        out
    }

    /// Every match for `key` across matching local stores, plus whether
    /// anything was found at all.
    pub fn get_by_key(
        &self,
        kind: Option<ResourceKind>,
        key: &str,
    ) -> (Vec<Arc<DynamicObject>>, bool) {
        let mut out = Vec::new();
        for store in self.stores_for(kind) {
            if let Some(obj) = store.get(key) {
                out.push(obj);
            }
        }
        let found = !out.is_empty();
        (out, found)
    }

    fn stores_for(&self, kind: Option<ResourceKind>) -> Box<dyn Iterator<Item = &LocalStore> + '_> {
        match kind {
            Some(kind) => match self.by_kind.get(&kind) {
                Some(stores) => Box::new(stores.iter()),
                None => Box::new(std::iter::empty()),
            },
            // Fixed kind order keeps "all" listings deterministic.
            None => Box::new(
                ResourceKind::ALL
                    .iter()
                    .filter_map(|kind| self.by_kind.get(kind))
                    .flatten(),
            ),
        }
    }
}
