#![forbid(unsafe_code)]
//! Fleetwatch cluster plumbing: kubeconfig clients, the resource registry
//! and the watch subscriptions that feed the shared queue.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Event as CoreEvent, Namespace, Pod, Secret, Service};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig, KubeconfigError};
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{reflector, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Config, ResourceExt};
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleetwatch_core::{object_key, ChangeRecord, EventKind, ResourceKind};
use fleetwatch_queue::RetryQueue;
use fleetwatch_store::LocalStore;

/// Which namespaces of a cluster a watch covers.
///
/// The wire form is a plain string; `"all"` selects every namespace the
/// client can see, anything else names one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NamespaceScope {
    All,
    Namespace(String),
}

impl From<String> for NamespaceScope {
    fn from(s: String) -> Self {
        if s == "all" {
            NamespaceScope::All
        } else {
            NamespaceScope::Namespace(s)
        }
    }
}

impl From<NamespaceScope> for String {
    fn from(scope: NamespaceScope) -> Self {
        match scope {
            NamespaceScope::All => "all".to_string(),
            NamespaceScope::Namespace(ns) => ns,
        }
    }
}

/// One resource type to watch within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchSpec {
    pub r_type: ResourceKind,
    pub namespace: NamespaceScope,
}

/// One cluster entry from the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub cluster_name: String,
    pub config_path: String,
    /// Skip TLS verification when talking to this cluster.
    #[serde(default)]
    pub insecure: bool,
    pub list: Vec<WatchSpec>,
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("kubeconfig {path}: {source}")]
    Kubeconfig {
        path: String,
        #[source]
        source: KubeconfigError,
    },
    #[error("kube client: {0}")]
    Client(#[from] kube::Error),
}

/// Build a client for one cluster from its kubeconfig file.
pub async fn cluster_client(spec: &ClusterSpec) -> Result<Client, ClusterError> {
    let kubeconfig =
        Kubeconfig::read_from(&spec.config_path).map_err(|source| ClusterError::Kubeconfig {
            path: spec.config_path.clone(),
            source,
        })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|source| ClusterError::Kubeconfig {
            path: spec.config_path.clone(),
            source,
        })?;
    if spec.insecure {
        config.accept_invalid_certs = true;
    }
    let client = Client::try_from(config)?;
    Ok(client)
}

/// Names of every namespace visible to the client, for `all` fan-out.
pub async fn list_namespaces(client: &Client) -> Result<Vec<String>, ClusterError> {
    let api: Api<Namespace> = Api::all(client.clone());
    let list = api.list(&ListParams::default()).await?;
    Ok(list.into_iter().map(|ns| ns.name_any()).collect())
}

/// The one place a configured kind turns into typed API metadata.
pub fn api_resource(kind: ResourceKind) -> ApiResource {
    match kind {
        ResourceKind::Pods => ApiResource::erase::<Pod>(&()),
        ResourceKind::Services => ApiResource::erase::<Service>(&()),
        ResourceKind::ConfigMaps => ApiResource::erase::<ConfigMap>(&()),
        ResourceKind::Secrets => ApiResource::erase::<Secret>(&()),
        ResourceKind::Events => ApiResource::erase::<CoreEvent>(&()),
        ResourceKind::Deployments => ApiResource::erase::<Deployment>(&()),
        ResourceKind::StatefulSets => ApiResource::erase::<StatefulSet>(&()),
        ResourceKind::DaemonSets => ApiResource::erase::<DaemonSet>(&()),
    }
}

/// A watch on one (cluster, kind, namespace) triple.
///
/// Owns the reflector writer; [`Subscription::local_store`] hands out the
/// matching read view before the watch task is spawned.
pub struct Subscription {
    cluster: String,
    kind: ResourceKind,
    namespace: String,
    resource: ApiResource,
    api: Api<DynamicObject>,
    writer: Writer<DynamicObject>,
    reader: Store<DynamicObject>,
}

impl Subscription {
    pub fn new(
        client: Client,
        cluster: impl Into<String>,
        kind: ResourceKind,
        namespace: impl Into<String>,
    ) -> Self {
        let cluster = cluster.into();
        let namespace = namespace.into();
        let resource = api_resource(kind);
        let api = Api::namespaced_with(client, &namespace, &resource);
        let writer = Writer::new(resource.clone());
        let reader = writer.as_reader();
        Self {
            cluster,
            kind,
            namespace,
            resource,
            api,
            writer,
            reader,
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

    /// Read view backed by this subscription's reflector.
    pub fn local_store(&self) -> LocalStore {
        LocalStore::new(
            &self.cluster,
            self.kind,
            &self.namespace,
            self.resource.clone(),
            self.reader.clone(),
        )
    }

    /// Start the watch loop. Every observed change lands in `queue` after
    /// the local store has been updated; the task exits when `stop` fires.
    pub fn spawn(self, queue: Arc<RetryQueue>, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.watch(queue, stop))
    }

    async fn watch(self, queue: Arc<RetryQueue>, mut stop: watch::Receiver<bool>) {
        let Subscription {
            cluster,
            kind,
            namespace,
            api,
            writer,
            ..
        } = self;
        info!(cluster = %cluster, kind = %kind, ns = %namespace, "watch started");
        let cfg = watcher::Config::default();
        let stream = reflector(writer, watcher::watcher(api, cfg).default_backoff());
        futures::pin_mut!(stream);
        let mut seen: HashSet<String> = HashSet::new();
        loop {
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => {
                    debug!(cluster = %cluster, kind = %kind, ns = %namespace, "watch stopping");
                    break;
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        for (event, key) in classify(event, &mut seen) {
                            queue.push(ChangeRecord::new(cluster.clone(), kind, event, key));
                        }
                    }
                    Some(Err(err)) => {
                        counter!("watch_errors_total", 1u64);
                        warn!(cluster = %cluster, kind = %kind, ns = %namespace, error = %err, "watch error");
                    }
                    None => {
                        warn!(cluster = %cluster, kind = %kind, ns = %namespace, "watch stream ended");
                        break;
                    }
                },
            }
        }
    }
}

/// Turn a watch event into add/update/delete notifications, tracked
/// against the keys this subscription has already seen.
fn classify(event: Event<DynamicObject>, seen: &mut HashSet<String>) -> Vec<(EventKind, String)> {
    match event {
        Event::Applied(obj) => {
            let key = object_key(obj.namespace().as_deref(), &obj.name_any());
            let kind = if seen.insert(key.clone()) {
                EventKind::Add
            } else {
                EventKind::Update
            };
            vec![(kind, key)]
        }
        Event::Deleted(obj) => {
            let key = object_key(obj.namespace().as_deref(), &obj.name_any());
            seen.remove(&key);
            vec![(EventKind::Delete, key)]
        }
        // Relist: diff against what we had, then adopt the new world.
        Event::Restarted(objects) => {
            let mut current = HashSet::with_capacity(objects.len());
            let mut out = Vec::with_capacity(objects.len());
            for obj in &objects {
                let key = object_key(obj.namespace().as_deref(), &obj.name_any());
                let kind = if seen.contains(&key) {
                    EventKind::Update
                } else {
                    EventKind::Add
                };
                if current.insert(key.clone()) {
                    out.push((kind, key));
                }
            }
            for key in seen.iter() {
                if !current.contains(key) {
                    out.push((EventKind::Delete, key.clone()));
                }
            }
            *seen = current;
            out
        }
    }
}
