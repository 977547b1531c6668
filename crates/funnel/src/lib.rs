#![forbid(unsafe_code)]
//! Fleetwatch funnel: configuration, the replaceable event handler and the
//! controller that fans multi-cluster watches into one consumer loop.

use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use futures::future::join_all;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleetwatch_cluster::{cluster_client, list_namespaces, ClusterError};

pub use fleetwatch_cluster::{ClusterSpec, NamespaceScope, Subscription, WatchSpec};
pub use fleetwatch_core::{ChangeRecord, EventKind, ResourceKind};
pub use fleetwatch_queue::{ExponentialBackoff, QueueError, RetryQueue};
pub use fleetwatch_store::{AggregatedStore, LocalStore};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root of the YAML configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelConfig {
    /// How many times a failed record is requeued before it is dropped.
    /// The wire name is historical; this is a count, not a duration.
    #[serde(rename = "maxRequeueTime", default)]
    pub max_requeue: u32,
    pub clusters: Vec<ClusterSpec>,
}

impl FunnelConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<FunnelConfig, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<FunnelConfig, ConfigError> {
        let config: FunnelConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clusters.is_empty() {
            return Err(ConfigError::Invalid("no clusters configured".into()));
        }
        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if cluster.cluster_name.is_empty() {
                return Err(ConfigError::Invalid("cluster with empty clusterName".into()));
            }
            if !names.insert(cluster.cluster_name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate cluster name: {}",
                    cluster.cluster_name
                )));
            }
            if cluster.config_path.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "cluster {}: empty configPath",
                    cluster.cluster_name
                )));
            }
            if cluster.list.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "cluster {}: nothing to watch",
                    cluster.cluster_name
                )));
            }
            for watch in &cluster.list {
                if let NamespaceScope::Namespace(ns) = &watch.namespace {
                    if ns.is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "cluster {}: empty namespace for {}",
                            cluster.cluster_name, watch.r_type
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// What the funnel calls for every delivered record.
///
/// `Err` asks for redelivery, so handlers must tolerate seeing the same
/// record again.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, record: ChangeRecord) -> anyhow::Result<()>;
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(ChangeRecord) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    HandlerFn(f)
}

pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for HandlerFn<F>
where
    F: Fn(ChangeRecord) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, record: ChangeRecord) -> anyhow::Result<()> {
        (self.0)(record).await
    }
}

#[derive(Debug, Error)]
pub enum FunnelError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("cluster {cluster}: {source}")]
    Cluster {
        cluster: String,
        #[source]
        source: ClusterError,
    },
    #[error("funnel already ran")]
    AlreadyRan,
}

/// The controller: one retry queue, one aggregated store, one consumer.
///
/// A funnel runs once. `stop` shuts it down for good; watching again means
/// building a fresh instance.
pub struct Funnel {
    queue: Arc<RetryQueue>,
    store: Arc<AggregatedStore>,
    handler: ArcSwapOption<Box<dyn EventHandler>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    subscriptions: Mutex<Option<Vec<Subscription>>>,
}

impl Funnel {
    /// Build the whole pipeline from configuration: one client per cluster,
    /// one subscription per (cluster, kind, namespace) with `all` expanded
    /// through namespace discovery, every local store registered.
    pub async fn new(config: FunnelConfig) -> Result<Funnel, FunnelError> {
        config.validate()?;
        let queue = Arc::new(RetryQueue::new(config.max_requeue));
        let mut store = AggregatedStore::new();
        let mut subscriptions = Vec::new();
        for cluster in &config.clusters {
            let client =
                cluster_client(cluster)
                    .await
                    .map_err(|source| FunnelError::Cluster {
                        cluster: cluster.cluster_name.clone(),
                        source,
                    })?;
            for watch in &cluster.list {
                let namespaces = match &watch.namespace {
                    NamespaceScope::Namespace(ns) => vec![ns.clone()],
                    NamespaceScope::All => list_namespaces(&client).await.map_err(|source| {
                        FunnelError::Cluster {
                            cluster: cluster.cluster_name.clone(),
                            source,
                        }
                    })?,
                };
                for ns in namespaces {
                    let sub = Subscription::new(
                        client.clone(),
                        &cluster.cluster_name,
                        watch.r_type,
                        ns,
                    );
                    store.register(sub.local_store());
                    subscriptions.push(sub);
                }
            }
        }
        info!(
            clusters = config.clusters.len(),
            subscriptions = subscriptions.len(),
            max_requeue = config.max_requeue,
            "funnel initialized"
        );
        gauge!("funnel_subscriptions", subscriptions.len() as f64);
        Ok(Self::from_parts(queue, store, subscriptions))
    }

    /// Assemble a funnel from prebuilt parts. Used by embedders and tests
    /// that drive the queue directly.
    pub fn from_parts(
        queue: Arc<RetryQueue>,
        store: AggregatedStore,
        subscriptions: Vec<Subscription>,
    ) -> Funnel {
        let (stop_tx, stop_rx) = watch::channel(false);
        Funnel {
            queue,
            store: Arc::new(store),
            handler: ArcSwapOption::empty(),
            stop_tx,
            stop_rx,
            subscriptions: Mutex::new(Some(subscriptions)),
        }
    }

    /// Install the handler invoked for every delivered record. Replaceable
    /// at any time; the newest handler wins, including mid-run.
    pub fn add_event_handler<H>(&self, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.handler.store(Some(Arc::new(Box::new(handler))));
        debug!("event handler installed");
    }

    /// Start the watches and consume the queue until `stop` is called.
    ///
    /// Delivery waits for every subscription's initial sync, each wait
    /// bounded by the stop signal and a deadline, so one unreachable
    /// cluster cannot stall the rest forever.
    pub async fn run(&self) -> Result<(), FunnelError> {
        let subs = self
            .subscriptions
            .lock()
            .unwrap()
            .take()
            .ok_or(FunnelError::AlreadyRan)?;

        let mut watchers = Vec::with_capacity(subs.len());
        let mut syncing = Vec::with_capacity(subs.len());
        for sub in subs {
            syncing.push(sub.local_store());
            watchers.push(sub.spawn(Arc::clone(&self.queue), self.stop_rx.clone()));
        }

        let deadline = sync_timeout();
        join_all(syncing.into_iter().map(|local| {
            let mut stop = self.stop_rx.clone();
            async move {
                tokio::select! {
                    res = local.wait_ready() => match res {
                        Ok(()) => debug!(
                            cluster = %local.cluster(),
                            kind = %local.kind(),
                            ns = %local.namespace(),
                            "initial sync complete"
                        ),
                        Err(_) => warn!(
                            cluster = %local.cluster(),
                            kind = %local.kind(),
                            ns = %local.namespace(),
                            "watch task gone before sync"
                        ),
                    },
                    _ = stop.wait_for(|stopped| *stopped) => {}
                    _ = tokio::time::sleep(deadline) => warn!(
                        cluster = %local.cluster(),
                        kind = %local.kind(),
                        ns = %local.namespace(),
                        "initial sync timed out"
                    ),
                }
            }
        }))
        .await;
        info!("funnel running");

        while let Ok(record) = self.queue.pop().await {
            self.handle_record(record).await;
        }
        debug!("queue closed, consumer exiting");

        let _ = self.stop_tx.send(true);
        for handle in watchers {
            let _ = handle.await;
        }
        info!("funnel stopped");
        Ok(())
    }

    /// Deliver one record to the current handler and settle it with the
    /// queue: `Ok` finishes, `Err` requeues until the retry bound.
    pub async fn handle_record(&self, record: ChangeRecord) {
        let handler = match self.handler.load_full() {
            Some(h) => h,
            None => {
                // Nothing installed: drain rather than retry.
                self.queue.finish(&record);
                return;
            }
        };
        match handler.handle(record.clone()).await {
            Ok(()) => {
                counter!("funnel_handled_total", 1u64);
                self.queue.finish(&record);
            }
            Err(err) => {
                warn!(
                    cluster = %record.cluster,
                    kind = %record.kind,
                    event = %record.event,
                    key = %record.key,
                    error = %err,
                    "handler failed"
                );
                match self.queue.requeue(record) {
                    Ok(()) => counter!("funnel_retried_total", 1u64),
                    Err(QueueError::MaxRetriesExceeded { .. }) => {
                        counter!("funnel_dropped_total", 1u64);
                    }
                    // Shutdown race; the record is gone with the queue.
                    Err(QueueError::Closed) => {}
                }
            }
        }
    }

    /// Shut down: broadcast the one-shot stop signal and close the queue.
    pub fn stop(&self) {
        info!("funnel stopping");
        let _ = self.stop_tx.send(true);
        self.queue.close();
    }

    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    pub fn store(&self) -> &Arc<AggregatedStore> {
        &self.store
    }

    pub async fn pop(&self) -> Result<ChangeRecord, QueueError> {
        self.queue.pop().await
    }

    pub fn requeue(&self, record: ChangeRecord) -> Result<(), QueueError> {
        self.queue.requeue(record)
    }

    pub fn finish(&self, record: &ChangeRecord) {
        self.queue.finish(record)
    }

    pub fn set_max_retries(&self, max: u32) {
        self.queue.set_max_retries(max)
    }
}

fn sync_timeout() -> Duration {
    let secs = std::env::var("FLEETWATCH_SYNC_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30);
    Duration::from_secs(secs)
}
