//! Fleetwatch shared types: resource kinds, change records and object keys.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Resource types the funnel knows how to watch.
///
/// Wire names are the lower-case plural forms used in configuration files
/// (`pods`, `configmaps`, `statefulsets`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pods,
    Services,
    ConfigMaps,
    Secrets,
    Events,
    Deployments,
    StatefulSets,
    DaemonSets,
}

impl ResourceKind {
    /// Every supported kind, in declaration order.
    pub const ALL: [ResourceKind; 8] = [
        ResourceKind::Pods,
        ResourceKind::Services,
        ResourceKind::ConfigMaps,
        ResourceKind::Secrets,
        ResourceKind::Events,
        ResourceKind::Deployments,
        ResourceKind::StatefulSets,
        ResourceKind::DaemonSets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pods => "pods",
            ResourceKind::Services => "services",
            ResourceKind::ConfigMaps => "configmaps",
            ResourceKind::Secrets => "secrets",
            ResourceKind::Events => "events",
            ResourceKind::Deployments => "deployments",
            ResourceKind::StatefulSets => "statefulsets",
            ResourceKind::DaemonSets => "daemonsets",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown resource type: {0}")]
pub struct UnknownResourceKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownResourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownResourceKind(s.to_string()))
    }
}

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Add => "add",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed change: which cluster saw what happen to which object.
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub cluster: String,
    #[serde(rename = "resourceType")]
    pub kind: ResourceKind,
    #[serde(rename = "eventKind")]
    pub event: EventKind,
    /// `namespace/name` identity of the object within its cluster.
    pub key: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn new(
        cluster: impl Into<String>,
        kind: ResourceKind,
        event: EventKind,
        key: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            kind,
            event,
            key: key.into(),
            created_at: Utc::now(),
        }
    }

    /// Identity used for queue deduplication and in-flight tracking.
    ///
    /// The observation timestamp stays payload metadata: two notifications
    /// for the same logical change must collapse to one pending entry.
    pub fn identity(&self) -> RecordIdentity {
        RecordIdentity {
            cluster: self.cluster.clone(),
            kind: self.kind,
            event: self.event,
            key: self.key.clone(),
        }
    }
}

/// The (cluster, resource type, event, key) tuple that makes two records
/// "the same change" for queueing purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordIdentity {
    pub cluster: String,
    pub kind: ResourceKind,
    pub event: EventKind,
    pub key: String,
}

/// Build a `namespace/name` object key, or bare `name` for cluster-scoped
/// objects.
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Split an object key back into its namespace and name parts.
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_names_round_trip() {
        for kind in ResourceKind::ALL {
            let s = serde_json::to_string(&kind).unwrap();
            assert_eq!(s, format!("\"{}\"", kind.as_str()));
            let back: ResourceKind = serde_json::from_str(&s).unwrap();
            assert_eq!(back, kind);
            assert_eq!(kind.as_str().parse::<ResourceKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!("replicasets".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn event_wire_names() {
        assert_eq!(serde_json::to_string(&EventKind::Add).unwrap(), "\"add\"");
        assert_eq!(serde_json::to_string(&EventKind::Update).unwrap(), "\"update\"");
        assert_eq!(serde_json::to_string(&EventKind::Delete).unwrap(), "\"delete\"");
    }

    #[test]
    fn identity_ignores_timestamp() {
        let a = ChangeRecord::new("c1", ResourceKind::Pods, EventKind::Add, "ns/x");
        let mut b = a.clone();
        b.created_at = b.created_at + chrono::Duration::seconds(30);
        assert_ne!(a, b);
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn identity_separates_event_kinds() {
        let add = ChangeRecord::new("c1", ResourceKind::Pods, EventKind::Add, "ns/x");
        let del = ChangeRecord::new("c1", ResourceKind::Pods, EventKind::Delete, "ns/x");
        assert_ne!(add.identity(), del.identity());
    }

    #[test]
    fn object_keys() {
        assert_eq!(object_key(Some("prod"), "web-1"), "prod/web-1");
        assert_eq!(object_key(None, "node-a"), "node-a");
        assert_eq!(object_key(Some(""), "node-a"), "node-a");
        assert_eq!(split_key("prod/web-1"), (Some("prod"), "web-1"));
        assert_eq!(split_key("node-a"), (None, "node-a"));
    }

    #[test]
    fn record_wire_field_names() {
        let rec = ChangeRecord::new("c1", ResourceKind::Deployments, EventKind::Update, "ns/app");
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["cluster"], "c1");
        assert_eq!(v["resourceType"], "deployments");
        assert_eq!(v["eventKind"], "update");
        assert_eq!(v["key"], "ns/app");
        assert!(v["createdAt"].is_string());
    }
}
