//! lazywatch core types: object keys, deltas and the watch error taxonomy

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Stable cache identity of an object: `namespace/name`, or just `name` when cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    pub fn cluster(name: &str) -> Self {
        Self::new(None, name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ns, name) = match s.split_once('/') {
            Some((ns, name)) => (Some(ns), name),
            None => (None, s),
        };
        if name.is_empty() || name.contains('/') {
            return Err(StoreError::InvalidKey(s.to_string()));
        }
        Ok(Self::new(ns, name))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Emitted for every object of a fresh list after the watch restarted.
    Replaced,
}

/// One observed change to a single object.
#[derive(Debug, Clone)]
pub struct Delta<K> {
    pub kind: DeltaKind,
    pub object: K,
}

impl<K> Delta<K> {
    pub fn added(object: K) -> Self { Self { kind: DeltaKind::Added, object } }
    pub fn updated(object: K) -> Self { Self { kind: DeltaKind::Updated, object } }
    pub fn deleted(object: K) -> Self { Self { kind: DeltaKind::Deleted, object } }
    pub fn replaced(object: K) -> Self { Self { kind: DeltaKind::Replaced, object } }
}

/// Logging scope of a watch session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchScope {
    resource: Arc<str>,
    namespace: Option<Arc<str>>,
}

impl WatchScope {
    pub fn new(resource: &str, namespace: Option<&str>) -> Self {
        Self {
            resource: Arc::from(resource),
            namespace: namespace.filter(|ns| !ns.is_empty()).map(Arc::from),
        }
    }

    pub fn resource(&self) -> &str { &self.resource }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }

    /// Namespace rendered for log fields.
    pub fn ns(&self) -> &str { self.namespace.as_deref().unwrap_or("(all)") }
}

impl fmt::Display for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.resource, self.ns())
    }
}

/// Local cache failures. These abort the delta batch being applied.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object {0} not found")]
    NotFound(ObjectKey),
    #[error("object has no metadata.name")]
    MissingName,
    #[error("invalid object key: {0}")]
    InvalidKey(String),
}

/// Status carried by a structured control-plane error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApiStatus {
    pub code: u16,
    pub reason: String,
    pub message: String,
}

impl ApiStatus {
    pub fn new(code: u16, reason: &str, message: &str) -> Self {
        Self { code, reason: reason.to_string(), message: message.to_string() }
    }

    pub fn is_forbidden(&self) -> bool { self.code == 403 || self.reason == "Forbidden" }

    /// Resource version too old (`Expired`) or no longer retained (`Gone`).
    pub fn is_expired(&self) -> bool {
        self.code == 410 || self.reason == "Expired" || self.reason == "Gone"
    }

    /// Most specific diagnostic available: message, falling back to reason.
    pub fn detail(&self) -> &str {
        if !self.message.is_empty() {
            &self.message
        } else if !self.reason.is_empty() {
            &self.reason
        } else {
            "unknown"
        }
    }
}

impl fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.code, self.reason, self.detail())
    }
}

/// Faults surfaced by a stream engine. Never returned to callers of the watcher;
/// they are only seen by its error handler.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("watch cancelled")]
    Cancelled,
    #[error("resource version expired: {0}")]
    Expired(ApiStatus),
    #[error("watch stream closed")]
    EndOfStream,
    #[error("unexpected EOF: {0}")]
    UnexpectedEof(String),
    #[error("api error: {0}")]
    Api(ApiStatus),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WatchError {
    /// Map a structured status onto the expired/api split.
    pub fn from_status(status: ApiStatus) -> Self {
        if status.is_expired() {
            WatchError::Expired(status)
        } else {
            WatchError::Api(status)
        }
    }
}

pub mod prelude {
    pub use super::{ApiStatus, Delta, DeltaKind, ObjectKey, StoreError, WatchError, WatchScope};
}
