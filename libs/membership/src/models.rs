//! Typed models shared by the substrate adapters, the cache and the facade.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Substrate lease handle.
pub type LeaseId = i64;

// ---------------------------------------------------------------------------
// Substrate records
// ---------------------------------------------------------------------------

/// A key/value pair as stored by the substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    /// Revision at which the key was created. Stable across updates.
    pub create_revision: i64,
    /// Revision of the last modification.
    pub mod_revision: i64,
    /// Lease the key is bound to, `0` when unbound.
    pub lease: LeaseId,
}

/// Result of a prefix range read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSnapshot {
    /// Entries sorted by `create_revision`, oldest first.
    pub entries: Vec<KeyValue>,
    /// Store revision the snapshot was taken at.
    pub revision: i64,
}

/// Mutation kind reported by the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Put,
    Delete,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Put => write!(f, "PUT"),
            EventKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// One mutation delivered by the watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Empty for deletes.
    pub value: Bytes,
    /// `0` for deletes.
    pub create_revision: i64,
    pub mod_revision: i64,
}

impl WatchEvent {
    pub fn put(kv: &KeyValue) -> Self {
        Self {
            kind: EventKind::Put,
            key: kv.key.clone(),
            value: kv.value.clone(),
            create_revision: kv.create_revision,
            mod_revision: kv.mod_revision,
        }
    }

    pub fn delete(key: impl Into<String>, mod_revision: i64) -> Self {
        Self {
            kind: EventKind::Delete,
            key: key.into(),
            value: Bytes::new(),
            create_revision: 0,
            mod_revision,
        }
    }
}

// ---------------------------------------------------------------------------
// Membership view
// ---------------------------------------------------------------------------

/// One registered participant under the watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Key with the prefix stripped.
    pub name: String,
    pub value: Bytes,
    pub create_revision: i64,
}

impl Member {
    /// Build a member from a substrate record, or `None` if `key` is not under `prefix`.
    pub fn from_kv(prefix: &str, kv: &KeyValue) -> Option<Self> {
        let name = member_name(prefix, &kv.key)?;
        Some(Self {
            name: name.to_owned(),
            value: kv.value.clone(),
            create_revision: kv.create_revision,
        })
    }

    /// Value rendered as text, lossy for non UTF-8 payloads.
    pub fn value_lossy(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Strip `prefix` from `key`.
pub fn member_name<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)
}

/// Change notification published for every applied watch event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Change {
    pub name: String,
    pub op: EventKind,
}

impl std::fmt::Display for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.op, self.name)
    }
}

/// Why an instance stopped following the prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called.
    Closed,
    /// The registration lease keepalive stream ended.
    LeaseLost(LeaseId),
    /// The watch stream ended or failed.
    WatchTerminated(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Closed => write!(f, "closed"),
            CloseReason::LeaseLost(lease) => write!(f, "lease {lease} lost"),
            CloseReason::WatchTerminated(reason) => write!(f, "watch terminated: {reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
