//! Abstract substrate interface consumed by the watcher and the registrar.
//!
//! `Substrate` is the operation set a linearizable store with leases and
//! resumable watches must offer. `EtcdSubstrate` talks to a real etcd v3
//! cluster; `MemorySubstrate` is an in-process store with the same
//! guarantees, used by tests and local runs.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::MembershipResult;
use crate::models::{LeaseId, RangeSnapshot, WatchEvent};

pub mod etcd;
pub mod memory;

pub use etcd::EtcdSubstrate;
pub use memory::{MemoryStore, MemorySubstrate};

/// Ordered stream of committed mutation batches.
///
/// Ends when the connection is closed. A `Compacted` or `Connection` error is
/// always the last item.
pub type WatchStream = BoxStream<'static, MembershipResult<Vec<WatchEvent>>>;

/// Stream of keepalive acknowledgements carrying the remaining lease TTL in
/// seconds. Ends when the lease is revoked, expires or the connection drops.
pub type KeepAliveStream = BoxStream<'static, MembershipResult<i64>>;

/// Client-side view of the coordination store.
#[async_trait]
pub trait Substrate: Send + Sync + std::fmt::Debug + 'static {
    /// Grant a lease with the given TTL.
    async fn grant_lease(&self, ttl_secs: i64) -> MembershipResult<LeaseId>;

    /// Start renewing `lease` every `interval`.
    async fn keep_alive(&self, lease: LeaseId, interval: Duration)
    -> MembershipResult<KeepAliveStream>;

    /// Revoke `lease`, deleting every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> MembershipResult<()>;

    /// Read every key under `prefix`, oldest `create_revision` first.
    async fn get_range(&self, prefix: &str) -> MembershipResult<RangeSnapshot>;

    /// Current store revision.
    async fn current_revision(&self) -> MembershipResult<i64>;

    /// Create `key` bound to `lease` only if it does not exist.
    ///
    /// Returns `false` when the key already exists.
    async fn put_if_absent(&self, key: &str, value: Bytes, lease: LeaseId)
    -> MembershipResult<bool>;

    /// Watch every key under `prefix`, starting at `from_revision` inclusive.
    async fn watch(&self, prefix: &str, from_revision: i64) -> MembershipResult<WatchStream>;

    /// Drop the connection. Open streams end and later calls fail with `Closed`.
    async fn close(&self);
}
