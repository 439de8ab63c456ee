#![allow(dead_code)]

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use membership::{
    LeaseId, MembershipConfig, MembershipResult, MemoryStore, MemorySubstrate, Substrate,
    models::RangeSnapshot,
    substrate::{KeepAliveStream, WatchStream},
};
use tokio::sync::Barrier;

pub const PREFIX: &str = "/svc/";
pub const TTL_SECS: i64 = 2;

pub fn config() -> MembershipConfig {
    MembershipConfig::new(vec!["memory".into()], PREFIX, TTL_SECS)
}

/// Store with a reaper expiring unrenewed leases, as the etcd server would.
pub fn store() -> MemoryStore {
    let store = MemoryStore::new();
    store.spawn_reaper(Duration::from_millis(100));
    store
}

/// Poll `cond` every 10ms until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let poll = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(within, poll).await.is_ok()
}

pub async fn within<F: Future>(limit: Duration, fut: F) -> Option<F::Output> {
    tokio::time::timeout(limit, fut).await.ok()
}

/// Memory connection whose first revision read waits for every other racer,
/// so all of them derive the same queue-mode name.
#[derive(Debug)]
pub struct RacingSubstrate {
    inner: MemorySubstrate,
    barrier: Arc<Barrier>,
    armed: AtomicBool,
}

impl RacingSubstrate {
    pub fn new(store: &MemoryStore, barrier: Arc<Barrier>) -> Self {
        Self {
            inner: store.connect(),
            barrier,
            armed: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Substrate for RacingSubstrate {
    async fn grant_lease(&self, ttl_secs: i64) -> MembershipResult<LeaseId> {
        self.inner.grant_lease(ttl_secs).await
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
        interval: Duration,
    ) -> MembershipResult<KeepAliveStream> {
        self.inner.keep_alive(lease, interval).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> MembershipResult<()> {
        self.inner.revoke_lease(lease).await
    }

    async fn get_range(&self, prefix: &str) -> MembershipResult<RangeSnapshot> {
        self.inner.get_range(prefix).await
    }

    async fn current_revision(&self) -> MembershipResult<i64> {
        let revision = self.inner.current_revision().await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.barrier.wait().await;
        }
        Ok(revision)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        lease: LeaseId,
    ) -> MembershipResult<bool> {
        self.inner.put_if_absent(key, value, lease).await
    }

    async fn watch(&self, prefix: &str, from_revision: i64) -> MembershipResult<WatchStream> {
        self.inner.watch(prefix, from_revision).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

/// Memory connection that compacts the store past the requested revision
/// right before opening a watch.
#[derive(Debug)]
pub struct CompactingSubstrate {
    inner: MemorySubstrate,
}

impl CompactingSubstrate {
    pub fn new(store: &MemoryStore) -> Self {
        Self {
            inner: store.connect(),
        }
    }
}

#[async_trait]
impl Substrate for CompactingSubstrate {
    async fn grant_lease(&self, ttl_secs: i64) -> MembershipResult<LeaseId> {
        self.inner.grant_lease(ttl_secs).await
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
        interval: Duration,
    ) -> MembershipResult<KeepAliveStream> {
        self.inner.keep_alive(lease, interval).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> MembershipResult<()> {
        self.inner.revoke_lease(lease).await
    }

    async fn get_range(&self, prefix: &str) -> MembershipResult<RangeSnapshot> {
        self.inner.get_range(prefix).await
    }

    async fn current_revision(&self) -> MembershipResult<i64> {
        self.inner.current_revision().await
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        lease: LeaseId,
    ) -> MembershipResult<bool> {
        self.inner.put_if_absent(key, value, lease).await
    }

    async fn watch(&self, prefix: &str, from_revision: i64) -> MembershipResult<WatchStream> {
        let store = self.inner.store();
        store.put("/unrelated", "x");
        store.put("/unrelated", "y");
        store.compact(from_revision + 1);
        self.inner.watch(prefix, from_revision).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
