//! In-process substrate with etcd semantics.
//!
//! A `MemoryStore` holds the shared state: a global revision counter, keys
//! with create/mod revisions, leases with deadlines, the event history and the
//! active watchers. Each `MemorySubstrate` obtained from `connect` behaves like
//! one client connection: closing it ends its watch and keepalive streams
//! without touching the store, so its lease runs out as it would against etcd.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{KeepAliveStream, Substrate, WatchStream};
use crate::error::{MembershipError, MembershipResult};
use crate::models::{KeyValue, LeaseId, RangeSnapshot, WatchEvent};

type WatchSender = mpsc::UnboundedSender<MembershipResult<Vec<WatchEvent>>>;

#[derive(Debug)]
struct LeaseEntry {
    ttl_secs: i64,
    deadline: Instant,
}

#[derive(Debug)]
struct WatchSubscriber {
    prefix: String,
    tx: WatchSender,
}

#[derive(Debug, Default)]
struct StoreState {
    revision: i64,
    compacted: i64,
    next_lease: LeaseId,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    /// Every committed batch, keyed by its revision.
    history: BTreeMap<i64, Vec<WatchEvent>>,
    watchers: Vec<WatchSubscriber>,
    /// Remaining `get_range` calls that fail with a connection error.
    failing_reads: u32,
}

impl StoreState {
    /// Commit one batch at a fresh revision and fan it out to watchers.
    fn commit(&mut self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        self.history.insert(self.revision, events.clone());
        self.watchers.retain(|sub| {
            let batch: Vec<WatchEvent> = events
                .iter()
                .filter(|ev| ev.key.starts_with(&sub.prefix))
                .cloned()
                .collect();
            if batch.is_empty() {
                return !sub.tx.is_closed();
            }
            sub.tx.send(Ok(batch)).is_ok()
        });
    }

    fn put(&mut self, key: &str, value: Bytes, lease: LeaseId) {
        self.revision += 1;
        let revision = self.revision;
        let kv = match self.kvs.get(key) {
            Some(existing) => KeyValue {
                value,
                mod_revision: revision,
                lease,
                ..existing.clone()
            },
            None => KeyValue {
                key: key.to_owned(),
                value,
                create_revision: revision,
                mod_revision: revision,
                lease,
            },
        };
        let event = WatchEvent::put(&kv);
        self.kvs.insert(key.to_owned(), kv);
        self.commit(vec![event]);
    }

    /// Delete every key bound to `lease` in a single revision.
    fn drop_lease(&mut self, lease: LeaseId) -> bool {
        if self.leases.remove(&lease).is_none() {
            return false;
        }
        let keys: Vec<String> = self
            .kvs
            .values()
            .filter(|kv| kv.lease == lease)
            .map(|kv| kv.key.clone())
            .collect();
        if keys.is_empty() {
            return true;
        }
        self.revision += 1;
        let revision = self.revision;
        let events = keys
            .into_iter()
            .map(|key| {
                self.kvs.remove(&key);
                WatchEvent::delete(key, revision)
            })
            .collect();
        self.commit(events);
        true
    }
}

/// Shared in-memory store. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client connection to this store.
    pub fn connect(&self) -> MemorySubstrate {
        MemorySubstrate {
            store: self.clone(),
            closed: CancellationToken::new(),
        }
    }

    /// Current store revision.
    pub fn revision(&self) -> i64 {
        self.state.lock().revision
    }

    /// Look up a key directly.
    pub fn get(&self, key: &str) -> Option<KeyValue> {
        self.state.lock().kvs.get(key).cloned()
    }

    /// Unconditional put without a lease.
    pub fn put(&self, key: &str, value: impl Into<Bytes>) {
        self.state.lock().put(key, value.into(), 0);
    }

    /// Delete a key. Returns false if it did not exist.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        if state.kvs.remove(key).is_none() {
            return false;
        }
        state.revision += 1;
        let revision = state.revision;
        state.commit(vec![WatchEvent::delete(key, revision)]);
        true
    }

    /// Expire `lease` immediately, as if its TTL had run out.
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        self.state.lock().drop_lease(lease)
    }

    /// Leases currently alive.
    pub fn leases(&self) -> Vec<LeaseId> {
        let mut ids: Vec<LeaseId> = self.state.lock().leases.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Discard history older than `revision`. Watches starting before it fail.
    pub fn compact(&self, revision: i64) {
        let mut state = self.state.lock();
        state.compacted = state.compacted.max(revision);
        let keep = state.history.split_off(&revision);
        state.history = keep;
    }

    /// Make the next `count` range reads fail with a connection error.
    pub fn fail_reads(&self, count: u32) {
        self.state.lock().failing_reads = count;
    }

    /// End every open watch stream with an error, as a server-side cancel would.
    pub fn cancel_watches(&self, reason: &str) {
        let mut state = self.state.lock();
        for sub in state.watchers.drain(..) {
            let _ = sub
                .tx
                .send(Err(MembershipError::WatchTerminated(reason.to_owned())));
        }
    }

    /// Expire every lease whose deadline has passed. Returns how many expired.
    pub fn expire_due_leases(&self) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();
        let due: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in &due {
            debug!(lease, "memory store lease expired");
            state.drop_lease(*lease);
        }
        due.len()
    }

    /// Spawn a task expiring leases every `period`. Stops once the store is dropped.
    pub fn spawn_reaper(&self, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Mutex<StoreState>> = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(state) = weak.upgrade() else {
                    return;
                };
                MemoryStore { state }.expire_due_leases();
            }
        })
    }

    fn refresh_lease(&self, lease: LeaseId) -> Option<i64> {
        let mut state = self.state.lock();
        let entry = state.leases.get_mut(&lease)?;
        if entry.deadline <= Instant::now() {
            return None;
        }
        entry.deadline = Instant::now() + Duration::from_secs(entry.ttl_secs as u64);
        Some(entry.ttl_secs)
    }
}

/// One client connection to a `MemoryStore`.
#[derive(Debug, Clone)]
pub struct MemorySubstrate {
    store: MemoryStore,
    closed: CancellationToken,
}

impl MemorySubstrate {
    /// The store this connection talks to.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn ensure_open(&self) -> MembershipResult<()> {
        if self.closed.is_cancelled() {
            return Err(MembershipError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Substrate for MemorySubstrate {
    async fn grant_lease(&self, ttl_secs: i64) -> MembershipResult<LeaseId> {
        self.ensure_open()?;
        if ttl_secs < 1 {
            return Err(MembershipError::Config(format!(
                "lease ttl must be positive, got {ttl_secs}"
            )));
        }
        let mut state = self.store.state.lock();
        state.next_lease += 1;
        let lease = state.next_lease;
        state.leases.insert(
            lease,
            LeaseEntry {
                ttl_secs,
                deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
            },
        );
        trace!(lease, ttl_secs, "memory store granted lease");
        Ok(lease)
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
        interval: Duration,
    ) -> MembershipResult<KeepAliveStream> {
        self.ensure_open()?;
        if !self.store.state.lock().leases.contains_key(&lease) {
            return Err(MembershipError::LeaseLost(lease));
        }
        let store = self.store.clone();
        let token = self.closed.clone();
        let ticker = tokio::time::interval(interval);

        let stream = futures::stream::unfold(
            (store, token, ticker),
            move |(store, token, mut ticker)| async move {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return None,
                    _ = ticker.tick() => {}
                }
                let ttl = store.refresh_lease(lease)?;
                Some((Ok(ttl), (store, token, ticker)))
            },
        );
        Ok(stream.boxed())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> MembershipResult<()> {
        self.ensure_open()?;
        if self.store.state.lock().drop_lease(lease) {
            Ok(())
        } else {
            Err(MembershipError::LeaseLost(lease))
        }
    }

    async fn get_range(&self, prefix: &str) -> MembershipResult<RangeSnapshot> {
        self.ensure_open()?;
        let mut state = self.store.state.lock();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(MembershipError::Connection(
                "memory store unreachable".into(),
            ));
        }
        let mut entries: Vec<KeyValue> = state
            .kvs
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        entries.sort_by_key(|kv| kv.create_revision);
        Ok(RangeSnapshot {
            entries,
            revision: state.revision,
        })
    }

    async fn current_revision(&self) -> MembershipResult<i64> {
        self.ensure_open()?;
        Ok(self.store.revision())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        lease: LeaseId,
    ) -> MembershipResult<bool> {
        self.ensure_open()?;
        let mut state = self.store.state.lock();
        if !state.leases.contains_key(&lease) {
            return Err(MembershipError::LeaseLost(lease));
        }
        if state.kvs.contains_key(key) {
            return Ok(false);
        }
        state.put(key, value, lease);
        Ok(true)
    }

    async fn watch(&self, prefix: &str, from_revision: i64) -> MembershipResult<WatchStream> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.store.state.lock();
            if from_revision < state.compacted {
                let _ = tx.send(Err(MembershipError::Compacted {
                    requested: from_revision,
                    compacted: state.compacted,
                }));
            } else {
                // replay and subscribe under one lock so nothing falls in between
                for events in state.history.range(from_revision..).map(|(_, ev)| ev) {
                    let batch: Vec<WatchEvent> = events
                        .iter()
                        .filter(|ev| ev.key.starts_with(prefix))
                        .cloned()
                        .collect();
                    if !batch.is_empty() {
                        let _ = tx.send(Ok(batch));
                    }
                }
                state.watchers.push(WatchSubscriber {
                    prefix: prefix.to_owned(),
                    tx,
                });
            }
        }
        let stream = UnboundedReceiverStream::new(rx).take_until(self.closed.clone().cancelled_owned());
        Ok(stream.boxed())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
