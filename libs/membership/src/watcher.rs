//! Read-only membership view: bootstraps a [`MemberCache`] from a range read,
//! then keeps it current from the substrate's watch stream on a background task.

use std::{collections::HashMap, future::Future, sync::Arc};

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::Instant,
};
use tokio_util::sync::DropGuard;
use tracing::{debug, error, info, trace, warn};

use crate::{
    cache::MemberCache,
    config::MembershipConfig,
    error::{MembershipError, MembershipResult},
    lifecycle::Lifecycle,
    metrics,
    models::{Change, CloseReason, RangeSnapshot, WatchEvent},
    substrate::{EtcdSubstrate, Substrate, WatchStream},
};

/// Live mirror of every member registered under a prefix.
///
/// Accessors are synchronous and return copies taken under the cache lock.
/// Once closed, the accessors keep serving the last known state.
#[derive(Debug)]
pub struct Watcher {
    substrate: Arc<dyn Substrate>,
    prefix: String,
    cache: Arc<Mutex<MemberCache>>,
    changes: Mutex<Option<mpsc::Receiver<Change>>>,
    lifecycle: Lifecycle,
    _guard: DropGuard,
}

impl Watcher {
    /// Connect to the etcd endpoints in `config` and start watching its prefix.
    pub async fn connect(config: &MembershipConfig) -> MembershipResult<Self> {
        config.validate()?;
        let etcd = EtcdSubstrate::connect(config.endpoints.clone(), config.connect_timeout()).await?;
        Self::start(Arc::new(etcd), config).await
    }

    /// Bootstrap from `substrate` and spawn the watch loop.
    ///
    /// The watcher takes ownership of the connection: it is closed when the
    /// watcher is, or when bootstrapping fails.
    pub async fn start(
        substrate: Arc<dyn Substrate>,
        config: &MembershipConfig,
    ) -> MembershipResult<Self> {
        config.validate()?;
        let prefix = config.prefix.clone();

        let snapshot = match bootstrap(substrate.as_ref(), config).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!(?err, prefix, "membership bootstrap failed");
                substrate.close().await;
                return Err(err);
            }
        };

        let cache = MemberCache::from_snapshot(&prefix, &snapshot);
        metrics::MEMBERSHIP_MEMBERS.set(cache.len() as i64);
        info!(
            prefix,
            revision = snapshot.revision,
            members = cache.len(),
            leader = cache.leader_name(),
            "membership cache bootstrapped"
        );

        // resume right after the snapshot so no mutation is missed or seen twice
        let stream = match substrate.watch(&prefix, snapshot.revision + 1).await {
            Ok(stream) => stream,
            Err(err) => {
                error!(?err, prefix, "unable to open membership watch");
                substrate.close().await;
                return Err(err);
            }
        };

        let cache = Arc::new(Mutex::new(cache));
        let (tx, rx) = mpsc::channel(config.change_buffer);
        let lifecycle = Lifecycle::new();
        lifecycle.spawn(
            "watch",
            watch_loop(stream, cache.clone(), tx, lifecycle.clone()),
        );

        Ok(Self {
            substrate,
            prefix,
            cache,
            changes: Mutex::new(Some(rx)),
            _guard: lifecycle.drop_guard(),
            lifecycle,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The substrate connection this watcher owns.
    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    /// Name to value copy of every member.
    pub fn get_all(&self) -> HashMap<String, Bytes> {
        self.cache.lock().to_map()
    }

    /// Member names, oldest first.
    pub fn get_names(&self) -> Vec<String> {
        self.cache
            .lock()
            .members_by_age()
            .into_iter()
            .map(|m| m.name.clone())
            .collect()
    }

    /// Member values, oldest first.
    pub fn get_values(&self) -> Vec<Bytes> {
        self.cache
            .lock()
            .members_by_age()
            .into_iter()
            .map(|m| m.value.clone())
            .collect()
    }

    pub fn get_value_by_name(&self, name: &str) -> Option<Bytes> {
        self.cache.lock().get(name).map(|m| m.value.clone())
    }

    /// `(name, value)` of the member with the smallest creation revision.
    pub fn get_leader(&self) -> Option<(String, Bytes)> {
        self.cache
            .lock()
            .leader()
            .map(|m| (m.name.clone(), m.value.clone()))
    }

    pub fn leader_name(&self) -> Option<String> {
        self.cache.lock().leader_name().map(str::to_owned)
    }

    /// Hand out the change receiver. Only the first caller gets it.
    ///
    /// Changes are offered without blocking; when the receiver falls more than
    /// `change_buffer` entries behind, newer changes are dropped.
    pub fn take_changes(&self) -> Option<mpsc::Receiver<Change>> {
        self.changes.lock().take()
    }

    /// Resolves once the watcher is closed, whatever the reason.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + '_ {
        self.lifecycle.closed()
    }

    pub fn closed_reason(&self) -> Option<CloseReason> {
        self.lifecycle.reason()
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    pub(crate) fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Stop background tasks and close the substrate connection.
    pub async fn close(&self) {
        if self.lifecycle.shutdown(CloseReason::Closed) {
            info!(prefix = self.prefix, "closing membership watcher");
        }
        self.lifecycle.join().await;
        self.substrate.close().await;
    }
}

/// Read the prefix, retrying connection failures with a fixed backoff until
/// the TTL deadline.
async fn bootstrap(
    substrate: &dyn Substrate,
    config: &MembershipConfig,
) -> MembershipResult<RangeSnapshot> {
    let deadline = Instant::now() + config.ttl();
    let backoff = config.bootstrap_backoff();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match substrate.get_range(&config.prefix).await {
            Ok(snapshot) => return Ok(snapshot),
            Err(err) if err.is_retryable() && Instant::now() + backoff <= deadline => {
                metrics::MEMBERSHIP_BOOTSTRAP_RETRIES.inc();
                warn!(?err, attempts, ?backoff, "membership range read failed, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn watch_loop(
    mut stream: WatchStream,
    cache: Arc<Mutex<MemberCache>>,
    tx: mpsc::Sender<Change>,
    lifecycle: Lifecycle,
) {
    let token = lifecycle.token();
    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(batch)) => apply_batch(&cache, &tx, &batch),
            Some(Err(err)) => {
                error!(?err, "membership watch failed");
                break err_reason(err);
            }
            None => {
                if token.is_cancelled() {
                    return;
                }
                warn!("membership watch stream ended");
                break "watch stream ended".to_owned();
            }
        }
    };
    metrics::MEMBERSHIP_WATCH_TERMINATIONS.inc();
    lifecycle.shutdown(CloseReason::WatchTerminated(reason));
}

fn err_reason(err: MembershipError) -> String {
    match err {
        MembershipError::WatchTerminated(reason) => reason,
        other => other.to_string(),
    }
}

fn apply_batch(cache: &Mutex<MemberCache>, tx: &mpsc::Sender<Change>, batch: &[WatchEvent]) {
    let (changes, leader) = {
        let mut cache = cache.lock();
        let before = cache.leader_name().map(str::to_owned);
        let changes: Vec<Change> = batch.iter().filter_map(|ev| cache.apply(ev)).collect();
        metrics::MEMBERSHIP_MEMBERS.set(cache.len() as i64);
        let after = cache.leader_name().map(str::to_owned);
        (changes, (before != after).then_some(after))
    };
    metrics::MEMBERSHIP_EVENTS_APPLIED.inc_by(changes.len() as u64);
    debug!(events = changes.len(), "applied membership batch");

    if let Some(leader) = leader {
        metrics::MEMBERSHIP_LEADER_CHANGES.inc();
        info!(leader = leader.as_deref(), "membership leader changed");
    }

    let mut dropped = 0u64;
    for change in changes {
        match tx.try_send(change) {
            Ok(()) => {}
            Err(TrySendError::Full(change)) => {
                dropped += 1;
                trace!(%change, "change channel full");
            }
            // nobody listens anymore
            Err(TrySendError::Closed(_)) => {}
        }
    }
    if dropped > 0 {
        metrics::MEMBERSHIP_CHANGES_DROPPED.inc_by(dropped);
        warn!(dropped, "change channel full, dropped notifications");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::{models::EventKind, substrate::MemoryStore};

    const PREFIX: &str = "/svc/";

    fn config() -> MembershipConfig {
        MembershipConfig::new(vec!["memory".into()], PREFIX, 2)
    }

    async fn settle() {
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_bootstrap_reads_existing_members() {
        let store = MemoryStore::new();
        store.put("/svc/b", "vb");
        store.put("/svc/a", "va");
        store.put("/other/x", "vx");

        let watcher = Watcher::start(Arc::new(store.connect()), &config())
            .await
            .unwrap();
        assert_eq!(watcher.get_names(), vec!["b", "a"]);
        assert_eq!(watcher.get_leader(), Some(("b".into(), Bytes::from_static(b"vb"))));
        assert_eq!(watcher.get_value_by_name("a"), Some(Bytes::from_static(b"va")));
        assert_eq!(watcher.get_value_by_name("x"), None);
        watcher.close().await;
    }

    #[tokio::test]
    async fn test_watch_loop_follows_changes() {
        let store = MemoryStore::new();
        store.put("/svc/a", "1");
        let watcher = Watcher::start(Arc::new(store.connect()), &config())
            .await
            .unwrap();
        let mut changes = watcher.take_changes().unwrap();
        assert!(watcher.take_changes().is_none());

        store.put("/svc/b", "2");
        store.delete("/svc/a");

        let first = changes.recv().await.unwrap();
        assert_eq!((first.name.as_str(), first.op), ("b", EventKind::Put));
        let second = changes.recv().await.unwrap();
        assert_eq!((second.name.as_str(), second.op), ("a", EventKind::Delete));

        assert_eq!(watcher.get_names(), vec!["b"]);
        assert_eq!(watcher.leader_name().as_deref(), Some("b"));
        assert_eq!(watcher.get_all(), watcher.get_all());
        watcher.close().await;
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_stalling() {
        let store = MemoryStore::new();
        let watcher = Watcher::start(
            Arc::new(store.connect()),
            &config().with_change_buffer(2),
        )
        .await
        .unwrap();

        for i in 0..5 {
            store.put(&format!("/svc/m{i}"), "v");
        }
        settle().await;

        assert_eq!(watcher.get_names().len(), 5);
        let mut changes = watcher.take_changes().unwrap();
        assert_eq!(changes.recv().await.unwrap().name, "m0");
        assert_eq!(changes.recv().await.unwrap().name, "m1");
        assert!(changes.try_recv().is_err());
        watcher.close().await;
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_bootstrap_retries_then_succeeds() {
        let store = MemoryStore::new();
        store.put("/svc/a", "1");
        store.fail_reads(1);

        let started = Instant::now();
        let watcher = Watcher::start(Arc::new(store.connect()), &config())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(watcher.get_names(), vec!["a"]);
        assert!(logs_contain("membership range read failed, retrying"));
        watcher.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_gives_up_at_ttl_deadline() {
        let store = MemoryStore::new();
        store.fail_reads(100);
        let substrate = Arc::new(store.connect());

        let started = Instant::now();
        let err = Watcher::start(substrate.clone(), &config()).await.unwrap_err();
        assert!(matches!(err, MembershipError::Connection(_)));
        assert!(started.elapsed() <= Duration::from_secs(2));
        // the connection was handed over and is closed with the failed watcher
        assert!(matches!(
            substrate.current_revision().await,
            Err(MembershipError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_compaction_terminates_watch() {
        let store = MemoryStore::new();
        let watcher = Watcher::start(Arc::new(store.connect()), &config())
            .await
            .unwrap();
        store.cancel_watches("required revision has been compacted");

        watcher.closed().await;
        assert_eq!(
            watcher.closed_reason(),
            Some(CloseReason::WatchTerminated(
                "required revision has been compacted".into()
            ))
        );
        // stale reads still work
        assert!(watcher.get_names().is_empty());
        watcher.close().await;
        assert!(matches!(
            watcher.closed_reason(),
            Some(CloseReason::WatchTerminated(_))
        ));
    }

    #[tokio::test]
    async fn test_close_fires_once_and_keeps_last_state() {
        let store = MemoryStore::new();
        store.put("/svc/a", "1");
        let watcher = Watcher::start(Arc::new(store.connect()), &config())
            .await
            .unwrap();
        watcher.close().await;
        watcher.close().await;
        assert!(watcher.is_closed());
        assert_eq!(watcher.closed_reason(), Some(CloseReason::Closed));

        store.put("/svc/b", "2");
        settle().await;
        assert_eq!(watcher.get_names(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let store = MemoryStore::new();
        let mut config = config();
        config.prefix.clear();
        let err = Watcher::start(Arc::new(store.connect()), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, MembershipError::Config(_)));
    }
}
