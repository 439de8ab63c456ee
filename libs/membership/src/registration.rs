//! Self-registration: a lease-bound key under the watched prefix.
//!
//! A [`Registration`] owns a [`Watcher`] on the same prefix plus the lease its
//! key is bound to. The key disappears from every cache when the lease is
//! revoked on [`Registration::close`] or when it expires.

use std::{ops::Deref, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::MembershipConfig,
    error::{MembershipError, MembershipResult},
    lifecycle::Lifecycle,
    metrics,
    models::{CloseReason, LeaseId},
    substrate::{EtcdSubstrate, KeepAliveStream, Substrate},
    watcher::Watcher,
};

/// Name used in queue mode: the next store revision, zero padded so that
/// lexicographic and creation order agree.
pub fn queue_name(revision: i64) -> String {
    format!("{:020}", revision + 1)
}

/// A registered member of the group.
///
/// Derefs to the [`Watcher`] observing the same prefix.
#[derive(Debug)]
pub struct Registration {
    watcher: Watcher,
    lease: LeaseId,
    name: String,
    key: String,
}

impl Registration {
    /// Connect to the etcd endpoints in `config` and register.
    pub async fn connect(config: &MembershipConfig) -> MembershipResult<Self> {
        config.validate()?;
        let etcd = EtcdSubstrate::connect(config.endpoints.clone(), config.connect_timeout()).await?;
        Self::start(Arc::new(etcd), config).await
    }

    /// Start watching the prefix, then register under it.
    ///
    /// Without a name in `config` the member joins in queue mode. Any failure
    /// revokes the granted lease and closes the connection.
    pub async fn start(
        substrate: Arc<dyn Substrate>,
        config: &MembershipConfig,
    ) -> MembershipResult<Self> {
        let watcher = Watcher::start(substrate, config).await?;

        let lease = match watcher.substrate().grant_lease(config.ttl_secs).await {
            Ok(lease) => lease,
            Err(err) => {
                error!(?err, "unable to grant membership lease");
                watcher.close().await;
                return Err(err);
            }
        };
        debug!(lease, ttl = config.ttl_secs, "granted membership lease");

        match claim(&watcher, lease, config).await {
            Ok((name, key)) => Ok(Self {
                watcher,
                lease,
                name,
                key,
            }),
            Err(err) => {
                error!(?err, lease, "membership registration failed");
                teardown(&watcher, lease).await;
                Err(err)
            }
        }
    }

    /// This member's name, with the prefix stripped.
    pub fn my_name(&self) -> &str {
        &self.name
    }

    /// Full key this member is registered under.
    pub fn my_key(&self) -> &str {
        &self.key
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease
    }

    pub fn am_i_leader(&self) -> bool {
        self.watcher.leader_name().as_deref() == Some(self.name.as_str())
    }

    pub fn watcher(&self) -> &Watcher {
        &self.watcher
    }

    /// Stop the keepalive and watch tasks, revoke the lease and close the
    /// connection.
    pub async fn close(&self) {
        if !self.watcher.is_closed() {
            info!(key = self.key, lease = self.lease, "leaving membership group");
        }
        teardown(&self.watcher, self.lease).await;
    }
}

impl Deref for Registration {
    type Target = Watcher;

    fn deref(&self) -> &Watcher {
        &self.watcher
    }
}

async fn teardown(watcher: &Watcher, lease: LeaseId) {
    let lifecycle = watcher.lifecycle();
    lifecycle.shutdown(CloseReason::Closed);
    lifecycle.join().await;
    match watcher.substrate().revoke_lease(lease).await {
        Ok(()) => debug!(lease, "revoked membership lease"),
        Err(err) => debug!(?err, lease, "lease revoke skipped"),
    }
    watcher.close().await;
}

/// Start the keepalive task and create this member's key.
async fn claim(
    watcher: &Watcher,
    lease: LeaseId,
    config: &MembershipConfig,
) -> MembershipResult<(String, String)> {
    let substrate = watcher.substrate();
    let lifecycle = watcher.lifecycle();

    let stream = substrate
        .keep_alive(lease, config.keepalive_interval())
        .await?;
    lifecycle.spawn("keepalive", keep_lease_alive(stream, lease, lifecycle.clone()));

    let deadline = Instant::now() + config.ttl();
    let value = Bytes::from(config.value.clone());
    let mut attempts = 0u32;
    loop {
        if let Some(reason) = lifecycle.reason() {
            return Err(closed_error(reason));
        }
        attempts += 1;

        let name = match &config.name {
            Some(name) => name.clone(),
            None => queue_name(substrate.current_revision().await?),
        };
        let key = format!("{}{name}", config.prefix);

        if substrate.put_if_absent(&key, value.clone(), lease).await? {
            metrics::MEMBERSHIP_REGISTRATIONS.inc();
            info!(key, lease, attempts, "registered membership key");
            return Ok((name, key));
        }

        metrics::MEMBERSHIP_REGISTER_CONFLICTS.inc();
        let backoff = if config.name.is_some() {
            config.bootstrap_backoff()
        } else {
            // a fresh revision is read on the next attempt
            Duration::ZERO
        };
        if attempts >= config.max_register_attempts || Instant::now() + backoff > deadline {
            return Err(MembershipError::Conflict { key, attempts });
        }
        warn!(key, attempts, ?backoff, "membership key taken, retrying");
        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }
    }
}

fn closed_error(reason: CloseReason) -> MembershipError {
    match reason {
        CloseReason::LeaseLost(lease) => MembershipError::LeaseLost(lease),
        CloseReason::WatchTerminated(reason) => MembershipError::WatchTerminated(reason),
        CloseReason::Closed => MembershipError::Closed,
    }
}

/// Drain keepalive acks. The stream ending means the lease is gone.
async fn keep_lease_alive(mut stream: KeepAliveStream, lease: LeaseId, lifecycle: Lifecycle) {
    let token = lifecycle.token();
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(ttl)) => trace!(lease, ttl, "lease renewed"),
            Some(Err(err)) => {
                warn!(?err, lease, "lease keepalive failed");
                break;
            }
            None => break,
        }
    }
    if token.is_cancelled() {
        return;
    }
    metrics::MEMBERSHIP_LEASES_LOST.inc();
    error!(lease, "membership lease lost");
    lifecycle.shutdown(CloseReason::LeaseLost(lease));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MemoryStore;

    const PREFIX: &str = "/svc/";

    fn config() -> MembershipConfig {
        MembershipConfig::new(vec!["memory".into()], PREFIX, 2)
    }

    #[test]
    fn test_queue_name_is_padded_next_revision() {
        assert_eq!(queue_name(0), "00000000000000000001");
        assert_eq!(queue_name(41), "00000000000000000042");
        assert!(queue_name(9) < queue_name(10));
    }

    #[tokio::test]
    async fn test_named_registration() {
        let store = MemoryStore::new();
        let reg = Registration::start(
            Arc::new(store.connect()),
            &config().with_name("1111").with_value("1.2.3.4:1234"),
        )
        .await
        .unwrap();

        assert_eq!(reg.my_name(), "1111");
        assert_eq!(reg.my_key(), "/svc/1111");
        let kv = store.get("/svc/1111").unwrap();
        assert_eq!(kv.lease, reg.lease_id());
        assert_eq!(kv.value, Bytes::from_static(b"1.2.3.4:1234"));

        reg.close().await;
        assert!(store.get("/svc/1111").is_none());
        assert!(store.leases().is_empty());
        assert_eq!(reg.closed_reason(), Some(CloseReason::Closed));
    }

    #[tokio::test]
    async fn test_queue_mode_name_matches_create_revision() {
        let store = MemoryStore::new();
        store.put("/elsewhere", "x");
        let reg = Registration::start(Arc::new(store.connect()), &config())
            .await
            .unwrap();

        let kv = store.get(reg.my_key()).unwrap();
        assert_eq!(reg.my_name(), format!("{:020}", kv.create_revision));
        assert_eq!(reg.my_key(), format!("{PREFIX}{}", reg.my_name()));
        reg.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_taken_name_is_a_conflict() {
        let store = MemoryStore::new();
        let _reaper = store.spawn_reaper(Duration::from_millis(100));
        let first = Registration::start(Arc::new(store.connect()), &config().with_name("a"))
            .await
            .unwrap();

        let substrate = Arc::new(store.connect());
        let err = Registration::start(substrate.clone(), &config().with_name("a"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MembershipError::Conflict { ref key, attempts } if key == "/svc/a" && attempts >= 2
        ));
        assert!(err.is_conflict());

        // the loser's lease went away with it
        assert_eq!(store.leases(), vec![first.lease_id()]);
        assert!(matches!(
            substrate.current_revision().await,
            Err(MembershipError::Closed)
        ));
        first.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_end_reports_lease_lost() {
        let store = MemoryStore::new();
        let reg = Registration::start(Arc::new(store.connect()), &config().with_name("a"))
            .await
            .unwrap();

        assert!(store.expire_lease(reg.lease_id()));
        reg.closed().await;
        assert_eq!(reg.closed_reason(), Some(CloseReason::LeaseLost(reg.lease_id())));

        reg.close().await;
        assert_eq!(reg.closed_reason(), Some(CloseReason::LeaseLost(reg.lease_id())));
    }
}
