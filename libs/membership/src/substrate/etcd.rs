//! etcd v3 substrate backed by `etcd-client`.
//!
//! Every call clones the underlying client (cheap, it is a channel handle).
//! Streams opened here stop when `close` cancels the adapter's token.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use etcd_client::{
    Compare, CompareOp, ConnectOptions, EventType, GetOptions, PutOptions, SortOrder, SortTarget,
    Txn, TxnOp, WatchOptions,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{KeepAliveStream, Substrate, WatchStream};
use crate::error::{MembershipError, MembershipResult};
use crate::models::{EventKind, KeyValue, LeaseId, RangeSnapshot, WatchEvent};

/// TCP keepalive period on the gRPC channel.
const DIAL_KEEPALIVE_TIME: Duration = Duration::from_secs(2);

/// TCP keepalive timeout on the gRPC channel.
const DIAL_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Map an etcd error onto the membership taxonomy.
///
/// `etcd_client::Error` does not expose structured status codes for every
/// failure, so classification goes by message.
pub(crate) fn classify_error(context: &str, err: etcd_client::Error) -> MembershipError {
    let msg = err.to_string();
    let lower = msg.to_lowercase();

    if lower.contains("compacted") {
        return MembershipError::WatchTerminated(format!("{context}: {msg}"));
    }
    if lower.contains("invalid arg") || lower.contains("invalid uri") {
        return MembershipError::Config(format!("{context}: {msg}"));
    }
    MembershipError::Connection(format!("{context}: {msg}"))
}

fn convert_kv(kv: &etcd_client::KeyValue) -> MembershipResult<KeyValue> {
    let key = kv
        .key_str()
        .map_err(|e| MembershipError::Connection(format!("non UTF-8 key from etcd: {e}")))?;
    Ok(KeyValue {
        key: key.to_owned(),
        value: Bytes::copy_from_slice(kv.value()),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        lease: kv.lease(),
    })
}

fn convert_event(event: &etcd_client::Event) -> Option<WatchEvent> {
    let kv = event.kv()?;
    let kv = match convert_kv(kv) {
        Ok(kv) => kv,
        Err(err) => {
            warn!(?err, "skipping watch event with undecodable key");
            return None;
        }
    };
    Some(match event.event_type() {
        EventType::Put => WatchEvent::put(&kv),
        EventType::Delete => WatchEvent {
            kind: EventKind::Delete,
            key: kv.key,
            value: Bytes::new(),
            create_revision: 0,
            mod_revision: kv.mod_revision,
        },
    })
}

/// Substrate adapter over an etcd v3 cluster.
#[derive(Clone)]
pub struct EtcdSubstrate {
    client: etcd_client::Client,
    endpoints: Vec<String>,
    closed: CancellationToken,
}

impl EtcdSubstrate {
    /// Connect to the given endpoints.
    pub async fn connect(
        endpoints: Vec<String>,
        connect_timeout: Duration,
    ) -> MembershipResult<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(connect_timeout)
            .with_keep_alive(DIAL_KEEPALIVE_TIME, DIAL_KEEPALIVE_TIMEOUT);

        info!(?endpoints, ?connect_timeout, "connecting to etcd");
        let client = etcd_client::Client::connect(endpoints.clone(), Some(options))
            .await
            .map_err(|e| {
                classify_error(
                    &format!("unable to connect to etcd at {}", endpoints.join(", ")),
                    e,
                )
            })?;

        Ok(Self {
            client,
            endpoints,
            closed: CancellationToken::new(),
        })
    }

    /// Configured endpoints.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Clone of the underlying client for callers needing raw etcd access.
    pub fn client(&self) -> etcd_client::Client {
        self.client.clone()
    }

    fn live_client(&self) -> MembershipResult<etcd_client::Client> {
        if self.closed.is_cancelled() {
            return Err(MembershipError::Closed);
        }
        Ok(self.client.clone())
    }
}

impl std::fmt::Debug for EtcdSubstrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdSubstrate")
            .field("endpoints", &self.endpoints)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Substrate for EtcdSubstrate {
    async fn grant_lease(&self, ttl_secs: i64) -> MembershipResult<LeaseId> {
        let mut client = self.live_client()?;
        let resp = client
            .lease_grant(ttl_secs, None)
            .await
            .map_err(|e| classify_error("lease grant failed", e))?;
        debug!(lease = resp.id(), ttl = resp.ttl(), "granted etcd lease");
        Ok(resp.id())
    }

    async fn keep_alive(
        &self,
        lease: LeaseId,
        interval: Duration,
    ) -> MembershipResult<KeepAliveStream> {
        let mut client = self.live_client()?;
        let (keeper, responses) = client
            .lease_keep_alive(lease)
            .await
            .map_err(|e| classify_error("lease keepalive failed", e))?;

        let ticker = tokio::time::interval(interval);
        let token = self.closed.clone();
        let state = Some((keeper, responses, ticker, token));

        let stream = futures::stream::unfold(state, move |state| async move {
            let (mut keeper, mut responses, mut ticker, token) = state?;
            tokio::select! {
                biased;
                _ = token.cancelled() => return None,
                _ = ticker.tick() => {}
            }
            if let Err(err) = keeper.keep_alive().await {
                return Some((Err(classify_error("keepalive send failed", err)), None));
            }
            match responses.message().await {
                Ok(Some(resp)) if resp.ttl() > 0 => {
                    let ttl = resp.ttl();
                    Some((Ok(ttl), Some((keeper, responses, ticker, token))))
                }
                Ok(Some(_)) => {
                    debug!(lease, "etcd reports lease expired");
                    None
                }
                Ok(None) => None,
                Err(err) => Some((Err(classify_error("keepalive receive failed", err)), None)),
            }
        });
        Ok(stream.boxed())
    }

    async fn revoke_lease(&self, lease: LeaseId) -> MembershipResult<()> {
        let mut client = self.live_client()?;
        client
            .lease_revoke(lease)
            .await
            .map_err(|e| classify_error("lease revoke failed", e))?;
        Ok(())
    }

    async fn get_range(&self, prefix: &str) -> MembershipResult<RangeSnapshot> {
        let mut client = self.live_client()?;
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Create, SortOrder::Ascend);
        let resp = client
            .get(prefix, Some(options))
            .await
            .map_err(|e| classify_error(&format!("range read of '{prefix}' failed"), e))?;

        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        let entries = resp
            .kvs()
            .iter()
            .map(convert_kv)
            .collect::<MembershipResult<Vec<_>>>()?;
        Ok(RangeSnapshot { entries, revision })
    }

    async fn current_revision(&self) -> MembershipResult<i64> {
        let mut client = self.live_client()?;
        let resp = client
            .get("/", Some(GetOptions::new().with_count_only()))
            .await
            .map_err(|e| classify_error("revision read failed", e))?;
        resp.header()
            .map(|h| h.revision())
            .ok_or_else(|| MembershipError::Connection("etcd response without header".into()))
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Bytes,
        lease: LeaseId,
    ) -> MembershipResult<bool> {
        let mut client = self.live_client()?;
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key,
                value.to_vec(),
                Some(PutOptions::new().with_lease(lease)),
            )]);
        let resp = client
            .txn(txn)
            .await
            .map_err(|e| classify_error(&format!("conditional create of '{key}' failed"), e))?;
        Ok(resp.succeeded())
    }

    async fn watch(&self, prefix: &str, from_revision: i64) -> MembershipResult<WatchStream> {
        let mut client = self.live_client()?;
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(from_revision);
        let (watcher, responses) = client
            .watch(prefix, Some(options))
            .await
            .map_err(|e| classify_error(&format!("watch of '{prefix}' failed"), e))?;

        let token = self.closed.clone();
        let state = Some((watcher, responses, token));

        let stream = futures::stream::unfold(state, move |state| async move {
            let (watcher, mut responses, token) = state?;
            loop {
                let message = tokio::select! {
                    biased;
                    _ = token.cancelled() => return None,
                    message = responses.message() => message,
                };
                match message {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            let compacted = resp.compact_revision();
                            let err = if compacted > 0 {
                                MembershipError::Compacted {
                                    requested: from_revision,
                                    compacted,
                                }
                            } else {
                                MembershipError::WatchTerminated(format!(
                                    "watch canceled by etcd: {}",
                                    resp.cancel_reason()
                                ))
                            };
                            return Some((Err(err), None));
                        }
                        let events: Vec<WatchEvent> =
                            resp.events().iter().filter_map(convert_event).collect();
                        // creation acks and progress notifications carry no events
                        if events.is_empty() {
                            continue;
                        }
                        return Some((Ok(events), Some((watcher, responses, token))));
                    }
                    Ok(None) => return None,
                    Err(err) => {
                        return Some((Err(classify_error("watch stream failed", err)), None));
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn close(&self) {
        if !self.closed.is_cancelled() {
            info!(endpoints = ?self.endpoints, "closing etcd connection");
        }
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_invalid_args_as_config() {
        let err = classify_error("get", etcd_client::Error::InvalidArgs("empty key".into()));
        assert!(matches!(err, MembershipError::Config(_)));
    }

    #[test]
    fn test_classify_compaction_as_watch_terminated() {
        let err = classify_error(
            "watch",
            etcd_client::Error::WatchError("required revision has been compacted".into()),
        );
        assert!(matches!(err, MembershipError::WatchTerminated(_)));
        assert!(err.is_terminal());
    }

    #[test]
    fn test_classify_transport_as_connection() {
        let err = classify_error(
            "keepalive",
            etcd_client::Error::LeaseKeepAliveError("service unavailable".into()),
        );
        assert!(matches!(err, MembershipError::Connection(ref msg) if msg.starts_with("keepalive: ")));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    #[ignore = "requires a running etcd at 127.0.0.1:2379"]
    async fn test_conditional_create_against_live_etcd() {
        let etcd = EtcdSubstrate::connect(
            vec!["http://127.0.0.1:2379".into()],
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        let lease = etcd.grant_lease(2).await.unwrap();
        let key = format!("/membership-test/{lease}");
        assert!(etcd.put_if_absent(&key, Bytes::from_static(b"a"), lease).await.unwrap());
        assert!(!etcd.put_if_absent(&key, Bytes::from_static(b"b"), lease).await.unwrap());
        etcd.revoke_lease(lease).await.unwrap();
        etcd.close().await;
        assert!(matches!(
            etcd.current_revision().await,
            Err(MembershipError::Closed)
        ));
    }
}
