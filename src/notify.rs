//! Cluster Fan-out
//!
//! Broadcast an operation to other cluster members with a policy for
//! partially-available clusters. Selection happens at construction time:
//! offline members (by heartbeat, confirmed by a live probe) are either
//! fatal (All), skipped (Alive) or attempted anyway (TryAll).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::store::MembershipDb;
use crate::transport::{PeerClient, PeerTransport};

/// Behavior of a fan-out towards members that are down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyPolicy {
    /// Require every member to be reachable
    All,
    /// Silently skip offline members
    Alive,
    /// Attempt every member regardless of state
    TryAll,
}

/// Hook invoked once per notified peer. Must be idempotent: it can run after
/// a partial success on other peers.
pub type NotifyHook = Arc<
    dyn Fn(Arc<dyn PeerClient>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

/// A prepared fan-out to a fixed set of peers
pub struct Notifier {
    peers: Vec<String>,
    policy: NotifyPolicy,
    transport: Arc<dyn PeerTransport>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("peers", &self.peers)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Notifier {
    /// Select the peers to notify, excluding the local member. Fails with
    /// `PeerUnreachable` under the All policy if any member is down.
    pub async fn new(
        db: &MembershipDb,
        transport: Arc<dyn PeerTransport>,
        local_address: &str,
        policy: NotifyPolicy,
    ) -> Result<Self> {
        let mut peers = Vec::new();

        // Fast-track the standalone case.
        if db.is_clustered().await? {
            let threshold = db.offline_threshold().await?;
            for member in db.list_members().await? {
                if member.address == local_address {
                    continue;
                }

                if member.is_offline(threshold) {
                    // The heartbeat may just be lagging; probe before giving
                    // up on the peer.
                    if !transport.probe(&member.address).await {
                        match policy {
                            NotifyPolicy::All => {
                                return Err(Error::PeerUnreachable {
                                    address: member.address,
                                    reason: "member is down".into(),
                                });
                            }
                            NotifyPolicy::Alive => continue,
                            NotifyPolicy::TryAll => {}
                        }
                    }
                }

                peers.push(member.address);
            }
        }

        Ok(Self {
            peers,
            policy,
            transport,
        })
    }

    /// Number of peers this notifier will contact.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Invoke `hook` against every selected peer concurrently and wait for
    /// all of them. Returns the first non-ignorable error in peer order.
    pub async fn notify(&self, hook: NotifyHook) -> Result<()> {
        let mut tasks = JoinSet::new();

        for (index, address) in self.peers.iter().cloned().enumerate() {
            let transport = Arc::clone(&self.transport);
            let hook = Arc::clone(&hook);
            tasks.spawn(async move {
                tracing::debug!(peer = %address, "notifying member of state change");
                let outcome = match transport.connect(&address).await {
                    Ok(client) => hook(client).await,
                    Err(err) => Err(err),
                };
                (index, address, outcome)
            });
        }

        let mut results: Vec<Option<(String, Result<()>)>> =
            (0..self.peers.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (index, address, outcome) =
                joined.map_err(|err| Error::Internal(format!("notify task panicked: {err}")))?;
            results[index] = Some((address, outcome));
        }

        for entry in results.into_iter().flatten() {
            let (address, outcome) = entry;
            if let Err(err) = outcome {
                if self.policy == NotifyPolicy::Alive && err.is_connection_error() {
                    tracing::warn!(peer = %address, "could not notify member: {err}");
                    continue;
                }
                return Err(err);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::transport::{
        AcceptRequest, AcceptResponse, CertificateUpdate, ClusterResources,
    };
    use crate::trust::PeerCertificate;

    struct StubClient {
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PeerClient for StubClient {
        async fn redeem_token(&self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn revoke_trust(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn cluster_resources(&self) -> Result<ClusterResources> {
            Ok(ClusterResources::default())
        }
        async fn trusted_certs(&self) -> Result<Vec<PeerCertificate>> {
            Ok(Vec::new())
        }
        async fn accept(&self, _: &AcceptRequest) -> Result<AcceptResponse> {
            Err(Error::Internal("not implemented".into()))
        }
        async fn assign(&self, _: &[crate::store::RaftNode]) -> Result<()> {
            Ok(())
        }
        async fn rebalance(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::Transient("boom".into()))
            } else {
                Ok(())
            }
        }
        async fn handover(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn delete_raft_node(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn remove_member(&self, _: &str, _: bool) -> Result<()> {
            Ok(())
        }
        async fn update_certificate(&self, _: &CertificateUpdate) -> Result<()> {
            Ok(())
        }
        async fn disable_clustering(&self) -> Result<()> {
            Ok(())
        }
        async fn delete_network(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn delete_storage_pool(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    struct StubTransport {
        reachable: HashSet<String>,
        failing: HashSet<String>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PeerTransport for StubTransport {
        async fn connect(&self, address: &str) -> Result<Arc<dyn PeerClient>> {
            if !self.reachable.contains(address) {
                return Err(Error::PeerUnreachable {
                    address: address.to_string(),
                    reason: "connection refused".into(),
                });
            }
            Ok(Arc::new(StubClient {
                fail: self.failing.contains(address),
                calls: Arc::clone(&self.calls),
            }))
        }

        async fn probe(&self, address: &str) -> bool {
            self.reachable.contains(address)
        }
    }

    async fn three_member_db() -> MembershipDb {
        let db = MembershipDb::open_ephemeral().unwrap();
        db.create_member("a", "10.0.0.1:8443", 4, 12, "x86_64")
            .await
            .unwrap();
        db.create_member("b", "10.0.0.2:8443", 4, 12, "x86_64")
            .await
            .unwrap();
        db.create_member("c", "10.0.0.3:8443", 4, 12, "x86_64")
            .await
            .unwrap();
        db
    }

    fn transport(reachable: &[&str], failing: &[&str]) -> (Arc<StubTransport>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let transport = Arc::new(StubTransport {
            reachable: reachable.iter().map(|s| s.to_string()).collect(),
            failing: failing.iter().map(|s| s.to_string()).collect(),
            calls: Arc::clone(&calls),
        });
        (transport, calls)
    }

    fn rebalance_hook() -> NotifyHook {
        Arc::new(|client| Box::pin(async move { client.rebalance().await }))
    }

    #[tokio::test]
    async fn test_notify_excludes_self() {
        let db = three_member_db().await;
        let (transport, calls) = transport(&["10.0.0.2:8443", "10.0.0.3:8443"], &[]);

        let notifier = Notifier::new(&db, transport, "10.0.0.1:8443", NotifyPolicy::All)
            .await
            .unwrap();
        assert_eq!(notifier.peer_count(), 2);

        notifier.notify(rebalance_hook()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_all_policy_rejects_offline_peer() {
        let db = three_member_db().await;
        let stale = Utc::now() - chrono::Duration::seconds(120);
        db.set_heartbeat("10.0.0.3:8443", stale).await.unwrap();

        let (transport, _) = transport(&["10.0.0.2:8443"], &[]);
        let err = Notifier::new(&db, transport, "10.0.0.1:8443", NotifyPolicy::All)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_alive_policy_skips_offline_peer() {
        let db = three_member_db().await;
        let stale = Utc::now() - chrono::Duration::seconds(120);
        db.set_heartbeat("10.0.0.3:8443", stale).await.unwrap();

        let (transport, calls) = transport(&["10.0.0.2:8443"], &[]);
        let notifier = Notifier::new(&db, transport, "10.0.0.1:8443", NotifyPolicy::Alive)
            .await
            .unwrap();
        assert_eq!(notifier.peer_count(), 1);

        notifier.notify(rebalance_hook()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_probe_overrides_stale_heartbeat() {
        let db = three_member_db().await;
        let stale = Utc::now() - chrono::Duration::seconds(120);
        db.set_heartbeat("10.0.0.3:8443", stale).await.unwrap();

        // The peer answers the probe even though its heartbeat is stale.
        let (transport, _) = transport(&["10.0.0.2:8443", "10.0.0.3:8443"], &[]);
        let notifier = Notifier::new(&db, transport, "10.0.0.1:8443", NotifyPolicy::All)
            .await
            .unwrap();
        assert_eq!(notifier.peer_count(), 2);
    }

    #[tokio::test]
    async fn test_hook_error_is_surfaced() {
        let db = three_member_db().await;
        let (transport, _) = transport(&["10.0.0.2:8443", "10.0.0.3:8443"], &["10.0.0.2:8443"]);

        let notifier = Notifier::new(&db, transport, "10.0.0.1:8443", NotifyPolicy::All)
            .await
            .unwrap();
        let err = notifier.notify(rebalance_hook()).await.unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
    }

    #[tokio::test]
    async fn test_standalone_is_a_no_op() {
        let db = MembershipDb::open_ephemeral().unwrap();
        let (transport, calls) = transport(&[], &[]);
        let notifier = Notifier::new(&db, transport, "10.0.0.1:8443", NotifyPolicy::All)
            .await
            .unwrap();
        notifier.notify(rebalance_hook()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
