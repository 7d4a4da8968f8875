//! Leadership coordination
//!
//! At most one node appends to the registry log. [`LeadershipCoordinator`]
//! answers "am I the primary" and "where is the primary" and publishes
//! changes on a watch channel, so an in-flight write can notice that it lost
//! leadership.
//!
//! - [`StaticCoordinator`]: role fixed by configuration, switchable by hand
//! - [`LeaseCoordinator`]: time-bounded lease held in a [`LeaseStore`]

use crate::error::SchemaResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Current view of who the primary is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimaryInfo {
    pub is_primary: bool,
    /// Best-effort address of the primary; `None` when unknown
    pub primary_url: Option<String>,
}

/// Decides which node may write
pub trait LeadershipCoordinator: Send + Sync {
    fn is_primary(&self) -> bool;

    /// Address write requests should be forwarded to
    fn primary_location(&self) -> Option<String>;

    /// Leadership changes
    fn subscribe(&self) -> watch::Receiver<PrimaryInfo>;
}

// ============================================================================
// Static
// ============================================================================

/// Fixed primary/follower role
pub struct StaticCoordinator {
    info: watch::Sender<PrimaryInfo>,
}

impl StaticCoordinator {
    pub fn new(is_primary: bool, primary_url: Option<String>) -> Self {
        let (info, _) = watch::channel(PrimaryInfo {
            is_primary,
            primary_url,
        });
        Self { info }
    }

    /// Primary advertising `url` to followers
    pub fn primary(url: Option<String>) -> Self {
        Self::new(true, url)
    }

    pub fn follower(primary_url: impl Into<String>) -> Self {
        Self::new(false, Some(primary_url.into()))
    }

    /// Manual failover
    pub fn set_primary(&self, is_primary: bool, primary_url: Option<String>) {
        info!(is_primary, primary = ?primary_url, "Leadership changed");
        self.info.send_replace(PrimaryInfo {
            is_primary,
            primary_url,
        });
    }
}

impl LeadershipCoordinator for StaticCoordinator {
    fn is_primary(&self) -> bool {
        self.info.borrow().is_primary
    }

    fn primary_location(&self) -> Option<String> {
        self.info.borrow().primary_url.clone()
    }

    fn subscribe(&self) -> watch::Receiver<PrimaryInfo> {
        self.info.subscribe()
    }
}

// ============================================================================
// Lease
// ============================================================================

/// A held lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub holder: String,
    pub holder_url: Option<String>,
    pub expires_at: Instant,
    /// Incremented whenever the lease changes hands
    pub epoch: u64,
}

impl Lease {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Shared storage for the primary lease
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire or renew the lease for `node_id`.
    ///
    /// Returns the lease in force after the attempt, which belongs to
    /// another node if it is held and unexpired.
    async fn try_acquire(&self, node_id: &str, url: Option<&str>, ttl: Duration) -> SchemaResult<Lease>;

    /// Give the lease up if `node_id` holds it
    async fn release(&self, node_id: &str) -> SchemaResult<()>;

    /// Lease currently in force, if any
    async fn current(&self) -> SchemaResult<Option<Lease>>;
}

/// In-process lease store, shared by nodes in one process
#[derive(Default)]
pub struct MemoryLeaseStore {
    lease: Mutex<Option<Lease>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, node_id: &str, url: Option<&str>, ttl: Duration) -> SchemaResult<Lease> {
        let mut slot = self.lease.lock();
        let expires_at = Instant::now() + ttl;
        let lease = match slot.take() {
            Some(mut current) if current.holder == node_id => {
                current.expires_at = expires_at;
                current.holder_url = url.map(str::to_string);
                current
            }
            Some(current) if !current.is_expired() => current,
            previous => Lease {
                holder: node_id.to_string(),
                holder_url: url.map(str::to_string),
                expires_at,
                epoch: previous.map_or(1, |l| l.epoch + 1),
            },
        };
        *slot = Some(lease.clone());
        Ok(lease)
    }

    async fn release(&self, node_id: &str) -> SchemaResult<()> {
        let mut lease = self.lease.lock();
        if let Some(current) = lease.as_mut() {
            if current.holder == node_id {
                current.expires_at = Instant::now();
            }
        }
        Ok(())
    }

    async fn current(&self) -> SchemaResult<Option<Lease>> {
        Ok(self.lease.lock().clone().filter(|l| !l.is_expired()))
    }
}

/// Lease-based election
///
/// Every node runs an election round each third of the TTL: eligible nodes
/// try to acquire or renew, ineligible nodes only look up the holder. A
/// store error makes the node step down until the next successful round.
pub struct LeaseCoordinator {
    node_id: String,
    url: Option<String>,
    ttl: Duration,
    eligible: bool,
    store: Arc<dyn LeaseStore>,
    info: watch::Sender<PrimaryInfo>,
    /// Expiry of the lease this node holds, if any
    held_until: Mutex<Option<Instant>>,
    shutdown: broadcast::Sender<()>,
}

impl LeaseCoordinator {
    pub fn new(
        node_id: impl Into<String>,
        url: Option<String>,
        ttl: Duration,
        eligible: bool,
        store: Arc<dyn LeaseStore>,
    ) -> Self {
        let (info, _) = watch::channel(PrimaryInfo::default());
        let (shutdown, _) = broadcast::channel(1);
        Self {
            node_id: node_id.into(),
            url,
            ttl,
            eligible,
            store,
            info,
            held_until: Mutex::new(None),
            shutdown,
        }
    }

    /// Spawn the renewal task
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(self.ttl / 3);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown.recv() => {
                    info!(node = %self.node_id, "Lease coordinator shutting down");
                    break;
                }
            }
        }
    }

    /// Run one election round
    pub async fn tick(&self) {
        let lease = if self.eligible {
            self.store
                .try_acquire(&self.node_id, self.url.as_deref(), self.ttl)
                .await
                .map(Some)
        } else {
            self.store.current().await
        };

        let next = match lease {
            Ok(Some(lease)) => {
                let held = lease.holder == self.node_id && !lease.is_expired();
                *self.held_until.lock() = held.then_some(lease.expires_at);
                PrimaryInfo {
                    is_primary: held,
                    primary_url: lease.holder_url,
                }
            }
            Ok(None) => {
                *self.held_until.lock() = None;
                PrimaryInfo::default()
            }
            Err(e) => {
                *self.held_until.lock() = None;
                warn!(node = %self.node_id, error = %e, "Lease round failed, stepping down");
                PrimaryInfo {
                    is_primary: false,
                    primary_url: self.info.borrow().primary_url.clone(),
                }
            }
        };
        self.publish(next);
    }

    /// Stop renewing and release the lease if held
    pub async fn shutdown(&self) -> SchemaResult<()> {
        let _ = self.shutdown.send(());
        let held = self.held_until.lock().take().is_some();
        if held {
            self.store.release(&self.node_id).await?;
        }
        self.publish(PrimaryInfo::default());
        Ok(())
    }

    fn publish(&self, next: PrimaryInfo) {
        self.info.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if current.is_primary != next.is_primary {
                info!(
                    node = %self.node_id,
                    is_primary = next.is_primary,
                    primary = ?next.primary_url,
                    "Leadership changed"
                );
            }
            *current = next;
            true
        });
    }
}

impl LeadershipCoordinator for LeaseCoordinator {
    /// Also false once the held lease has lapsed without a renewal round
    fn is_primary(&self) -> bool {
        let unexpired = self
            .held_until
            .lock()
            .is_some_and(|expires_at| Instant::now() < expires_at);
        unexpired && self.info.borrow().is_primary
    }

    fn primary_location(&self) -> Option<String> {
        self.info.borrow().primary_url.clone()
    }

    fn subscribe(&self) -> watch::Receiver<PrimaryInfo> {
        self.info.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(300);

    fn node(id: &str, eligible: bool, store: &Arc<MemoryLeaseStore>) -> LeaseCoordinator {
        LeaseCoordinator::new(
            id,
            Some(format!("http://{}:8081", id)),
            TTL,
            eligible,
            store.clone(),
        )
    }

    #[test]
    fn test_static_failover() {
        let coordinator = StaticCoordinator::follower("http://a:8081");
        assert!(!coordinator.is_primary());
        assert_eq!(coordinator.primary_location().as_deref(), Some("http://a:8081"));

        let mut rx = coordinator.subscribe();
        coordinator.set_primary(true, Some("http://b:8081".to_string()));
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_primary);
        assert!(coordinator.is_primary());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_lease_holder() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = node("a", true, &store);
        let b = node("b", true, &store);

        a.tick().await;
        b.tick().await;
        assert!(a.is_primary());
        assert!(!b.is_primary());
        assert_eq!(b.primary_location().as_deref(), Some("http://a:8081"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_moves_after_expiry() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = node("a", true, &store);
        let b = node("b", true, &store);
        a.tick().await;
        let mut a_changes = a.subscribe();
        a_changes.borrow_and_update();

        // a stops renewing
        tokio::time::advance(TTL + Duration::from_millis(1)).await;
        b.tick().await;
        assert!(b.is_primary());
        assert_eq!(store.current().await.unwrap().unwrap().epoch, 2);

        a.tick().await;
        assert!(!a.is_primary());
        assert!(a_changes.has_changed().unwrap());
        assert_eq!(a.primary_location().as_deref(), Some("http://b:8081"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ineligible_node_never_leads() {
        let store = Arc::new(MemoryLeaseStore::new());
        let observer = node("observer", false, &store);
        observer.tick().await;
        assert!(!observer.is_primary());
        assert_eq!(observer.primary_location(), None);

        let a = node("a", true, &store);
        a.tick().await;
        observer.tick().await;
        assert_eq!(observer.primary_location().as_deref(), Some("http://a:8081"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_lease_is_not_primary_before_next_round() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = node("a", true, &store);
        a.tick().await;
        assert!(a.is_primary());

        // renewal round delayed past the expiry
        tokio::time::advance(TTL + Duration::from_millis(1)).await;
        assert!(!a.is_primary());

        a.tick().await;
        assert!(a.is_primary());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_on_shutdown() {
        let store = Arc::new(MemoryLeaseStore::new());
        let a = node("a", true, &store);
        let b = node("b", true, &store);
        a.tick().await;
        a.shutdown().await.unwrap();
        assert!(!a.is_primary());

        b.tick().await;
        assert!(b.is_primary());
    }
}
