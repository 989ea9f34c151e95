//! Leader-side reconciliation of cluster state into the registry
//!
//! [`ServerDiscovery`] turns pods into routable backends and
//! [`LoadBalancerDiscovery`] turns replica groups into load-balanced names.
//! Both only poll the cluster while this instance holds the lease; the
//! store-side bookkeeping they write is what followers replay.

mod load_balancers;
mod servers;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use podroute_core::config::LabelKeys;

use crate::cluster_api::{ClusterApi, Selector};
use crate::election::LeaderElection;
use crate::error::Result;
use crate::keys::KeySpace;
use crate::naming;
use crate::notification::Notification;
use crate::registry::ServerRegistry;
use crate::replication::Replicator;
use crate::store::CoordinationStore;

pub use load_balancers::LoadBalancerDiscovery;
pub use servers::ServerDiscovery;

/// Lifecycle shared by both reconcilers
#[async_trait]
pub trait Discovery: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Bring the local registry in line before polling starts: against the
    /// store and the live cluster when leading, against the store otherwise
    async fn reconcile_for_startup(&self) -> Result<()>;

    /// Start the polling task
    fn start(self: Arc<Self>);

    /// Stop polling and any pending re-checks
    fn shutdown(&self);
}

/// Wall clock used to evaluate deletion deadlines
#[derive(Debug, Clone, Copy, Default)]
pub enum Clock {
    #[default]
    System,
    /// Starts at `wall` and advances with the tokio clock
    Anchored { wall: DateTime<Utc>, instant: Instant },
}

impl Clock {
    /// Anchor at the current time; follows paused tokio time in tests
    #[must_use]
    pub fn anchored_now() -> Self {
        Self::Anchored {
            wall: Utc::now(),
            instant: Instant::now(),
        }
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Self::System => Utc::now(),
            Self::Anchored { wall, instant } => {
                let elapsed = chrono::Duration::from_std(instant.elapsed()).unwrap_or_default();
                *wall + elapsed
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub selector: Selector,
    pub labels: LabelKeys,
    pub poll_interval: Duration,
    /// Terminating backends are removed once less than this much grace is left
    pub drain_threshold: Duration,
    pub clock: Clock,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            selector: Selector::new(),
            labels: LabelKeys::default(),
            poll_interval: Duration::from_secs(5),
            drain_threshold: Duration::from_secs(50),
            clock: Clock::System,
        }
    }
}

/// Dependencies shared by the reconcilers of one instance
pub struct DiscoveryContext {
    pub store: Arc<dyn CoordinationStore>,
    pub cluster: Arc<dyn ClusterApi>,
    pub registry: Arc<ServerRegistry>,
    pub election: Arc<LeaderElection>,
    pub keys: KeySpace,
    pub settings: DiscoverySettings,
}

impl DiscoveryContext {
    #[must_use]
    pub fn replicator(&self) -> Replicator {
        Replicator::new(self.store.clone(), self.keys.clone(), self.registry.clone())
    }

    /// Broadcast a delta; failures only cost followers freshness
    pub(crate) async fn publish(&self, notification: &Notification) {
        if let Err(e) = self
            .store
            .publish(&notification.channel(&self.keys), &notification.payload())
            .await
        {
            tracing::warn!(
                error = %e,
                topic = notification.topic(),
                payload = %notification.payload(),
                "Failed to publish notification"
            );
        }
    }

    /// Names held by backends or groups in the store, or live in the routing table
    pub(crate) async fn is_name_taken(&self, name: &str) -> Result<bool> {
        let taken = self.stored_names().await?;
        Ok(taken.contains(name) || self.registry.routing().lookup_address(name).is_some())
    }

    /// Allocate a unique backend name starting from `preferred`
    pub(crate) async fn allocate_name(&self, preferred: &str) -> Result<String> {
        let taken = self.stored_names().await?;
        let routing = self.registry.routing();
        Ok(naming::allocate(preferred, |name| {
            taken.contains(name) || routing.lookup_address(name).is_some()
        }))
    }

    async fn stored_names(&self) -> Result<HashSet<String>> {
        let mut names: HashSet<String> = self
            .store
            .hash_get_all(&self.keys.servers())
            .await?
            .into_values()
            .collect();
        names.extend(
            self.store
                .hash_get_all(&self.keys.load_balancers())
                .await?
                .into_values(),
        );
        Ok(names)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::cluster_api::MemoryCluster;
    use crate::routing::MemoryRoutingTable;
    use crate::store::MemoryStore;
    use podroute_core::models::{PodPhase, PodResource, ReplicaGroupResource};
    use std::collections::BTreeMap;

    pub const GAME_LABEL: (&str, &str) = ("game", "survival");

    pub struct Fixture {
        pub store: MemoryStore,
        pub cluster: Arc<MemoryCluster>,
        pub routing: Arc<MemoryRoutingTable>,
        pub ctx: Arc<DiscoveryContext>,
    }

    impl Fixture {
        /// A context whose election already holds the lease
        pub async fn leader() -> Self {
            let fixture = Self::new();
            assert!(fixture.ctx.election.try_acquire_or_renew().await.unwrap());
            fixture
        }

        pub fn new() -> Self {
            let store = MemoryStore::new();
            let cluster = Arc::new(MemoryCluster::new());
            let routing = Arc::new(MemoryRoutingTable::new());
            let keys = KeySpace::new("podroute:", "survival");
            let shared: Arc<dyn CoordinationStore> = Arc::new(store.clone());
            let ctx = Arc::new(DiscoveryContext {
                store: shared.clone(),
                cluster: cluster.clone(),
                registry: Arc::new(ServerRegistry::new(routing.clone())),
                election: Arc::new(LeaderElection::new(
                    shared,
                    keys.clone(),
                    "leader-1",
                    Duration::from_secs(3600),
                )),
                keys,
                settings: DiscoverySettings {
                    selector: Selector::from([(GAME_LABEL.0.to_string(), GAME_LABEL.1.to_string())]),
                    clock: Clock::anchored_now(),
                    ..DiscoverySettings::default()
                },
            });
            Self {
                store,
                cluster,
                routing,
                ctx,
            }
        }

        pub fn now(&self) -> DateTime<Utc> {
            self.ctx.settings.clock.now()
        }
    }

    pub fn pod(uid: &str, preferred: Option<&str>, last: u8, owners: &[&str]) -> PodResource {
        let mut labels = BTreeMap::from([(GAME_LABEL.0.to_string(), GAME_LABEL.1.to_string())]);
        if let Some(name) = preferred {
            labels.insert(LabelKeys::default().server_name, name.to_string());
        }
        PodResource {
            uid: uid.to_string(),
            name: format!("pod-{uid}"),
            namespace: "games".to_string(),
            labels,
            phase: PodPhase::Running,
            address: Some(std::net::SocketAddr::from(([10, 0, 0, last], 25565))),
            owner_uids: owners.iter().map(ToString::to_string).collect(),
            deletion_deadline: None,
        }
    }

    pub fn replica_group(uid: &str, preferred: Option<&str>, replicas: i32) -> ReplicaGroupResource {
        let mut labels = BTreeMap::from([(GAME_LABEL.0.to_string(), GAME_LABEL.1.to_string())]);
        if let Some(name) = preferred {
            labels.insert(LabelKeys::default().server_name, name.to_string());
        }
        ReplicaGroupResource {
            uid: uid.to_string(),
            name: format!("rs-{uid}"),
            namespace: "games".to_string(),
            labels,
            replicas,
            observed_generation: 1,
        }
    }
}
