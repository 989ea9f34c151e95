//! Follower-side replay of the leader's bookkeeping
//!
//! Followers never talk to the cluster API. They rebuild their registry from
//! the name and endpoint hashes the leader maintains, and apply the deltas it
//! publishes in between.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use podroute_core::models::{BackendEndpoint, BackendServer, GroupDescriptor, GroupOptions};

use crate::error::{Error, Result};
use crate::keys::KeySpace;
use crate::notification::Notification;
use crate::registry::ServerRegistry;
use crate::store::CoordinationStore;

#[derive(Clone)]
pub struct Replicator {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    registry: Arc<ServerRegistry>,
}

impl Replicator {
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeySpace, registry: Arc<ServerRegistry>) -> Self {
        Self {
            store,
            keys,
            registry,
        }
    }

    /// Apply one delta published by the leader
    pub async fn apply(&self, notification: &Notification) -> Result<()> {
        match notification {
            Notification::BackendAdded { uid, name } => {
                let raw = self
                    .store
                    .hash_get(&self.keys.endpoints(), uid)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("endpoint of backend {name} ({uid})")))?;
                let endpoint = BackendEndpoint::from_json(&raw)?;
                self.registry
                    .register_backend(BackendServer::from_endpoint(uid, name, endpoint));
            }
            Notification::BackendDeleted { uid } => {
                self.registry.unregister_backend(uid);
            }
            Notification::GroupAdded { uid, name, initial } => {
                let mut options = match self
                    .store
                    .hash_get(&self.keys.load_balancer_options(), uid)
                    .await?
                {
                    Some(raw) => GroupOptions::from_json(&raw)?,
                    None => GroupOptions::default(),
                };
                options.initial = *initial;
                self.registry.register_group(&GroupDescriptor {
                    uid: uid.clone(),
                    name: name.clone(),
                    options,
                });
            }
            Notification::GroupDeleted { uid } => {
                self.registry.unregister_group(uid);
            }
            Notification::LeaderChanged { .. } | Notification::LeaderLeft { .. } => {}
        }
        Ok(())
    }

    /// Backends recorded by the leader; entries without an endpoint are skipped
    pub async fn load_backends(&self) -> Result<Vec<BackendServer>> {
        let names = self.store.hash_get_all(&self.keys.servers()).await?;
        let endpoints = self.store.hash_get_all(&self.keys.endpoints()).await?;

        let mut backends = Vec::with_capacity(names.len());
        for (uid, name) in names {
            let Some(raw) = endpoints.get(&uid) else {
                warn!(uid = %uid, name = %name, "Backend has no stored endpoint, skipping");
                continue;
            };
            match BackendEndpoint::from_json(raw) {
                Ok(endpoint) => backends.push(BackendServer::from_endpoint(&uid, &name, endpoint)),
                Err(e) => warn!(uid = %uid, error = %e, "Invalid stored endpoint, skipping"),
            }
        }
        backends.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(backends)
    }

    pub async fn load_groups(&self) -> Result<Vec<GroupDescriptor>> {
        let names = self.store.hash_get_all(&self.keys.load_balancers()).await?;
        let options = self
            .store
            .hash_get_all(&self.keys.load_balancer_options())
            .await?;

        let mut groups: Vec<GroupDescriptor> = names
            .into_iter()
            .map(|(uid, name)| {
                let options = options
                    .get(&uid)
                    .and_then(|raw| {
                        GroupOptions::from_json(raw)
                            .inspect_err(|e| warn!(uid = %uid, error = %e, "Invalid stored group options"))
                            .ok()
                    })
                    .unwrap_or_default();
                GroupDescriptor { uid, name, options }
            })
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    /// Replace the registry's backends with the stored set
    pub async fn sync_backends(&self) -> Result<()> {
        let backends = self.load_backends().await?;
        let keep: HashSet<&str> = backends.iter().map(|b| b.uid.as_str()).collect();
        for uid in self.registry.backend_uids() {
            if !keep.contains(uid.as_str()) {
                self.registry.unregister_backend(&uid);
            }
        }
        let count = backends.len();
        for backend in backends {
            self.registry.register_backend(backend);
        }
        debug!(count, "Backends synced from store");
        Ok(())
    }

    /// Replace the registry's groups with the stored set
    pub async fn sync_groups(&self) -> Result<()> {
        let groups = self.load_groups().await?;
        let keep: HashSet<&str> = groups.iter().map(|g| g.uid.as_str()).collect();
        for uid in self.registry.group_uids() {
            if !keep.contains(uid.as_str()) {
                self.registry.unregister_group(&uid);
            }
        }
        let count = groups.len();
        for group in &groups {
            self.registry.register_group(group);
        }
        debug!(count, "Groups synced from store");
        Ok(())
    }

    /// Full follower re-sync; groups first so backends attach to them
    pub async fn sync(&self) -> Result<()> {
        self.sync_groups().await?;
        self.sync_backends().await?;
        info!(
            group = %self.keys.group(),
            backends = self.registry.backend_uids().len(),
            load_balancers = self.registry.group_uids().len(),
            "Registry synced from store"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{MemoryRoutingTable, RoutingTable, GROUP_PLACEHOLDER};
    use crate::store::MemoryStore;
    use podroute_core::models::StrategyKind;

    struct Fixture {
        store: MemoryStore,
        keys: KeySpace,
        routing: Arc<MemoryRoutingTable>,
        registry: Arc<ServerRegistry>,
        replicator: Replicator,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let keys = KeySpace::new("podroute:", "survival");
        let routing = Arc::new(MemoryRoutingTable::new());
        let registry = Arc::new(ServerRegistry::new(routing.clone()));
        let replicator = Replicator::new(Arc::new(store.clone()), keys.clone(), registry.clone());
        Fixture {
            store,
            keys,
            routing,
            registry,
            replicator,
        }
    }

    async fn record_backend(f: &Fixture, uid: &str, name: &str, address: &str, owners: &[&str]) {
        let endpoint = BackendEndpoint {
            address: address.parse().unwrap(),
            owners: owners.iter().map(ToString::to_string).collect(),
            initial: false,
        };
        f.store
            .hash_set(&f.keys.servers(), uid, name)
            .await
            .unwrap();
        f.store
            .hash_set(&f.keys.endpoints(), uid, &endpoint.to_json().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_apply_backend_added_reads_endpoint() {
        let f = fixture();
        record_backend(&f, "u1", "lobby", "10.0.0.5:25565", &[]).await;

        f.replicator
            .apply(&Notification::BackendAdded {
                uid: "u1".to_string(),
                name: "lobby".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            f.routing.lookup_address("lobby"),
            Some("10.0.0.5:25565".parse().unwrap())
        );

        f.replicator
            .apply(&Notification::BackendDeleted { uid: "u1".to_string() })
            .await
            .unwrap();
        assert_eq!(f.routing.lookup_address("lobby"), None);
    }

    #[tokio::test]
    async fn test_apply_backend_without_endpoint_fails() {
        let f = fixture();
        let err = f
            .replicator
            .apply(&Notification::BackendAdded {
                uid: "u9".to_string(),
                name: "ghost".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(f.registry.backends().is_empty());
    }

    #[tokio::test]
    async fn test_apply_group_added_uses_stored_options() {
        let f = fixture();
        let options = GroupOptions {
            initial: false,
            strategy: StrategyKind::MinimumLoad,
        };
        f.store
            .hash_set(&f.keys.load_balancer_options(), "rs", &options.to_json().unwrap())
            .await
            .unwrap();

        f.replicator
            .apply(&Notification::GroupAdded {
                uid: "rs".to_string(),
                name: "shop".to_string(),
                initial: true,
            })
            .await
            .unwrap();

        let group = f.registry.load_balancer("shop").unwrap();
        assert_eq!(group.strategy(), StrategyKind::MinimumLoad);
        assert!(group.is_initial());
        assert_eq!(f.routing.lookup_address("shop"), Some(GROUP_PLACEHOLDER));
    }

    #[tokio::test]
    async fn test_sync_replaces_registry_contents() {
        let f = fixture();
        f.registry.register_backend(BackendServer {
            uid: "stale".to_string(),
            name: "old".to_string(),
            address: "10.0.0.9:25565".parse().unwrap(),
            initial: false,
            owners: Vec::new(),
        });

        record_backend(&f, "p1", "shop-a", "10.0.0.1:25565", &["rs"]).await;
        record_backend(&f, "p2", "shop-b", "10.0.0.2:25565", &["rs"]).await;
        // a name without endpoint is skipped
        f.store
            .hash_set(&f.keys.servers(), "p3", "half-written")
            .await
            .unwrap();
        f.store
            .hash_set(&f.keys.load_balancers(), "rs", "shop")
            .await
            .unwrap();

        f.replicator.sync().await.unwrap();

        assert_eq!(
            f.routing.names(),
            vec!["shop".to_string(), "shop-a".to_string(), "shop-b".to_string()]
        );
        let group = f.registry.load_balancer("shop").unwrap();
        assert_eq!(group.members(), ["shop-a".to_string(), "shop-b".to_string()]);
        assert_eq!(group.strategy(), StrategyKind::RoundRobin);
    }

    #[tokio::test]
    async fn test_sync_fails_while_store_is_down() {
        let f = fixture();
        f.store.set_available(false);
        assert!(f.replicator.sync().await.is_err());
    }
}
