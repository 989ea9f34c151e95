//! Per-instance registry of routable names
//!
//! Both the leader (while reconciling) and followers (while replaying
//! notifications) mutate the registry through the same operations, so every
//! instance ends up with the same view. Each mutation is applied to the
//! routing table under the registry's write lock.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use podroute_core::models::{BackendServer, GroupDescriptor, GroupOptions, StrategyKind};

use crate::load_balancer::LoadBalancer;
use crate::routing::{RoutingTable, GROUP_PLACEHOLDER};
use crate::strategy::Target;

#[derive(Default)]
struct RegistryState {
    backends: HashMap<String, BackendServer>,
    groups: HashMap<String, LoadBalancer>,
    backend_names: HashMap<String, String>,
    group_names: HashMap<String, String>,
}

impl RegistryState {
    fn remove_backend(&mut self, uid: &str) -> Option<BackendServer> {
        let name = self.backend_names.remove(uid)?;
        let server = self.backends.remove(&name)?;
        for group in self.groups.values_mut() {
            if group.remove_member(&name) {
                debug!(backend = %name, group = %group.name(), "Backend left group");
            }
        }
        Some(server)
    }

    fn remove_group(&mut self, uid: &str) -> Option<LoadBalancer> {
        let name = self.group_names.remove(uid)?;
        self.groups.remove(&name)
    }
}

pub struct ServerRegistry {
    routing: Arc<dyn RoutingTable>,
    state: RwLock<RegistryState>,
}

impl ServerRegistry {
    #[must_use]
    pub fn new(routing: Arc<dyn RoutingTable>) -> Self {
        Self {
            routing,
            state: RwLock::new(RegistryState::default()),
        }
    }

    #[must_use]
    pub fn routing(&self) -> &Arc<dyn RoutingTable> {
        &self.routing
    }

    /// Add or refresh a backend and attach it to the groups owning it
    pub fn register_backend(&self, server: BackendServer) {
        let mut state = self.state.write();

        if let Some(existing) = state.backend_names.get(&server.uid).cloned() {
            if existing != server.name {
                warn!(uid = %server.uid, old = %existing, new = %server.name, "Backend renamed, replacing");
                state.remove_backend(&server.uid);
                self.routing.unregister_address(&existing);
            }
        }
        if let Some(holder) = state.backends.get(&server.name).map(|s| s.uid.clone()) {
            if holder != server.uid {
                warn!(name = %server.name, old_uid = %holder, new_uid = %server.uid, "Name taken over by another backend");
                state.remove_backend(&holder);
            }
        }

        let name = server.name.clone();
        for owner in &server.owners {
            let Some(group_name) = state.group_names.get(owner).cloned() else {
                continue;
            };
            if let Some(group) = state.groups.get_mut(&group_name) {
                group.add_member(&name);
            }
        }

        self.routing.register_address(&name, server.address);
        state.backend_names.insert(server.uid.clone(), name.clone());
        info!(uid = %server.uid, name = %name, address = %server.address, "Backend registered");
        state.backends.insert(name, server);
    }

    /// Remove a backend from the registry, its groups and the routing table
    pub fn unregister_backend(&self, uid: &str) -> Option<BackendServer> {
        let mut state = self.state.write();
        let server = state.remove_backend(uid)?;
        self.routing.unregister_address(&server.name);
        info!(uid = %uid, name = %server.name, "Backend unregistered");
        Some(server)
    }

    /// Add a group, or update the options of an already registered one.
    ///
    /// Members are every registered backend owned by the group.
    pub fn register_group(&self, descriptor: &GroupDescriptor) {
        let mut state = self.state.write();

        if let Some(existing) = state.group_names.get(&descriptor.uid).cloned() {
            if existing == descriptor.name {
                if let Some(group) = state.groups.get_mut(&existing) {
                    group.set_strategy(descriptor.options.strategy);
                    group.set_initial(descriptor.options.initial);
                }
                return;
            }
            state.remove_group(&descriptor.uid);
            self.routing.unregister_address(&existing);
        }

        let mut group = LoadBalancer::new(descriptor);
        let mut owned: Vec<&BackendServer> = state
            .backends
            .values()
            .filter(|s| s.owners.iter().any(|o| o == &descriptor.uid))
            .collect();
        owned.sort_by(|a, b| a.name.cmp(&b.name));
        for server in owned {
            group.add_member(&server.name);
        }

        self.routing.register_address(&descriptor.name, GROUP_PLACEHOLDER);
        state
            .group_names
            .insert(descriptor.uid.clone(), descriptor.name.clone());
        info!(
            uid = %descriptor.uid,
            name = %descriptor.name,
            members = group.members().len(),
            strategy = %descriptor.options.strategy,
            "Group registered"
        );
        state.groups.insert(descriptor.name.clone(), group);
    }

    /// Remove a group and retract its name from the routing table
    pub fn unregister_group(&self, uid: &str) -> Option<GroupDescriptor> {
        let mut state = self.state.write();
        let group = state.remove_group(uid)?;
        self.routing.unregister_address(group.name());
        info!(uid = %uid, name = %group.name(), "Group unregistered");
        Some(GroupDescriptor {
            uid: group.uid().to_string(),
            name: group.name().to_string(),
            options: GroupOptions {
                initial: group.is_initial(),
                strategy: group.strategy(),
            },
        })
    }

    /// Switch the strategy of a registered group
    pub fn set_strategy(&self, group_name: &str, kind: StrategyKind) -> bool {
        let mut state = self.state.write();
        match state.groups.get_mut(group_name) {
            Some(group) => {
                group.set_strategy(kind);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn backend_name(&self, uid: &str) -> Option<String> {
        self.state.read().backend_names.get(uid).cloned()
    }

    #[must_use]
    pub fn group_name(&self, uid: &str) -> Option<String> {
        self.state.read().group_names.get(uid).cloned()
    }

    #[must_use]
    pub fn backend(&self, name: &str) -> Option<BackendServer> {
        self.state.read().backends.get(name).cloned()
    }

    /// Snapshot of a group; selections on it still advance the shared cursor
    #[must_use]
    pub fn load_balancer(&self, name: &str) -> Option<LoadBalancer> {
        self.state.read().groups.get(name).cloned()
    }

    #[must_use]
    pub fn is_group(&self, name: &str) -> bool {
        self.state.read().groups.contains_key(name)
    }

    /// Whether a backend or group already uses `name`
    #[must_use]
    pub fn is_name_registered(&self, name: &str) -> bool {
        let state = self.state.read();
        state.backends.contains_key(name) || state.groups.contains_key(name)
    }

    #[must_use]
    pub fn backends(&self) -> Vec<BackendServer> {
        let mut backends: Vec<BackendServer> = self.state.read().backends.values().cloned().collect();
        backends.sort_by(|a, b| a.name.cmp(&b.name));
        backends
    }

    #[must_use]
    pub fn load_balancers(&self) -> Vec<LoadBalancer> {
        let mut groups: Vec<LoadBalancer> = self.state.read().groups.values().cloned().collect();
        groups.sort_by(|a, b| a.name().cmp(b.name()));
        groups
    }

    #[must_use]
    pub fn backend_uids(&self) -> Vec<String> {
        self.state.read().backend_names.keys().cloned().collect()
    }

    #[must_use]
    pub fn group_uids(&self) -> Vec<String> {
        self.state.read().group_names.keys().cloned().collect()
    }

    /// Names flagged as initial entry points, sorted
    #[must_use]
    pub fn initial_entry_points(&self) -> Vec<String> {
        let state = self.state.read();
        let mut names: Vec<String> = state
            .backends
            .values()
            .filter(|s| s.initial)
            .map(|s| s.name.clone())
            .chain(
                state
                    .groups
                    .values()
                    .filter(|g| g.is_initial())
                    .map(|g| g.name().to_string()),
            )
            .collect();
        names.sort();
        names
    }

    /// Pick a member of the group called `group_name`
    #[must_use]
    pub fn choose_target(&self, group_name: &str) -> Option<Target> {
        let group = self.load_balancer(group_name)?;
        group.choose(self.routing.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::MemoryRoutingTable;
    use std::net::SocketAddr;

    fn backend(uid: &str, name: &str, last: u8, owners: &[&str]) -> BackendServer {
        BackendServer {
            uid: uid.to_string(),
            name: name.to_string(),
            address: SocketAddr::from(([10, 0, 0, last], 25565)),
            initial: false,
            owners: owners.iter().map(ToString::to_string).collect(),
        }
    }

    fn shop(uid: &str) -> GroupDescriptor {
        GroupDescriptor {
            uid: uid.to_string(),
            name: "shop".to_string(),
            options: GroupOptions::default(),
        }
    }

    fn registry() -> (Arc<MemoryRoutingTable>, ServerRegistry) {
        let routing = Arc::new(MemoryRoutingTable::new());
        let registry = ServerRegistry::new(routing.clone());
        (routing, registry)
    }

    #[test]
    fn test_backend_registration_updates_routing() {
        let (routing, registry) = registry();
        registry.register_backend(backend("u1", "lobby", 1, &[]));

        assert_eq!(registry.backend_name("u1").as_deref(), Some("lobby"));
        assert_eq!(routing.lookup_address("lobby"), Some("10.0.0.1:25565".parse().unwrap()));

        let removed = registry.unregister_backend("u1").unwrap();
        assert_eq!(removed.name, "lobby");
        assert_eq!(routing.lookup_address("lobby"), None);
        assert!(registry.unregister_backend("u1").is_none());
    }

    #[test]
    fn test_group_membership_is_derived_both_ways() {
        let (routing, registry) = registry();
        registry.register_backend(backend("p1", "shop-a", 1, &["rs"]));
        registry.register_group(&shop("rs"));
        registry.register_backend(backend("p2", "shop-b", 2, &["rs"]));
        registry.register_backend(backend("p3", "lobby", 3, &["other"]));

        let group = registry.load_balancer("shop").unwrap();
        assert_eq!(group.members(), ["shop-a".to_string(), "shop-b".to_string()]);
        assert_eq!(routing.lookup_address("shop"), Some(GROUP_PLACEHOLDER));
        assert!(registry.is_group("shop"));
    }

    #[test]
    fn test_unregistered_backend_leaves_groups_and_is_skipped() {
        let (_routing, registry) = registry();
        registry.register_group(&shop("rs"));
        registry.register_backend(backend("p1", "shop-a", 1, &["rs"]));
        registry.register_backend(backend("p2", "shop-b", 2, &["rs"]));

        registry.unregister_backend("p1");
        let group = registry.load_balancer("shop").unwrap();
        assert_eq!(group.members(), ["shop-b".to_string()]);
        for _ in 0..3 {
            assert_eq!(registry.choose_target("shop").unwrap().name, "shop-b");
        }

        registry.unregister_backend("p2");
        assert!(registry.choose_target("shop").is_none());
    }

    #[test]
    fn test_unregister_group_retracts_routing() {
        let (routing, registry) = registry();
        registry.register_group(&shop("rs"));
        let removed = registry.unregister_group("rs").unwrap();
        assert_eq!(removed.name, "shop");
        assert_eq!(routing.lookup_address("shop"), None);
        assert!(registry.load_balancer("shop").is_none());
        assert!(registry.unregister_group("rs").is_none());
    }

    #[test]
    fn test_reregistration_is_idempotent() {
        let (routing, registry) = registry();
        registry.register_backend(backend("u1", "lobby", 1, &[]));
        registry.register_backend(backend("u1", "lobby", 1, &[]));
        registry.register_group(&shop("rs"));
        registry.register_group(&shop("rs"));

        assert_eq!(registry.backends().len(), 1);
        assert_eq!(registry.load_balancers().len(), 1);
        assert_eq!(routing.names(), vec!["lobby".to_string(), "shop".to_string()]);
    }

    #[test]
    fn test_renamed_backend_replaces_old_name() {
        let (routing, registry) = registry();
        registry.register_backend(backend("u1", "lobby", 1, &[]));
        registry.register_backend(backend("u1", "lobby-1", 1, &[]));

        assert_eq!(routing.lookup_address("lobby"), None);
        assert!(routing.lookup_address("lobby-1").is_some());
        assert!(registry.backend("lobby").is_none());
    }

    #[test]
    fn test_initial_entry_points_and_strategy() {
        let (_routing, registry) = registry();
        let mut hub = backend("u1", "hub", 1, &[]);
        hub.initial = true;
        registry.register_backend(hub);
        registry.register_backend(backend("u2", "arena", 2, &[]));
        registry.register_group(&GroupDescriptor {
            uid: "rs".to_string(),
            name: "lobby".to_string(),
            options: GroupOptions {
                initial: true,
                strategy: StrategyKind::RoundRobin,
            },
        });

        assert_eq!(registry.initial_entry_points(), vec!["hub".to_string(), "lobby".to_string()]);

        assert!(registry.set_strategy("lobby", StrategyKind::MinimumLoad));
        assert_eq!(registry.load_balancer("lobby").unwrap().strategy(), StrategyKind::MinimumLoad);
        assert!(!registry.set_strategy("missing", StrategyKind::MinimumLoad));
    }
}
