//! Connection routing decisions for the proxy
//!
//! The proxy asks where a fresh connection should land and whether a
//! requested server name stands for a group that has to be resolved first.

use rand::seq::SliceRandom;
use std::sync::Arc;

use crate::registry::ServerRegistry;
use crate::strategy::Target;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Forward to this member of the requested group
    Route(Target),
    /// The group exists but has no member to send the player to
    Deny,
    /// Not a group; the proxy resolves the name itself
    Passthrough,
}

#[derive(Clone)]
pub struct RouteSelector {
    registry: Arc<ServerRegistry>,
}

impl RouteSelector {
    #[must_use]
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self { registry }
    }

    /// Pick a random initial entry point that can take a connection now
    #[must_use]
    pub fn choose_initial(&self) -> Option<Target> {
        let mut candidates = self.registry.initial_entry_points();
        candidates.shuffle(&mut rand::thread_rng());

        let routing = self.registry.routing();
        candidates.into_iter().find_map(|name| {
            if self.registry.is_group(&name) {
                return self.registry.choose_target(&name);
            }
            routing.lookup_address(&name).map(|address| Target {
                sessions: routing.session_count(&name),
                address,
                name,
            })
        })
    }

    /// Resolve a requested server name
    #[must_use]
    pub fn reroute(&self, requested: &str) -> RouteDecision {
        if !self.registry.is_group(requested) {
            return RouteDecision::Passthrough;
        }
        match self.registry.choose_target(requested) {
            Some(target) => RouteDecision::Route(target),
            None => {
                tracing::info!(group = %requested, "Group has no live member, denying connection");
                RouteDecision::Deny
            }
        }
    }
}
