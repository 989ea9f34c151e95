//! Load-balanced server groups
//!
//! A group is registered under its own logical name and forwards each
//! connection to one of its member backends, picked by the group's strategy.

use std::sync::Arc;

use podroute_core::models::{GroupDescriptor, StrategyKind};

use crate::routing::RoutingTable;
use crate::strategy::{strategy_for, Strategy, Target};

/// A group and its current members.
///
/// Clones share the strategy, so a snapshot taken from the registry keeps
/// advancing the same round-robin cursor.
#[derive(Clone)]
pub struct LoadBalancer {
    uid: String,
    name: String,
    initial: bool,
    strategy: Arc<dyn Strategy>,
    /// Member logical names in the order they joined
    members: Vec<String>,
}

impl LoadBalancer {
    #[must_use]
    pub fn new(descriptor: &GroupDescriptor) -> Self {
        Self {
            uid: descriptor.uid.clone(),
            name: descriptor.name.clone(),
            initial: descriptor.options.initial,
            strategy: strategy_for(descriptor.options.strategy),
            members: Vec::new(),
        }
    }

    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn is_initial(&self) -> bool {
        self.initial
    }

    #[must_use]
    pub fn strategy(&self) -> StrategyKind {
        self.strategy.kind()
    }

    #[must_use]
    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub(crate) fn set_strategy(&mut self, kind: StrategyKind) {
        if self.strategy.kind() != kind {
            self.strategy = strategy_for(kind);
        }
    }

    pub(crate) fn set_initial(&mut self, initial: bool) {
        self.initial = initial;
    }

    pub(crate) fn add_member(&mut self, name: &str) {
        if !self.members.iter().any(|m| m == name) {
            self.members.push(name.to_string());
        }
    }

    pub(crate) fn remove_member(&mut self, name: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m != name);
        self.members.len() != before
    }

    /// Members that currently resolve to an address
    #[must_use]
    pub fn targets(&self, routing: &dyn RoutingTable) -> Vec<Target> {
        self.members
            .iter()
            .filter_map(|name| {
                routing.lookup_address(name).map(|address| Target {
                    name: name.clone(),
                    address,
                    sessions: routing.session_count(name),
                })
            })
            .collect()
    }

    /// Pick a member, skipping names that no longer resolve
    #[must_use]
    pub fn choose(&self, routing: &dyn RoutingTable) -> Option<Target> {
        let targets = self.targets(routing);
        let chosen = self.strategy.choose(&targets);
        if chosen.is_none() {
            tracing::debug!(group = %self.name, members = self.members.len(), "No live member to route to");
        }
        chosen
    }
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .field("initial", &self.initial)
            .field("strategy", &self.strategy.kind())
            .field("members", &self.members)
            .finish()
    }
}
