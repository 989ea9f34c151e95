//! Multi-instance coordination for the podroute proxy
//!
//! Instances sharing a group elect one leader through the coordination
//! store. The leader polls the cluster for backend pods and replica groups,
//! names them, records them in the store and publishes each change; the
//! followers replay those changes into their own routing tables.

pub mod cluster_api;
pub mod coordinator;
pub mod diff;
pub mod discovery;
pub mod election;
pub mod error;
pub mod identity;
pub mod keys;
pub mod load_balancer;
pub mod naming;
pub mod notification;
pub mod registry;
pub mod replication;
pub mod routing;
pub mod selector;
pub mod store;
pub mod strategy;
pub mod subscriber;
pub mod task;

pub use cluster_api::{ClusterApi, MemoryCluster, Selector};
pub use coordinator::{Coordinator, CoordinatorSettings};
pub use discovery::{Clock, Discovery, DiscoverySettings};
pub use election::LeaderElection;
pub use error::{Error, Result};
pub use keys::KeySpace;
pub use notification::Notification;
pub use registry::ServerRegistry;
pub use routing::{MemoryRoutingTable, RoutingTable, GROUP_PLACEHOLDER};
pub use selector::{RouteDecision, RouteSelector};
pub use store::{CoordinationStore, MemoryStore, RedisStore};
pub use strategy::Target;
