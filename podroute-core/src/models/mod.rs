//! Cluster resource snapshots and routable server descriptors

pub mod resource;
pub mod server;

pub use resource::{label_flag, PodPhase, PodResource, ReplicaGroupResource, Resource};
pub use server::{BackendEndpoint, BackendServer, GroupDescriptor, GroupOptions, StrategyKind};
