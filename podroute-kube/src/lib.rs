//! Kubernetes implementation of the cluster API
//!
//! Pods become [`PodResource`]s and ReplicaSets become
//! [`ReplicaGroupResource`]s. Listing is label-selected and, when a
//! namespace is configured, namespaced.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use std::net::{IpAddr, SocketAddr};

use podroute_cluster::cluster_api::{selector_string, ClusterApi, Selector};
use podroute_cluster::{Error, Result};
use podroute_core::config::DiscoveryConfig;
use podroute_core::models::{PodPhase, PodResource, ReplicaGroupResource};

pub struct KubeCluster {
    client: Client,
    namespace: Option<String>,
    port_name: String,
    default_port: u16,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client, config: &DiscoveryConfig) -> Self {
        Self {
            client,
            namespace: config.namespace.clone().filter(|ns| !ns.is_empty()),
            port_name: config.backend_port_name.clone(),
            default_port: config.default_backend_port,
        }
    }

    /// Connect with the in-cluster or kubeconfig credentials
    pub async fn connect(config: &DiscoveryConfig) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Cluster(format!("Failed to create Kubernetes client: {e}")))?;
        Ok(Self::new(client, config))
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_pods(&self, selector: &Selector) -> Result<Vec<PodResource>> {
        let params = ListParams::default().labels(&selector_string(selector));
        let pods = self
            .api::<Pod>()
            .list(&params)
            .await
            .map_err(|e| Error::Cluster(format!("Failed to list pods: {e}")))?;

        Ok(pods
            .items
            .iter()
            .filter_map(|pod| pod_to_resource(pod, &self.port_name, self.default_port))
            .collect())
    }

    async fn list_replica_groups(&self, selector: &Selector) -> Result<Vec<ReplicaGroupResource>> {
        let params = ListParams::default().labels(&selector_string(selector));
        let sets = self
            .api::<ReplicaSet>()
            .list(&params)
            .await
            .map_err(|e| Error::Cluster(format!("Failed to list replica sets: {e}")))?;

        Ok(sets.items.iter().filter_map(replica_set_to_resource).collect())
    }
}

/// Convert a pod; `None` for objects the API returned without a UID.
///
/// A pod with a deletion timestamp is terminating whatever its phase says.
/// The backend port is the container port named `port_name`, else `default_port`.
#[must_use]
pub fn pod_to_resource(pod: &Pod, port_name: &str, default_port: u16) -> Option<PodResource> {
    let metadata = &pod.metadata;
    let uid = metadata.uid.clone()?;
    let status = pod.status.as_ref();

    let deletion_deadline = metadata.deletion_timestamp.as_ref().map(|ts| ts.0);
    let phase = if deletion_deadline.is_some() {
        PodPhase::Terminating
    } else {
        status
            .and_then(|s| s.phase.as_deref())
            .map_or(PodPhase::Unknown, PodPhase::from_status)
    };

    let address = status
        .and_then(|s| s.pod_ip.as_deref())
        .and_then(|ip| {
            ip.parse::<IpAddr>()
                .inspect_err(|e| tracing::warn!(pod_ip = %ip, error = %e, "Unparseable pod IP"))
                .ok()
        })
        .map(|ip| SocketAddr::new(ip, backend_port(pod, port_name).unwrap_or(default_port)));

    Some(PodResource {
        uid,
        name: metadata.name.clone().unwrap_or_default(),
        namespace: metadata.namespace.clone().unwrap_or_default(),
        labels: metadata.labels.clone().unwrap_or_default(),
        phase,
        address,
        owner_uids: metadata
            .owner_references
            .iter()
            .flatten()
            .map(|owner| owner.uid.clone())
            .collect(),
        deletion_deadline,
    })
}

fn backend_port(pod: &Pod, port_name: &str) -> Option<u16> {
    pod.spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|container| container.ports.iter().flatten())
        .find(|port| {
            port.name
                .as_deref()
                .is_some_and(|name| name.eq_ignore_ascii_case(port_name))
        })
        .and_then(|port| u16::try_from(port.container_port).ok())
}

/// Convert a ReplicaSet; replicas are the ones the controller currently runs
#[must_use]
pub fn replica_set_to_resource(set: &ReplicaSet) -> Option<ReplicaGroupResource> {
    let metadata = &set.metadata;
    let status = set.status.as_ref();
    Some(ReplicaGroupResource {
        uid: metadata.uid.clone()?,
        name: metadata.name.clone().unwrap_or_default(),
        namespace: metadata.namespace.clone().unwrap_or_default(),
        labels: metadata.labels.clone().unwrap_or_default(),
        replicas: status.map_or(0, |s| s.replicas),
        observed_generation: status.and_then(|s| s.observed_generation).unwrap_or(0),
    })
}
