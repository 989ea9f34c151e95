//! Read access to the cluster the backends run in

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use podroute_core::models::{PodResource, ReplicaGroupResource, Resource};

use crate::error::{Error, Result};

/// Label selector: every key must be present with exactly this value
pub type Selector = BTreeMap<String, String>;

/// Listing operations the reconcilers need from the cluster API
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_pods(&self, selector: &Selector) -> Result<Vec<PodResource>>;

    async fn list_replica_groups(&self, selector: &Selector) -> Result<Vec<ReplicaGroupResource>>;
}

/// Render a selector in `key=value,key=value` form
#[must_use]
pub fn selector_string(selector: &Selector) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether `resource` carries every label of `selector`
#[must_use]
pub fn matches_selector<R: Resource>(resource: &R, selector: &Selector) -> bool {
    selector
        .iter()
        .all(|(k, v)| resource.labels().get(k).is_some_and(|actual| actual == v))
}

/// In-memory cluster for standalone tests and simulations
#[derive(Default)]
pub struct MemoryCluster {
    pods: RwLock<Vec<PodResource>>,
    groups: RwLock<Vec<ReplicaGroupResource>>,
    unavailable: AtomicBool,
    list_calls: AtomicUsize,
}

impl MemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a pod by UID
    pub fn upsert_pod(&self, pod: PodResource) {
        let mut pods = self.pods.write();
        match pods.iter_mut().find(|p| p.uid == pod.uid) {
            Some(existing) => *existing = pod,
            None => pods.push(pod),
        }
    }

    pub fn remove_pod(&self, uid: &str) {
        self.pods.write().retain(|p| p.uid != uid);
    }

    /// Insert or replace a replica group by UID
    pub fn upsert_group(&self, group: ReplicaGroupResource) {
        let mut groups = self.groups.write();
        match groups.iter_mut().find(|g| g.uid == group.uid) {
            Some(existing) => *existing = group,
            None => groups.push(group),
        }
    }

    pub fn remove_group(&self, uid: &str) {
        self.groups.write().retain(|g| g.uid != uid);
    }

    /// Make every listing fail until re-enabled
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of list requests served so far
    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Cluster("cluster API unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn list_pods(&self, selector: &Selector) -> Result<Vec<PodResource>> {
        self.check_available()?;
        Ok(self
            .pods
            .read()
            .iter()
            .filter(|p| matches_selector(*p, selector))
            .cloned()
            .collect())
    }

    async fn list_replica_groups(&self, selector: &Selector) -> Result<Vec<ReplicaGroupResource>> {
        self.check_available()?;
        Ok(self
            .groups
            .read()
            .iter()
            .filter(|g| matches_selector(*g, selector))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podroute_core::models::PodPhase;

    fn pod(uid: &str, labels: &[(&str, &str)]) -> PodResource {
        PodResource {
            uid: uid.to_string(),
            name: uid.to_string(),
            namespace: "games".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            phase: PodPhase::Running,
            address: None,
            owner_uids: Vec::new(),
            deletion_deadline: None,
        }
    }

    #[test]
    fn test_selector_string() {
        let selector = Selector::from([
            ("game".to_string(), "survival".to_string()),
            ("app".to_string(), "backend".to_string()),
        ]);
        assert_eq!(selector_string(&selector), "app=backend,game=survival");
        assert_eq!(selector_string(&Selector::new()), "");
    }

    #[tokio::test]
    async fn test_memory_cluster_filters_by_selector() {
        let cluster = MemoryCluster::new();
        cluster.upsert_pod(pod("a", &[("game", "survival")]));
        cluster.upsert_pod(pod("b", &[("game", "creative")]));
        cluster.upsert_pod(pod("c", &[]));

        let selector = Selector::from([("game".to_string(), "survival".to_string())]);
        let pods = cluster.list_pods(&selector).await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].uid, "a");

        assert_eq!(cluster.list_pods(&Selector::new()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_memory_cluster_upsert_and_outage() {
        let cluster = MemoryCluster::new();
        cluster.upsert_pod(pod("a", &[]));
        let mut updated = pod("a", &[]);
        updated.phase = PodPhase::Failed;
        cluster.upsert_pod(updated);

        let pods = cluster.list_pods(&Selector::new()).await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].phase, PodPhase::Failed);

        cluster.set_available(false);
        assert!(cluster.list_pods(&Selector::new()).await.is_err());
        assert_eq!(cluster.list_calls(), 2);

        cluster.remove_pod("a");
        cluster.set_available(true);
        assert!(cluster.list_pods(&Selector::new()).await.unwrap().is_empty());
    }
}
