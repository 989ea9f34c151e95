//! Change detection between polling ticks
//!
//! Remembers the last snapshot of every resource by UID and reports a
//! resource as changed when it is new or when one of the registered
//! comparators sees a difference. Fields without a comparator are ignored.

use std::collections::{HashMap, HashSet};

use podroute_core::models::{PodResource, ReplicaGroupResource, Resource};

type Comparator<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

pub struct DiffChecker<T: Resource> {
    seen: HashMap<String, T>,
    comparators: Vec<Comparator<T>>,
}

impl<T: Resource> DiffChecker<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            seen: HashMap::new(),
            comparators: Vec::new(),
        }
    }

    /// Compare the field extracted by `field`
    #[must_use]
    pub fn watch<F, V>(mut self, field: F) -> Self
    where
        F: Fn(&T) -> V + Send + Sync + 'static,
        V: PartialEq,
    {
        self.comparators
            .push(Box::new(move |old: &T, new: &T| field(old) == field(new)));
        self
    }

    /// Record `resource` and report whether it is new or changed
    pub fn diff(&mut self, resource: &T) -> bool {
        let unchanged = self
            .seen
            .get(resource.uid())
            .is_some_and(|previous| self.comparators.iter().all(|same| same(previous, resource)));
        if unchanged {
            return false;
        }

        self.seen.insert(resource.uid().to_string(), resource.clone());
        true
    }

    /// Forget every UID missing from `live` and return them
    pub fn reap_deleted(&mut self, live: &HashSet<String>) -> Vec<String> {
        let deleted: Vec<String> = self
            .seen
            .keys()
            .filter(|uid| !live.contains(*uid))
            .cloned()
            .collect();
        for uid in &deleted {
            self.seen.remove(uid);
        }
        deleted
    }

    /// Drop a single UID so the next `diff` treats it as new
    pub fn forget(&mut self, uid: &str) {
        self.seen.remove(uid);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl<T: Resource> Default for DiffChecker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffChecker<PodResource> {
    /// Pods change on phase, address and deletion deadline
    #[must_use]
    pub fn for_pods() -> Self {
        Self::new()
            .watch(|pod: &PodResource| pod.phase)
            .watch(|pod: &PodResource| pod.address)
            .watch(|pod: &PodResource| pod.deletion_deadline)
    }
}

impl DiffChecker<ReplicaGroupResource> {
    /// Replica groups change on their replica count
    #[must_use]
    pub fn for_replica_groups() -> Self {
        Self::new().watch(|group: &ReplicaGroupResource| group.replicas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podroute_core::models::PodPhase;
    use std::collections::BTreeMap;

    fn pod(uid: &str, phase: PodPhase) -> PodResource {
        PodResource {
            uid: uid.to_string(),
            name: format!("pod-{uid}"),
            namespace: "games".to_string(),
            labels: BTreeMap::new(),
            phase,
            address: Some("10.0.0.1:25565".parse().unwrap()),
            owner_uids: Vec::new(),
            deletion_deadline: None,
        }
    }

    #[test]
    fn test_unchanged_resources_are_idempotent() {
        let mut checker = DiffChecker::for_pods();
        let pods = vec![pod("a", PodPhase::Running), pod("b", PodPhase::Pending)];

        assert!(pods.iter().all(|p| checker.diff(p)));
        for _ in 0..5 {
            assert!(pods.iter().all(|p| !checker.diff(p)));
        }
        assert_eq!(checker.len(), 2);
    }

    #[test]
    fn test_watched_field_change_is_reported_once() {
        let mut checker = DiffChecker::for_pods();
        let mut p = pod("a", PodPhase::Pending);
        assert!(checker.diff(&p));

        p.phase = PodPhase::Running;
        assert!(checker.diff(&p));
        assert!(!checker.diff(&p));
    }

    #[test]
    fn test_unwatched_field_is_ignored() {
        let mut checker = DiffChecker::for_pods();
        let mut p = pod("a", PodPhase::Running);
        assert!(checker.diff(&p));

        p.labels.insert("extra".to_string(), "label".to_string());
        assert!(!checker.diff(&p));
    }

    #[test]
    fn test_reap_deleted() {
        let mut checker = DiffChecker::for_pods();
        checker.diff(&pod("a", PodPhase::Running));
        checker.diff(&pod("b", PodPhase::Running));

        let live = HashSet::from(["a".to_string()]);
        assert_eq!(checker.reap_deleted(&live), vec!["b".to_string()]);
        assert!(checker.reap_deleted(&live).is_empty());
        assert!(checker.diff(&pod("b", PodPhase::Running)));
    }

    #[test]
    fn test_replica_group_comparator() {
        let mut checker = DiffChecker::for_replica_groups();
        let mut group = ReplicaGroupResource {
            uid: "rs".to_string(),
            name: "shop".to_string(),
            namespace: "games".to_string(),
            labels: BTreeMap::new(),
            replicas: 2,
            observed_generation: 1,
        };
        assert!(checker.diff(&group));

        group.observed_generation = 2;
        assert!(!checker.diff(&group));

        group.replicas = 0;
        assert!(checker.diff(&group));

        checker.forget("rs");
        assert!(checker.diff(&group));
    }
}
