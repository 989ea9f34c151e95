use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// A cluster object identified by a stable UID
pub trait Resource: Clone + Send + Sync + 'static {
    fn uid(&self) -> &str;
    fn name(&self) -> &str;
    fn labels(&self) -> &BTreeMap<String, String>;

    /// Value of `key`, if the label is present and non-empty
    fn label(&self, key: &str) -> Option<&str> {
        self.labels()
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Lifecycle phase as seen by discovery.
///
/// `Terminating` is reported for any pod with a deletion deadline,
/// regardless of the phase the platform still reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodPhase {
    Pending,
    Running,
    Terminating,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Parse the phase string reported by the cluster API
    #[must_use]
    pub fn from_status(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Snapshot of a backend pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodResource {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub phase: PodPhase,
    /// Routable address, once the pod has an IP
    pub address: Option<SocketAddr>,
    /// UIDs of the objects owning this pod (its replica group)
    pub owner_uids: Vec<String>,
    /// When the platform will forcibly remove the pod
    pub deletion_deadline: Option<DateTime<Utc>>,
}

impl PodResource {
    /// Time left before forced removal, zero once the deadline has passed
    #[must_use]
    pub fn remaining_grace(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.deletion_deadline
            .map(|deadline| (deadline - now).to_std().unwrap_or_default())
    }

    #[must_use]
    pub fn is_owned_by(&self, owner_uid: &str) -> bool {
        self.owner_uids.iter().any(|uid| uid == owner_uid)
    }
}

impl Resource for PodResource {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

/// Snapshot of a scalable replica group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaGroupResource {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    /// Replicas the group is currently asked to run
    pub replicas: i32,
    pub observed_generation: i64,
}

impl ReplicaGroupResource {
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.replicas > 0
    }

    /// Scaled to zero after at least one update
    #[must_use]
    pub const fn is_scaled_down(&self) -> bool {
        self.replicas <= 0 && self.observed_generation > 1
    }
}

impl Resource for ReplicaGroupResource {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

/// Boolean label value; only `true` (any case) counts
#[must_use]
pub fn label_flag(labels: &BTreeMap<String, String>, key: &str) -> bool {
    labels
        .get(key)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn pod() -> PodResource {
        PodResource {
            uid: "uid-1".to_string(),
            name: "lobby-7f9c".to_string(),
            namespace: "games".to_string(),
            labels: BTreeMap::from([("podroute.io/initial-server".to_string(), "TRUE".to_string())]),
            phase: PodPhase::Running,
            address: None,
            owner_uids: vec!["rs-1".to_string()],
            deletion_deadline: None,
        }
    }

    #[test]
    fn test_phase_from_status() {
        assert_eq!(PodPhase::from_status("Running"), PodPhase::Running);
        assert_eq!(PodPhase::from_status("Failed"), PodPhase::Failed);
        assert_eq!(PodPhase::from_status("Weird"), PodPhase::Unknown);
    }

    #[test]
    fn test_remaining_grace() {
        let now = Utc::now();
        let mut pod = pod();
        assert_eq!(pod.remaining_grace(now), None);

        pod.deletion_deadline = Some(now + ChronoDuration::seconds(70));
        assert_eq!(pod.remaining_grace(now), Some(std::time::Duration::from_secs(70)));

        pod.deletion_deadline = Some(now - ChronoDuration::seconds(3));
        assert_eq!(pod.remaining_grace(now), Some(std::time::Duration::ZERO));
    }

    #[test]
    fn test_labels() {
        let pod = pod();
        assert!(label_flag(&pod.labels, "podroute.io/initial-server"));
        assert!(!label_flag(&pod.labels, "missing"));
        assert_eq!(pod.label("missing"), None);
        assert!(pod.is_owned_by("rs-1"));
    }

    #[test]
    fn test_replica_group_liveness() {
        let mut group = ReplicaGroupResource {
            uid: "rs-1".to_string(),
            name: "shop".to_string(),
            namespace: "games".to_string(),
            labels: BTreeMap::new(),
            replicas: 0,
            observed_generation: 1,
        };
        assert!(!group.is_live());
        assert!(!group.is_scaled_down());

        group.observed_generation = 2;
        assert!(group.is_scaled_down());

        group.replicas = 3;
        assert!(group.is_live());
        assert!(!group.is_scaled_down());
    }
}
