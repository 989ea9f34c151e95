//! Leader election over a TTL lease in the shared store
//!
//! The lease key holds the identity of the current leader. The holder renews
//! it with a compare-and-expire; anybody else can only claim it once it has
//! expired. Locally the lease is considered held until the expiry computed
//! from the moment the last successful claim or renewal was *started*, which
//! is never later than the store's own expiry.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::keys::KeySpace;
use crate::notification::Notification;
use crate::store::CoordinationStore;

pub struct LeaderElection {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    identity: String,
    ttl: Duration,
    /// Local expiry of the lease while we believe we hold it
    lease_expiry: Mutex<Option<Instant>>,
}

impl LeaderElection {
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeySpace,
        identity: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            identity: identity.into(),
            ttl,
            lease_expiry: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Claim the lease if it is free, or renew it if we hold it.
    ///
    /// Returns whether this instance is leader afterwards. Store failures are
    /// returned as errors and leave the local lease untouched, so it simply
    /// runs out if renewals keep failing.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let key = self.keys.leader();
        let started = Instant::now();

        if self.store.set_if_absent(&key, &self.identity, self.ttl).await? {
            *self.lease_expiry.lock() = Some(started + self.ttl);
            info!(proxy_id = %self.identity, group = %self.keys.group(), "Leadership acquired");

            let notification = Notification::LeaderChanged {
                holder: self.identity.clone(),
            };
            if let Err(e) = self
                .store
                .publish(&notification.channel(&self.keys), &notification.payload())
                .await
            {
                warn!(error = %e, "Failed to announce leadership change");
            }
            return Ok(true);
        }

        if self
            .store
            .compare_and_expire(&key, &self.identity, self.ttl)
            .await?
        {
            *self.lease_expiry.lock() = Some(started + self.ttl);
            debug!(proxy_id = %self.identity, "Leadership renewed");
            return Ok(true);
        }

        if self.lease_expiry.lock().take().is_some() {
            warn!(proxy_id = %self.identity, "Leadership lost to another instance");
        }
        Ok(false)
    }

    /// Cheap local check; false once the last known expiry has passed
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.lease_expiry
            .lock()
            .is_some_and(|expiry| Instant::now() < expiry)
    }

    /// Current lease holder according to the store
    pub async fn current_holder(&self) -> Result<Option<String>> {
        self.store.get(&self.keys.leader()).await
    }

    /// Give up the lease if we still own it and tell the others to
    /// re-run their election right away
    pub async fn leave(&self) -> Result<()> {
        self.lease_expiry.lock().take();

        if !self
            .store
            .compare_and_delete(&self.keys.leader(), &self.identity)
            .await?
        {
            debug!(proxy_id = %self.identity, "Lease not held, nothing to release");
            return Ok(());
        }

        info!(proxy_id = %self.identity, "Leadership released");
        let notification = Notification::LeaderLeft {
            holder: self.identity.clone(),
        };
        self.store
            .publish(&notification.channel(&self.keys), &notification.payload())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use futures::StreamExt;

    const TTL: Duration = Duration::from_secs(10);

    fn keys() -> KeySpace {
        KeySpace::new("podroute:", "survival")
    }

    fn election(store: &MemoryStore, id: &str) -> LeaderElection {
        LeaderElection::new(Arc::new(store.clone()), keys(), id, TTL)
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_and_renew() {
        let store = MemoryStore::new();
        let a = election(&store, "a");
        let b = election(&store, "b");

        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!b.try_acquire_or_renew().await.unwrap());
        assert!(a.is_leader());
        assert!(!b.is_leader());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(a.try_acquire_or_renew().await.unwrap());
        tokio::time::advance(Duration::from_secs(7)).await;
        // renewed at t=5, so still held at t=12
        assert!(a.is_leader());
        assert!(!b.try_acquire_or_renew().await.unwrap());
        assert_eq!(a.current_holder().await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_lease_is_not_leader() {
        let store = MemoryStore::new();
        let a = election(&store, "a");
        assert!(a.try_acquire_or_renew().await.unwrap());

        store.set_available(false);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(a.try_acquire_or_renew().await.is_err());
        assert!(a.is_leader());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!a.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_takeover_after_expiry() {
        let store = MemoryStore::new();
        let a = election(&store, "a");
        let b = election(&store, "b");
        assert!(a.try_acquire_or_renew().await.unwrap());

        tokio::time::advance(TTL).await;
        assert!(!a.is_leader());
        assert!(b.try_acquire_or_renew().await.unwrap());
        assert!(!a.try_acquire_or_renew().await.unwrap());
        assert!(!a.is_leader());
    }

    #[tokio::test]
    async fn test_leave_releases_and_notifies() {
        let store = MemoryStore::new();
        let a = election(&store, "a");
        let b = election(&store, "b");
        let mut messages = store
            .subscribe(&[keys().channel("leader-leave")])
            .await
            .unwrap();

        assert!(a.try_acquire_or_renew().await.unwrap());
        a.leave().await.unwrap();
        assert!(!a.is_leader());

        let msg = messages.next().await.unwrap();
        assert_eq!(msg.payload, "a");
        assert!(b.try_acquire_or_renew().await.unwrap());

        // leaving a lease held by someone else is a no-op
        a.leave().await.unwrap();
        assert_eq!(b.current_holder().await.unwrap().as_deref(), Some("b"));
    }

    async fn race(instances: usize) {
        let store = MemoryStore::new();
        let elections: Vec<LeaderElection> = (0..instances)
            .map(|i| election(&store, &format!("proxy-{i}")))
            .collect();
        // the first leader stops renewing at round 10, as if partitioned away
        let mut crashed: Option<usize> = None;

        for round in 0..40 {
            let attempts = elections.iter().enumerate().filter_map(|(i, e)| {
                (Some(i) != crashed).then(|| e.try_acquire_or_renew())
            });
            futures::future::join_all(attempts).await;

            let leaders: Vec<usize> = (0..instances).filter(|&i| elections[i].is_leader()).collect();
            assert!(leaders.len() <= 1, "round {round}: leaders {leaders:?}");

            if round == 10 && instances > 1 {
                crashed = leaders.first().copied();
            }

            for _ in 0..3 {
                tokio::time::advance(Duration::from_secs(1)).await;
                let leaders = elections.iter().filter(|e| e.is_leader()).count();
                assert!(leaders <= 1, "round {round}: {leaders} leaders");
            }
        }

        let leaders: Vec<usize> = (0..instances).filter(|&i| elections[i].is_leader()).collect();
        assert_eq!(leaders.len(), 1);
        if instances > 1 {
            assert_ne!(leaders.first().copied(), crashed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_leader_one_instance() {
        race(1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_leader_three_instances() {
        race(3).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_leader_ten_instances() {
        race(10).await;
    }
}
