//! Replica groups to load-balanced names
//!
//! A group with at least one replica and a preferred-name label is
//! registered under exactly that name. When the name is already taken the
//! group waits in a per-name queue; every pass hands a freed name to the
//! oldest live group waiting for it.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use podroute_core::models::{
    label_flag, GroupDescriptor, GroupOptions, ReplicaGroupResource, Resource, StrategyKind,
};

use super::{Discovery, DiscoveryContext};
use crate::diff::DiffChecker;
use crate::error::Result;
use crate::notification::Notification;
use crate::task::spawn_periodic;

pub struct LoadBalancerDiscovery {
    ctx: Arc<DiscoveryContext>,
    diff: Mutex<DiffChecker<ReplicaGroupResource>>,
    /// Group UIDs waiting for a name, oldest first
    waiting: Mutex<HashMap<String, VecDeque<String>>>,
    /// Removals whose store cleanup failed; retried every pass
    pending: Mutex<HashSet<String>>,
    pass: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl LoadBalancerDiscovery {
    #[must_use]
    pub fn new(ctx: Arc<DiscoveryContext>, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            diff: Mutex::new(DiffChecker::for_replica_groups()),
            waiting: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            pass: tokio::sync::Mutex::new(()),
            cancel,
        }
    }

    pub async fn tick(&self) -> Result<()> {
        if !self.ctx.election.is_leader() {
            debug!("Not leader, skipping load balancer discovery pass");
            return Ok(());
        }
        let _pass = self.pass.lock().await;

        let groups = self
            .ctx
            .cluster
            .list_replica_groups(&self.ctx.settings.selector)
            .await?;
        let changed: Vec<&ReplicaGroupResource> = {
            let mut diff = self.diff.lock();
            groups.iter().filter(|group| diff.diff(*group)).collect()
        };

        for group in changed {
            if let Err(e) = self.process(group).await {
                warn!(uid = %group.uid, group = %group.name, error = %e, "Failed to process replica group, retrying next pass");
                self.diff.lock().forget(&group.uid);
            }
        }

        let live: HashSet<String> = groups.iter().map(|g| g.uid.clone()).collect();
        let mut deleted: HashSet<String> = self.diff.lock().reap_deleted(&live).into_iter().collect();
        deleted.extend(
            self.ctx
                .registry
                .group_uids()
                .into_iter()
                .chain(self.waiting.lock().values().flatten().cloned().collect::<Vec<_>>())
                .filter(|uid| !live.contains(uid)),
        );
        deleted.extend(self.pending_removals(&groups));
        for uid in deleted {
            if let Err(e) = self.unregister(&uid).await {
                warn!(uid = %uid, error = %e, "Failed to unregister deleted replica group");
            }
        }

        let names: Vec<String> = self.waiting.lock().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.promote_waiting(&name, &groups).await {
                warn!(name = %name, error = %e, "Failed to promote queued load balancer, retrying next pass");
            }
        }
        Ok(())
    }

    /// Pending removals still to retry; a group that came back is dropped from the set
    fn pending_removals(&self, groups: &[ReplicaGroupResource]) -> Vec<String> {
        let mut pending = self.pending.lock();
        pending.retain(|uid| {
            !groups
                .iter()
                .any(|g| &g.uid == uid && !g.is_scaled_down())
        });
        pending.iter().cloned().collect()
    }

    async fn process(&self, group: &ReplicaGroupResource) -> Result<()> {
        if group.is_live() {
            self.register_or_ignore(group).await
        } else if group.is_scaled_down() {
            self.unregister(&group.uid).await
        } else {
            Ok(())
        }
    }

    /// Register a group under its preferred name, or queue it if the name is taken
    async fn register_or_ignore(&self, group: &ReplicaGroupResource) -> Result<()> {
        if self.ctx.registry.group_name(&group.uid).is_some() {
            return Ok(());
        }
        let Some(name) = group.label(&self.ctx.settings.labels.server_name) else {
            debug!(group = %group.name, "Replica group has no preferred name, ignoring");
            return Ok(());
        };

        if !self.claim(group, name).await? && self.enqueue(name, &group.uid) {
            info!(uid = %group.uid, name = %name, "Load balancer name is taken, queued");
        }
        Ok(())
    }

    /// Register `group` as `name` if nobody holds it; false when taken
    async fn claim(&self, group: &ReplicaGroupResource, name: &str) -> Result<bool> {
        if self.ctx.is_name_taken(name).await? {
            return Ok(false);
        }

        let descriptor = self.descriptor(group, name);
        self.persist(&descriptor).await?;
        self.ctx.registry.register_group(&descriptor);
        self.ctx
            .publish(&Notification::GroupAdded {
                uid: descriptor.uid,
                name: descriptor.name,
                initial: descriptor.options.initial,
            })
            .await;
        Ok(true)
    }

    /// Drop a group from the store, then from the registry, then tell followers.
    ///
    /// Its name is handed on by the queue pass once the store has forgotten it.
    pub async fn unregister(&self, uid: &str) -> Result<()> {
        self.dequeue_uid(uid);

        let keys = &self.ctx.keys;
        let stored = async {
            self.ctx.store.hash_delete(&keys.load_balancers(), uid).await?;
            self.ctx
                .store
                .hash_delete(&keys.load_balancer_options(), uid)
                .await
        }
        .await;
        if let Err(e) = stored {
            self.pending.lock().insert(uid.to_string());
            return Err(e);
        }
        self.pending.lock().remove(uid);

        if let Some(descriptor) = self.ctx.registry.unregister_group(uid) {
            info!(uid = %uid, name = %descriptor.name, "Load balancer unregistered");
            self.ctx
                .publish(&Notification::GroupDeleted { uid: uid.to_string() })
                .await;
        }
        Ok(())
    }

    /// Give `name` to the oldest live group waiting for it, if the name is free.
    ///
    /// The group leaves the queue only once it is registered.
    async fn promote_waiting(&self, name: &str, live: &[ReplicaGroupResource]) -> Result<()> {
        while let Some(next) = self.front_waiting(name) {
            let Some(group) = live.iter().find(|g| g.uid == next && g.is_live()) else {
                debug!(uid = %next, "Queued load balancer is gone, skipping");
                self.dequeue_uid(&next);
                continue;
            };
            if self.claim(group, name).await? {
                info!(uid = %next, name = %name, "Promoted queued load balancer");
                self.dequeue_uid(&next);
            }
            break;
        }
        Ok(())
    }

    /// Leader startup: keep stored groups that still exist, prune the rest
    pub async fn groups_for_startup(&self) -> Result<Vec<GroupDescriptor>> {
        let ctx = &self.ctx;
        let stored = ctx.store.hash_get_all(&ctx.keys.load_balancers()).await?;
        let groups = ctx
            .cluster
            .list_replica_groups(&ctx.settings.selector)
            .await?;

        let mut kept = Vec::new();
        for (uid, name) in stored {
            match groups.iter().find(|g| g.uid == uid) {
                Some(group) if !group.is_scaled_down() => {
                    let descriptor = self.descriptor(group, &name);
                    self.persist(&descriptor).await?;
                    kept.push(descriptor);
                }
                _ => {
                    ctx.store.hash_delete(&ctx.keys.load_balancers(), &uid).await?;
                    ctx.store
                        .hash_delete(&ctx.keys.load_balancer_options(), &uid)
                        .await?;
                    info!(uid = %uid, name = %name, "Pruned load balancer of a removed replica group");
                    ctx.publish(&Notification::GroupDeleted { uid }).await;
                }
            }
        }
        kept.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(kept)
    }

    fn descriptor(&self, group: &ReplicaGroupResource, name: &str) -> GroupDescriptor {
        let labels = &self.ctx.settings.labels;
        let strategy = group
            .label(&labels.strategy)
            .and_then(|raw| {
                raw.parse::<StrategyKind>()
                    .inspect_err(|e| warn!(group = %group.name, error = %e, "Ignoring load balancing label"))
                    .ok()
            })
            .unwrap_or_default();
        GroupDescriptor {
            uid: group.uid.clone(),
            name: name.to_string(),
            options: GroupOptions {
                initial: label_flag(&group.labels, &labels.initial_server),
                strategy,
            },
        }
    }

    async fn persist(&self, descriptor: &GroupDescriptor) -> Result<()> {
        let keys = &self.ctx.keys;
        self.ctx
            .store
            .hash_set(
                &keys.load_balancer_options(),
                &descriptor.uid,
                &descriptor.options.to_json()?,
            )
            .await?;
        self.ctx
            .store
            .hash_set(&keys.load_balancers(), &descriptor.uid, &descriptor.name)
            .await
    }

    /// Queue `uid` for `name`; false if it already waits
    fn enqueue(&self, name: &str, uid: &str) -> bool {
        let mut waiting = self.waiting.lock();
        let queue = waiting.entry(name.to_string()).or_default();
        if queue.iter().any(|queued| queued == uid) {
            return false;
        }
        queue.push_back(uid.to_string());
        true
    }

    fn front_waiting(&self, name: &str) -> Option<String> {
        self.waiting.lock().get(name)?.front().cloned()
    }

    fn dequeue_uid(&self, uid: &str) {
        let mut waiting = self.waiting.lock();
        waiting.retain(|_, queue| {
            queue.retain(|queued| queued != uid);
            !queue.is_empty()
        });
    }

    /// UIDs waiting for `name`, oldest first
    #[must_use]
    pub fn queued(&self, name: &str) -> Vec<String> {
        self.waiting
            .lock()
            .get(name)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Discovery for LoadBalancerDiscovery {
    fn kind(&self) -> &'static str {
        "load-balancers"
    }

    async fn reconcile_for_startup(&self) -> Result<()> {
        if !self.ctx.election.is_leader() {
            return self.ctx.replicator().sync_groups().await;
        }

        let kept = self.groups_for_startup().await?;
        let keep: HashSet<&str> = kept.iter().map(|g| g.uid.as_str()).collect();
        for uid in self.ctx.registry.group_uids() {
            if !keep.contains(uid.as_str()) {
                self.ctx.registry.unregister_group(&uid);
            }
        }
        for descriptor in &kept {
            self.ctx.registry.register_group(descriptor);
        }

        // live groups the store does not know yet
        let groups = self
            .ctx
            .cluster
            .list_replica_groups(&self.ctx.settings.selector)
            .await?;
        for group in groups.iter().filter(|g| g.is_live() && !keep.contains(g.uid.as_str())) {
            self.register_or_ignore(group).await?;
        }
        info!(
            count = self.ctx.registry.group_uids().len(),
            queued = self.waiting.lock().values().map(VecDeque::len).sum::<usize>(),
            "Load balancers reconciled for startup"
        );
        Ok(())
    }

    fn start(self: Arc<Self>) {
        let period = self.ctx.settings.poll_interval;
        let cancel = self.cancel.clone();
        spawn_periodic("load-balancer-discovery", period, cancel, move || {
            let this = Arc::clone(&self);
            async move { this.tick().await }
        });
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}
