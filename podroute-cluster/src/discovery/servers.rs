//! Pods to backends
//!
//! Running pods are registered under their preferred name (or the next free
//! suffix). Terminating pods stay routable until less than the drain
//! threshold of their grace period is left, so players on them can be moved
//! off in time.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use podroute_core::models::{label_flag, BackendServer, PodPhase, PodResource, Resource};

use super::{Discovery, DiscoveryContext};
use crate::diff::DiffChecker;
use crate::error::Result;
use crate::notification::Notification;
use crate::task::{sleep_or_cancel, spawn_periodic};

pub struct ServerDiscovery {
    ctx: Arc<DiscoveryContext>,
    diff: Mutex<DiffChecker<PodResource>>,
    /// Removals whose store cleanup failed; retried every pass
    pending: Mutex<HashSet<String>>,
    /// Serializes polling passes and deferred re-checks
    pass: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl ServerDiscovery {
    #[must_use]
    pub fn new(ctx: Arc<DiscoveryContext>, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            diff: Mutex::new(DiffChecker::for_pods()),
            pending: Mutex::new(HashSet::new()),
            pass: tokio::sync::Mutex::new(()),
            cancel,
        }
    }

    /// One polling pass; a no-op unless this instance leads
    pub async fn tick(self: &Arc<Self>) -> Result<()> {
        if !self.ctx.election.is_leader() {
            debug!("Not leader, skipping server discovery pass");
            return Ok(());
        }
        let _pass = self.pass.lock().await;

        let pods = self.ctx.cluster.list_pods(&self.ctx.settings.selector).await?;
        let changed: Vec<&PodResource> = {
            let mut diff = self.diff.lock();
            pods.iter().filter(|pod| diff.diff(*pod)).collect()
        };

        for pod in changed {
            if let Err(e) = self.process(pod).await {
                warn!(uid = %pod.uid, pod = %pod.name, error = %e, "Failed to process pod, retrying next pass");
                self.diff.lock().forget(&pod.uid);
            }
        }

        let live: HashSet<String> = pods.iter().map(|p| p.uid.clone()).collect();
        let mut deleted: HashSet<String> = self.diff.lock().reap_deleted(&live).into_iter().collect();
        // registered at startup but gone before the first pass saw it
        deleted.extend(
            self.ctx
                .registry
                .backend_uids()
                .into_iter()
                .filter(|uid| !live.contains(uid)),
        );
        let pending: Vec<String> = self.pending.lock().iter().cloned().collect();
        deleted.extend(pending);
        for uid in deleted {
            if let Err(e) = self.unregister(&uid).await {
                warn!(uid = %uid, error = %e, "Failed to unregister deleted pod");
            }
        }
        Ok(())
    }

    async fn process(self: &Arc<Self>, pod: &PodResource) -> Result<()> {
        match pod.phase {
            PodPhase::Running => self.register_or_ignore(pod).await,
            PodPhase::Terminating => self.drain(pod).await,
            PodPhase::Failed | PodPhase::Succeeded => self.unregister(&pod.uid).await,
            PodPhase::Pending | PodPhase::Unknown => Ok(()),
        }
    }

    /// Register a running pod unless it already is
    async fn register_or_ignore(&self, pod: &PodResource) -> Result<()> {
        if self.ctx.registry.backend_name(&pod.uid).is_some() {
            return Ok(());
        }
        let Some(address) = pod.address else {
            debug!(pod = %pod.name, "Pod has no address yet");
            return Ok(());
        };

        let name = match self
            .ctx
            .store
            .hash_get(&self.ctx.keys.servers(), &pod.uid)
            .await?
        {
            Some(name) => name,
            None => self.ctx.allocate_name(self.preferred_name(pod)).await?,
        };

        let server = self.backend(pod, name, address);
        self.persist(&server).await?;
        self.ctx.registry.register_backend(server.clone());
        self.ctx
            .publish(&Notification::BackendAdded {
                uid: server.uid,
                name: server.name,
            })
            .await;
        Ok(())
    }

    async fn drain(self: &Arc<Self>, pod: &PodResource) -> Result<()> {
        let threshold = self.ctx.settings.drain_threshold;
        let Some(remaining) = pod.remaining_grace(self.ctx.settings.clock.now()) else {
            return self.unregister(&pod.uid).await;
        };

        if remaining < threshold {
            info!(pod = %pod.name, remaining_secs = remaining.as_secs(), "Pod is draining, unregistering");
            return self.unregister(&pod.uid).await;
        }

        let delay = remaining - threshold + Duration::from_secs(1);
        info!(
            pod = %pod.name,
            remaining_secs = remaining.as_secs(),
            recheck_in_secs = delay.as_secs(),
            "Pod is terminating, keeping it until the drain threshold"
        );
        self.schedule_recheck(pod.uid.clone(), delay);
        Ok(())
    }

    fn schedule_recheck(self: &Arc<Self>, uid: String, delay: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if !sleep_or_cancel(delay, &this.cancel).await {
                return;
            }
            if let Err(e) = this.recheck(&uid).await {
                warn!(uid = %uid, error = %e, "Terminating pod re-check failed");
            }
        });
    }

    async fn recheck(self: &Arc<Self>, uid: &str) -> Result<()> {
        if !self.ctx.election.is_leader() {
            return Ok(());
        }
        let _pass = self.pass.lock().await;

        let pods = self.ctx.cluster.list_pods(&self.ctx.settings.selector).await?;
        match pods.into_iter().find(|p| p.uid == uid) {
            Some(pod) => self.process(&pod).await,
            None => self.unregister(uid).await,
        }
    }

    /// Drop a backend from the store, then from the registry, then tell followers.
    ///
    /// The registry keeps the backend until the store forgets it, and the uid
    /// is retried on every pass until then.
    pub async fn unregister(&self, uid: &str) -> Result<()> {
        let keys = &self.ctx.keys;
        let stored = async {
            self.ctx.store.hash_delete(&keys.servers(), uid).await?;
            self.ctx.store.hash_delete(&keys.endpoints(), uid).await
        }
        .await;
        if let Err(e) = stored {
            self.pending.lock().insert(uid.to_string());
            return Err(e);
        }
        self.pending.lock().remove(uid);

        if let Some(server) = self.ctx.registry.unregister_backend(uid) {
            info!(uid = %uid, name = %server.name, "Backend unregistered");
            self.ctx
                .publish(&Notification::BackendDeleted { uid: uid.to_string() })
                .await;
        }
        Ok(())
    }

    /// Leader startup: reconcile the stored names with the live pods.
    ///
    /// Stored entries whose pod is gone are pruned. Running pods without a
    /// stored name get one. Endpoints are refreshed for every entry kept.
    pub async fn servers_for_startup(&self) -> Result<Vec<BackendServer>> {
        let ctx = &self.ctx;
        let mut stored = ctx.store.hash_get_all(&ctx.keys.servers()).await?;
        let pods = ctx.cluster.list_pods(&ctx.settings.selector).await?;
        let live: HashSet<&str> = pods.iter().map(|p| p.uid.as_str()).collect();

        let stale: Vec<String> = stored
            .keys()
            .filter(|uid| !live.contains(uid.as_str()))
            .cloned()
            .collect();
        for uid in stale {
            stored.remove(&uid);
            ctx.store.hash_delete(&ctx.keys.servers(), &uid).await?;
            ctx.store.hash_delete(&ctx.keys.endpoints(), &uid).await?;
            info!(uid = %uid, "Pruned backend of a pod that no longer exists");
            ctx.publish(&Notification::BackendDeleted { uid }).await;
        }

        let mut servers = Vec::new();
        for pod in &pods {
            let Some(address) = pod.address else {
                continue;
            };
            let known = stored.get(&pod.uid).cloned();
            let routable = matches!(pod.phase, PodPhase::Running | PodPhase::Terminating);
            let (name, fresh) = match known {
                Some(name) if routable => (name, false),
                None if pod.phase == PodPhase::Running => {
                    (ctx.allocate_name(self.preferred_name(pod)).await?, true)
                }
                _ => continue,
            };

            let server = self.backend(pod, name, address);
            self.persist(&server).await?;
            if fresh {
                ctx.publish(&Notification::BackendAdded {
                    uid: server.uid.clone(),
                    name: server.name.clone(),
                })
                .await;
            }
            servers.push(server);
        }
        Ok(servers)
    }

    fn preferred_name<'a>(&self, pod: &'a PodResource) -> &'a str {
        pod.label(&self.ctx.settings.labels.server_name)
            .unwrap_or(&pod.name)
    }

    fn backend(&self, pod: &PodResource, name: String, address: std::net::SocketAddr) -> BackendServer {
        BackendServer {
            uid: pod.uid.clone(),
            name,
            address,
            initial: label_flag(&pod.labels, &self.ctx.settings.labels.initial_server),
            owners: pod.owner_uids.clone(),
        }
    }

    async fn persist(&self, server: &BackendServer) -> Result<()> {
        let keys = &self.ctx.keys;
        self.ctx
            .store
            .hash_set(&keys.endpoints(), &server.uid, &server.endpoint().to_json()?)
            .await?;
        self.ctx
            .store
            .hash_set(&keys.servers(), &server.uid, &server.name)
            .await
    }
}

#[async_trait]
impl Discovery for ServerDiscovery {
    fn kind(&self) -> &'static str {
        "servers"
    }

    async fn reconcile_for_startup(&self) -> Result<()> {
        if !self.ctx.election.is_leader() {
            return self.ctx.replicator().sync_backends().await;
        }

        let servers = self.servers_for_startup().await?;
        let keep: HashSet<&str> = servers.iter().map(|s| s.uid.as_str()).collect();
        for uid in self.ctx.registry.backend_uids() {
            if !keep.contains(uid.as_str()) {
                self.ctx.registry.unregister_backend(&uid);
            }
        }
        info!(count = servers.len(), "Backends reconciled for startup");
        for server in servers {
            self.ctx.registry.register_backend(server);
        }
        Ok(())
    }

    fn start(self: Arc<Self>) {
        let period = self.ctx.settings.poll_interval;
        let cancel = self.cancel.clone();
        spawn_periodic("server-discovery", period, cancel, move || {
            let this = Arc::clone(&self);
            async move { this.tick().await }
        });
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}
