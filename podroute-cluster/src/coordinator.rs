//! Per-instance coordination lifecycle
//!
//! Every proxy instance runs one coordinator. It claims a proxy identity,
//! takes part in the election and, depending on the outcome, either runs the
//! reconcilers (leader) or mirrors the leader's bookkeeping (follower).
//! Leadership transitions are serialized: the previous set of reconcilers is
//! always shut down before a new one starts.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use podroute_core::Config;

use crate::cluster_api::ClusterApi;
use crate::discovery::{
    Discovery, DiscoveryContext, DiscoverySettings, LoadBalancerDiscovery, ServerDiscovery,
};
use crate::election::LeaderElection;
use crate::error::Result;
use crate::identity::ProxyIdentity;
use crate::keys::KeySpace;
use crate::registry::ServerRegistry;
use crate::replication::Replicator;
use crate::routing::RoutingTable;
use crate::selector::RouteSelector;
use crate::store::CoordinationStore;
use crate::subscriber::{Subscriber, SubscriberEvent};
use crate::task::spawn_periodic;

const EVENT_QUEUE: usize = 16;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub key_prefix: String,
    pub group: String,
    pub lease_ttl: Duration,
    pub election_interval: Duration,
    pub identity_ttl: Duration,
    pub identity_renew_interval: Duration,
    pub subscriber_retry: Duration,
    pub discovery: DiscoverySettings,
}

impl CoordinatorSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let coordination = &config.coordination;
        Self {
            key_prefix: config.redis.key_prefix.clone(),
            group: coordination.group.clone(),
            lease_ttl: config.lease_ttl(),
            election_interval: Duration::from_secs(coordination.election_interval_seconds),
            identity_ttl: Duration::from_secs(coordination.identity_ttl_seconds),
            identity_renew_interval: Duration::from_secs(coordination.identity_renew_interval_seconds),
            subscriber_retry: Duration::from_secs(coordination.subscriber_retry_seconds),
            discovery: DiscoverySettings {
                selector: config.discovery.selector(),
                labels: config.discovery.labels.clone(),
                poll_interval: config.poll_interval(),
                drain_threshold: Duration::from_secs(config.discovery.drain_threshold_seconds),
                ..DiscoverySettings::default()
            },
        }
    }
}

type Reconcilers = Vec<Arc<dyn Discovery>>;

pub struct Coordinator {
    identity: ProxyIdentity,
    election: Arc<LeaderElection>,
    ctx: Arc<DiscoveryContext>,
    replicator: Replicator,
    reconcilers: Mutex<Option<Reconcilers>>,
    /// Held for the whole of a leadership evaluation
    transition: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    settings: CoordinatorSettings,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Join the group: claim an identity, bootstrap the registry from the
    /// store, run a first election and start the background tasks
    pub async fn start(
        settings: CoordinatorSettings,
        store: Arc<dyn CoordinationStore>,
        cluster: Arc<dyn ClusterApi>,
        routing: Arc<dyn RoutingTable>,
    ) -> Result<Arc<Self>> {
        let keys = KeySpace::new(settings.key_prefix.clone(), settings.group.clone());
        let identity = ProxyIdentity::acquire(store.clone(), &keys, settings.identity_ttl).await?;
        let election = Arc::new(LeaderElection::new(
            store.clone(),
            keys.clone(),
            identity.id(),
            settings.lease_ttl,
        ));
        let ctx = Arc::new(DiscoveryContext {
            store: store.clone(),
            cluster,
            registry: Arc::new(ServerRegistry::new(routing)),
            election: election.clone(),
            keys: keys.clone(),
            settings: settings.discovery.clone(),
        });
        let replicator = ctx.replicator();
        let cancel = CancellationToken::new();

        let coordinator = Arc::new(Self {
            identity,
            election: election.clone(),
            ctx,
            replicator: replicator.clone(),
            reconcilers: Mutex::new(None),
            transition: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
            settings: settings.clone(),
            cancel: cancel.clone(),
        });
        info!(
            proxy_id = %coordinator.proxy_id(),
            group = %keys.group(),
            "Joining coordination group"
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let subscriber = Arc::new(Subscriber::new(
            store,
            keys,
            replicator,
            election,
            events_tx,
            settings.subscriber_retry,
            cancel.child_token(),
        ));
        let mut tasks = vec![subscriber.start(), coordinator.spawn_event_loop(events_rx)];

        if let Err(e) = coordinator.replicator.sync().await {
            warn!(error = %e, "Initial registry bootstrap failed, waiting for notifications");
        }
        if let Err(e) = coordinator.evaluate_leadership().await {
            warn!(error = %e, "Initial election failed, retrying on schedule");
        }

        let this = Arc::clone(&coordinator);
        tasks.push(spawn_periodic(
            "leader-election",
            settings.election_interval,
            cancel.child_token(),
            move || {
                let this = Arc::clone(&this);
                async move { this.evaluate_leadership().await }
            },
        ));
        let this = Arc::clone(&coordinator);
        tasks.push(spawn_periodic(
            "proxy-identity",
            settings.identity_renew_interval,
            cancel.child_token(),
            move || {
                let this = Arc::clone(&this);
                async move { this.identity.renew().await }
            },
        ));
        coordinator.tasks.lock().extend(tasks);

        Ok(coordinator)
    }

    /// Run one election round and apply the resulting role.
    ///
    /// Promotion reconciles against the cluster before polling starts;
    /// demotion stops the reconcilers and re-syncs from the store.
    pub async fn evaluate_leadership(self: &Arc<Self>) -> Result<()> {
        let _transition = self.transition.lock().await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let was_leading = self.election.is_leader();
        let leading = self.election.try_acquire_or_renew().await?;
        let active = self.reconcilers.lock().is_some();

        match (active, leading) {
            (false, true) => self.promote().await,
            // the lease lapsed and was claimed again; state may have moved on meanwhile
            (true, true) if !was_leading => {
                info!(proxy_id = %self.proxy_id(), "Lease re-acquired, restarting reconcilers");
                self.set_and_run_reconcilers(None);
                self.promote().await;
            }
            (true, false) => {
                info!(proxy_id = %self.proxy_id(), "Stepping down, following the store");
                self.set_and_run_reconcilers(None);
                if let Err(e) = self.replicator.sync().await {
                    warn!(error = %e, "Re-sync after demotion failed");
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn promote(&self) {
        info!(proxy_id = %self.proxy_id(), group = %self.settings.group, "Promoted to leader, reconciling");
        let groups: Arc<dyn Discovery> = Arc::new(LoadBalancerDiscovery::new(
            self.ctx.clone(),
            self.cancel.child_token(),
        ));
        let servers: Arc<dyn Discovery> = Arc::new(ServerDiscovery::new(
            self.ctx.clone(),
            self.cancel.child_token(),
        ));
        let next = vec![groups, servers];

        for discovery in &next {
            if let Err(e) = discovery.reconcile_for_startup().await {
                warn!(kind = discovery.kind(), error = %e, "Startup reconciliation failed, retrying next election round");
                return;
            }
        }
        self.set_and_run_reconcilers(Some(next));
    }

    /// Swap the active reconcilers, stopping the previous ones first
    fn set_and_run_reconcilers(&self, next: Option<Reconcilers>) {
        let mut slot = self.reconcilers.lock();
        if let Some(previous) = slot.take() {
            for discovery in previous {
                discovery.shutdown();
            }
        }
        if let Some(next) = &next {
            for discovery in next {
                Arc::clone(discovery).start();
            }
        }
        *slot = next;
    }

    fn spawn_event_loop(self: &Arc<Self>, mut events: mpsc::Receiver<SubscriberEvent>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = this.cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                let Some(event) = event else {
                    return;
                };
                match event {
                    SubscriberEvent::LeadershipChanged => {
                        if let Err(e) = this.evaluate_leadership().await {
                            warn!(error = %e, "Election after leadership notification failed");
                        }
                    }
                    SubscriberEvent::Resubscribed if !this.is_leader() => {
                        if let Err(e) = this.replicator.sync().await {
                            warn!(error = %e, "Re-sync after resubscribe failed");
                        }
                    }
                    SubscriberEvent::Resubscribed => {}
                }
            }
        })
    }

    /// Leave the group: stop all tasks, hand the lease over and drop the identity
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        {
            let _transition = self.transition.lock().await;
            self.set_and_run_reconcilers(None);
        }

        if let Err(e) = self.election.leave().await {
            warn!(error = %e, "Failed to release leadership");
        }
        if let Err(e) = self.identity.release().await {
            warn!(error = %e, "Failed to release proxy identity");
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }
        info!(proxy_id = %self.proxy_id(), "Left coordination group");
    }

    #[must_use]
    pub fn proxy_id(&self) -> &str {
        self.identity.id()
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.ctx.registry
    }

    #[must_use]
    pub fn selector(&self) -> RouteSelector {
        RouteSelector::new(self.ctx.registry.clone())
    }
}
