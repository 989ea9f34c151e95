//! Notification listener
//!
//! Keeps one subscription to every topic of the group open, reconnecting
//! with a fixed backoff. Leadership messages are forwarded to the
//! coordinator; deltas are applied to the registry unless this instance is
//! the leader that published them.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::election::LeaderElection;
use crate::error::Error;
use crate::keys::KeySpace;
use crate::notification::{Notification, TOPICS};
use crate::replication::Replicator;
use crate::store::{CoordinationStore, StoreMessage};
use crate::task::sleep_or_cancel;

/// What the subscriber asks the coordinator to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberEvent {
    /// Someone claimed or released the lease; re-run the election now
    LeadershipChanged,
    /// The subscription was re-established and deltas may have been missed
    Resubscribed,
}

enum Exit {
    Cancelled,
    Disconnected,
    Failed(Error),
}

pub struct Subscriber {
    store: Arc<dyn CoordinationStore>,
    keys: KeySpace,
    replicator: Replicator,
    election: Arc<LeaderElection>,
    events: mpsc::Sender<SubscriberEvent>,
    retry: Duration,
    cancel: CancellationToken,
}

impl Subscriber {
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeySpace,
        replicator: Replicator,
        election: Arc<LeaderElection>,
        events: mpsc::Sender<SubscriberEvent>,
        retry: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            keys,
            replicator,
            election,
            events,
            retry,
            cancel,
        }
    }

    /// Listen until cancelled, reconnecting after every failure
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut connected_before = false;
            loop {
                match self.listen(&mut connected_before).await {
                    Exit::Cancelled => return,
                    Exit::Disconnected => {
                        warn!(retry_secs = self.retry.as_secs(), "Notification stream ended, resubscribing");
                    }
                    Exit::Failed(e) => {
                        warn!(error = %e, retry_secs = self.retry.as_secs(), "Failed to subscribe to notifications");
                    }
                }
                if !sleep_or_cancel(self.retry, &self.cancel).await {
                    return;
                }
            }
        })
    }

    async fn listen(&self, connected_before: &mut bool) -> Exit {
        let channels: Vec<String> = TOPICS.iter().map(|topic| self.keys.channel(topic)).collect();
        let mut messages = match self.store.subscribe(&channels).await {
            Ok(messages) => messages,
            Err(e) => return Exit::Failed(e),
        };
        info!(group = %self.keys.group(), channels = channels.len(), "Subscribed to notifications");

        if *connected_before {
            self.notify(SubscriberEvent::Resubscribed);
        }
        *connected_before = true;

        loop {
            let message = tokio::select! {
                () = self.cancel.cancelled() => return Exit::Cancelled,
                message = messages.next() => message,
            };
            let Some(message) = message else {
                return Exit::Disconnected;
            };
            self.handle(&message).await;
        }
    }

    /// Route one raw message; malformed ones are dropped
    pub async fn handle(&self, message: &StoreMessage) {
        let notification = match Notification::parse(&self.keys, &message.channel, &message.payload) {
            Ok(notification) => notification,
            Err(e) => {
                warn!(error = %e, payload = %message.payload, "Dropping malformed notification");
                return;
            }
        };

        if notification.is_leadership() {
            debug!(topic = notification.topic(), payload = %message.payload, "Leadership notification");
            self.notify(SubscriberEvent::LeadershipChanged);
            return;
        }
        if self.election.is_leader() {
            return;
        }
        if let Err(e) = self.replicator.apply(&notification).await {
            warn!(
                error = %e,
                topic = notification.topic(),
                payload = %message.payload,
                "Failed to apply notification"
            );
        }
    }

    fn notify(&self, event: SubscriberEvent) {
        // a full queue already holds a pending re-evaluation
        if let Err(mpsc::error::TrySendError::Closed(_)) = self.events.try_send(event) {
            debug!(?event, "Coordinator is gone, dropping event");
        }
    }
}
