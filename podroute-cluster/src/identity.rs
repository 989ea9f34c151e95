//! Proxy instance identity
//!
//! Each running instance claims a short random token in the shared store.
//! The claim carries a liveness TTL that is renewed periodically and is
//! deleted again on graceful shutdown.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::keys::KeySpace;
use crate::store::CoordinationStore;

const ID_LENGTH: usize = 8;

/// Give up after this many consecutive collisions
const MAX_ATTEMPTS: usize = 16;

const ALPHANUMERIC: [char; 62] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L',
    'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', '0', '1', '2', '3', '4',
    '5', '6', '7', '8', '9',
];

/// The identity this instance holds in the shared store
pub struct ProxyIdentity {
    id: String,
    key: String,
    ttl: Duration,
    store: Arc<dyn CoordinationStore>,
}

impl ProxyIdentity {
    /// Claim a fresh, collision-checked identity
    pub async fn acquire(
        store: Arc<dyn CoordinationStore>,
        keys: &KeySpace,
        ttl: Duration,
    ) -> Result<Self> {
        for _ in 0..MAX_ATTEMPTS {
            let id = nanoid::nanoid!(ID_LENGTH, &ALPHANUMERIC);
            let key = keys.proxy_id(&id);

            if store.set_if_absent(&key, "1", ttl).await? {
                info!(proxy_id = %id, group = %keys.group(), "Proxy identity acquired");
                return Ok(Self { id, key, ttl, store });
            }

            debug!(proxy_id = %id, "Proxy identity already taken, retrying");
        }

        Err(Error::Store(format!(
            "Could not allocate a unique proxy id after {MAX_ATTEMPTS} attempts"
        )))
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Extend the liveness TTL.
    ///
    /// If the entry vanished (store flushed, TTL missed) it is claimed again
    /// under the same id when possible.
    pub async fn renew(&self) -> Result<()> {
        if self.store.compare_and_expire(&self.key, "1", self.ttl).await? {
            return Ok(());
        }

        if self.store.set_if_absent(&self.key, "1", self.ttl).await? {
            warn!(proxy_id = %self.id, "Proxy identity had expired and was reclaimed");
        } else {
            warn!(proxy_id = %self.id, "Proxy identity key is held by an unexpected value");
        }
        Ok(())
    }

    /// Delete the identity entry
    pub async fn release(&self) -> Result<()> {
        self.store.delete(&self.key).await?;
        info!(proxy_id = %self.id, "Proxy identity released");
        Ok(())
    }
}
