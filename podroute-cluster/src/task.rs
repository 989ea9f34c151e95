//! Periodic background tasks with cancellation

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Run `tick` every `period` until `cancel` fires.
///
/// The first tick runs immediately. A failing tick is logged and the next
/// one runs on schedule; a slow tick delays the following ones instead of
/// bursting to catch up.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!(task = name, "Periodic task shutting down");
                    return;
                }
                _ = timer.tick() => {
                    if let Err(e) = tick().await {
                        tracing::warn!(task = name, error = %e, "Periodic task failed, retrying next tick");
                    }
                }
            }
        }
    })
}

/// Sleep for `duration`; false if cancelled first
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counter = count.clone();

        let handle = spawn_periodic("test", Duration::from_secs(5), cancel.clone(), move || {
            let counter = counter.clone();
            async move {
                // failures do not stop the loop
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(Error::Store("first tick fails".to_string()));
                }
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        cancel.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_cancel() {
        let cancel = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_secs(3), &cancel).await);
        cancel.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(3), &cancel).await);
    }
}
