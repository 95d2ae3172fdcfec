use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::{config::CleanupConfig, storage::StorageClient};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Exponential backoff, capped at one minute.
    fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(factor)
            .min(Duration::from_secs(60))
    }
}

impl From<&CleanupConfig> for RetryPolicy {
    fn from(cfg: &CleanupConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            base_delay: cfg.base_delay,
        }
    }
}

/// Deletes replaced media in the background.
///
/// `release` only enqueues; deletions happen on a worker task and their
/// failures never reach the request that caused them.
#[derive(Clone)]
pub struct MediaJanitor {
    tx: mpsc::UnboundedSender<String>,
    storage: Arc<dyn StorageClient>,
}

impl MediaJanitor {
    pub fn spawn(storage: Arc<dyn StorageClient>, policy: RetryPolicy) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let worker_storage = storage.clone();
        tokio::spawn(async move {
            while let Some(key) = rx.recv().await {
                let storage = worker_storage.clone();
                tokio::spawn(delete_with_retry(storage, key, policy));
            }
            debug!("media janitor stopped");
        });
        Self { tx, storage }
    }

    /// Schedules deletion of the object behind `url`. Foreign URLs are ignored.
    pub fn release(&self, url: &str) {
        let Some(key) = self.storage.key_from_url(url) else {
            debug!(%url, "not a managed media url; skipping release");
            return;
        };
        if self.tx.send(key).is_err() {
            warn!(%url, "media janitor is gone; object left behind");
        }
    }
}

async fn delete_with_retry(storage: Arc<dyn StorageClient>, key: String, policy: RetryPolicy) {
    for attempt in 1..=policy.max_attempts {
        match storage.delete_object(&key).await {
            Ok(()) => {
                debug!(%key, attempt, "released media");
                return;
            }
            Err(e) if attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(error = %e, %key, attempt, ?delay, "media delete failed; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(error = %e, %key, attempt, "media delete failed; giving up");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FakeStorage;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    async fn wait_for_deletes(storage: &FakeStorage, want: usize) -> usize {
        for _ in 0..200 {
            if storage.delete_attempts() >= want {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        storage.delete_attempts()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(p.delay_after(1), Duration::from_millis(100));
        assert_eq!(p.delay_after(2), Duration::from_millis(200));
        assert_eq!(p.delay_after(4), Duration::from_millis(800));
        assert_eq!(p.delay_after(40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn release_deletes_managed_object() {
        let storage = Arc::new(FakeStorage::default());
        let janitor = MediaJanitor::spawn(storage.clone(), policy(3));
        janitor.release("https://fake.local/media/users/u/avatar-1.png");
        assert_eq!(wait_for_deletes(&storage, 1).await, 1);
        assert_eq!(storage.deleted_keys(), vec!["users/u/avatar-1.png".to_string()]);
    }

    #[tokio::test]
    async fn release_retries_until_success() {
        let storage = Arc::new(FakeStorage::failing_deletes(2));
        let janitor = MediaJanitor::spawn(storage.clone(), policy(5));
        janitor.release("https://fake.local/media/users/u/cover-1.jpg");
        assert_eq!(wait_for_deletes(&storage, 3).await, 3);
        assert_eq!(storage.deleted_keys().len(), 1);
    }

    #[tokio::test]
    async fn release_gives_up_after_max_attempts() {
        let storage = Arc::new(FakeStorage::failing_deletes(u32::MAX));
        let janitor = MediaJanitor::spawn(storage.clone(), policy(3));
        janitor.release("https://fake.local/media/users/u/cover-1.jpg");
        wait_for_deletes(&storage, 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(storage.delete_attempts(), 3);
        assert!(storage.deleted_keys().is_empty());
    }

    #[tokio::test]
    async fn foreign_urls_are_not_touched() {
        let storage = Arc::new(FakeStorage::default());
        let janitor = MediaJanitor::spawn(storage.clone(), policy(3));
        janitor.release("https://res.cloudinary.com/demo/image/upload/a.png");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(storage.delete_attempts(), 0);
    }
}
