use std::sync::Arc;

use crate::config::AppConfig;
use crate::media::{MediaJanitor, RetryPolicy};
use crate::storage::StorageClient;
use crate::users::{jwt::JwtKeys, password::PasswordHasher, repo::UserStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: Arc<dyn UserStore>,
    pub storage: Arc<dyn StorageClient>,
    pub keys: Arc<JwtKeys>,
    pub hasher: PasswordHasher,
    pub janitor: MediaJanitor,
}

impl AppState {
    /// Wires collaborators together; must run inside a tokio runtime.
    pub fn from_parts(
        config: Arc<AppConfig>,
        users: Arc<dyn UserStore>,
        storage: Arc<dyn StorageClient>,
    ) -> Self {
        let keys = Arc::new(JwtKeys::from_config(&config.jwt));
        let hasher = PasswordHasher::new(config.password_cost);
        let janitor = MediaJanitor::spawn(storage.clone(), RetryPolicy::from(&config.cleanup));
        Self {
            config,
            users,
            storage,
            keys,
            hasher,
            janitor,
        }
    }

    #[cfg(test)]
    pub(crate) fn fake() -> Self {
        Self::fake_with_storage(Arc::new(FakeStorage::default()))
    }

    #[cfg(test)]
    pub(crate) fn fake_with_storage(storage: Arc<FakeStorage>) -> Self {
        use crate::users::repo::MemoryUserStore;

        Self::from_parts(
            Arc::new(crate::config::sample_config()),
            Arc::new(MemoryUserStore::default()),
            storage,
        )
    }
}

#[cfg(test)]
pub(crate) use fake::FakeStorage;

#[cfg(test)]
mod fake {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    };

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::storage::{key_under, public_url_for, StorageClient};

    const BASE: &str = "https://fake.local/media";

    /// Records puts and deletes; can be told to fail.
    #[derive(Default)]
    pub(crate) struct FakeStorage {
        stored: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
        delete_attempts: AtomicU32,
        fail_puts: bool,
        failing_deletes: AtomicU32,
    }

    impl FakeStorage {
        pub(crate) fn failing_puts() -> Self {
            Self {
                fail_puts: true,
                ..Self::default()
            }
        }

        /// The first `n` deletes fail.
        pub(crate) fn failing_deletes(n: u32) -> Self {
            Self {
                failing_deletes: AtomicU32::new(n),
                ..Self::default()
            }
        }

        pub(crate) fn stored_keys(&self) -> Vec<String> {
            self.stored.lock().unwrap().clone()
        }

        pub(crate) fn deleted_keys(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }

        pub(crate) fn delete_attempts(&self) -> usize {
            self.delete_attempts.load(Ordering::SeqCst) as usize
        }
    }

    #[async_trait]
    impl StorageClient for FakeStorage {
        async fn put_object(&self, key: &str, _body: Bytes, _ct: &str) -> anyhow::Result<()> {
            anyhow::ensure!(!self.fail_puts, "storage unavailable");
            self.stored.lock().unwrap().push(key.to_string());
            Ok(())
        }

        async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
            self.delete_attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failing_deletes.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_deletes.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("storage unavailable");
            }
            self.deleted.lock().unwrap().push(key.to_string());
            Ok(())
        }

        fn object_url(&self, key: &str) -> String {
            public_url_for(BASE, key)
        }

        fn key_from_url(&self, url: &str) -> Option<String> {
            key_under(BASE, url)
        }
    }
}
