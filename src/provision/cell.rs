//! Compute-once cache for a downstream client connection.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;

/// A lazily created, shared connection.
///
/// The first caller creates the value under the lock; everyone after that
/// gets the same `Arc`. This is a single slot, not a pool. A failed
/// initialization leaves the slot empty so the next caller tries again.
pub struct ConnectionCell<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> ConnectionCell<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Return the cached value, creating it with `init` on first use.
    pub async fn get_or_try_init<F, Fut, E>(&self, init: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(value) = slot.as_ref() {
            return Ok(Arc::clone(value));
        }

        let value = Arc::new(init().await?);
        *slot = Some(Arc::clone(&value));
        Ok(value)
    }

    /// The cached value, if created.
    pub async fn get(&self) -> Option<Arc<T>> {
        self.slot.lock().await.clone()
    }
}

impl<T> Default for ConnectionCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ConnectionCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let initialized = self.slot.try_lock().map(|s| s.is_some()).ok();
        f.debug_struct("ConnectionCell")
            .field("initialized", &initialized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_value() {
        let cell = Arc::new(ConnectionCell::<String>::new());
        let inits = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cell = Arc::clone(&cell);
            let inits = Arc::clone(&inits);
            tasks.push(tokio::spawn(async move {
                cell.get_or_try_init(|| async {
                    inits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, std::io::Error>("conn".to_string())
                })
                .await
                .unwrap()
            }));
        }

        let mut values = Vec::new();
        for task in tasks {
            values.push(task.await.unwrap());
        }

        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    }

    #[tokio::test]
    async fn test_failed_init_is_retried() {
        let cell = ConnectionCell::<u32>::new();

        let err = cell
            .get_or_try_init(|| async { Err::<u32, _>("refused") })
            .await;
        assert_eq!(err.unwrap_err(), "refused");
        assert!(cell.get().await.is_none());

        let value = cell
            .get_or_try_init(|| async { Ok::<_, &str>(7) })
            .await
            .unwrap();
        assert_eq!(*value, 7);
        assert!(cell.get().await.is_some());
    }
}
