//! Caches whose entries are computed at most once at a time.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use self::storage::CacheStorage;
use self::storage::KeyType;
use self::storage::ValueType;

pub(crate) mod storage;

type WaitMap<K, V, E> = Arc<Mutex<HashMap<K, broadcast::Sender<Result<V, E>>>>>;

/// An LRU cache where concurrent callers asking for a missing key wait for the first one to
/// compute it.
///
/// Errors are sent to the waiting callers but never stored.
#[derive(Clone)]
pub(crate) struct DedupCache<K: KeyType, V: ValueType, E> {
    wait_map: WaitMap<K, V, E>,
    storage: CacheStorage<K, V>,
}

impl<K, V, E> DedupCache<K, V, E>
where
    K: KeyType + 'static,
    V: ValueType + 'static,
    E: Clone + Send + 'static,
{
    pub(crate) fn new(capacity: NonZeroUsize) -> Self {
        Self {
            wait_map: Arc::new(Mutex::new(HashMap::new())),
            storage: CacheStorage::new(capacity),
        }
    }

    pub(crate) fn entry(&self, key: &K) -> Entry<K, V, E> {
        let mut locked_wait_map = self.wait_map.lock();
        if let Some(waiter) = locked_wait_map.get(key) {
            // Register interest in key
            return Entry::Receiver(waiter.subscribe());
        }
        if let Some(value) = self.storage.get(key) {
            return Entry::Value(value);
        }

        let (sender, _receiver) = broadcast::channel(1);
        locked_wait_map.insert(key.clone(), sender.clone());
        Entry::First(FirstEntry {
            key: key.clone(),
            sender,
            cache: self.clone(),
            done: false,
        })
    }

    /// Returns the cached value, or computes it with `build` unless another caller is already
    /// doing so.
    pub(crate) async fn get_or_try_insert_with<F, Fut>(&self, key: K, build: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let first = loop {
            match self.entry(&key) {
                Entry::Value(value) => return Ok(value),
                Entry::Receiver(mut receiver) => {
                    // a closed channel means the first caller went away: try again
                    if let Ok(result) = receiver.recv().await {
                        return result;
                    }
                }
                Entry::First(first) => break first,
            }
        };

        let result = build().await;
        match &result {
            Ok(value) => first.insert(value.clone()),
            Err(error) => first.error(error.clone()),
        }
        result
    }

    pub(crate) fn len(&self) -> usize {
        self.storage.len()
    }
}

pub(crate) enum Entry<K: KeyType, V: ValueType, E> {
    First(FirstEntry<K, V, E>),
    Receiver(broadcast::Receiver<Result<V, E>>),
    Value(V),
}

/// The right to compute a value.
///
/// Dropping it without a result releases the waiting callers.
pub(crate) struct FirstEntry<K: KeyType, V: ValueType, E> {
    key: K,
    sender: broadcast::Sender<Result<V, E>>,
    cache: DedupCache<K, V, E>,
    done: bool,
}

impl<K: KeyType, V: ValueType, E> FirstEntry<K, V, E> {
    pub(crate) fn insert(mut self, value: V) {
        {
            let mut locked_wait_map = self.cache.wait_map.lock();
            self.cache.storage.insert(self.key.clone(), value.clone());
            locked_wait_map.remove(&self.key);
        }
        self.done = true;
        let _ = self.sender.send(Ok(value));
    }

    pub(crate) fn error(mut self, error: E) {
        self.cache.wait_map.lock().remove(&self.key);
        self.done = true;
        let _ = self.sender.send(Err(error));
    }
}

impl<K: KeyType, V: ValueType, E> Drop for FirstEntry<K, V, E> {
    fn drop(&mut self) {
        if !self.done {
            self.cache.wait_map.lock().remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use futures::future::join_all;

    use super::*;

    fn cache() -> DedupCache<String, Arc<String>, String> {
        DedupCache::new(NonZeroUsize::new(10).unwrap())
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_build() {
        let cache = cache();
        let builds = Arc::new(AtomicUsize::new(0));

        let results = join_all((0..10).map(|_| {
            let cache = cache.clone();
            let builds = builds.clone();
            async move {
                cache
                    .get_or_try_insert_with("plan".to_string(), || async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Arc::new("value".to_string()))
                    })
                    .await
            }
        }))
        .await;

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        let first = results[0].clone().unwrap();
        for result in results {
            assert!(Arc::ptr_eq(&first, &result.unwrap()));
        }
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn errors_are_shared_but_not_stored() {
        let cache = cache();
        let results = join_all((0..3).map(|_| {
            cache.get_or_try_insert_with("plan".to_string(), || async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err("planning failed".to_string())
            })
        }))
        .await;
        assert!(
            results
                .iter()
                .all(|result| result == &Err("planning failed".to_string()))
        );
        assert_eq!(cache.len(), 0);

        let value = cache
            .get_or_try_insert_with("plan".to_string(), || async {
                Ok(Arc::new("value".to_string()))
            })
            .await;
        assert_eq!(value.unwrap().as_str(), "value");
    }

    #[tokio::test]
    async fn waiters_take_over_when_the_first_caller_goes_away() {
        let cache = cache();
        let Entry::First(first) = cache.entry(&"plan".to_string()) else {
            panic!("expected to be first");
        };
        let Entry::Receiver(_) = cache.entry(&"plan".to_string()) else {
            panic!("expected to wait");
        };
        drop(first);

        assert!(matches!(
            cache.entry(&"plan".to_string()),
            Entry::First(_)
        ));
    }
}
