//! Deduplication of concurrent asynchronous loads of the same key.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use futures::future::{LocalBoxFuture, Shared};
use futures::prelude::*;
use tokio::sync::RwLock;

type SharedResult<V> = Result<V, Arc<anyhow::Error>>;
pub type TryLoadFuture<'a, V> = LocalBoxFuture<'a, SharedResult<V>>;

/// A keyed cache where each value is computed at most once, no matter how
/// many tasks ask for it concurrently. Later callers await the same future
/// as the first one.
pub struct SingleFlightCache<'a, K, V, C> {
    futures: RwLock<HashMap<K, Shared<TryLoadFuture<'a, V>>>>,
    load_fn: Box<dyn Fn(K, C) -> TryLoadFuture<'a, V> + 'a>,
    context: C,
}

impl<'a, K, V, C> SingleFlightCache<'a, K, V, C>
where
    K: Clone + Eq + Hash,
    V: Clone + 'a,
    C: Clone,
{
    pub fn new(context: C, load_fn: impl Fn(K, C) -> TryLoadFuture<'a, V> + 'a) -> Self {
        Self {
            futures: RwLock::new(HashMap::with_capacity(64)),
            load_fn: Box::new(load_fn),
            context,
        }
    }

    pub async fn load(&self, key: K) -> Result<V> {
        let cached_future = self.futures.read().await.get(&key).cloned();
        let future = if let Some(future) = cached_future {
            future
        } else {
            let mut futures = self.futures.write().await;
            futures
                .entry(key.clone())
                .or_insert_with(|| {
                    (self.load_fn)(key, self.context.clone())
                        .boxed_local()
                        .shared()
                })
                .clone()
        };
        future.await.map_err(|err| anyhow!("{err}"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU8, Ordering};

    use futures::prelude::*;

    use super::SingleFlightCache;

    #[tokio::test]
    async fn load_once_per_key() {
        let cache = SingleFlightCache::new((), |key: usize, _ctx: ()| {
            static COUNTER: AtomicU8 = AtomicU8::new(0);
            async move { Ok((key, COUNTER.fetch_add(1, Ordering::Relaxed))) }.boxed_local()
        });

        assert_eq!(cache.load(1).await.unwrap(), (1, 0));
        assert_eq!(cache.load(1).await.unwrap(), (1, 0));
        assert_eq!(cache.load(2).await.unwrap(), (2, 1));
        assert_eq!(cache.load(2).await.unwrap(), (2, 1));
    }
}
