//! Boundary between the engine and the data-fetching layer.
//!
//! The engine depends on exactly one operation,
//! [`CacheInterface::invalidate`]. It assumes nothing about how (or how
//! quickly) refetching happens; the call only has to mark entries
//! tagged with the topic as stale and must be a no-op when none match.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use flowsync_core::topics::Topic;
use tokio::sync::broadcast;

/// Broadcast capacity for refetch requests.
const REFETCH_CHANNEL_CAPACITY: usize = 256;

/// The single call the engine makes into the cache layer.
pub trait CacheInterface: Send + Sync {
    /// Mark every entry tagged with `topic` as stale and request a refetch.
    fn invalidate(&self, topic: Topic);
}

impl<F> CacheInterface for F
where
    F: Fn(Topic) + Send + Sync,
{
    fn invalidate(&self, topic: Topic) {
        self(topic)
    }
}

/// Emitted by [`TaggedCache`] for every entry that went stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefetchRequest {
    pub key: String,
    /// The topic whose invalidation made the entry stale.
    pub topic: Topic,
}

/// A cached value together with its freshness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached<V> {
    pub value: V,
    pub stale: bool,
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    topics: Vec<Topic>,
    stale: bool,
}

/// Minimal in-memory query cache with topic tags.
///
/// Query results are stored under a key with the topics they depend
/// on. Invalidating a topic flags the matching entries as stale (the
/// stale value stays readable) and publishes a [`RefetchRequest`] per
/// entry; the fetching layer listens via [`subscribe`](Self::subscribe)
/// and calls [`put`](Self::put) with fresh data.
pub struct TaggedCache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    refetch_tx: broadcast::Sender<RefetchRequest>,
}

impl<V: Clone> TaggedCache<V> {
    pub fn new() -> Self {
        let (refetch_tx, _) = broadcast::channel(REFETCH_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            refetch_tx,
        }
    }

    /// Receive refetch requests for entries that went stale.
    pub fn subscribe(&self) -> broadcast::Receiver<RefetchRequest> {
        self.refetch_tx.subscribe()
    }

    /// Store a fresh value tagged with `topics`, replacing any previous entry.
    pub fn put(&self, key: impl Into<String>, topics: &[Topic], value: V) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key.into(),
            CacheEntry {
                value,
                topics: topics.to_vec(),
                stale: false,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<Cached<V>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).map(|entry| Cached {
            value: entry.value.clone(),
            stale: entry.stale,
        })
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key).map(|entry| entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently flagged stale, sorted.
    pub fn stale_keys(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.stale)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl<V: Clone> Default for TaggedCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> CacheInterface for TaggedCache<V> {
    fn invalidate(&self, topic: Topic) {
        let stale: Vec<String> = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter_mut()
                .filter(|(_, entry)| entry.topics.contains(&topic))
                .map(|(key, entry)| {
                    entry.stale = true;
                    key.clone()
                })
                .collect()
        };

        tracing::debug!(topic = %topic, entries = stale.len(), "Cache topic invalidated");

        for key in stale {
            // A send error only means nobody is refetching right now.
            let _ = self.refetch_tx.send(RefetchRequest { key, topic });
        }
    }
}
