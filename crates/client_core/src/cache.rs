//! Session-scoped store of entity collections keyed by [`QueryKey`].
//!
//! Each key holds at most one collection plus a staleness flag. Fetches are
//! de-duplicated per key: a reader arriving while a fetch is in flight awaits
//! the same shared result instead of issuing a second request. Fetches run on
//! their own task, so a reader that goes away does not abort the network
//! call; the result is only written if some view still watches the key and
//! neither an invalidation nor a discard happened in the meantime.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use shared::domain::{
    Campaign, EntityType, ListId, SmtpConfig, Subscriber, SubscriberList, Template,
};
use tracing::debug;

use crate::gateway::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Campaigns,
    SubscriberLists,
    Subscribers { list_id: ListId },
    Templates,
    SmtpConfigs,
}

impl QueryKey {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Campaigns => EntityType::Campaign,
            Self::SubscriberLists => EntityType::SubscriberList,
            Self::Subscribers { .. } => EntityType::Subscriber,
            Self::Templates => EntityType::Template,
            Self::SmtpConfigs => EntityType::SmtpConfig,
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribers { list_id } => write!(f, "subscriber[list_id={list_id}]"),
            other => write!(f, "{}", other.entity_type()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Collection {
    Campaigns(Vec<Campaign>),
    SubscriberLists(Vec<SubscriberList>),
    Subscribers(Vec<Subscriber>),
    Templates(Vec<Template>),
    SmtpConfigs(Vec<SmtpConfig>),
}

impl Collection {
    pub fn len(&self) -> usize {
        match self {
            Self::Campaigns(items) => items.len(),
            Self::SubscriberLists(items) => items.len(),
            Self::Subscribers(items) => items.len(),
            Self::Templates(items) => items.len(),
            Self::SmtpConfigs(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Entity records that can be held in a [`Collection`].
pub trait CachedEntity: Clone + Send + Sync + 'static {
    fn into_collection(items: Vec<Self>) -> Collection;
    fn from_collection(collection: &Collection) -> Option<&[Self]>;
}

macro_rules! cached_entity {
    ($entity:ty, $variant:ident) => {
        impl CachedEntity for $entity {
            fn into_collection(items: Vec<Self>) -> Collection {
                Collection::$variant(items)
            }

            fn from_collection(collection: &Collection) -> Option<&[Self]> {
                match collection {
                    Collection::$variant(items) => Some(items),
                    _ => None,
                }
            }
        }
    };
}

cached_entity!(Campaign, Campaigns);
cached_entity!(SubscriberList, SubscriberLists);
cached_entity!(Subscriber, Subscribers);
cached_entity!(Template, Templates);
cached_entity!(SmtpConfig, SmtpConfigs);

pub type FetchResult = Result<Arc<Collection>, GatewayError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Last known value for a key. `stale` entries are still displayable.
#[derive(Debug, Clone)]
pub struct CacheRead {
    pub value: Arc<Collection>,
    pub stale: bool,
}

struct Inflight {
    fetch_id: u64,
    generation: u64,
    shared: SharedFetch,
}

#[derive(Default)]
struct Entry {
    value: Option<Arc<Collection>>,
    stale: bool,
    subscribers: usize,
    generation: u64,
    inflight: Option<Inflight>,
}

impl Entry {
    fn is_idle(&self) -> bool {
        self.value.is_none() && self.subscribers == 0 && self.inflight.is_none()
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<QueryKey, Entry>,
    next_fetch_id: u64,
    epoch: u64,
}

#[derive(Clone, Default)]
pub struct EntityCache {
    state: Arc<Mutex<CacheState>>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read(&self, key: &QueryKey) -> Option<CacheRead> {
        let state = self.lock();
        let entry = state.entries.get(key)?;
        entry.value.as_ref().map(|value| CacheRead {
            value: Arc::clone(value),
            stale: entry.stale,
        })
    }

    /// Replaces the collection under `key` and marks it fresh.
    pub fn write(&self, key: QueryKey, collection: Collection) {
        let mut state = self.lock();
        let entry = state.entries.entry(key).or_default();
        entry.value = Some(Arc::new(collection));
        entry.stale = false;
    }

    /// Absent and stale entries both need a fetch before they are authoritative.
    pub fn needs_fetch(&self, key: &QueryKey) -> bool {
        let state = self.lock();
        state
            .entries
            .get(key)
            .map_or(true, |entry| entry.value.is_none() || entry.stale)
    }

    pub fn is_stale(&self, key: &QueryKey) -> bool {
        let state = self.lock();
        state.entries.get(key).is_some_and(|entry| entry.stale)
    }

    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        let state = self.lock();
        state
            .entries
            .get(key)
            .is_some_and(|entry| entry.inflight.is_some())
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        let state = self.lock();
        state.entries.get(key).map_or(0, |entry| entry.subscribers)
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Marks `key` stale without dropping its value and moves it to a new
    /// generation. A fetch already in flight keeps running for the readers
    /// attached to it, but its result predates the mutation and is not
    /// written. The next reader queues one follow-up fetch behind it.
    ///
    /// Returns whether an active view is subscribed to the key.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return false;
        };
        entry.stale = true;
        entry.generation += 1;
        if entry.inflight.is_some() {
            debug!(%key, "cache: in-flight fetch superseded by invalidation");
        }
        entry.subscribers > 0
    }

    /// Drops every cached value at a session boundary. Subscriptions survive;
    /// fetches started before the call never write.
    pub fn discard(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        for entry in state.entries.values_mut() {
            entry.value = None;
            entry.stale = false;
            entry.inflight = None;
        }
        state.entries.retain(|_, entry| entry.subscribers > 0);
    }

    pub fn subscribe(&self, key: QueryKey) -> Subscription {
        let mut state = self.lock();
        state.entries.entry(key).or_default().subscribers += 1;
        Subscription {
            cache: self.clone(),
            key,
        }
    }

    /// Runs `fetch` for `key` unless a fetch is already in flight, in which
    /// case the caller attaches to that one and `fetch` is dropped unpolled.
    pub async fn fetch<F>(&self, key: QueryKey, fetch: F) -> FetchResult
    where
        F: Future<Output = Result<Collection, GatewayError>> + Send + 'static,
    {
        self.fetch_with(key, fetch, |_, _| {}).await
    }

    /// Like [`fetch`](Self::fetch), and `on_write` runs with the previous and
    /// the new value once the result is actually stored. It never runs for a
    /// result that is discarded or superseded, nor for readers that attach.
    ///
    /// An in-flight fetch of an older generation is never joined. The new
    /// fetch waits for it to settle first, so at most one request per key is
    /// on the wire.
    pub async fn fetch_with<F, W>(&self, key: QueryKey, fetch: F, on_write: W) -> FetchResult
    where
        F: Future<Output = Result<Collection, GatewayError>> + Send + 'static,
        W: FnOnce(Option<&Collection>, &Collection) + Send + 'static,
    {
        let shared = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let epoch = state.epoch;
            let entry = state.entries.entry(key).or_default();
            let generation = entry.generation;

            let (attached, previous) = match &entry.inflight {
                Some(inflight) if inflight.generation == generation => {
                    (Some(inflight.shared.clone()), None)
                }
                Some(inflight) => (None, Some(inflight.shared.clone())),
                None => (None, None),
            };

            if let Some(shared) = attached {
                debug!(%key, "cache: attaching to in-flight fetch");
                shared
            } else {
                if previous.is_some() {
                    debug!(%key, "cache: queueing fetch behind a superseded one");
                }
                state.next_fetch_id += 1;
                let fetch_id = state.next_fetch_id;
                let cache = self.clone();
                let task = tokio::spawn(async move {
                    if let Some(previous) = previous {
                        let _ = previous.await;
                    }
                    let result = fetch.await.map(Arc::new);
                    match &result {
                        Ok(value) => {
                            let written = cache.complete(key, fetch_id, generation, epoch, value);
                            if let Some(replaced) = written {
                                on_write(replaced.as_deref(), &**value);
                            }
                        }
                        Err(err) => {
                            debug!(%key, "cache: fetch failed, keeping last value: {err}");
                            cache.settle(key, fetch_id);
                        }
                    }
                    result
                });
                let shared = async move {
                    task.await.unwrap_or_else(|err| {
                        Err(GatewayError::Server {
                            status: None,
                            message: format!("fetch task for {key} failed: {err}"),
                        })
                    })
                }
                .boxed()
                .shared();
                let entry = state.entries.entry(key).or_default();
                entry.inflight = Some(Inflight {
                    fetch_id,
                    generation,
                    shared: shared.clone(),
                });
                shared
            }
        };
        shared.await
    }

    /// Stores a successful result. Returns the replaced value when the write
    /// happened, `None` when the result was dropped.
    fn complete(
        &self,
        key: QueryKey,
        fetch_id: u64,
        generation: u64,
        epoch: u64,
        value: &Arc<Collection>,
    ) -> Option<Option<Arc<Collection>>> {
        let mut state = self.lock();
        if state.epoch != epoch {
            debug!(%key, "cache: dropping fetch result from a discarded session");
            return None;
        }
        let entry = state.entries.get_mut(&key)?;
        if entry.inflight.as_ref().map(|inflight| inflight.fetch_id) == Some(fetch_id) {
            entry.inflight = None;
        }
        if entry.generation != generation {
            debug!(%key, "cache: dropping superseded fetch result");
            return None;
        }
        if entry.subscribers == 0 {
            debug!(%key, "cache: no active view left, fetch result discarded");
            if entry.is_idle() {
                state.entries.remove(&key);
            }
            return None;
        }
        let replaced = entry.value.replace(Arc::clone(value));
        entry.stale = false;
        Some(replaced)
    }

    fn settle(&self, key: QueryKey, fetch_id: u64) {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(&key) else {
            return;
        };
        if entry.inflight.as_ref().map(|inflight| inflight.fetch_id) == Some(fetch_id) {
            entry.inflight = None;
        }
        if entry.is_idle() {
            state.entries.remove(&key);
        }
    }

    fn release(&self, key: &QueryKey) {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.is_idle() {
            state.entries.remove(key);
        }
    }
}

/// Keeps a key "watched by an active view" while alive.
pub struct Subscription {
    cache: EntityCache,
    key: QueryKey,
}

impl Subscription {
    pub fn key(&self) -> QueryKey {
        self.key
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
