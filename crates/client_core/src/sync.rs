//! Read path: views subscribe to query keys, reads go through the cache, and
//! invalidated keys that are still watched get refetched.

use std::{future::Future, marker::PhantomData, sync::Arc};

use futures::future::join_all;
use shared::domain::Campaign;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    cache::{CachedEntity, Collection, EntityCache, FetchResult, QueryKey, Subscription},
    gateway::{Gateway, GatewayError},
    lifecycle::{is_forward_transition, status_changes},
    session::{Session, SessionEndReason},
    ConsoleEvent,
};

#[derive(Clone)]
pub struct QueryClient {
    gateway: Arc<Gateway>,
    cache: EntityCache,
    session: Arc<Session>,
    events: broadcast::Sender<ConsoleEvent>,
}

impl QueryClient {
    pub fn new(
        gateway: Arc<Gateway>,
        cache: EntityCache,
        session: Arc<Session>,
        events: broadcast::Sender<ConsoleEvent>,
    ) -> Self {
        Self {
            gateway,
            cache,
            session,
            events,
        }
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn view<T: CachedEntity>(&self, key: QueryKey) -> CollectionView<T> {
        CollectionView {
            subscription: self.cache.subscribe(key),
            client: self.clone(),
            _entity: PhantomData,
        }
    }

    /// Fresh cached value if there is one, otherwise the (shared) fetch result.
    pub async fn load(&self, key: QueryKey) -> FetchResult {
        if !self.cache.needs_fetch(&key) {
            if let Some(read) = self.cache.read(&key) {
                return Ok(read.value);
            }
        }
        self.fetch(key).await
    }

    /// Refetches `key` regardless of its state. A fetch already in flight for
    /// the current generation of the key is joined rather than repeated.
    pub async fn refresh(&self, key: QueryKey) -> FetchResult {
        self.fetch(key).await
    }

    /// Marks every key stale; watched keys are refetched concurrently, the rest
    /// wait for their next reader.
    pub async fn invalidate(&self, keys: &[QueryKey]) {
        let watched: Vec<QueryKey> = keys
            .iter()
            .copied()
            .filter(|key| self.cache.invalidate(key))
            .collect();
        debug!(
            invalidated = keys.len(),
            refetching = watched.len(),
            "sync: invalidated query keys"
        );

        let refetches = watched
            .iter()
            .map(|key| async move { (*key, self.fetch(*key).await) });
        for (key, result) in join_all(refetches).await {
            if let Err(err) = result {
                warn!(%key, "sync: refetch after invalidation failed: {err}");
            }
        }
    }

    /// Ends the session when the service rejects the credential.
    pub async fn observe_error(&self, err: &GatewayError) {
        observe_error(&self.session, err).await;
    }

    async fn fetch(&self, key: QueryKey) -> FetchResult {
        let events = self.events.clone();
        self.cache
            .fetch_with(key, self.fetch_future(key), move |previous, next| {
                report_status_changes(&events, previous, next);
            })
            .await
    }

    fn fetch_future(
        &self,
        key: QueryKey,
    ) -> impl Future<Output = Result<Collection, GatewayError>> + Send + 'static {
        let gateway = Arc::clone(&self.gateway);
        let session = Arc::clone(&self.session);
        async move {
            let result = fetch_collection(&gateway, key).await;
            if let Err(err) = &result {
                observe_error(&session, err).await;
            }
            result
        }
    }
}

/// Compares a stored campaign collection with the one it replaced.
fn report_status_changes(
    events: &broadcast::Sender<ConsoleEvent>,
    previous: Option<&Collection>,
    next: &Collection,
) {
    let Collection::Campaigns(next) = next else {
        return;
    };
    let previous: &[Campaign] = match previous {
        Some(Collection::Campaigns(items)) => items.as_slice(),
        _ => &[],
    };
    for change in status_changes(previous, next) {
        if is_forward_transition(change.from, change.to) {
            info!(
                campaign_id = %change.id,
                from = %change.from,
                to = %change.to,
                "sync: campaign status changed"
            );
        } else {
            warn!(
                campaign_id = %change.id,
                from = %change.from,
                to = %change.to,
                "sync: server moved campaign off the forward path"
            );
        }
        let _ = events.send(ConsoleEvent::CampaignStatusChanged(change));
    }
}

async fn observe_error(session: &Session, err: &GatewayError) {
    if err.is_auth() {
        session.end(SessionEndReason::AuthorizationRejected).await;
    }
}

async fn fetch_collection(gateway: &Gateway, key: QueryKey) -> Result<Collection, GatewayError> {
    match key {
        QueryKey::Campaigns => gateway.list_campaigns().await.map(Collection::Campaigns),
        QueryKey::SubscriberLists => gateway
            .list_subscriber_lists()
            .await
            .map(Collection::SubscriberLists),
        QueryKey::Subscribers { list_id } => gateway
            .list_subscribers(list_id)
            .await
            .map(Collection::Subscribers),
        QueryKey::Templates => gateway.list_templates().await.map(Collection::Templates),
        QueryKey::SmtpConfigs => gateway
            .list_smtp_configs()
            .await
            .map(Collection::SmtpConfigs),
    }
}

/// What a view shows right now: the last known items and whether a refresh is
/// due.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    pub items: Vec<T>,
    pub stale: bool,
}

/// A live view over one query key. While it exists the key counts as watched,
/// so invalidations refetch it; dropping it lets late fetch results fall on
/// the floor.
pub struct CollectionView<T: CachedEntity> {
    subscription: Subscription,
    client: QueryClient,
    _entity: PhantomData<fn() -> T>,
}

impl<T: CachedEntity> CollectionView<T> {
    pub fn key(&self) -> QueryKey {
        self.subscription.key()
    }

    pub fn snapshot(&self) -> Option<Snapshot<T>> {
        let read = self.client.cache.read(&self.key())?;
        let items = T::from_collection(&read.value)?.to_vec();
        Some(Snapshot {
            items,
            stale: read.stale,
        })
    }

    pub async fn load(&self) -> Result<Vec<T>, GatewayError> {
        let value = self.client.load(self.key()).await?;
        self.items(&value)
    }

    pub async fn refresh(&self) -> Result<Vec<T>, GatewayError> {
        let value = self.client.refresh(self.key()).await?;
        self.items(&value)
    }

    fn items(&self, value: &Collection) -> Result<Vec<T>, GatewayError> {
        T::from_collection(value)
            .map(<[T]>::to_vec)
            .ok_or_else(|| GatewayError::Server {
                status: None,
                message: format!("unexpected collection for {}", self.key()),
            })
    }
}
