use std::{sync::Arc, time::Duration};

use anyhow::Result;
use shared::{
    domain::{
        Campaign, CampaignId, ListId, SmtpConfig, Subscriber, SubscriberList, Template,
    },
    protocol::{LoginRequest, RegisterRequest},
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;
use url::Url;

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod gateway;
pub mod invalidation;
pub mod lifecycle;
pub mod session;
pub mod sync;

use aggregate::DashboardSummary;
use cache::{CachedEntity, EntityCache, QueryKey};
use config::{prepare_api_base_url, ConsoleSettings};
use coordinator::{Completed, CoordinatorError, MutationCoordinator, Operation};
use gateway::{Gateway, GatewayError};
use lifecycle::{available_actions, CampaignAction, StatusChange};
use session::{CredentialStore, Session, SessionClaims, SessionEndReason, SessionError};
use sync::{CollectionView, QueryClient};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    SessionStarted { user_id: i64 },
    /// The presentation layer should return to its sign-in screen.
    SessionEnded { reason: SessionEndReason },
    CampaignStatusChanged(StatusChange),
}

#[derive(Debug, Error)]
pub enum AuthFlowError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Credential(#[from] SessionError),
}

/// Entry point for a presentation layer: session handling, collection views
/// and mutations over one cache instance.
pub struct Console {
    session: Arc<Session>,
    client: QueryClient,
    coordinator: MutationCoordinator,
    events: broadcast::Sender<ConsoleEvent>,
}

impl Console {
    pub fn new(settings: &ConsoleSettings, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let base_url = prepare_api_base_url(&settings.api_base_url)?;
        Self::with_base_url(base_url, settings.request_timeout(), store)
    }

    pub fn with_base_url(
        base_url: Url,
        timeout: Duration,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cache = EntityCache::new();
        let session = Arc::new(Session::new(store, cache.clone(), events.clone()));
        let gateway = Arc::new(Gateway::new(base_url, timeout, Arc::clone(&session))?);
        let client = QueryClient::new(gateway, cache, Arc::clone(&session), events.clone());
        let coordinator = MutationCoordinator::new(client.clone());
        Ok(Self {
            session,
            client,
            coordinator,
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &EntityCache {
        self.client.cache()
    }

    pub async fn restore_session(&self) -> Option<SessionClaims> {
        self.session.restore().await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<SessionClaims, AuthFlowError> {
        let request = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let tokens = self.client.gateway().login(&request).await?;
        let claims = self.session.begin(tokens).await?;
        info!(user_id = claims.user_id, "console: logged in");
        Ok(claims)
    }

    /// Registers an account. Signs straight in when the service hands back a
    /// credential pair; otherwise the caller still has to log in.
    pub async fn register(
        &self,
        request: &RegisterRequest,
    ) -> Result<Option<SessionClaims>, AuthFlowError> {
        let response = self.client.gateway().register(request).await?;
        info!(username = %request.username, "console: account registered");
        match response.tokens {
            Some(tokens) => Ok(Some(self.session.begin(tokens).await?)),
            None => Ok(None),
        }
    }

    pub async fn logout(&self) {
        self.session.end(SessionEndReason::Logout).await;
    }

    pub async fn is_authenticated(&self) -> bool {
        self.session.is_authenticated().await
    }

    pub async fn claims(&self) -> Option<SessionClaims> {
        self.session.claims().await
    }

    pub fn campaigns(&self) -> CollectionView<Campaign> {
        self.client.view(QueryKey::Campaigns)
    }

    pub fn subscriber_lists(&self) -> CollectionView<SubscriberList> {
        self.client.view(QueryKey::SubscriberLists)
    }

    pub fn subscribers(&self, list_id: ListId) -> CollectionView<Subscriber> {
        self.client.view(QueryKey::Subscribers { list_id })
    }

    pub fn templates(&self) -> CollectionView<Template> {
        self.client.view(QueryKey::Templates)
    }

    pub fn smtp_configs(&self) -> CollectionView<SmtpConfig> {
        self.client.view(QueryKey::SmtpConfigs)
    }

    pub async fn execute(&self, operation: Operation) -> Result<Completed, CoordinatorError> {
        self.coordinator.execute(operation).await
    }

    /// Actions to offer for a campaign, going by its last known status.
    pub fn campaign_actions(&self, id: CampaignId) -> Option<Vec<CampaignAction>> {
        let read = self.cache().read(&QueryKey::Campaigns)?;
        Campaign::from_collection(&read.value)?
            .iter()
            .find(|campaign| campaign.id == id)
            .map(|campaign| available_actions(campaign.status))
    }

    /// Server-computed member count of a list, read through the cache.
    pub async fn subscriber_count(&self, list_id: ListId) -> Result<Option<u64>, GatewayError> {
        let lists = self.subscriber_lists().load().await?;
        Ok(aggregate::subscriber_count(&lists, list_id))
    }

    pub async fn dashboard(&self) -> Result<DashboardSummary, GatewayError> {
        let lists_view = self.subscriber_lists();
        let campaigns_view = self.campaigns();
        let (lists, campaigns) = tokio::try_join!(lists_view.load(), campaigns_view.load())?;
        Ok(DashboardSummary::derive(&lists, &campaigns))
    }
}
