//! Executes user operations against the service and keeps the cache honest
//! afterwards.
//!
//! An operation runs one or more gateway calls in sequence. Only once the
//! service has accepted the primary step are the affected query keys
//! invalidated; a rejected operation leaves the cache untouched. Operations on
//! the same primary key never overlap: a second invocation while the first is
//! in flight is refused with [`CoordinatorError::AlreadyInProgress`].

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::Utc;
use shared::{
    domain::{
        Campaign, CampaignId, EntityType, ListId, SmtpConfigId, SubscriberId, TemplateId,
    },
    protocol::{
        CampaignDraft, CampaignPatch, ListDraft, SmtpConfigDraft, SubscriberDraft,
        SubscriberPatch, TemplateDraft,
    },
};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    cache::{CachedEntity, QueryKey},
    gateway::{GatewayError, ImportFile},
    invalidation::{affected_keys, MutationKind},
    lifecycle::{ensure_sendable, validate_schedule, LifecycleError},
    sync::QueryClient,
};

/// Identifies the thing an operation acts on. Creates have no id yet, so at
/// most one create per entity type runs at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub entity: EntityType,
    pub id: Option<i64>,
}

impl OperationKey {
    fn create(entity: EntityType) -> Self {
        Self { entity, id: None }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{}#{id}", self.entity),
            None => write!(f, "new {}", self.entity),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Campaign(CampaignId),
    SubscriberList(ListId),
    Subscriber(SubscriberId),
    Template(TemplateId),
    SmtpConfig(SmtpConfigId),
}

impl EntityRef {
    pub fn entity_type(self) -> EntityType {
        match self {
            Self::Campaign(_) => EntityType::Campaign,
            Self::SubscriberList(_) => EntityType::SubscriberList,
            Self::Subscriber(_) => EntityType::Subscriber,
            Self::Template(_) => EntityType::Template,
            Self::SmtpConfig(_) => EntityType::SmtpConfig,
        }
    }

    pub fn raw_id(self) -> i64 {
        match self {
            Self::Campaign(id) => id.0,
            Self::SubscriberList(id) => id.0,
            Self::Subscriber(id) => id.0,
            Self::Template(id) => id.0,
            Self::SmtpConfig(id) => id.0,
        }
    }

    pub fn operation_key(self) -> OperationKey {
        OperationKey {
            entity: self.entity_type(),
            id: Some(self.raw_id()),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_type(), self.raw_id())
    }
}

/// The caller's explicit go-ahead for deleting one specific entity.
///
/// Not `Clone`: an operation consumes its confirmation, so a replayed delete
/// needs a fresh one.
#[derive(Debug)]
pub struct Confirmation {
    target: EntityRef,
}

impl Confirmation {
    pub fn confirm(target: EntityRef) -> Self {
        Self { target }
    }

    pub fn target(&self) -> EntityRef {
        self.target
    }
}

#[derive(Debug)]
pub enum Operation {
    CreateCampaign(CampaignDraft),
    UpdateCampaign {
        id: CampaignId,
        patch: CampaignPatch,
    },
    SendCampaign {
        id: CampaignId,
    },
    DeleteCampaign {
        id: CampaignId,
        confirmation: Option<Confirmation>,
    },
    /// Creates the list, then imports `attachment` into it when given.
    CreateList {
        draft: ListDraft,
        attachment: Option<ImportFile>,
    },
    RenameList {
        id: ListId,
        draft: ListDraft,
    },
    DeleteList {
        id: ListId,
        confirmation: Option<Confirmation>,
    },
    ImportSubscribers {
        list_id: ListId,
        file: ImportFile,
    },
    AddSubscriber(SubscriberDraft),
    UpdateSubscriber {
        id: SubscriberId,
        list_id: ListId,
        patch: SubscriberPatch,
    },
    RemoveSubscriber {
        id: SubscriberId,
        list_id: ListId,
        confirmation: Option<Confirmation>,
    },
    CreateTemplate(TemplateDraft),
    UpdateTemplate {
        id: TemplateId,
        draft: TemplateDraft,
    },
    DeleteTemplate {
        id: TemplateId,
        confirmation: Option<Confirmation>,
    },
    CreateSmtpConfig(SmtpConfigDraft),
    UpdateSmtpConfig {
        id: SmtpConfigId,
        draft: SmtpConfigDraft,
    },
    DeleteSmtpConfig {
        id: SmtpConfigId,
        confirmation: Option<Confirmation>,
    },
}

impl Operation {
    pub fn key(&self) -> OperationKey {
        match self {
            Self::CreateCampaign(_) => OperationKey::create(EntityType::Campaign),
            Self::UpdateCampaign { id, .. }
            | Self::SendCampaign { id }
            | Self::DeleteCampaign { id, .. } => EntityRef::Campaign(*id).operation_key(),
            Self::CreateList { .. } => OperationKey::create(EntityType::SubscriberList),
            Self::RenameList { id, .. } | Self::DeleteList { id, .. } => {
                EntityRef::SubscriberList(*id).operation_key()
            }
            Self::ImportSubscribers { list_id, .. } => {
                EntityRef::SubscriberList(*list_id).operation_key()
            }
            Self::AddSubscriber(_) => OperationKey::create(EntityType::Subscriber),
            Self::UpdateSubscriber { id, .. } | Self::RemoveSubscriber { id, .. } => {
                EntityRef::Subscriber(*id).operation_key()
            }
            Self::CreateTemplate(_) => OperationKey::create(EntityType::Template),
            Self::UpdateTemplate { id, .. } | Self::DeleteTemplate { id, .. } => {
                EntityRef::Template(*id).operation_key()
            }
            Self::CreateSmtpConfig(_) => OperationKey::create(EntityType::SmtpConfig),
            Self::UpdateSmtpConfig { id, .. } | Self::DeleteSmtpConfig { id, .. } => {
                EntityRef::SmtpConfig(*id).operation_key()
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::CreateCampaign(_) => "create_campaign",
            Self::UpdateCampaign { .. } => "update_campaign",
            Self::SendCampaign { .. } => "send_campaign",
            Self::DeleteCampaign { .. } => "delete_campaign",
            Self::CreateList { .. } => "create_list",
            Self::RenameList { .. } => "rename_list",
            Self::DeleteList { .. } => "delete_list",
            Self::ImportSubscribers { .. } => "import_subscribers",
            Self::AddSubscriber(_) => "add_subscriber",
            Self::UpdateSubscriber { .. } => "update_subscriber",
            Self::RemoveSubscriber { .. } => "remove_subscriber",
            Self::CreateTemplate(_) => "create_template",
            Self::UpdateTemplate { .. } => "update_template",
            Self::DeleteTemplate { .. } => "delete_template",
            Self::CreateSmtpConfig(_) => "create_smtp_config",
            Self::UpdateSmtpConfig { .. } => "update_smtp_config",
            Self::DeleteSmtpConfig { .. } => "delete_smtp_config",
        }
    }

    /// Deletes name their target alongside the confirmation they carry.
    fn deletion(&self) -> Option<(EntityRef, Option<&Confirmation>)> {
        match self {
            Self::DeleteCampaign { id, confirmation } => {
                Some((EntityRef::Campaign(*id), confirmation.as_ref()))
            }
            Self::DeleteList { id, confirmation } => {
                Some((EntityRef::SubscriberList(*id), confirmation.as_ref()))
            }
            Self::RemoveSubscriber {
                id, confirmation, ..
            } => Some((EntityRef::Subscriber(*id), confirmation.as_ref())),
            Self::DeleteTemplate { id, confirmation } => {
                Some((EntityRef::Template(*id), confirmation.as_ref()))
            }
            Self::DeleteSmtpConfig { id, confirmation } => {
                Some((EntityRef::SmtpConfig(*id), confirmation.as_ref()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeStep {
    UploadFile,
}

impl fmt::Display for CompositeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UploadFile => "file upload",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completed {
    pub created: Option<EntityRef>,
    /// Subscribers the service reported importing.
    pub imported: Option<u64>,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("an operation on {0} is already in progress")]
    AlreadyInProgress(OperationKey),
    #[error("{created} was created but {failed_step} failed: {source}")]
    PartialSuccess {
        created: EntityRef,
        failed_step: CompositeStep,
        source: GatewayError,
    },
    #[error("deleting {0} requires confirmation")]
    ConfirmationRequired(EntityRef),
    #[error(transparent)]
    Rejected(#[from] LifecycleError),
}

impl CoordinatorError {
    pub fn gateway_error(&self) -> Option<&GatewayError> {
        match self {
            Self::Gateway(err) | Self::PartialSuccess { source: err, .. } => Some(err),
            _ => None,
        }
    }
}

enum Outcome {
    Done(Completed),
    Partial {
        created: EntityRef,
        failed_step: CompositeStep,
        source: GatewayError,
    },
}

struct Applied {
    outcome: Outcome,
    mutations: Vec<MutationKind>,
}

impl Applied {
    fn done(completed: Completed, mutation: MutationKind) -> Self {
        Self {
            outcome: Outcome::Done(completed),
            mutations: vec![mutation],
        }
    }

    fn plain(mutation: MutationKind) -> Self {
        Self::done(Completed::default(), mutation)
    }

    fn created(created: EntityRef, mutation: MutationKind) -> Self {
        Self::done(
            Completed {
                created: Some(created),
                imported: None,
            },
            mutation,
        )
    }
}

type InFlight = Arc<Mutex<HashSet<OperationKey>>>;

struct InFlightGuard {
    inflight: InFlight,
    key: OperationKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

pub struct MutationCoordinator {
    client: QueryClient,
    inflight: InFlight,
}

impl MutationCoordinator {
    pub fn new(client: QueryClient) -> Self {
        Self {
            client,
            inflight: Arc::default(),
        }
    }

    pub fn is_in_flight(&self, key: &OperationKey) -> bool {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    pub async fn execute(&self, operation: Operation) -> Result<Completed, CoordinatorError> {
        let key = operation.key();
        let label = operation.label();
        self.check_preconditions(&operation)?;
        let _guard = self.claim(key)?;

        info!(operation = label, %key, "coordinator: executing");
        match self.run(operation).await {
            Ok(applied) => {
                self.client
                    .invalidate(&affected_keys(&applied.mutations))
                    .await;
                match applied.outcome {
                    Outcome::Done(completed) => {
                        info!(operation = label, %key, "coordinator: completed");
                        Ok(completed)
                    }
                    Outcome::Partial {
                        created,
                        failed_step,
                        source,
                    } => {
                        warn!(
                            operation = label,
                            %created,
                            %failed_step,
                            "coordinator: partial success: {source}"
                        );
                        self.client.observe_error(&source).await;
                        Err(CoordinatorError::PartialSuccess {
                            created,
                            failed_step,
                            source,
                        })
                    }
                }
            }
            Err(err) => {
                warn!(operation = label, %key, "coordinator: failed: {err}");
                self.client.observe_error(&err).await;
                Err(err.into())
            }
        }
    }

    /// Checks that must pass before any network call is attempted.
    fn check_preconditions(&self, operation: &Operation) -> Result<(), CoordinatorError> {
        if let Some((target, confirmation)) = operation.deletion() {
            match confirmation {
                Some(confirmation) if confirmation.target() == target => {}
                _ => return Err(CoordinatorError::ConfirmationRequired(target)),
            }
        }

        match operation {
            Operation::CreateCampaign(draft) => {
                validate_schedule(draft.scheduled_at, Utc::now())?;
            }
            Operation::UpdateCampaign { patch, .. } => {
                validate_schedule(patch.scheduled_at, Utc::now())?;
            }
            Operation::SendCampaign { id } => {
                if let Some(campaign) = self.cached_campaign(*id) {
                    ensure_sendable(&campaign)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn cached_campaign(&self, id: CampaignId) -> Option<Campaign> {
        let read = self.client.cache().read(&QueryKey::Campaigns)?;
        Campaign::from_collection(&read.value)?
            .iter()
            .find(|campaign| campaign.id == id)
            .cloned()
    }

    fn claim(&self, key: OperationKey) -> Result<InFlightGuard, CoordinatorError> {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if !inflight.insert(key) {
            warn!(%key, "coordinator: operation already in progress; rejecting duplicate");
            return Err(CoordinatorError::AlreadyInProgress(key));
        }
        Ok(InFlightGuard {
            inflight: Arc::clone(&self.inflight),
            key,
        })
    }

    async fn run(&self, operation: Operation) -> Result<Applied, GatewayError> {
        let gateway = self.client.gateway();
        let applied = match operation {
            Operation::CreateCampaign(draft) => {
                let campaign = gateway.create_campaign(&draft).await?;
                Applied::created(
                    EntityRef::Campaign(campaign.id),
                    MutationKind::CampaignWrite,
                )
            }
            Operation::UpdateCampaign { id, patch } => {
                gateway.update_campaign(id, &patch).await?;
                Applied::plain(MutationKind::CampaignWrite)
            }
            Operation::SendCampaign { id } => {
                let response = gateway.send_campaign(id).await?;
                info!(campaign_id = %id, status = %response.status, "coordinator: send accepted");
                Applied::plain(MutationKind::CampaignSend)
            }
            Operation::DeleteCampaign { id, .. } => {
                gateway.delete_campaign(id).await?;
                Applied::plain(MutationKind::CampaignWrite)
            }
            Operation::CreateList { draft, attachment } => {
                let list = gateway.create_subscriber_list(&draft).await?;
                let created = EntityRef::SubscriberList(list.id);
                let Some(file) = attachment else {
                    return Ok(Applied::created(created, MutationKind::ListWrite));
                };
                let mutations = vec![
                    MutationKind::ListWrite,
                    MutationKind::SubscriberImport { list_id: list.id },
                ];
                // The list stays even if the upload fails.
                match gateway.import_subscribers(list.id, file).await {
                    Ok(response) => Applied {
                        outcome: Outcome::Done(Completed {
                            created: Some(created),
                            imported: Some(response.count),
                        }),
                        mutations,
                    },
                    Err(source) => Applied {
                        outcome: Outcome::Partial {
                            created,
                            failed_step: CompositeStep::UploadFile,
                            source,
                        },
                        mutations,
                    },
                }
            }
            Operation::RenameList { id, draft } => {
                gateway.rename_subscriber_list(id, &draft).await?;
                Applied::plain(MutationKind::ListWrite)
            }
            Operation::DeleteList { id, .. } => {
                gateway.delete_subscriber_list(id).await?;
                Applied::plain(MutationKind::ListDelete { list_id: id })
            }
            Operation::ImportSubscribers { list_id, file } => {
                let response = gateway.import_subscribers(list_id, file).await?;
                Applied::done(
                    Completed {
                        created: None,
                        imported: Some(response.count),
                    },
                    MutationKind::SubscriberImport { list_id },
                )
            }
            Operation::AddSubscriber(draft) => {
                let subscriber = gateway.create_subscriber(&draft).await?;
                Applied::created(
                    EntityRef::Subscriber(subscriber.id),
                    MutationKind::SubscriberWrite {
                        list_id: subscriber.subscriber_list_id,
                    },
                )
            }
            Operation::UpdateSubscriber { id, list_id, patch } => {
                gateway.update_subscriber(id, &patch).await?;
                Applied::plain(MutationKind::SubscriberWrite { list_id })
            }
            Operation::RemoveSubscriber { id, list_id, .. } => {
                gateway.delete_subscriber(id).await?;
                Applied::plain(MutationKind::SubscriberWrite { list_id })
            }
            Operation::CreateTemplate(draft) => {
                let template = gateway.create_template(&draft).await?;
                Applied::created(
                    EntityRef::Template(template.id),
                    MutationKind::TemplateWrite,
                )
            }
            Operation::UpdateTemplate { id, draft } => {
                gateway.update_template(id, &draft).await?;
                Applied::plain(MutationKind::TemplateWrite)
            }
            Operation::DeleteTemplate { id, .. } => {
                gateway.delete_template(id).await?;
                Applied::plain(MutationKind::TemplateWrite)
            }
            Operation::CreateSmtpConfig(draft) => {
                let config = gateway.create_smtp_config(&draft).await?;
                Applied::created(
                    EntityRef::SmtpConfig(config.id),
                    MutationKind::SmtpConfigWrite,
                )
            }
            Operation::UpdateSmtpConfig { id, draft } => {
                gateway.update_smtp_config(id, draft).await?;
                Applied::plain(MutationKind::SmtpConfigWrite)
            }
            Operation::DeleteSmtpConfig { id, .. } => {
                gateway.delete_smtp_config(id).await?;
                Applied::plain(MutationKind::SmtpConfigWrite)
            }
        };
        Ok(applied)
    }
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
