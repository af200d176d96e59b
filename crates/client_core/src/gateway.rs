//! Typed request layer over the campaign service's REST API.
//!
//! Every call attaches the session's bearer credential (short-circuiting with
//! [`GatewayError::Auth`] before touching the network when there is none) and
//! maps any non-2xx response onto [`GatewayError`]. No caching, no retries.

use std::{sync::Arc, time::Duration};

use reqwest::{multipart, Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{
        Campaign, CampaignId, ListId, SmtpConfig, SmtpConfigId, Subscriber, SubscriberId,
        SubscriberList, Template, TemplateId,
    },
    error::ErrorBody,
    protocol::{
        CampaignDraft, CampaignPatch, ImportResponse, ListDraft, LoginRequest, RegisterRequest,
        RegisterResponse, SendResponse, SmtpConfigDraft, SubscriberDraft, SubscriberPatch,
        TemplateDraft, TokenPair,
    },
};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::session::Session;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("authorization failed: {0}")]
    Auth(String),
    #[error("validation failed: {0}")]
    Validation(ErrorBody),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(ErrorBody),
    #[error("server error{}: {message}", status_suffix(.status))]
    Server { status: Option<u16>, message: String },
    #[error("network error: {0}")]
    Network(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|status| format!(" (status {status})"))
        .unwrap_or_default()
}

impl GatewayError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Network(format!("request timed out: {err}"))
        } else if err.is_decode() {
            Self::Server {
                status: None,
                message: format!("malformed response: {err}"),
            }
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Maps a rejected response onto the error taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    let parsed = ErrorBody::parse(body);
    let message = if parsed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string()
    } else {
        parsed.to_string()
    };

    match status.as_u16() {
        401 | 403 => GatewayError::Auth(message),
        404 => GatewayError::NotFound(message),
        409 => GatewayError::Conflict(parsed),
        400..=499 if parsed.reports_uniqueness_violation() => GatewayError::Conflict(parsed),
        400..=499 if parsed.is_empty() => {
            GatewayError::Validation(ErrorBody::single(shared::error::NON_FIELD_ERRORS, message))
        }
        400..=499 => GatewayError::Validation(parsed),
        code => GatewayError::Server {
            status: Some(code),
            message,
        },
    }
}

/// Opaque spreadsheet payload for a bulk subscriber import.
#[derive(Debug, Clone)]
pub struct ImportFile {
    pub filename: String,
    pub content: Vec<u8>,
    pub mime_type: Option<String>,
}

impl ImportFile {
    pub fn new(filename: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
            mime_type: None,
        }
    }
}

mod routes {
    use std::fmt::Display;

    pub const LOGIN: &str = "auth/login/";
    pub const REGISTER: &str = "auth/register/";
    pub const CAMPAIGNS: &str = "campaigns/";
    pub const LISTS: &str = "campaigns/lists/";
    pub const SUBSCRIBERS: &str = "campaigns/subscribers/";
    pub const TEMPLATES: &str = "campaigns/templates/";
    pub const SMTP_CONFIGS: &str = "campaigns/smtp/";

    pub fn item(collection: &str, id: impl Display) -> String {
        format!("{collection}{id}/")
    }

    pub fn action(collection: &str, id: impl Display, action: &str) -> String {
        format!("{collection}{id}/{action}/")
    }
}

pub struct Gateway {
    http: Client,
    base_url: Url,
    session: Arc<Session>,
}

impl Gateway {
    pub fn new(base_url: Url, timeout: Duration, session: Arc<Session>) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            session,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, GatewayError> {
        self.base_url.join(path).map_err(|err| GatewayError::Server {
            status: None,
            message: format!("invalid resource path '{path}': {err}"),
        })
    }

    async fn authorized(&self, method: Method, path: &str) -> Result<RequestBuilder, GatewayError> {
        let bearer = self
            .session
            .bearer()
            .await
            .map_err(|err| GatewayError::Auth(err.to_string()))?;
        Ok(self.http.request(method, self.url(path)?).bearer_auth(bearer))
    }

    async fn dispatch(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let response = request.send().await.map_err(GatewayError::from_transport)?;
        let status = response.status();
        debug!(status = status.as_u16(), url = %response.url(), "gateway: response");
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
        let bytes = response.bytes().await.map_err(GatewayError::from_transport)?;
        Self::decode_bytes(&bytes)
    }

    fn decode_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, GatewayError> {
        serde_json::from_slice(bytes).map_err(|err| GatewayError::Server {
            status: None,
            message: format!("malformed response body: {err}"),
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let request = self.authorized(Method::GET, path).await?.query(query);
        Self::decode(self.dispatch(request).await?).await
    }

    async fn send_json<B, T>(&self, method: Method, path: &str, body: &B) -> Result<T, GatewayError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.authorized(method, path).await?.json(body);
        Self::decode(self.dispatch(request).await?).await
    }

    async fn delete(&self, path: &str) -> Result<(), GatewayError> {
        let request = self.authorized(Method::DELETE, path).await?;
        self.dispatch(request).await?;
        Ok(())
    }

    pub async fn login(&self, request: &LoginRequest) -> Result<TokenPair, GatewayError> {
        let response = self
            .dispatch(self.http.post(self.url(routes::LOGIN)?).json(request))
            .await?;
        Self::decode(response).await
    }

    pub async fn register(
        &self,
        request: &RegisterRequest,
    ) -> Result<RegisterResponse, GatewayError> {
        let response = self
            .dispatch(self.http.post(self.url(routes::REGISTER)?).json(request))
            .await?;
        let bytes = response.bytes().await.map_err(GatewayError::from_transport)?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(RegisterResponse::default());
        }
        Self::decode_bytes(&bytes)
    }

    pub async fn list_campaigns(&self) -> Result<Vec<Campaign>, GatewayError> {
        self.get(routes::CAMPAIGNS, &[]).await
    }

    pub async fn create_campaign(&self, draft: &CampaignDraft) -> Result<Campaign, GatewayError> {
        self.send_json(Method::POST, routes::CAMPAIGNS, draft).await
    }

    pub async fn update_campaign(
        &self,
        id: CampaignId,
        patch: &CampaignPatch,
    ) -> Result<Campaign, GatewayError> {
        self.send_json(Method::PATCH, &routes::item(routes::CAMPAIGNS, id), patch)
            .await
    }

    pub async fn delete_campaign(&self, id: CampaignId) -> Result<(), GatewayError> {
        self.delete(&routes::item(routes::CAMPAIGNS, id)).await
    }

    pub async fn send_campaign(&self, id: CampaignId) -> Result<SendResponse, GatewayError> {
        let request = self
            .authorized(Method::POST, &routes::action(routes::CAMPAIGNS, id, "send"))
            .await?;
        Self::decode(self.dispatch(request).await?).await
    }

    pub async fn list_subscriber_lists(&self) -> Result<Vec<SubscriberList>, GatewayError> {
        self.get(routes::LISTS, &[]).await
    }

    pub async fn create_subscriber_list(
        &self,
        draft: &ListDraft,
    ) -> Result<SubscriberList, GatewayError> {
        self.send_json(Method::POST, routes::LISTS, draft).await
    }

    pub async fn rename_subscriber_list(
        &self,
        id: ListId,
        draft: &ListDraft,
    ) -> Result<SubscriberList, GatewayError> {
        self.send_json(Method::PATCH, &routes::item(routes::LISTS, id), draft)
            .await
    }

    pub async fn delete_subscriber_list(&self, id: ListId) -> Result<(), GatewayError> {
        self.delete(&routes::item(routes::LISTS, id)).await
    }

    pub async fn import_subscribers(
        &self,
        id: ListId,
        file: ImportFile,
    ) -> Result<ImportResponse, GatewayError> {
        let mut part = multipart::Part::bytes(file.content).file_name(file.filename);
        if let Some(mime_type) = file.mime_type.as_deref() {
            part = part.mime_str(mime_type).map_err(|err| {
                GatewayError::Validation(ErrorBody::single("file", err.to_string()))
            })?;
        }
        let form = multipart::Form::new().part("file", part);
        let request = self
            .authorized(Method::POST, &routes::action(routes::LISTS, id, "upload"))
            .await?
            .multipart(form);
        Self::decode(self.dispatch(request).await?).await
    }

    pub async fn list_subscribers(&self, list_id: ListId) -> Result<Vec<Subscriber>, GatewayError> {
        self.get(routes::SUBSCRIBERS, &[("list_id", list_id.to_string())])
            .await
    }

    pub async fn create_subscriber(
        &self,
        draft: &SubscriberDraft,
    ) -> Result<Subscriber, GatewayError> {
        self.send_json(Method::POST, routes::SUBSCRIBERS, draft).await
    }

    pub async fn update_subscriber(
        &self,
        id: SubscriberId,
        patch: &SubscriberPatch,
    ) -> Result<Subscriber, GatewayError> {
        self.send_json(Method::PATCH, &routes::item(routes::SUBSCRIBERS, id), patch)
            .await
    }

    pub async fn delete_subscriber(&self, id: SubscriberId) -> Result<(), GatewayError> {
        self.delete(&routes::item(routes::SUBSCRIBERS, id)).await
    }

    pub async fn list_templates(&self) -> Result<Vec<Template>, GatewayError> {
        self.get(routes::TEMPLATES, &[]).await
    }

    pub async fn create_template(&self, draft: &TemplateDraft) -> Result<Template, GatewayError> {
        self.send_json(Method::POST, routes::TEMPLATES, draft).await
    }

    pub async fn update_template(
        &self,
        id: TemplateId,
        draft: &TemplateDraft,
    ) -> Result<Template, GatewayError> {
        self.send_json(Method::PUT, &routes::item(routes::TEMPLATES, id), draft)
            .await
    }

    pub async fn delete_template(&self, id: TemplateId) -> Result<(), GatewayError> {
        self.delete(&routes::item(routes::TEMPLATES, id)).await
    }

    pub async fn list_smtp_configs(&self) -> Result<Vec<SmtpConfig>, GatewayError> {
        self.get(routes::SMTP_CONFIGS, &[]).await
    }

    pub async fn create_smtp_config(
        &self,
        draft: &SmtpConfigDraft,
    ) -> Result<SmtpConfig, GatewayError> {
        self.send_json(Method::POST, routes::SMTP_CONFIGS, draft)
            .await
    }

    /// A blank password is left out of the body so the stored one is kept.
    pub async fn update_smtp_config(
        &self,
        id: SmtpConfigId,
        draft: SmtpConfigDraft,
    ) -> Result<SmtpConfig, GatewayError> {
        let draft = draft.without_blank_password();
        self.send_json(Method::PUT, &routes::item(routes::SMTP_CONFIGS, id), &draft)
            .await
    }

    pub async fn delete_smtp_config(&self, id: SmtpConfigId) -> Result<(), GatewayError> {
        self.delete(&routes::item(routes::SMTP_CONFIGS, id)).await
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
