#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, patch, post, put},
    Json, Router,
};
use chrono::Utc;
use client_core::{session::MemoryCredentialStore, Console};
use jsonwebtoken::{EncodingKey, Header};
use serde::Deserialize;
use serde_json::{json, Value};
use shared::{
    domain::{
        Campaign, CampaignId, CampaignStatus, ListId, SmtpConfig, SmtpConfigId, Subscriber,
        SubscriberId, SubscriberList, Template, TemplateId,
    },
    protocol::{
        CampaignDraft, CampaignPatch, ListDraft, LoginRequest, SmtpConfigDraft, SubscriberDraft,
        SubscriberPatch, TemplateDraft,
    },
};
use tokio::{net::TcpListener, sync::Mutex};
use url::Url;

type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

#[derive(Default)]
struct Store {
    next_id: i64,
    campaigns: Vec<Campaign>,
    lists: Vec<SubscriberList>,
    subscribers: Vec<Subscriber>,
    templates: Vec<Template>,
    smtp_configs: Vec<SmtpConfig>,
    smtp_passwords: HashMap<SmtpConfigId, Option<String>>,
    calls: HashMap<&'static str, usize>,
    total_calls: usize,
    fail_uploads: bool,
    revoked: bool,
}

impl Store {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn hit(&mut self, route: &'static str) {
        *self.calls.entry(route).or_default() += 1;
        self.total_calls += 1;
    }

    fn lists_with_counts(&self) -> Vec<SubscriberList> {
        self.lists
            .iter()
            .map(|list| SubscriberList {
                subscriber_count: self
                    .subscribers
                    .iter()
                    .filter(|s| s.subscriber_list_id == list.id)
                    .count() as u64,
                ..list.clone()
            })
            .collect()
    }

    fn email_taken(&self, list_id: ListId, email: &str) -> bool {
        self.subscribers
            .iter()
            .any(|s| s.subscriber_list_id == list_id && s.email.eq_ignore_ascii_case(email))
    }

    fn insert_subscriber(&mut self, draft: SubscriberDraft) -> Subscriber {
        let subscriber = Subscriber {
            id: SubscriberId(self.next_id()),
            email: draft.email,
            first_name: draft.first_name,
            last_name: draft.last_name,
            subscriber_list_id: draft.subscriber_list_id,
            extra_data: Default::default(),
        };
        self.subscribers.push(subscriber.clone());
        subscriber
    }
}

/// In-memory stand-in for the campaign service, mounted under `/api/`.
#[derive(Clone, Default)]
pub struct FakeService {
    store: Arc<Mutex<Store>>,
}

impl FakeService {
    pub async fn calls(&self, route: &'static str) -> usize {
        self.store
            .lock()
            .await
            .calls
            .get(route)
            .copied()
            .unwrap_or_default()
    }

    pub async fn total_calls(&self) -> usize {
        self.store.lock().await.total_calls
    }

    pub async fn fail_uploads(&self, fail: bool) {
        self.store.lock().await.fail_uploads = fail;
    }

    /// Every bearer credential is rejected from now on.
    pub async fn revoke_credentials(&self) {
        self.store.lock().await.revoked = true;
    }

    pub async fn smtp_password(&self, id: SmtpConfigId) -> Option<String> {
        self.store
            .lock()
            .await
            .smtp_passwords
            .get(&id)
            .cloned()
            .flatten()
    }

    pub async fn set_campaign_status(&self, id: CampaignId, status: CampaignStatus) {
        let mut store = self.store.lock().await;
        if let Some(campaign) = store.campaigns.iter_mut().find(|c| c.id == id) {
            campaign.status = status;
        }
    }

    async fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let bearer = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("Bearer "));
        if !bearer {
            return Err(rejection(
                StatusCode::UNAUTHORIZED,
                json!({"detail": "Authentication credentials were not provided."}),
            ));
        }
        if self.store.lock().await.revoked {
            return Err(rejection(
                StatusCode::UNAUTHORIZED,
                json!({"detail": "Given token not valid for any token type"}),
            ));
        }
        Ok(())
    }
}

fn rejection(status: StatusCode, body: Value) -> ApiError {
    (status, Json(body))
}

fn not_found() -> ApiError {
    rejection(StatusCode::NOT_FOUND, json!({"detail": "Not found."}))
}

fn bad_request(body: Value) -> ApiError {
    rejection(StatusCode::BAD_REQUEST, body)
}

fn to_json<T: serde::Serialize>(value: &T) -> ApiResult {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|err| rejection(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": err.to_string()})))
}

pub fn mint_access_token(user_id: i64, username: &str) -> String {
    jsonwebtoken::encode(
        &Header::default(),
        &json!({
            "user_id": user_id,
            "username": username,
            "exp": Utc::now().timestamp() + 3600,
        }),
        &EncodingKey::from_secret(b"fake-service-signing-key"),
    )
    .expect("mint token")
}

async fn login(State(service): State<FakeService>, Json(request): Json<LoginRequest>) -> ApiResult {
    service.store.lock().await.hit("login");
    if request.password == "wrong" {
        return Err(rejection(
            StatusCode::UNAUTHORIZED,
            json!({"detail": "No active account found with the given credentials"}),
        ));
    }
    Ok(Json(json!({
        "access": mint_access_token(1, &request.username),
        "refresh": "refresh-token",
    })))
}

async fn register(State(service): State<FakeService>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    service.store.lock().await.hit("register");
    (
        StatusCode::CREATED,
        Json(json!({"username": body["username"], "email": body["email"]})),
    )
}

async fn list_campaigns(State(service): State<FakeService>, headers: HeaderMap) -> ApiResult {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("list_campaigns");
    to_json(&store.campaigns)
}

async fn create_campaign(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Json(draft): Json<CampaignDraft>,
) -> ApiResult {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("create_campaign");
    let status = if draft.scheduled_at.is_some() {
        CampaignStatus::Scheduled
    } else {
        CampaignStatus::Draft
    };
    let campaign = Campaign {
        id: CampaignId(store.next_id()),
        name: draft.name,
        subject: draft.subject,
        template_id: draft.template_id,
        subscriber_list_ids: draft.subscriber_list_ids,
        smtp_config_id: Some(draft.smtp_config_id),
        status,
        scheduled_at: draft.scheduled_at,
        created_at: Utc::now(),
    };
    store.campaigns.push(campaign.clone());
    to_json(&campaign)
}

async fn update_campaign(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(patch): Json<CampaignPatch>,
) -> ApiResult {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("update_campaign");
    let campaign = store
        .campaigns
        .iter_mut()
        .find(|c| c.id == CampaignId(id))
        .ok_or_else(not_found)?;
    if let Some(name) = patch.name {
        campaign.name = name;
    }
    if let Some(subject) = patch.subject {
        campaign.subject = subject;
    }
    if let Some(scheduled_at) = patch.scheduled_at {
        campaign.scheduled_at = Some(scheduled_at);
        campaign.status = CampaignStatus::Scheduled;
    }
    let campaign = campaign.clone();
    to_json(&campaign)
}

async fn delete_campaign(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("delete_campaign");
    let before = store.campaigns.len();
    store.campaigns.retain(|c| c.id != CampaignId(id));
    if store.campaigns.len() == before {
        return Err(not_found());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn send_campaign(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("send_campaign");
    let campaign = store
        .campaigns
        .iter_mut()
        .find(|c| c.id == CampaignId(id))
        .ok_or_else(not_found)?;
    if !matches!(
        campaign.status,
        CampaignStatus::Draft | CampaignStatus::Scheduled
    ) {
        return Err(bad_request(json!({
            "error": "Campaign cannot be sent in its current status"
        })));
    }
    campaign.status = CampaignStatus::Processing;
    Ok(Json(json!({"status": "Campaign sending started"})))
}

async fn list_lists(State(service): State<FakeService>, headers: HeaderMap) -> ApiResult {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("list_lists");
    to_json(&store.lists_with_counts())
}

async fn create_list(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Json(draft): Json<ListDraft>,
) -> ApiResult {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("create_list");
    if draft.name.trim().is_empty() {
        return Err(bad_request(json!({"name": ["This field may not be blank."]})));
    }
    let list = SubscriberList {
        id: ListId(store.next_id()),
        name: draft.name,
        subscriber_count: 0,
        created_at: Utc::now(),
    };
    store.lists.push(list.clone());
    to_json(&list)
}

async fn rename_list(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(draft): Json<ListDraft>,
) -> ApiResult {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("rename_list");
    let list = store
        .lists
        .iter_mut()
        .find(|l| l.id == ListId(id))
        .ok_or_else(not_found)?;
    list.name = draft.name;
    let list = list.clone();
    to_json(&list)
}

async fn delete_list(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("delete_list");
    let before = store.lists.len();
    store.lists.retain(|l| l.id != ListId(id));
    if store.lists.len() == before {
        return Err(not_found());
    }
    store.subscribers.retain(|s| s.subscriber_list_id != ListId(id));
    Ok(StatusCode::NO_CONTENT)
}

async fn upload_subscribers(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    mut multipart: Multipart,
) -> ApiResult {
    service.authorize(&headers).await?;
    let mut content = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("file") {
            content = field.text().await.ok();
        }
    }

    let mut store = service.store.lock().await;
    store.hit("upload");
    if store.fail_uploads {
        return Err(rejection(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "import worker unavailable"}),
        ));
    }
    let list_id = ListId(id);
    if !store.lists.iter().any(|l| l.id == list_id) {
        return Err(not_found());
    }
    let content = content.ok_or_else(|| bad_request(json!({"error": "No file provided"})))?;

    let mut count = 0;
    for line in content.lines().skip(1) {
        let mut columns = line.split(',').map(str::trim);
        let Some(email) = columns.next().filter(|email| !email.is_empty()) else {
            continue;
        };
        if store.email_taken(list_id, email) {
            continue;
        }
        let first_name = columns.next().filter(|v| !v.is_empty()).map(String::from);
        let last_name = columns.next().filter(|v| !v.is_empty()).map(String::from);
        store.insert_subscriber(SubscriberDraft {
            email: email.to_string(),
            first_name,
            last_name,
            subscriber_list_id: list_id,
        });
        count += 1;
    }
    Ok(Json(json!({"status": "success", "count": count})))
}

#[derive(Deserialize)]
struct SubscriberQuery {
    list_id: Option<i64>,
}

async fn list_subscribers(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Query(query): Query<SubscriberQuery>,
) -> ApiResult {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("list_subscribers");
    let subscribers: Vec<&Subscriber> = store
        .subscribers
        .iter()
        .filter(|s| query.list_id.map_or(true, |id| s.subscriber_list_id == ListId(id)))
        .collect();
    to_json(&subscribers)
}

async fn create_subscriber(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Json(draft): Json<SubscriberDraft>,
) -> ApiResult {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("create_subscriber");
    if store.email_taken(draft.subscriber_list_id, &draft.email) {
        return Err(bad_request(json!({
            "non_field_errors": ["The fields subscriber_list, email must make a unique set."]
        })));
    }
    let subscriber = store.insert_subscriber(draft);
    to_json(&subscriber)
}

async fn update_subscriber(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(patch): Json<SubscriberPatch>,
) -> ApiResult {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("update_subscriber");
    let subscriber = store
        .subscribers
        .iter_mut()
        .find(|s| s.id == SubscriberId(id))
        .ok_or_else(not_found)?;
    if let Some(email) = patch.email {
        subscriber.email = email;
    }
    if patch.first_name.is_some() {
        subscriber.first_name = patch.first_name;
    }
    if patch.last_name.is_some() {
        subscriber.last_name = patch.last_name;
    }
    let subscriber = subscriber.clone();
    to_json(&subscriber)
}

async fn delete_subscriber(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("delete_subscriber");
    let before = store.subscribers.len();
    store.subscribers.retain(|s| s.id != SubscriberId(id));
    if store.subscribers.len() == before {
        return Err(not_found());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_templates(State(service): State<FakeService>, headers: HeaderMap) -> ApiResult {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("list_templates");
    to_json(&store.templates)
}

async fn create_template(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Json(draft): Json<TemplateDraft>,
) -> ApiResult {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("create_template");
    let template = Template {
        id: TemplateId(store.next_id()),
        name: draft.name,
        html_content: draft.html_content,
        created_at: Utc::now(),
    };
    store.templates.push(template.clone());
    to_json(&template)
}

async fn update_template(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(draft): Json<TemplateDraft>,
) -> ApiResult {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("update_template");
    let template = store
        .templates
        .iter_mut()
        .find(|t| t.id == TemplateId(id))
        .ok_or_else(not_found)?;
    template.name = draft.name;
    template.html_content = draft.html_content;
    let template = template.clone();
    to_json(&template)
}

async fn delete_template(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("delete_template");
    store.templates.retain(|t| t.id != TemplateId(id));
    Ok(StatusCode::NO_CONTENT)
}

async fn list_smtp_configs(State(service): State<FakeService>, headers: HeaderMap) -> ApiResult {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("list_smtp");
    to_json(&store.smtp_configs)
}

async fn create_smtp_config(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Json(draft): Json<SmtpConfigDraft>,
) -> ApiResult {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("create_smtp");
    let config = SmtpConfig {
        id: SmtpConfigId(store.next_id()),
        name: draft.name,
        host: draft.host,
        port: draft.port,
        username: draft.username,
        from_email: draft.from_email,
        use_tls: draft.use_tls,
        use_ssl: draft.use_ssl,
        created_at: Utc::now(),
    };
    store.smtp_passwords.insert(config.id, draft.password);
    store.smtp_configs.push(config.clone());
    to_json(&config)
}

async fn update_smtp_config(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> ApiResult {
    service.authorize(&headers).await?;
    let draft: SmtpConfigDraft = serde_json::from_value(body.clone())
        .map_err(|err| bad_request(json!({"error": err.to_string()})))?;
    let mut store = service.store.lock().await;
    store.hit("update_smtp");
    let id = SmtpConfigId(id);
    let config = store
        .smtp_configs
        .iter_mut()
        .find(|c| c.id == id)
        .ok_or_else(not_found)?;
    config.name = draft.name;
    config.host = draft.host;
    config.port = draft.port;
    config.username = draft.username;
    config.from_email = draft.from_email;
    config.use_tls = draft.use_tls;
    config.use_ssl = draft.use_ssl;
    let config = config.clone();
    // A present key overwrites the credential, even when empty.
    if let Some(password) = body.get("password") {
        let password = password.as_str().map(String::from);
        store.smtp_passwords.insert(id, password);
    }
    to_json(&config)
}

async fn delete_smtp_config(
    State(service): State<FakeService>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    service.authorize(&headers).await?;
    let mut store = service.store.lock().await;
    store.hit("delete_smtp");
    store.smtp_configs.retain(|c| c.id != SmtpConfigId(id));
    Ok(StatusCode::NO_CONTENT)
}

pub async fn spawn_service() -> (FakeService, Url) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let service = FakeService::default();
    let app = Router::new()
        .route("/api/auth/login/", post(login))
        .route("/api/auth/register/", post(register))
        .route("/api/campaigns/", get(list_campaigns).post(create_campaign))
        .route(
            "/api/campaigns/:id/",
            patch(update_campaign).delete(delete_campaign),
        )
        .route("/api/campaigns/:id/send/", post(send_campaign))
        .route("/api/campaigns/lists/", get(list_lists).post(create_list))
        .route(
            "/api/campaigns/lists/:id/",
            patch(rename_list).delete(delete_list),
        )
        .route("/api/campaigns/lists/:id/upload/", post(upload_subscribers))
        .route(
            "/api/campaigns/subscribers/",
            get(list_subscribers).post(create_subscriber),
        )
        .route(
            "/api/campaigns/subscribers/:id/",
            patch(update_subscriber).delete(delete_subscriber),
        )
        .route(
            "/api/campaigns/templates/",
            get(list_templates).post(create_template),
        )
        .route(
            "/api/campaigns/templates/:id/",
            put(update_template).delete(delete_template),
        )
        .route(
            "/api/campaigns/smtp/",
            get(list_smtp_configs).post(create_smtp_config),
        )
        .route(
            "/api/campaigns/smtp/:id/",
            put(update_smtp_config).delete(delete_smtp_config),
        )
        .with_state(service.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    let base_url = Url::parse(&format!("http://{addr}/api/")).expect("base url");
    (service, base_url)
}

pub fn console_for(base_url: &Url) -> Console {
    Console::with_base_url(
        base_url.clone(),
        Duration::from_secs(5),
        Arc::new(MemoryCredentialStore::new()),
    )
    .expect("console")
}

pub async fn signed_in_console() -> (FakeService, Console) {
    let (service, base_url) = spawn_service().await;
    let console = console_for(&base_url);
    console.login("operator", "hunter2").await.expect("login");
    (service, console)
}
