use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(CampaignId);
id_newtype!(ListId);
id_newtype!(SubscriberId);
id_newtype!(TemplateId);
id_newtype!(SmtpConfigId);

/// Entity kinds the console manages. Used to label cache keys and in-flight
/// operation guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Campaign,
    SubscriberList,
    Subscriber,
    Template,
    SmtpConfig,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Campaign => "campaign",
            Self::SubscriberList => "subscriber_list",
            Self::Subscriber => "subscriber",
            Self::Template => "template",
            Self::SmtpConfig => "smtp_config",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    #[default]
    Draft,
    Scheduled,
    Processing,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberList {
    pub id: ListId,
    pub name: String,
    /// Computed by the service; never adjusted locally.
    #[serde(default)]
    pub subscriber_count: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(rename = "subscriber_list")]
    pub subscriber_list_id: ListId,
    /// Columns carried over from a bulk import beyond email and names.
    #[serde(default)]
    pub extra_data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub html_content: String,
    pub created_at: DateTime<Utc>,
}

/// Sender profile as returned by the service. The password is write-only and
/// never appears in a read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub id: SmtpConfigId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub from_email: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub use_ssl: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub subject: String,
    #[serde(rename = "template", default)]
    pub template_id: Option<TemplateId>,
    #[serde(rename = "subscriber_lists", default)]
    pub subscriber_list_ids: BTreeSet<ListId>,
    /// Nullable on read: the service clears it when the profile is deleted.
    #[serde(rename = "smtp_config", default)]
    pub smtp_config_id: Option<SmtpConfigId>,
    #[serde(default)]
    pub status: CampaignStatus,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
