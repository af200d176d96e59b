//! Read-only projections over cached collections. Counts come from the
//! service and are never adjusted locally.

use serde::Serialize;
use shared::domain::{Campaign, CampaignStatus, ListId, SubscriberList};

pub fn subscriber_count(lists: &[SubscriberList], list_id: ListId) -> Option<u64> {
    lists
        .iter()
        .find(|list| list.id == list_id)
        .map(|list| list.subscriber_count)
}

pub fn total_subscribers(lists: &[SubscriberList]) -> u64 {
    lists.iter().map(|list| list.subscriber_count).sum()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DashboardSummary {
    pub total_subscribers: u64,
    pub total_campaigns: usize,
    pub campaigns_sent: usize,
}

impl DashboardSummary {
    pub fn derive(lists: &[SubscriberList], campaigns: &[Campaign]) -> Self {
        Self {
            total_subscribers: total_subscribers(lists),
            total_campaigns: campaigns.len(),
            campaigns_sent: campaigns
                .iter()
                .filter(|campaign| campaign.status == CampaignStatus::Completed)
                .count(),
        }
    }
}
