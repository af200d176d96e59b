//! Campaign status rules the console checks before issuing an action.
//!
//! The displayed status is always the last one read from the service; nothing
//! here predicts a transition.

use chrono::{DateTime, Utc};
use shared::domain::{Campaign, CampaignId, CampaignStatus};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CampaignAction {
    SendNow,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("campaign {id} cannot be sent while {status}")]
    SendNotAllowed { id: CampaignId, status: CampaignStatus },
    #[error("scheduled time {scheduled_at} is not in the future")]
    ScheduleInPast { scheduled_at: DateTime<Utc> },
}

pub fn can_send(status: CampaignStatus) -> bool {
    matches!(status, CampaignStatus::Draft | CampaignStatus::Scheduled)
}

pub fn is_terminal(status: CampaignStatus) -> bool {
    matches!(status, CampaignStatus::Completed | CampaignStatus::Failed)
}

/// Deletion is always offered; the service decides whether it is allowed.
pub fn available_actions(status: CampaignStatus) -> Vec<CampaignAction> {
    let mut actions = Vec::with_capacity(2);
    if can_send(status) {
        actions.push(CampaignAction::SendNow);
    }
    actions.push(CampaignAction::Delete);
    actions
}

fn rank(status: CampaignStatus) -> u8 {
    match status {
        CampaignStatus::Draft => 0,
        CampaignStatus::Scheduled => 1,
        CampaignStatus::Processing => 2,
        CampaignStatus::Completed | CampaignStatus::Failed => 3,
    }
}

/// Whether `from -> to` follows the forward path
/// `draft -> [scheduled ->] processing -> completed | failed`.
pub fn is_forward_transition(from: CampaignStatus, to: CampaignStatus) -> bool {
    from != to && !is_terminal(from) && rank(to) > rank(from)
}

pub fn ensure_sendable(campaign: &Campaign) -> Result<(), LifecycleError> {
    if can_send(campaign.status) {
        Ok(())
    } else {
        Err(LifecycleError::SendNotAllowed {
            id: campaign.id,
            status: campaign.status,
        })
    }
}

/// A schedule must be strictly after `now`. Absent means "no schedule".
pub fn validate_schedule(
    scheduled_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), LifecycleError> {
    match scheduled_at {
        Some(scheduled_at) if scheduled_at <= now => {
            Err(LifecycleError::ScheduleInPast { scheduled_at })
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub id: CampaignId,
    pub from: CampaignStatus,
    pub to: CampaignStatus,
}

/// Status differences between two reads of the campaign collection. Campaigns
/// that appear or disappear are not reported.
pub fn status_changes(previous: &[Campaign], next: &[Campaign]) -> Vec<StatusChange> {
    next.iter()
        .filter_map(|campaign| {
            let before = previous.iter().find(|prev| prev.id == campaign.id)?;
            (before.status != campaign.status).then_some(StatusChange {
                id: campaign.id,
                from: before.status,
                to: campaign.status,
            })
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
