//! Which cached collections a successful mutation makes stale.

use shared::domain::ListId;

use crate::cache::QueryKey;

/// Mutation kinds as seen by the cache. Creates, updates and deletes of the
/// same entity invalidate the same keys, so they share a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    CampaignWrite,
    CampaignSend,
    ListWrite,
    /// A deleted list takes its subscribers with it.
    ListDelete { list_id: ListId },
    SubscriberWrite { list_id: ListId },
    SubscriberImport { list_id: ListId },
    TemplateWrite,
    SmtpConfigWrite,
}

impl MutationKind {
    pub fn affected_keys(self) -> Vec<QueryKey> {
        match self {
            Self::CampaignWrite | Self::CampaignSend => vec![QueryKey::Campaigns],
            Self::ListWrite => vec![QueryKey::SubscriberLists],
            Self::ListDelete { list_id }
            | Self::SubscriberWrite { list_id }
            | Self::SubscriberImport { list_id } => vec![
                QueryKey::SubscriberLists,
                QueryKey::Subscribers { list_id },
            ],
            Self::TemplateWrite => vec![QueryKey::Templates],
            Self::SmtpConfigWrite => vec![QueryKey::SmtpConfigs],
        }
    }
}

/// Union of the keys for several mutations, first occurrence order kept.
pub fn affected_keys(kinds: &[MutationKind]) -> Vec<QueryKey> {
    let mut keys: Vec<QueryKey> = Vec::new();
    for key in kinds.iter().flat_map(|kind| kind.affected_keys()) {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_changes_hit_list_and_scoped_subscribers() {
        for kind in [
            MutationKind::SubscriberWrite { list_id: ListId(7) },
            MutationKind::SubscriberImport { list_id: ListId(7) },
        ] {
            assert_eq!(
                kind.affected_keys(),
                vec![
                    QueryKey::SubscriberLists,
                    QueryKey::Subscribers { list_id: ListId(7) }
                ]
            );
        }
    }

    #[test]
    fn entity_writes_only_touch_their_own_collection() {
        assert_eq!(
            MutationKind::CampaignSend.affected_keys(),
            vec![QueryKey::Campaigns]
        );
        assert_eq!(
            MutationKind::TemplateWrite.affected_keys(),
            vec![QueryKey::Templates]
        );
        assert_eq!(
            MutationKind::SmtpConfigWrite.affected_keys(),
            vec![QueryKey::SmtpConfigs]
        );
        assert_eq!(
            MutationKind::ListWrite.affected_keys(),
            vec![QueryKey::SubscriberLists]
        );
    }

    #[test]
    fn combined_keys_are_deduplicated() {
        let keys = affected_keys(&[
            MutationKind::ListWrite,
            MutationKind::SubscriberImport { list_id: ListId(3) },
        ]);
        assert_eq!(
            keys,
            vec![
                QueryKey::SubscriberLists,
                QueryKey::Subscribers { list_id: ListId(3) }
            ]
        );
    }
}
