//! Send-log rows and engagement events
//!
//! Both are append-only. Usage counters, per-recipient job state, variant
//! results and real-time stats are all derived from them on read.

use serde::{Deserialize, Serialize};

use crate::{
    ids::{CampaignId, EntryId, RecipientId, SendId, UserId, VariantId},
    time::Timestamp,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendOutcome {
    Sent,
    Failed {
        error: String,
        /// No further attempts will be made for this recipient
        permanent: bool,
    },
}

impl SendOutcome {
    #[must_use]
    pub const fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }
}

/// One transport attempt for one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRecord {
    pub id: SendId,
    pub user_id: UserId,
    pub campaign_id: CampaignId,
    pub entry_id: EntryId,
    pub recipient_id: RecipientId,
    pub variant_id: Option<VariantId>,
    pub outcome: SendOutcome,
    /// 1-based attempt number
    pub attempt: u32,
    pub provider_message_id: Option<String>,
    pub at: Timestamp,
    /// When a failed, non-permanent attempt may be retried
    pub next_retry_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngagementKind {
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Complained,
    Unsubscribed,
    Converted,
}

impl EngagementKind {
    pub const ALL: [Self; 7] = [
        Self::Delivered,
        Self::Opened,
        Self::Clicked,
        Self::Bounced,
        Self::Complained,
        Self::Unsubscribed,
        Self::Converted,
    ];

    /// Events the send-time optimizer treats as engagement
    #[must_use]
    pub const fn is_engagement(self) -> bool {
        matches!(self, Self::Opened | Self::Clicked)
    }
}

impl std::fmt::Display for EngagementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Delivered => "delivered",
            Self::Opened => "opened",
            Self::Clicked => "clicked",
            Self::Bounced => "bounced",
            Self::Complained => "complained",
            Self::Unsubscribed => "unsubscribed",
            Self::Converted => "converted",
        })
    }
}

/// Provider feedback or tracking event for a recipient of a campaign
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementEvent {
    pub campaign_id: CampaignId,
    pub recipient_id: RecipientId,
    pub kind: EngagementKind,
    pub at: Timestamp,
}

impl EngagementEvent {
    #[must_use]
    pub const fn new(
        campaign_id: CampaignId,
        recipient_id: RecipientId,
        kind: EngagementKind,
        at: Timestamp,
    ) -> Self {
        Self {
            campaign_id,
            recipient_id,
            kind,
            at,
        }
    }
}
