//! Schedule entries: one concrete, dated send event of a campaign

use serde::{Deserialize, Serialize};

use crate::{
    ids::{CampaignId, EntryId, VariantId},
    time::Timestamp,
};

/// Status of a schedule entry.
///
/// The only permitted transitions are `Pending` to one of the terminal
/// states. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[default]
    Pending,
    Processed,
    Skipped,
    Failed,
}

impl EntryStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Whether `self -> next` is an edge of the state machine
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(self, Self::Pending) && next.is_terminal()
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        })
    }
}

/// Which delivery stream an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// A regular occurrence of the campaign's schedule
    Scheduled,
    /// The assigned recipients of one A/B test variant
    Variant(VariantId),
    /// Winner rollout to the rest of the audience
    Rollout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: EntryId,
    pub campaign_id: CampaignId,
    pub scheduled_at: Timestamp,
    pub status: EntryStatus,
    /// Successful sends, set once the entry reaches a terminal state
    pub recipient_count: Option<u64>,
    pub actual_sent_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub kind: EntryKind,
    /// Logical occurrence key; at most one non-skipped entry per campaign and key
    pub occurrence: String,
    /// Bumped on every write, used for compare-and-swap
    pub version: u64,
}

impl ScheduleEntry {
    #[must_use]
    pub fn new(
        campaign_id: CampaignId,
        scheduled_at: Timestamp,
        kind: EntryKind,
        occurrence: impl Into<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            id: EntryId::generate(),
            campaign_id,
            scheduled_at,
            status: EntryStatus::Pending,
            recipient_count: None,
            actual_sent_at: None,
            created_at: now,
            kind,
            occurrence: occurrence.into(),
            version: 0,
        }
    }

    #[must_use]
    pub const fn is_due(&self, now: Timestamp) -> bool {
        matches!(self.status, EntryStatus::Pending) && self.scheduled_at <= now
    }
}
