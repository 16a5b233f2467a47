use async_trait::async_trait;
use cadence_common::{
    AbTest, AlertRule, Campaign, CampaignId, CampaignStatus, EngagementEvent, EntryId, EntryKind,
    EntryStatus, Rollout, RuleId, ScheduleEntry, SendRecord, TestId, Timestamp, UserConfig,
    UserId,
};

use crate::error::Result;

/// Selects schedule entries. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFilter {
    pub campaign_id: Option<CampaignId>,
    pub status: Option<EntryStatus>,
    pub kind: Option<EntryKind>,
    /// Only entries with `scheduled_at <= due_by`
    pub due_by: Option<Timestamp>,
}

impl EntryFilter {
    #[must_use]
    pub fn campaign(campaign_id: CampaignId) -> Self {
        Self {
            campaign_id: Some(campaign_id),
            ..Self::default()
        }
    }

    /// Pending entries whose time has come
    #[must_use]
    pub fn due(now: Timestamp) -> Self {
        Self {
            status: Some(EntryStatus::Pending),
            due_by: Some(now),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn matches(&self, entry: &ScheduleEntry) -> bool {
        self.campaign_id.is_none_or(|id| entry.campaign_id == id)
            && self.status.is_none_or(|status| entry.status == status)
            && self.kind.is_none_or(|kind| entry.kind == kind)
            && self.due_by.is_none_or(|due| entry.scheduled_at <= due)
    }
}

/// Storage for the scheduler's mutable entities.
///
/// Schedule entries and A/B tests are written with compare-and-swap on
/// their `version` field: a write succeeds only when the stored version
/// equals the version the caller read, and the stored version is then
/// incremented.
#[async_trait]
pub trait BackingStore: Send + Sync + std::fmt::Debug {
    /// Insert or replace a campaign
    async fn put_campaign(&self, campaign: &Campaign) -> Result<()>;

    async fn campaign(&self, id: CampaignId) -> Result<Campaign>;

    async fn campaigns(&self) -> Result<Vec<Campaign>>;

    /// Atomically move a campaign to `to` if its current status is one of
    /// `from`. Returns the updated campaign, or `None` when the guard failed.
    async fn update_campaign_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<Option<Campaign>>;

    async fn set_campaign_rollout(&self, id: CampaignId, rollout: Option<Rollout>) -> Result<()>;

    /// Insert a new entry unless a non-skipped entry for the same campaign
    /// and occurrence already exists, in which case that entry is returned
    /// and nothing is written.
    async fn insert_entry(&self, entry: &ScheduleEntry) -> Result<Option<ScheduleEntry>>;

    async fn entry(&self, id: EntryId) -> Result<ScheduleEntry>;

    /// Entries matching the filter, ordered by `scheduled_at`
    async fn entries(&self, filter: &EntryFilter) -> Result<Vec<ScheduleEntry>>;

    async fn compare_and_swap_entry(&self, entry: &ScheduleEntry) -> Result<ScheduleEntry>;

    async fn put_user(&self, user: &UserConfig) -> Result<()>;

    async fn user(&self, id: UserId) -> Result<Option<UserConfig>>;

    async fn insert_test(&self, test: &AbTest) -> Result<()>;

    async fn test(&self, id: TestId) -> Result<AbTest>;

    async fn tests(&self) -> Result<Vec<AbTest>>;

    async fn compare_and_swap_test(&self, test: &AbTest) -> Result<AbTest>;

    /// Insert or replace an alert rule
    async fn put_alert_rule(&self, rule: &AlertRule) -> Result<()>;

    async fn alert_rules(&self, user: UserId) -> Result<Vec<AlertRule>>;

    async fn delete_alert_rule(&self, id: RuleId) -> Result<()>;
}

/// Append-only send log and engagement events.
#[async_trait]
pub trait EventLog: Send + Sync + std::fmt::Debug {
    async fn append_send(&self, record: &SendRecord) -> Result<()>;

    async fn append_engagement(&self, event: &EngagementEvent) -> Result<()>;

    /// Successful sends by the user with `start <= at < end`
    async fn count_sent(&self, user: UserId, start: Timestamp, end: Timestamp) -> Result<u64>;

    /// Successful sends of the campaign with `start <= at < end`
    async fn count_campaign_sent(
        &self,
        campaign: CampaignId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<u64>;

    async fn sends_for_entry(&self, entry: EntryId) -> Result<Vec<SendRecord>>;

    async fn sends_for_campaign(&self, campaign: CampaignId) -> Result<Vec<SendRecord>>;

    async fn engagements(&self, campaign: CampaignId) -> Result<Vec<EngagementEvent>>;

    /// Engagement events on any of the user's campaigns since `since`
    async fn user_engagements(
        &self,
        user: UserId,
        since: Timestamp,
    ) -> Result<Vec<EngagementEvent>>;
}
