use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use cadence_common::{
    AbTest, AlertRule, Campaign, CampaignId, CampaignStatus, EngagementEvent, EntryId, Rollout,
    RuleId, ScheduleEntry, SendRecord, TestId, Timestamp, UserConfig, UserId,
};
use tokio::sync::Notify;

use super::memory::MemoryBackingStore;
use crate::{
    error::{Result, StoreError},
    r#trait::{BackingStore, EntryFilter, EventLog},
};

/// Testing wrapper around the memory store
///
/// Adds a switch that makes event-log reads fail as if the data were
/// temporarily unreachable, and lets tests wait for sends to be recorded.
#[derive(Debug, Clone, Default)]
pub struct TestBackingStore {
    inner: MemoryBackingStore,
    unavailable: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl TestBackingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn inner(&self) -> &MemoryBackingStore {
        &self.inner
    }

    /// Make event-log reads fail until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Wait until at least `expected` send records exist
    pub async fn wait_for_sends(&self, expected: usize, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.inner.send_count() >= expected {
                    return;
                }
                notified.await;
            }
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("Timeout waiting for sends: {e}")))
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("event log offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BackingStore for TestBackingStore {
    async fn put_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.inner.put_campaign(campaign).await
    }

    async fn campaign(&self, id: CampaignId) -> Result<Campaign> {
        self.inner.campaign(id).await
    }

    async fn campaigns(&self) -> Result<Vec<Campaign>> {
        self.inner.campaigns().await
    }

    async fn update_campaign_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<Option<Campaign>> {
        self.inner.update_campaign_status(id, from, to).await
    }

    async fn set_campaign_rollout(&self, id: CampaignId, rollout: Option<Rollout>) -> Result<()> {
        self.inner.set_campaign_rollout(id, rollout).await
    }

    async fn insert_entry(&self, entry: &ScheduleEntry) -> Result<Option<ScheduleEntry>> {
        self.inner.insert_entry(entry).await
    }

    async fn entry(&self, id: EntryId) -> Result<ScheduleEntry> {
        self.inner.entry(id).await
    }

    async fn entries(&self, filter: &EntryFilter) -> Result<Vec<ScheduleEntry>> {
        self.inner.entries(filter).await
    }

    async fn compare_and_swap_entry(&self, entry: &ScheduleEntry) -> Result<ScheduleEntry> {
        self.inner.compare_and_swap_entry(entry).await
    }

    async fn put_user(&self, user: &UserConfig) -> Result<()> {
        self.inner.put_user(user).await
    }

    async fn user(&self, id: UserId) -> Result<Option<UserConfig>> {
        self.inner.user(id).await
    }

    async fn insert_test(&self, test: &AbTest) -> Result<()> {
        self.inner.insert_test(test).await
    }

    async fn test(&self, id: TestId) -> Result<AbTest> {
        self.inner.test(id).await
    }

    async fn tests(&self) -> Result<Vec<AbTest>> {
        self.inner.tests().await
    }

    async fn compare_and_swap_test(&self, test: &AbTest) -> Result<AbTest> {
        self.inner.compare_and_swap_test(test).await
    }

    async fn put_alert_rule(&self, rule: &AlertRule) -> Result<()> {
        self.inner.put_alert_rule(rule).await
    }

    async fn alert_rules(&self, user: UserId) -> Result<Vec<AlertRule>> {
        self.inner.alert_rules(user).await
    }

    async fn delete_alert_rule(&self, id: RuleId) -> Result<()> {
        self.inner.delete_alert_rule(id).await
    }
}

#[async_trait]
impl EventLog for TestBackingStore {
    async fn append_send(&self, record: &SendRecord) -> Result<()> {
        self.inner.append_send(record).await?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn append_engagement(&self, event: &EngagementEvent) -> Result<()> {
        self.inner.append_engagement(event).await
    }

    async fn count_sent(&self, user: UserId, start: Timestamp, end: Timestamp) -> Result<u64> {
        self.check_available()?;
        self.inner.count_sent(user, start, end).await
    }

    async fn count_campaign_sent(
        &self,
        campaign: CampaignId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<u64> {
        self.check_available()?;
        self.inner.count_campaign_sent(campaign, start, end).await
    }

    async fn sends_for_entry(&self, entry: EntryId) -> Result<Vec<SendRecord>> {
        self.check_available()?;
        self.inner.sends_for_entry(entry).await
    }

    async fn sends_for_campaign(&self, campaign: CampaignId) -> Result<Vec<SendRecord>> {
        self.check_available()?;
        self.inner.sends_for_campaign(campaign).await
    }

    async fn engagements(&self, campaign: CampaignId) -> Result<Vec<EngagementEvent>> {
        self.check_available()?;
        self.inner.engagements(campaign).await
    }

    async fn user_engagements(
        &self,
        user: UserId,
        since: Timestamp,
    ) -> Result<Vec<EngagementEvent>> {
        self.check_available()?;
        self.inner.user_engagements(user, since).await
    }
}
