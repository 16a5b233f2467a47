//! The schedule entry state machine
//!
//! Entries move only from `pending` to one of `processed`, `skipped` or
//! `failed`. Every write goes through compare-and-swap on the entry's
//! version; a writer that finds the entry already terminal treats its
//! attempt as a successful no-op.

use std::sync::Arc;

use ahash::AHashMap;
use cadence_common::{
    Campaign, CampaignId, CampaignStatus, ConfigError, EntryId, EntryKind, EntryStatus,
    ScheduleEntry, ScheduleSettings, TestStatus, Timestamp, UserId, internal,
};
use serde::{Deserialize, Serialize};

use crate::{
    config::ScheduleConfig,
    error::{ScheduleError, StoreError},
    recurrence::{is_recurring_key, occurrence_key, occurrences_after},
    r#trait::{BackingStore, EntryFilter},
};

/// Outcome of a transition request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transition {
    Applied,
    /// The entry was already terminal and has not been changed
    NoOp { current: EntryStatus },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Active campaigns examined
    pub campaigns: usize,
    /// Entries materialised
    pub created: usize,
}

/// A schedule entry joined with a summary of its campaign
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySummary {
    pub entry: ScheduleEntry,
    pub campaign_name: String,
    pub campaign_status: CampaignStatus,
    pub user_id: UserId,
}

const IMMEDIATE: &str = "immediate";
const ONCE: &str = "once";

#[derive(Debug, Clone)]
pub struct ScheduleStore {
    store: Arc<dyn BackingStore>,
    config: ScheduleConfig,
}

impl ScheduleStore {
    #[must_use]
    pub fn new(store: Arc<dyn BackingStore>, config: ScheduleConfig) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub const fn backing(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Validate a campaign's schedule, mark it scheduled and materialise
    /// its first occurrence(s). Pending occurrences from an earlier schedule
    /// of the same campaign are skipped.
    #[tracing::instrument(skip(self, campaign), fields(campaign_id = %campaign.id))]
    pub async fn schedule_campaign(
        &self,
        mut campaign: Campaign,
        now: Timestamp,
    ) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        validate(&campaign, now)?;

        match self.store.campaign(campaign.id).await {
            Ok(existing) if existing.status.is_final() => {
                return Err(ScheduleError::InvalidState {
                    campaign_id: existing.id,
                    status: existing.status,
                });
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }

        campaign.status = CampaignStatus::Scheduled;
        self.store.put_campaign(&campaign).await?;

        let replaced = self
            .skip_pending(campaign.id, |entry| entry.kind == EntryKind::Scheduled)
            .await?;
        if replaced > 0 {
            internal!(
                level = DEBUG,
                campaign_id = %campaign.id,
                "Skipped {replaced} pending entries from the previous schedule"
            );
        }

        self.sync_campaign(&campaign, now).await
    }

    /// Create a single entry for a campaign. `None` sends immediately.
    pub async fn create_entry(
        &self,
        campaign_id: CampaignId,
        scheduled_at: Option<Timestamp>,
        now: Timestamp,
    ) -> Result<ScheduleEntry, ScheduleError> {
        let campaign = self.store.campaign(campaign_id).await?;
        if campaign.status.is_final() || campaign.status == CampaignStatus::Paused {
            return Err(ScheduleError::InvalidState {
                campaign_id,
                status: campaign.status,
            });
        }

        let at = match scheduled_at {
            Some(at) if at < now => {
                return Err(ConfigError::ScheduledInPast {
                    scheduled_at: at,
                    now,
                }
                .into());
            }
            Some(at) => at,
            None => now,
        };

        self.store
            .update_campaign_status(
                campaign_id,
                &[CampaignStatus::Draft],
                CampaignStatus::Scheduled,
            )
            .await?;

        self.ensure_entry(
            campaign_id,
            EntryKind::Scheduled,
            format!("manual:{at}"),
            at,
            now,
        )
        .await
    }

    /// Create the entry for a logical occurrence unless a live entry for it
    /// already exists, returning whichever entry now represents it.
    pub async fn ensure_entry(
        &self,
        campaign_id: CampaignId,
        kind: EntryKind,
        occurrence: String,
        at: Timestamp,
        now: Timestamp,
    ) -> Result<ScheduleEntry, ScheduleError> {
        Ok(self
            .materialise(campaign_id, kind, occurrence, at, now)
            .await?
            .unwrap_or_else(|existing| existing))
    }

    /// `Ok(entry)` when created, `Err(existing)` when the occurrence was
    /// already materialised
    async fn materialise(
        &self,
        campaign_id: CampaignId,
        kind: EntryKind,
        occurrence: String,
        at: Timestamp,
        now: Timestamp,
    ) -> Result<Result<ScheduleEntry, ScheduleEntry>, StoreError> {
        let entry = ScheduleEntry::new(campaign_id, at, kind, occurrence, now);
        match self.store.insert_entry(&entry).await? {
            Some(existing) => Ok(Err(existing)),
            None => {
                internal!(
                    level = DEBUG,
                    campaign_id = %campaign_id,
                    entry_id = %entry.id,
                    "Materialised occurrence {} at {at}",
                    entry.occurrence
                );
                Ok(Ok(entry))
            }
        }
    }

    /// Reconcile every active campaign's schedule with its entries.
    ///
    /// Idempotent: each logical occurrence maps to one occurrence key, and a
    /// key that already has a live entry is never materialised again.
    #[tracing::instrument(skip(self))]
    pub async fn sync_campaign_schedules(
        &self,
        now: Timestamp,
    ) -> Result<SyncReport, ScheduleError> {
        let mut report = SyncReport::default();

        for campaign in self.store.campaigns().await? {
            if !campaign.status.is_active() {
                continue;
            }

            report.campaigns += 1;
            match self.sync_campaign(&campaign, now).await {
                Ok(created) => report.created += created.len(),
                Err(ScheduleError::Config(err)) => {
                    internal!(
                        level = WARN,
                        campaign_id = %campaign.id,
                        "Schedule cannot be expanded: {err}"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        if report.created > 0 {
            internal!(
                level = INFO,
                "Sync created {} entries across {} campaigns",
                report.created,
                report.campaigns
            );
        }

        Ok(report)
    }

    /// Whether the campaign's occurrences are delivered through A/B variant
    /// entries. A test that has started takes over the single occurrence of
    /// a one-off campaign for good; recurring campaigns resume once it ends.
    async fn under_test(&self, campaign: &Campaign) -> Result<bool, StoreError> {
        let recurring = matches!(campaign.schedule, ScheduleSettings::Recurring(_));
        Ok(self.store.tests().await?.iter().any(|test| {
            test.campaign_id == campaign.id
                && match test.status {
                    TestStatus::Active | TestStatus::Paused => true,
                    TestStatus::Completed => !recurring,
                    TestStatus::Draft => false,
                }
        }))
    }

    async fn sync_campaign(
        &self,
        campaign: &Campaign,
        now: Timestamp,
    ) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        if self.under_test(campaign).await? {
            internal!(campaign_id = %campaign.id, "Campaign is under test, not materialising");
            return Ok(Vec::new());
        }

        let created = match &campaign.schedule {
            ScheduleSettings::Immediate => self
                .materialise(campaign.id, EntryKind::Scheduled, IMMEDIATE.to_string(), now, now)
                .await?
                .into_iter()
                .collect(),
            ScheduleSettings::Once { at } => self
                .materialise(
                    campaign.id,
                    EntryKind::Scheduled,
                    ONCE.to_string(),
                    (*at).max(now),
                    now,
                )
                .await?
                .into_iter()
                .collect(),
            ScheduleSettings::Recurring(rule) => {
                let filter = EntryFilter {
                    kind: Some(EntryKind::Scheduled),
                    ..EntryFilter::campaign(campaign.id)
                };
                let live: Vec<_> = self
                    .store
                    .entries(&filter)
                    .await?
                    .into_iter()
                    .filter(|e| e.status != EntryStatus::Skipped && is_recurring_key(&e.occurrence))
                    .collect();

                let pending = live
                    .iter()
                    .filter(|e| e.status == EntryStatus::Pending)
                    .count();
                let missing = self.config.horizon.saturating_sub(pending);
                if missing == 0 {
                    return Ok(Vec::new());
                }

                let after = live
                    .iter()
                    .map(|e| e.scheduled_at)
                    .max()
                    .map_or(now, |latest| latest.max(now));

                let mut created = Vec::with_capacity(missing);
                for at in occurrences_after(rule, after, missing)? {
                    if let Ok(entry) = self
                        .materialise(campaign.id, EntryKind::Scheduled, occurrence_key(at), at, now)
                        .await?
                    {
                        created.push(entry);
                    }
                }
                created
            }
        };

        Ok(created)
    }

    /// Apply a state machine transition to an entry.
    ///
    /// Losing a race to a concurrent writer is resolved by re-reading the
    /// entry: if it became terminal the attempt is a no-op.
    pub async fn transition(
        &self,
        entry_id: EntryId,
        next: EntryStatus,
        recipient_count: Option<u64>,
        actual_sent_at: Option<Timestamp>,
    ) -> Result<Transition, ScheduleError> {
        loop {
            let mut entry = self.store.entry(entry_id).await?;

            if entry.status.is_terminal() {
                internal!(
                    entry_id = %entry_id,
                    "Ignoring transition to {next}, entry is already {}",
                    entry.status
                );
                return Ok(Transition::NoOp {
                    current: entry.status,
                });
            }

            if !entry.status.can_transition_to(next) {
                return Err(ScheduleError::InvalidTransition {
                    entry_id,
                    from: entry.status,
                    to: next,
                });
            }

            entry.status = next;
            if recipient_count.is_some() {
                entry.recipient_count = recipient_count;
            }
            if actual_sent_at.is_some() {
                entry.actual_sent_at = actual_sent_at;
            }

            match self.store.compare_and_swap_entry(&entry).await {
                Ok(_) => {
                    internal!(level = DEBUG, entry_id = %entry_id, "Entry is now {next}");
                    return Ok(Transition::Applied);
                }
                Err(err) if err.is_conflict() => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Skip every pending entry of the campaign accepted by `predicate`,
    /// returning how many this call moved to `skipped`
    pub async fn skip_pending<F>(
        &self,
        campaign_id: CampaignId,
        predicate: F,
    ) -> Result<usize, ScheduleError>
    where
        F: Fn(&ScheduleEntry) -> bool + Send + Sync,
    {
        let filter = EntryFilter::campaign(campaign_id).with_status(EntryStatus::Pending);
        let mut skipped = 0;

        for entry in self.store.entries(&filter).await? {
            if predicate(&entry)
                && self
                    .transition(entry.id, EntryStatus::Skipped, Some(0), None)
                    .await?
                    == Transition::Applied
            {
                skipped += 1;
            }
        }

        Ok(skipped)
    }

    /// Pause a campaign: it stops materialising occurrences and the pending
    /// entries accepted by `predicate` are skipped
    #[tracing::instrument(skip(self, predicate))]
    pub async fn pause<F>(
        &self,
        campaign_id: CampaignId,
        predicate: F,
    ) -> Result<usize, ScheduleError>
    where
        F: Fn(&ScheduleEntry) -> bool + Send + Sync,
    {
        self.halt(
            campaign_id,
            &[CampaignStatus::Scheduled, CampaignStatus::Sending],
            CampaignStatus::Paused,
            predicate,
        )
        .await
    }

    /// Entries rejected by `predicate` stay pending for whoever is working them
    #[tracing::instrument(skip(self, predicate))]
    pub async fn cancel<F>(
        &self,
        campaign_id: CampaignId,
        predicate: F,
    ) -> Result<usize, ScheduleError>
    where
        F: Fn(&ScheduleEntry) -> bool + Send + Sync,
    {
        self.halt(
            campaign_id,
            &[
                CampaignStatus::Draft,
                CampaignStatus::Scheduled,
                CampaignStatus::Sending,
                CampaignStatus::Paused,
            ],
            CampaignStatus::Cancelled,
            predicate,
        )
        .await
    }

    async fn halt<F>(
        &self,
        campaign_id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
        predicate: F,
    ) -> Result<usize, ScheduleError>
    where
        F: Fn(&ScheduleEntry) -> bool + Send + Sync,
    {
        if self
            .store
            .update_campaign_status(campaign_id, from, to)
            .await?
            .is_none()
        {
            let campaign = self.store.campaign(campaign_id).await?;
            if campaign.status != to {
                return Err(ScheduleError::InvalidState {
                    campaign_id,
                    status: campaign.status,
                });
            }
        }

        let skipped = self.skip_pending(campaign_id, predicate).await?;
        internal!(
            level = INFO,
            campaign_id = %campaign_id,
            "Campaign is now {to:?}, skipped {skipped} pending entries"
        );
        Ok(skipped)
    }

    /// Resume a paused campaign and re-materialise its schedule
    #[tracing::instrument(skip(self))]
    pub async fn resume(
        &self,
        campaign_id: CampaignId,
        now: Timestamp,
    ) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        let Some(campaign) = self
            .store
            .update_campaign_status(
                campaign_id,
                &[CampaignStatus::Paused],
                CampaignStatus::Scheduled,
            )
            .await?
        else {
            let campaign = self.store.campaign(campaign_id).await?;
            return Err(ScheduleError::InvalidState {
                campaign_id,
                status: campaign.status,
            });
        };

        self.sync_campaign(&campaign, now).await
    }

    /// Entries matching `filter`, each with its campaign summary
    pub async fn list_entries(
        &self,
        filter: &EntryFilter,
    ) -> Result<Vec<EntrySummary>, ScheduleError> {
        let mut campaigns: AHashMap<CampaignId, Campaign> = AHashMap::new();
        let mut summaries = Vec::new();

        for entry in self.store.entries(filter).await? {
            if !campaigns.contains_key(&entry.campaign_id) {
                match self.store.campaign(entry.campaign_id).await {
                    Ok(campaign) => {
                        campaigns.insert(campaign.id, campaign);
                    }
                    Err(err) if err.is_not_found() => continue,
                    Err(err) => return Err(err.into()),
                }
            }

            if let Some(campaign) = campaigns.get(&entry.campaign_id) {
                summaries.push(EntrySummary {
                    campaign_name: campaign.name.clone(),
                    campaign_status: campaign.status,
                    user_id: campaign.user_id,
                    entry,
                });
            }
        }

        Ok(summaries)
    }
}

/// Configuration checks made before anything is persisted
fn validate(campaign: &Campaign, now: Timestamp) -> Result<(), ConfigError> {
    if campaign.tags.is_empty() {
        return Err(ConfigError::EmptyAudience);
    }

    if let Some(rate) = &campaign.send.send_rate {
        rate.validate()?;
    }

    match &campaign.schedule {
        ScheduleSettings::Immediate => Ok(()),
        ScheduleSettings::Once { at } if *at < now => Err(ConfigError::ScheduledInPast {
            scheduled_at: *at,
            now,
        }),
        ScheduleSettings::Once { .. } => Ok(()),
        ScheduleSettings::Recurring(rule) => rule.validate(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use cadence_common::{RecurrenceRule, time::DAY_MS};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::backends::MemoryBackingStore;

    const NOW: Timestamp = 1_773_100_800_000; // 2026-03-10 00:00 UTC

    fn schedule_store() -> ScheduleStore {
        ScheduleStore::new(
            Arc::new(MemoryBackingStore::new()),
            ScheduleConfig::default(),
        )
    }

    fn campaign(schedule: ScheduleSettings) -> Campaign {
        let mut campaign = Campaign::new(UserId::generate(), "spring", vec!["news".to_string()]);
        campaign.schedule = schedule;
        campaign
    }

    #[tokio::test]
    async fn empty_audiences_are_rejected_before_persisting() {
        let store = schedule_store();
        let mut campaign = campaign(ScheduleSettings::Immediate);
        campaign.tags.clear();

        let err = store
            .schedule_campaign(campaign.clone(), NOW)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::Config(ConfigError::EmptyAudience)
        ));
        assert!(store.backing().campaign(campaign.id).await.is_err());
    }

    #[tokio::test]
    async fn one_time_sends_in_the_past_are_rejected() {
        let store = schedule_store();
        let err = store
            .schedule_campaign(campaign(ScheduleSettings::Once { at: NOW - 1 }), NOW)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::Config(ConfigError::ScheduledInPast { .. })
        ));
    }

    #[tokio::test]
    async fn immediate_entries_are_due_now() {
        let store = schedule_store();
        let created = store
            .schedule_campaign(campaign(ScheduleSettings::Immediate), NOW)
            .await
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].scheduled_at, NOW);
        assert_eq!(created[0].status, EntryStatus::Pending);
    }

    #[tokio::test]
    async fn manual_entries_reject_past_times() {
        let store = schedule_store();
        let campaign = campaign(ScheduleSettings::Immediate);
        store.schedule_campaign(campaign.clone(), NOW).await.unwrap();

        assert!(store.create_entry(campaign.id, Some(NOW - 5), NOW).await.is_err());
        let entry = store.create_entry(campaign.id, None, NOW).await.unwrap();
        assert_eq!(entry.scheduled_at, NOW);
    }

    #[tokio::test]
    async fn recurring_campaigns_fill_the_horizon_once() {
        let store = schedule_store();
        let campaign = campaign(ScheduleSettings::Recurring(RecurrenceRule::daily("UTC", 9)));

        let created = store.schedule_campaign(campaign.clone(), NOW).await.unwrap();
        assert_eq!(created.len(), 3);

        let before = store
            .backing()
            .entries(&EntryFilter::campaign(campaign.id))
            .await
            .unwrap();

        let first = store.sync_campaign_schedules(NOW).await.unwrap();
        let second = store.sync_campaign_schedules(NOW).await.unwrap();
        assert_eq!(first.created, 0);
        assert_eq!(second.created, 0);

        let after = store
            .backing()
            .entries(&EntryFilter::campaign(campaign.id))
            .await
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn sync_tops_up_after_an_occurrence_completes() {
        let store = schedule_store();
        let campaign = campaign(ScheduleSettings::Recurring(RecurrenceRule::daily("UTC", 9)));
        let created = store.schedule_campaign(campaign.clone(), NOW).await.unwrap();

        store
            .transition(created[0].id, EntryStatus::Processed, Some(10), Some(NOW))
            .await
            .unwrap();

        let report = store.sync_campaign_schedules(NOW + DAY_MS).await.unwrap();
        assert_eq!(report.created, 1);

        let pending = store
            .backing()
            .entries(&EntryFilter::campaign(campaign.id).with_status(EntryStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().all(|e| e.scheduled_at > created[0].scheduled_at));
    }

    #[tokio::test]
    async fn terminal_entries_never_change() {
        let store = schedule_store();
        let created = store
            .schedule_campaign(campaign(ScheduleSettings::Immediate), NOW)
            .await
            .unwrap();
        let id = created[0].id;

        assert_eq!(
            store
                .transition(id, EntryStatus::Processed, Some(3), Some(NOW))
                .await
                .unwrap(),
            Transition::Applied
        );

        for next in [EntryStatus::Skipped, EntryStatus::Failed, EntryStatus::Processed] {
            assert_eq!(
                store.transition(id, next, Some(0), None).await.unwrap(),
                Transition::NoOp {
                    current: EntryStatus::Processed
                }
            );
        }

        let entry = store.backing().entry(id).await.unwrap();
        assert_eq!(entry.status, EntryStatus::Processed);
        assert_eq!(entry.recipient_count, Some(3));
    }

    #[tokio::test]
    async fn pause_skips_only_pending_entries() {
        let store = schedule_store();
        let campaign = campaign(ScheduleSettings::Recurring(RecurrenceRule::daily("UTC", 9)));
        let created = store.schedule_campaign(campaign.clone(), NOW).await.unwrap();
        store
            .transition(created[0].id, EntryStatus::Processed, Some(1), Some(NOW))
            .await
            .unwrap();

        assert_eq!(store.pause(campaign.id, |_| true).await.unwrap(), 2);
        assert_eq!(
            store.backing().entry(created[0].id).await.unwrap().status,
            EntryStatus::Processed
        );
        assert_eq!(
            store.backing().campaign(campaign.id).await.unwrap().status,
            CampaignStatus::Paused
        );

        // a paused campaign is not synced
        assert_eq!(store.sync_campaign_schedules(NOW).await.unwrap().created, 0);
    }

    #[tokio::test]
    async fn resume_rematerialises_skipped_occurrences() {
        let store = schedule_store();
        let campaign = campaign(ScheduleSettings::Once { at: NOW + DAY_MS });
        store.schedule_campaign(campaign.clone(), NOW).await.unwrap();
        store.pause(campaign.id, |_| true).await.unwrap();

        let created = store.resume(campaign.id, NOW).await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].scheduled_at, NOW + DAY_MS);
        assert_eq!(
            store.backing().campaign(campaign.id).await.unwrap().status,
            CampaignStatus::Scheduled
        );
    }

    #[tokio::test]
    async fn cancelled_campaigns_cannot_resume() {
        let store = schedule_store();
        let campaign = campaign(ScheduleSettings::Immediate);
        store.schedule_campaign(campaign.clone(), NOW).await.unwrap();
        store.cancel(campaign.id, |_| true).await.unwrap();

        assert!(matches!(
            store.resume(campaign.id, NOW).await,
            Err(ScheduleError::InvalidState {
                status: CampaignStatus::Cancelled,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn cancel_leaves_rejected_entries_pending() {
        let store = schedule_store();
        let campaign = campaign(ScheduleSettings::Recurring(RecurrenceRule::daily("UTC", 9)));
        let created = store.schedule_campaign(campaign.clone(), NOW).await.unwrap();
        let working = created[0].id;

        let skipped = store
            .cancel(campaign.id, |entry| entry.id != working)
            .await
            .unwrap();
        assert_eq!(skipped, created.len() - 1);
        assert_eq!(
            store.backing().entry(working).await.unwrap().status,
            EntryStatus::Pending
        );
        assert_eq!(
            store.backing().campaign(campaign.id).await.unwrap().status,
            CampaignStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn listed_entries_carry_their_campaign() {
        let store = schedule_store();
        let campaign = campaign(ScheduleSettings::Immediate);
        store.schedule_campaign(campaign.clone(), NOW).await.unwrap();

        let listed = store
            .list_entries(&EntryFilter::default().with_status(EntryStatus::Pending))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].campaign_name, "spring");
        assert_eq!(listed[0].campaign_status, CampaignStatus::Scheduled);
    }

    #[tokio::test]
    async fn campaigns_under_test_are_not_materialised() {
        let store = schedule_store();
        let mut campaign = campaign(ScheduleSettings::Immediate);
        campaign.status = CampaignStatus::Scheduled;
        store.backing().put_campaign(&campaign).await.unwrap();

        let mut test = cadence_common::AbTest::new(
            campaign.id,
            "subject",
            Vec::new(),
            cadence_common::TestConfiguration::default(),
            NOW,
        );
        test.status = TestStatus::Active;
        store.backing().insert_test(&test).await.unwrap();

        let report = store.sync_campaign_schedules(NOW).await.unwrap();
        assert_eq!(report.created, 0);

        test.status = TestStatus::Completed;
        store.backing().compare_and_swap_test(&test).await.unwrap();
        let report = store.sync_campaign_schedules(NOW).await.unwrap();
        assert_eq!(report.created, 0, "the test consumed the one-off send");
    }
}
