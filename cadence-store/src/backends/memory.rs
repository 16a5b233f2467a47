use std::{collections::BTreeMap, path::Path, sync::Arc};

use ahash::AHashMap;
use async_trait::async_trait;
use cadence_common::{
    AbTest, AlertRule, Campaign, CampaignId, CampaignStatus, EngagementEvent, EntryId,
    EntryStatus, Rollout, RuleId, ScheduleEntry, SendRecord, TestId, Timestamp, UserConfig,
    UserId, internal,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SerializationError, StoreError},
    r#trait::{BackingStore, EntryFilter, EventLog},
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    campaigns: AHashMap<CampaignId, Campaign>,
    entries: BTreeMap<EntryId, ScheduleEntry>,
    users: AHashMap<UserId, UserConfig>,
    tests: AHashMap<TestId, AbTest>,
    rules: BTreeMap<RuleId, AlertRule>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Log {
    sends: Vec<SendRecord>,
    engagements: Vec<EngagementEvent>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    tables: &'a Tables,
    log: &'a Log,
}

#[derive(Deserialize)]
struct Snapshot {
    tables: Tables,
    log: Log,
}

/// In-memory backing store and event log
///
/// Entities live in maps behind one `RwLock` and the event log behind
/// another, so appends never contend with entity writes. Every operation
/// completes under a single lock acquisition, which makes the
/// compare-and-swap and conditional-insert operations atomic.
///
/// The whole store can be written to and restored from a bincode snapshot.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackingStore {
    tables: Arc<RwLock<Tables>>,
    log: Arc<RwLock<Log>>,
}

impl MemoryBackingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in the send log
    #[must_use]
    pub fn send_count(&self) -> usize {
        self.log.read().sends.len()
    }

    /// Write a snapshot of every table and the event log to `path`
    pub async fn save(&self, path: &Path) -> Result<()> {
        let bytes = {
            let tables = self.tables.read();
            let log = self.log.read();
            bincode::serde::encode_to_vec(
                SnapshotRef {
                    tables: &*tables,
                    log: &*log,
                },
                bincode::config::legacy(),
            )
            .map_err(SerializationError::from)?
        };

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;

        internal!(
            level = DEBUG,
            "Wrote {} byte snapshot to {}",
            bytes.len(),
            path.display()
        );
        Ok(())
    }

    /// Restore a store from a snapshot written by [`Self::save`]
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let (snapshot, _): (Snapshot, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())
                .map_err(SerializationError::from)?;

        internal!(
            level = INFO,
            "Restored {} campaigns and {} entries from {}",
            snapshot.tables.campaigns.len(),
            snapshot.tables.entries.len(),
            path.display()
        );

        Ok(Self {
            tables: Arc::new(RwLock::new(snapshot.tables)),
            log: Arc::new(RwLock::new(snapshot.log)),
        })
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn put_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.tables
            .write()
            .campaigns
            .insert(campaign.id, campaign.clone());
        Ok(())
    }

    async fn campaign(&self, id: CampaignId) -> Result<Campaign> {
        self.tables
            .read()
            .campaigns
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Campaign", id))
    }

    async fn campaigns(&self) -> Result<Vec<Campaign>> {
        let mut campaigns: Vec<_> = self.tables.read().campaigns.values().cloned().collect();
        campaigns.sort_by_key(|c| c.id);
        Ok(campaigns)
    }

    async fn update_campaign_status(
        &self,
        id: CampaignId,
        from: &[CampaignStatus],
        to: CampaignStatus,
    ) -> Result<Option<Campaign>> {
        let mut tables = self.tables.write();
        let campaign = tables
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("Campaign", id))?;

        if !from.contains(&campaign.status) {
            return Ok(None);
        }

        campaign.status = to;
        Ok(Some(campaign.clone()))
    }

    async fn set_campaign_rollout(&self, id: CampaignId, rollout: Option<Rollout>) -> Result<()> {
        self.tables
            .write()
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("Campaign", id))?
            .rollout = rollout;
        Ok(())
    }

    async fn insert_entry(&self, entry: &ScheduleEntry) -> Result<Option<ScheduleEntry>> {
        let mut tables = self.tables.write();

        if tables.entries.contains_key(&entry.id) {
            return Err(StoreError::AlreadyExists {
                kind: "Entry",
                id: entry.id.to_string(),
            });
        }

        if let Some(existing) = tables.entries.values().find(|existing| {
            existing.campaign_id == entry.campaign_id
                && existing.occurrence == entry.occurrence
                && existing.status != EntryStatus::Skipped
        }) {
            return Ok(Some(existing.clone()));
        }

        tables.entries.insert(entry.id, entry.clone());
        Ok(None)
    }

    async fn entry(&self, id: EntryId) -> Result<ScheduleEntry> {
        self.tables
            .read()
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Entry", id))
    }

    async fn entries(&self, filter: &EntryFilter) -> Result<Vec<ScheduleEntry>> {
        let mut entries: Vec<_> = self
            .tables
            .read()
            .entries
            .values()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        entries.sort_by_key(|entry| (entry.scheduled_at, entry.id));
        Ok(entries)
    }

    async fn compare_and_swap_entry(&self, entry: &ScheduleEntry) -> Result<ScheduleEntry> {
        let mut tables = self.tables.write();
        let stored = tables
            .entries
            .get_mut(&entry.id)
            .ok_or_else(|| StoreError::not_found("Entry", entry.id))?;

        if stored.version != entry.version {
            return Err(StoreError::VersionConflict {
                kind: "Entry",
                id: entry.id.to_string(),
                expected: entry.version,
                found: stored.version,
            });
        }

        *stored = entry.clone();
        stored.version += 1;
        Ok(stored.clone())
    }

    async fn put_user(&self, user: &UserConfig) -> Result<()> {
        self.tables.write().users.insert(user.user_id, user.clone());
        Ok(())
    }

    async fn user(&self, id: UserId) -> Result<Option<UserConfig>> {
        Ok(self.tables.read().users.get(&id).cloned())
    }

    async fn insert_test(&self, test: &AbTest) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.tests.contains_key(&test.id) {
            return Err(StoreError::AlreadyExists {
                kind: "Test",
                id: test.id.to_string(),
            });
        }
        tables.tests.insert(test.id, test.clone());
        Ok(())
    }

    async fn test(&self, id: TestId) -> Result<AbTest> {
        self.tables
            .read()
            .tests
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Test", id))
    }

    async fn tests(&self) -> Result<Vec<AbTest>> {
        let mut tests: Vec<_> = self.tables.read().tests.values().cloned().collect();
        tests.sort_by_key(|t| t.id);
        Ok(tests)
    }

    async fn compare_and_swap_test(&self, test: &AbTest) -> Result<AbTest> {
        let mut tables = self.tables.write();
        let stored = tables
            .tests
            .get_mut(&test.id)
            .ok_or_else(|| StoreError::not_found("Test", test.id))?;

        if stored.version != test.version {
            return Err(StoreError::VersionConflict {
                kind: "Test",
                id: test.id.to_string(),
                expected: test.version,
                found: stored.version,
            });
        }

        *stored = test.clone();
        stored.version += 1;
        Ok(stored.clone())
    }

    async fn put_alert_rule(&self, rule: &AlertRule) -> Result<()> {
        self.tables.write().rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn alert_rules(&self, user: UserId) -> Result<Vec<AlertRule>> {
        Ok(self
            .tables
            .read()
            .rules
            .values()
            .filter(|rule| rule.user_id == user)
            .cloned()
            .collect())
    }

    async fn delete_alert_rule(&self, id: RuleId) -> Result<()> {
        self.tables
            .write()
            .rules
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("Alert rule", id))
    }
}

#[async_trait]
impl EventLog for MemoryBackingStore {
    async fn append_send(&self, record: &SendRecord) -> Result<()> {
        self.log.write().sends.push(record.clone());
        Ok(())
    }

    async fn append_engagement(&self, event: &EngagementEvent) -> Result<()> {
        self.log.write().engagements.push(event.clone());
        Ok(())
    }

    async fn count_sent(&self, user: UserId, start: Timestamp, end: Timestamp) -> Result<u64> {
        Ok(self
            .log
            .read()
            .sends
            .iter()
            .filter(|r| {
                r.user_id == user && r.outcome.is_sent() && (start..end).contains(&r.at)
            })
            .count() as u64)
    }

    async fn count_campaign_sent(
        &self,
        campaign: CampaignId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<u64> {
        Ok(self
            .log
            .read()
            .sends
            .iter()
            .filter(|r| {
                r.campaign_id == campaign && r.outcome.is_sent() && (start..end).contains(&r.at)
            })
            .count() as u64)
    }

    async fn sends_for_entry(&self, entry: EntryId) -> Result<Vec<SendRecord>> {
        Ok(self
            .log
            .read()
            .sends
            .iter()
            .filter(|r| r.entry_id == entry)
            .cloned()
            .collect())
    }

    async fn sends_for_campaign(&self, campaign: CampaignId) -> Result<Vec<SendRecord>> {
        Ok(self
            .log
            .read()
            .sends
            .iter()
            .filter(|r| r.campaign_id == campaign)
            .cloned()
            .collect())
    }

    async fn engagements(&self, campaign: CampaignId) -> Result<Vec<EngagementEvent>> {
        Ok(self
            .log
            .read()
            .engagements
            .iter()
            .filter(|e| e.campaign_id == campaign)
            .cloned()
            .collect())
    }

    async fn user_engagements(
        &self,
        user: UserId,
        since: Timestamp,
    ) -> Result<Vec<EngagementEvent>> {
        let campaigns: Vec<CampaignId> = self
            .tables
            .read()
            .campaigns
            .values()
            .filter(|c| c.user_id == user)
            .map(|c| c.id)
            .collect();

        Ok(self
            .log
            .read()
            .engagements
            .iter()
            .filter(|e| e.at >= since && campaigns.contains(&e.campaign_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use cadence_common::{EntryKind, PlanTier, RecipientId, SendId, SendOutcome};
    use pretty_assertions::assert_eq;

    use super::*;

    fn entry(campaign_id: CampaignId, occurrence: &str) -> ScheduleEntry {
        ScheduleEntry::new(campaign_id, 1_000, EntryKind::Scheduled, occurrence, 0)
    }

    fn sent(user_id: UserId, campaign_id: CampaignId, at: Timestamp, ok: bool) -> SendRecord {
        SendRecord {
            id: SendId::generate(),
            user_id,
            campaign_id,
            entry_id: EntryId::generate(),
            recipient_id: RecipientId::new("r"),
            variant_id: None,
            outcome: if ok {
                SendOutcome::Sent
            } else {
                SendOutcome::Failed {
                    error: "boom".to_string(),
                    permanent: false,
                }
            },
            attempt: 1,
            provider_message_id: None,
            at,
            next_retry_at: None,
        }
    }

    #[tokio::test]
    async fn duplicate_occurrences_return_the_existing_entry() {
        let store = MemoryBackingStore::new();
        let campaign_id = CampaignId::generate();

        let first = entry(campaign_id, "once");
        assert!(store.insert_entry(&first).await.unwrap().is_none());

        let existing = store
            .insert_entry(&entry(campaign_id, "once"))
            .await
            .unwrap()
            .expect("duplicate should be rejected");
        assert_eq!(existing.id, first.id);
    }

    #[tokio::test]
    async fn skipped_occurrences_may_be_rematerialised() {
        let store = MemoryBackingStore::new();
        let campaign_id = CampaignId::generate();

        let mut first = entry(campaign_id, "once");
        store.insert_entry(&first).await.unwrap();
        first.status = EntryStatus::Skipped;
        store.compare_and_swap_entry(&first).await.unwrap();

        assert!(
            store
                .insert_entry(&entry(campaign_id, "once"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn stale_versions_lose_the_compare_and_swap() {
        let store = MemoryBackingStore::new();
        let original = entry(CampaignId::generate(), "once");
        store.insert_entry(&original).await.unwrap();

        let mut winner = original.clone();
        winner.status = EntryStatus::Processed;
        let stored = store.compare_and_swap_entry(&winner).await.unwrap();
        assert_eq!(stored.version, 1);

        let mut loser = original;
        loser.status = EntryStatus::Skipped;
        let err = store.compare_and_swap_entry(&loser).await.unwrap_err();
        assert!(err.is_conflict());

        let current = store.entry(stored.id).await.unwrap();
        assert_eq!(current.status, EntryStatus::Processed);
    }

    #[tokio::test]
    async fn status_updates_are_guarded() {
        let store = MemoryBackingStore::new();
        let mut campaign = Campaign::new(UserId::generate(), "news", vec!["a".to_string()]);
        campaign.status = CampaignStatus::Stopped;
        store.put_campaign(&campaign).await.unwrap();

        let updated = store
            .update_campaign_status(
                campaign.id,
                &[CampaignStatus::Scheduled, CampaignStatus::Sending],
                CampaignStatus::Paused,
            )
            .await
            .unwrap();
        assert!(updated.is_none());
        assert_eq!(
            store.campaign(campaign.id).await.unwrap().status,
            CampaignStatus::Stopped
        );
    }

    #[tokio::test]
    async fn only_successful_sends_inside_the_window_count() {
        let store = MemoryBackingStore::new();
        let user = UserId::generate();
        let campaign = CampaignId::generate();

        store.append_send(&sent(user, campaign, 100, true)).await.unwrap();
        store.append_send(&sent(user, campaign, 150, false)).await.unwrap();
        store.append_send(&sent(user, campaign, 200, true)).await.unwrap();
        store
            .append_send(&sent(UserId::generate(), campaign, 120, true))
            .await
            .unwrap();

        assert_eq!(store.count_sent(user, 100, 200).await.unwrap(), 1);
        assert_eq!(store.count_sent(user, 0, 1_000).await.unwrap(), 2);
        assert_eq!(store.count_campaign_sent(campaign, 0, 1_000).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn snapshots_restore_every_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.snapshot");

        let store = MemoryBackingStore::new();
        let user = UserConfig::new(UserId::generate(), PlanTier::Pro);
        let campaign = Campaign::new(user.user_id, "news", vec!["a".to_string()]);
        let scheduled = entry(campaign.id, "once");
        store.put_user(&user).await.unwrap();
        store.put_campaign(&campaign).await.unwrap();
        store.insert_entry(&scheduled).await.unwrap();
        store
            .append_send(&sent(user.user_id, campaign.id, 10, true))
            .await
            .unwrap();

        store.save(&path).await.unwrap();
        let restored = MemoryBackingStore::load(&path).await.unwrap();

        assert_eq!(restored.campaign(campaign.id).await.unwrap(), campaign);
        assert_eq!(restored.entry(scheduled.id).await.unwrap(), scheduled);
        assert_eq!(restored.user(user.user_id).await.unwrap(), Some(user));
        assert_eq!(restored.send_count(), 1);
    }
}
