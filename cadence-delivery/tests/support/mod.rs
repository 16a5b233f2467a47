//! Shared harness for the delivery integration tests
#![allow(dead_code)] // Test utility module - not all helpers are used in every test

pub mod mock_transport;

use std::sync::Arc;

use cadence_common::{
    Campaign, CampaignStatus, ContactDirectory, EntryKind, PassthroughRenderer, PlanTier,
    Recipient, ScheduleEntry, ScheduleSettings, Timestamp, UserConfig, UserId,
};
use cadence_delivery::{DeliveryContext, DeliveryProcessor};
use cadence_store::{BackingStore, MemoryBackingStore, ScheduleConfig, ScheduleStore};
use mock_transport::MockTransport;

pub struct Harness {
    pub store: MemoryBackingStore,
    pub schedule: ScheduleStore,
    pub contacts: Arc<ContactDirectory>,
    pub transport: Arc<MockTransport>,
    pub processor: DeliveryProcessor,
}

impl Harness {
    pub fn new(transport: MockTransport) -> Self {
        Self::with_processor(transport, DeliveryProcessor::default())
    }

    pub fn with_processor(transport: MockTransport, mut processor: DeliveryProcessor) -> Self {
        let store = MemoryBackingStore::default();
        let schedule = ScheduleStore::new(Arc::new(store.clone()), ScheduleConfig::default());
        let contacts = Arc::new(ContactDirectory::new());
        let transport = Arc::new(transport);

        processor
            .init(DeliveryContext {
                schedule: schedule.clone(),
                log: Arc::new(store.clone()),
                contacts: contacts.clone(),
                transport: transport.clone(),
                renderer: Arc::new(PassthroughRenderer),
                plans: None,
            })
            .expect("processor initialises");

        Self {
            store,
            schedule,
            contacts,
            transport,
            processor,
        }
    }

    /// Add `count` contacts tagged `tag`, named `<tag>-<n>`
    pub fn add_recipients(&self, tag: &str, count: usize) -> Vec<Recipient> {
        (0..count)
            .map(|n| {
                let recipient =
                    Recipient::new(format!("{tag}-{n}"), format!("{tag}-{n}@example.com"));
                self.contacts.insert(recipient.clone(), &[tag]);
                recipient
            })
            .collect()
    }

    pub async fn user(&self, plan: PlanTier) -> UserId {
        let user = UserConfig::new(UserId::generate(), plan);
        self.store.put_user(&user).await.expect("user stored");
        user.user_id
    }

    /// A one-time campaign already accepted by the scheduler
    pub async fn campaign(&self, user: UserId, tag: &str, at: Timestamp) -> Campaign {
        let mut campaign = Campaign::new(user, format!("{tag} campaign"), vec![tag.to_string()]);
        campaign.schedule = ScheduleSettings::Once { at };
        campaign.status = CampaignStatus::Scheduled;
        self.store.put_campaign(&campaign).await.expect("campaign stored");
        campaign
    }

    pub async fn entry(&self, campaign: &Campaign, at: Timestamp, now: Timestamp) -> ScheduleEntry {
        self.entry_of_kind(campaign, EntryKind::Scheduled, at, now).await
    }

    pub async fn entry_of_kind(
        &self,
        campaign: &Campaign,
        kind: EntryKind,
        at: Timestamp,
        now: Timestamp,
    ) -> ScheduleEntry {
        let entry = ScheduleEntry::new(campaign.id, at, kind, format!("manual:{at}"), now);
        let existing = self.store.insert_entry(&entry).await.expect("entry stored");
        assert!(existing.is_none(), "occurrence already materialised");
        entry
    }

    pub async fn reload(&self, entry: &ScheduleEntry) -> ScheduleEntry {
        self.store.entry(entry.id).await.expect("entry exists")
    }
}
