//! Shared harness for the monitor integration tests
#![allow(dead_code)] // Test utility module - not all helpers are used in every test

use std::sync::Arc;

use cadence_common::{
    Campaign, CampaignStatus, ContactDirectory, EngagementEvent, EngagementKind, EntryId,
    LoggingTransport, PassthroughRenderer, RecipientId, SendId, SendOutcome, SendRecord,
    Timestamp, UserId,
};
use cadence_delivery::{DeliveryContext, DeliveryProcessor};
use cadence_monitor::{Monitor, MonitorContext};
use cadence_store::{BackingStore, EventLog, ScheduleConfig, ScheduleStore, TestBackingStore};

pub const NOW: Timestamp = 1_780_000_000_000;

pub struct Harness {
    pub store: TestBackingStore,
    pub monitor: Monitor,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(Monitor::default())
    }

    pub fn with(mut monitor: Monitor) -> Self {
        let store = TestBackingStore::new();
        let schedule = ScheduleStore::new(Arc::new(store.clone()), ScheduleConfig::default());

        let mut processor = DeliveryProcessor::default();
        processor
            .init(DeliveryContext {
                schedule,
                log: Arc::new(store.clone()),
                contacts: Arc::new(ContactDirectory::new()),
                transport: Arc::new(LoggingTransport),
                renderer: Arc::new(PassthroughRenderer),
                plans: None,
            })
            .expect("processor initialises");

        monitor
            .init(MonitorContext {
                store: Arc::new(store.clone()),
                log: Arc::new(store.clone()),
                delivery: Arc::new(processor),
            })
            .expect("monitor initialises");

        Self { store, monitor }
    }

    pub async fn campaign(&self, user: UserId, status: CampaignStatus) -> Campaign {
        let mut campaign = Campaign::new(user, "newsletter", vec!["news".to_string()]);
        campaign.status = status;
        self.store.put_campaign(&campaign).await.expect("campaign stored");
        campaign
    }

    /// `n` successful sends to recipients `r-0` up to `r-<n - 1>`
    pub async fn sent(&self, campaign: &Campaign, n: usize) {
        for i in 0..n {
            self.store
                .append_send(&SendRecord {
                    id: SendId::generate(),
                    user_id: campaign.user_id,
                    campaign_id: campaign.id,
                    entry_id: EntryId::generate(),
                    recipient_id: RecipientId::new(format!("r-{i}")),
                    variant_id: None,
                    outcome: SendOutcome::Sent,
                    attempt: 1,
                    provider_message_id: None,
                    at: NOW - 60_000,
                    next_retry_at: None,
                })
                .await
                .expect("send recorded");
        }
    }

    /// Recipients `r-0` up to `r-<n - 1>` engaged with `kind`
    pub async fn engaged(&self, campaign: &Campaign, n: usize, kind: EngagementKind) {
        for i in 0..n {
            self.store
                .append_engagement(&EngagementEvent::new(
                    campaign.id,
                    RecipientId::new(format!("r-{i}")),
                    kind,
                    NOW - 30_000,
                ))
                .await
                .expect("engagement recorded");
        }
    }
}
