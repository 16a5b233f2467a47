//! Shared harness for the experiment integration tests
#![allow(dead_code)] // Test utility module - not all helpers are used in every test

use std::{collections::BTreeSet, sync::Arc};

use cadence_common::{
    AbTest, Campaign, CampaignId, CampaignStatus, ContactDirectory, ContentRef, EngagementEvent,
    EngagementKind, EntryId, LoggingTransport, PassthroughRenderer, PlanTier, Recipient,
    RecipientId, ScheduleSettings, SendId, SendOutcome, SendRecord, TestConfiguration, Timestamp,
    UserConfig, UserId, Variant, VariantId,
};
use cadence_delivery::{DeliveryContext, DeliveryProcessor};
use cadence_experiment::{ExperimentContext, ExperimentEngine};
use cadence_store::{BackingStore, EventLog, MemoryBackingStore, ScheduleConfig, ScheduleStore};

pub struct Harness {
    pub store: MemoryBackingStore,
    pub schedule: ScheduleStore,
    pub contacts: Arc<ContactDirectory>,
    pub engine: ExperimentEngine,
    pub processor: DeliveryProcessor,
}

impl Harness {
    pub fn new() -> Self {
        let store = MemoryBackingStore::default();
        let schedule = ScheduleStore::new(Arc::new(store.clone()), ScheduleConfig::default());
        let contacts = Arc::new(ContactDirectory::new());

        let mut engine = ExperimentEngine::default();
        engine
            .init(ExperimentContext {
                schedule: schedule.clone(),
                log: Arc::new(store.clone()),
                contacts: contacts.clone(),
            })
            .expect("engine initialises");

        let mut processor = DeliveryProcessor::default();
        processor
            .init(DeliveryContext {
                schedule: schedule.clone(),
                log: Arc::new(store.clone()),
                contacts: contacts.clone(),
                transport: Arc::new(LoggingTransport),
                renderer: Arc::new(PassthroughRenderer),
                plans: None,
            })
            .expect("processor initialises");

        Self {
            store,
            schedule,
            contacts,
            engine,
            processor,
        }
    }

    /// Add contacts `<tag>-<from>` up to `<tag>-<to - 1>`, all tagged `tag`
    pub fn add_recipients(&self, tag: &str, from: usize, to: usize) {
        for n in from..to {
            self.contacts.insert(
                Recipient::new(format!("{tag}-{n}"), format!("{tag}-{n}@example.com")),
                &[tag],
            );
        }
    }

    /// A draft one-off campaign owned by a pro user
    pub async fn campaign(&self, tag: &str) -> Campaign {
        let user = UserConfig::new(UserId::generate(), PlanTier::Pro);
        self.store.put_user(&user).await.expect("user stored");

        let mut campaign =
            Campaign::new(user.user_id, format!("{tag} campaign"), vec![tag.to_string()]);
        campaign.schedule = ScheduleSettings::Immediate;
        campaign.status = CampaignStatus::Draft;
        self.store.put_campaign(&campaign).await.expect("campaign stored");
        campaign
    }

    /// A test inserted as-is, bypassing assignment
    pub async fn insert_test(&self, test: &AbTest) {
        self.store.insert_test(test).await.expect("test stored");
    }

    /// Record a successful send of `variant` to `recipient`
    pub async fn sent(&self, campaign: &Campaign, recipient: &str, variant: VariantId) {
        self.store
            .append_send(&SendRecord {
                id: SendId::generate(),
                user_id: campaign.user_id,
                campaign_id: campaign.id,
                entry_id: EntryId::generate(),
                recipient_id: RecipientId::new(recipient),
                variant_id: Some(variant),
                outcome: SendOutcome::Sent,
                attempt: 1,
                provider_message_id: None,
                at: 0,
                next_retry_at: None,
            })
            .await
            .expect("send recorded");
    }

    pub async fn engaged(&self, campaign: CampaignId, recipient: &str, kind: EngagementKind) {
        self.store
            .append_engagement(&EngagementEvent::new(
                campaign,
                RecipientId::new(recipient),
                kind,
                1,
            ))
            .await
            .expect("engagement recorded");
    }

    /// An active two-variant test with `n` recipients per variant, of which
    /// `control_opens` and `variant_opens` opened
    pub async fn running_test(
        &self,
        campaign: &Campaign,
        n: usize,
        control_opens: usize,
        variant_opens: usize,
        configuration: TestConfiguration,
    ) -> AbTest {
        let mut control = Variant::new("control", true, content("Hello"));
        control.assigned_recipients = (0..n)
            .map(|i| RecipientId::new(format!("c-{i}")))
            .collect::<BTreeSet<_>>();
        let mut challenger = Variant::new("challenger", false, content("Hello there"));
        challenger.assigned_recipients = (0..n)
            .map(|i| RecipientId::new(format!("v-{i}")))
            .collect::<BTreeSet<_>>();

        for i in 0..n {
            self.sent(campaign, &format!("c-{i}"), control.id).await;
            self.sent(campaign, &format!("v-{i}"), challenger.id).await;
        }
        for i in 0..control_opens {
            self.engaged(campaign.id, &format!("c-{i}"), EngagementKind::Opened).await;
        }
        for i in 0..variant_opens {
            self.engaged(campaign.id, &format!("v-{i}"), EngagementKind::Opened).await;
        }

        let mut test = AbTest::new(
            campaign.id,
            "subject line",
            vec![control, challenger],
            configuration,
            0,
        );
        test.status = cadence_common::TestStatus::Active;
        self.insert_test(&test).await;
        test
    }
}

pub fn content(subject: &str) -> ContentRef {
    ContentRef::Custom {
        subject: subject.to_string(),
        html: format!("<p>{subject}</p>"),
        text: subject.to_string(),
    }
}

pub fn variants() -> Vec<Variant> {
    vec![
        Variant::new("control", true, content("Hello")),
        Variant::new("challenger", false, content("Hello there")),
    ]
}

pub fn automatic() -> TestConfiguration {
    let mut configuration = TestConfiguration::default();
    configuration.statistical_settings.automatic_winner = true;
    configuration
}

pub const fn at(offset: Timestamp) -> Timestamp {
    1_780_000_000_000 + offset
}
