//! Service trait abstraction for delivery operations
//!
//! The control handler and the monitor talk to the processor through this
//! trait rather than the concrete `DeliveryProcessor`.

use async_trait::async_trait;
use cadence_common::{CampaignId, EntryId, ScheduleEntry, Timestamp, UserId};
use cadence_store::ScheduleStore;

use crate::{
    error::DeliveryError,
    processor::{DeliveryProcessor, PassReport, StopReport},
    usage::UsageDecision,
};

#[async_trait]
pub trait DeliveryQueryService: Send + Sync {
    /// Entries currently being worked by a pass
    fn in_flight(&self) -> Vec<EntryId>;

    /// Recipients of the campaign still waiting for a send
    fn queued_for(&self, campaign_id: CampaignId) -> u64;

    /// Whether dispatch for the campaign has been halted
    fn is_halted(&self, campaign_id: CampaignId) -> bool;

    /// The schedule store the processor works against
    fn schedule(&self) -> Result<&ScheduleStore, DeliveryError>;

    async fn check_usage(
        &self,
        user: UserId,
        count: u64,
        now: Timestamp,
    ) -> Result<UsageDecision, DeliveryError>;

    /// Run a pass immediately instead of waiting for the next poll
    async fn process_now(&self, now: Timestamp) -> Result<PassReport, DeliveryError>;

    async fn emergency_stop(&self, campaign_id: CampaignId) -> Result<StopReport, DeliveryError>;

    async fn pause_campaign(&self, campaign_id: CampaignId) -> Result<usize, DeliveryError>;

    async fn resume_campaign(
        &self,
        campaign_id: CampaignId,
        now: Timestamp,
    ) -> Result<Vec<ScheduleEntry>, DeliveryError>;

    async fn cancel_campaign(&self, campaign_id: CampaignId) -> Result<usize, DeliveryError>;
}

#[async_trait]
impl DeliveryQueryService for DeliveryProcessor {
    fn in_flight(&self) -> Vec<EntryId> {
        self.queue().in_flight()
    }

    fn queued_for(&self, campaign_id: CampaignId) -> u64 {
        self.queue().queued_for(campaign_id)
    }

    fn is_halted(&self, campaign_id: CampaignId) -> bool {
        self.queue().is_halted(campaign_id)
    }

    fn schedule(&self) -> Result<&ScheduleStore, DeliveryError> {
        Self::schedule(self)
    }

    async fn check_usage(
        &self,
        user: UserId,
        count: u64,
        now: Timestamp,
    ) -> Result<UsageDecision, DeliveryError> {
        Self::check_usage(self, user, count, now).await
    }

    async fn process_now(&self, now: Timestamp) -> Result<PassReport, DeliveryError> {
        if let Err(e) = self.schedule()?.sync_campaign_schedules(now).await {
            cadence_common::tracing::warn!("Sync before manual pass failed: {e}");
        }
        self.run_pass(now).await
    }

    async fn emergency_stop(&self, campaign_id: CampaignId) -> Result<StopReport, DeliveryError> {
        Self::emergency_stop(self, campaign_id).await
    }

    async fn pause_campaign(&self, campaign_id: CampaignId) -> Result<usize, DeliveryError> {
        Self::pause_campaign(self, campaign_id).await
    }

    async fn resume_campaign(
        &self,
        campaign_id: CampaignId,
        now: Timestamp,
    ) -> Result<Vec<ScheduleEntry>, DeliveryError> {
        Self::resume_campaign(self, campaign_id, now).await
    }

    async fn cancel_campaign(&self, campaign_id: CampaignId) -> Result<usize, DeliveryError> {
        Self::cancel_campaign(self, campaign_id).await
    }
}
