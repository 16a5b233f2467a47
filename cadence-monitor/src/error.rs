//! Monitor error types

use cadence_common::CampaignId;
use cadence_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Invalid monitor configuration: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The event log could not be read and no earlier snapshot exists.
    #[error("No statistics available for campaign {campaign_id}: {source}")]
    Unavailable {
        campaign_id: CampaignId,
        source: StoreError,
    },

    #[error("Monitor not initialised. Call init() first.")]
    NotInitialised,
}
