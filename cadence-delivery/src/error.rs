//! Typed error handling for delivery operations.
//!
//! Errors are split the way the scheduler reacts to them:
//! - Capacity errors (plan caps, send rates) leave work pending for the next poll
//! - Temporary errors (collaborator outages, timeouts) are retried with backoff
//! - Permanent errors are recorded and never retried
//! - System errors indicate internal problems

use std::time::Duration;

use cadence_common::{CampaignId, CampaignStatus, CollaboratorError, UsageWindow};
use cadence_store::{ScheduleError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Capacity exhausted: {0}")]
    Capacity(#[from] CapacityError),

    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// The user or campaign has no headroom left right now.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapacityError {
    /// A plan cap would be exceeded.
    #[error("{window} plan limit reached ({usage}/{limit}, {remaining} remaining)")]
    PlanLimit {
        window: UsageWindow,
        usage: u64,
        limit: u64,
        remaining: u64,
    },

    /// The campaign's own send rate is used up for the current period.
    #[error("Campaign send rate reached for the current {0}")]
    SendRate(&'static str),
}

#[derive(Debug, Error)]
pub enum TemporaryError {
    /// A collaborator could not answer.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// The transport did not answer within the send timeout.
    #[error("Transport timed out after {0:?}")]
    Timeout(Duration),

    /// The transport reported a retryable failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum PermanentError {
    /// The transport rejected the recipient outright.
    #[error("Recipient rejected: {0}")]
    Rejected(String),

    /// The campaign's status does not allow the operation.
    #[error("Campaign {campaign_id} is {status:?}")]
    InvalidState {
        campaign_id: CampaignId,
        status: CampaignStatus,
    },
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Delivery processor not initialised.
    #[error("Delivery processor not initialised: {0}")]
    NotInitialised(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for DeliveryError {
    fn from(err: StoreError) -> Self {
        Self::System(SystemError::Store(err))
    }
}

impl From<ScheduleError> for DeliveryError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::InvalidState {
                campaign_id,
                status,
            } => Self::Permanent(PermanentError::InvalidState {
                campaign_id,
                status,
            }),
            other => Self::System(SystemError::Schedule(other)),
        }
    }
}

impl From<CollaboratorError> for DeliveryError {
    fn from(err: CollaboratorError) -> Self {
        Self::Temporary(TemporaryError::Collaborator(err))
    }
}

impl DeliveryError {
    /// Whether the work should stay pending and be attempted again
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Capacity(_) | Self::Temporary(_))
    }

    #[must_use]
    pub const fn is_capacity(&self) -> bool {
        matches!(self, Self::Capacity(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_and_temporary_errors_are_retryable() {
        let capacity: DeliveryError = CapacityError::SendRate("hour").into();
        assert!(capacity.is_retryable());
        assert!(capacity.is_capacity());

        let temporary: DeliveryError = TemporaryError::Timeout(Duration::from_secs(30)).into();
        assert!(temporary.is_retryable());

        let permanent: DeliveryError = PermanentError::Rejected("550".to_string()).into();
        assert!(!permanent.is_retryable());
        assert!(permanent.is_permanent());
    }

    #[test]
    fn invalid_campaign_state_is_permanent() {
        let err: DeliveryError = ScheduleError::InvalidState {
            campaign_id: CampaignId::generate(),
            status: CampaignStatus::Stopped,
        }
        .into();
        assert!(err.is_permanent());
    }

    #[test]
    fn plan_limit_messages_name_the_window() {
        let err = CapacityError::PlanLimit {
            window: UsageWindow::Monthly,
            usage: 7,
            limit: 10,
            remaining: 3,
        };
        assert_eq!(
            err.to_string(),
            "monthly plan limit reached (7/10, 3 remaining)"
        );
    }
}
