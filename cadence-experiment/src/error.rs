//! Error types for the A/B test engine.

use cadence_common::{CollaboratorError, TestId, TestStatus, VariantId};
use cadence_store::{ScheduleError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// The test definition is unusable; nothing was persisted.
    #[error("Invalid test configuration: {0}")]
    Config(String),

    /// The test's status does not allow the operation.
    #[error("Test {test_id} is {status}")]
    InvalidState { test_id: TestId, status: TestStatus },

    /// Variant assignments do not partition the audience.
    #[error("Invalid recipient partition: {0}")]
    InvalidPartition(String),

    #[error("Test {test_id} has no variant {variant_id}")]
    UnknownVariant {
        test_id: TestId,
        variant_id: VariantId,
    },

    /// A different winner was declared first.
    #[error("Test {test_id} already declared {winner} the winner")]
    AlreadyDeclared { test_id: TestId, winner: VariantId },

    /// Rollout requested before a winner exists.
    #[error("Test {0} has no winner")]
    NoWinner(TestId),

    #[error("Experiment engine not initialised. Call init() first.")]
    NotInitialised,
}

impl ExperimentError {
    /// Errors caused by the request rather than the system
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::InvalidState { .. }
                | Self::InvalidPartition(_)
                | Self::UnknownVariant { .. }
                | Self::AlreadyDeclared { .. }
                | Self::NoWinner(_)
        )
    }
}
