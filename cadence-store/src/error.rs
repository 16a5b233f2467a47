//! Error types for the cadence-store crate.

use std::io;

use cadence_common::{CampaignId, CampaignStatus, ConfigError, EntryId, EntryStatus};
use thiserror::Error;

/// Errors raised by a backing store or event log.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No row with this id.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A compare-and-swap write lost against a concurrent writer.
    #[error("{kind} {id} was modified concurrently (expected version {expected}, found {found})")]
    VersionConflict {
        kind: &'static str,
        id: String,
        expected: u64,
        found: u64,
    },

    /// A row with this id already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    /// The underlying data is temporarily unreachable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Snapshot encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Snapshot file could not be read or written.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Errors raised by schedule store operations.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The schedule configuration is invalid; nothing was persisted.
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The campaign's status does not allow the requested operation.
    #[error("Campaign {campaign_id} is {status:?}")]
    InvalidState {
        campaign_id: CampaignId,
        status: CampaignStatus,
    },

    /// The requested transition is not an edge of the entry state machine.
    #[error("Entry {entry_id} cannot move from {from} to {to}")]
    InvalidTransition {
        entry_id: EntryId,
        from: EntryStatus,
        to: EntryStatus,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_pass_through_unchanged() {
        let err = ScheduleError::from(ConfigError::EmptyAudience);
        assert_eq!(err.to_string(), ConfigError::EmptyAudience.to_string());
    }

    #[test]
    fn io_errors_convert() {
        let err: StoreError = io::Error::new(io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(err.to_string().contains("denied"));
    }
}
