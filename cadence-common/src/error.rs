//! Error types shared across the cadence crates.

use thiserror::Error;

/// Configuration problems surfaced when a schedule or rule is created.
///
/// These are reported immediately to the caller and nothing is persisted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The timezone is not a known IANA zone name.
    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    /// The recurrence rule cannot produce occurrences.
    #[error("Invalid recurrence rule: {0}")]
    InvalidRecurrence(String),

    /// The campaign targets no tags, so it has no audience.
    #[error("Campaign has an empty target audience")]
    EmptyAudience,

    /// A one-time send was requested in the past.
    #[error("Scheduled time {scheduled_at} is before now ({now})")]
    ScheduledInPast { scheduled_at: u64, now: u64 },

    /// A send-rate or throttle value is out of range.
    #[error("Invalid send rate: {0}")]
    InvalidSendRate(String),

    /// A/B test variants do not form a valid partition of the audience.
    #[error("Invalid variant partition: {0}")]
    InvalidPartition(String),
}

/// A collaborator (contacts, renderer, plan lookup) could not answer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("{collaborator} unavailable: {reason}")]
    Unavailable {
        collaborator: &'static str,
        reason: String,
    },

    #[error("Template {0} not found")]
    TemplateNotFound(String),
}
