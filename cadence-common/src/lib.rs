//! Shared types for the cadence campaign delivery scheduler
//!
//! Entity rows, identifiers, usage windows and the traits that describe the
//! external collaborators (contacts, transport, rendering, plan lookup).

pub mod alert;
pub mod campaign;
pub mod entry;
pub mod error;
pub mod experiment;
pub mod ids;
pub mod logging;
pub mod recipient;
pub mod send;
pub mod time;
pub mod traits;
pub mod user;

pub use alert::{AlertMetric, AlertRule, AlertSeverity, Comparison};
pub use campaign::{
    Campaign, CampaignStatus, ContentRef, RecurrenceKind, RecurrenceRule, Rollout,
    ScheduleSettings, SendRate, SendSettings,
};
pub use entry::{EntryKind, EntryStatus, ScheduleEntry};
pub use error::{CollaboratorError, ConfigError};
pub use experiment::{
    AbTest, StatisticalSettings, SuccessMetric, SuccessMetrics, TestConfiguration, TestStatus,
    Variant,
};
pub use ids::{CampaignId, EntryId, RecipientId, RuleId, SendId, TestId, UserId, VariantId};
pub use recipient::Recipient;
pub use send::{EngagementEvent, EngagementKind, SendOutcome, SendRecord};
pub use time::{Timestamp, UsageWindow};
pub use traits::{
    ContactDirectory, Contacts, LoggingTransport, PassthroughRenderer, PlanLookup, RenderedContent,
    Renderer, SendResult, Transport,
};
pub use tracing;
pub use user::{PlanLimits, PlanTier, UserConfig};

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
