//! Real-time monitoring for the cadence campaign scheduler
//!
//! A read-side aggregator: campaign statistics, health classification and
//! alert rule evaluation are recomputed from the send log and engagement
//! events on every read.

mod alerts;
mod config;
mod error;
mod health;
mod monitor;
pub mod stats;

pub use alerts::{AlertHistory, AlertKind, AlertTrigger, evaluate};
pub use config::HealthThresholds;
pub use error::MonitorError;
pub use health::{CampaignBadge, Health, HealthIssue, HealthStatus, classify};
pub use monitor::{Monitor, MonitorContext, Snapshot};
pub use stats::{EngagementWindow, QueueStats, Rates, RealTimeStats, SendingRate};
