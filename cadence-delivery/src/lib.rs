//! Delivery queue processor for campaign sends
//!
//! This crate provides:
//! - The usage limiter enforcing hourly, daily and monthly plan caps
//! - A provider token bucket and the per-recipient retry policy
//! - The send-time optimizer
//! - The delivery processor, which polls due schedule entries, expands
//!   them into per-recipient send jobs and hands those to the transport

mod error;
mod optimizer;
mod processor;
pub mod queue;
mod rate_limiter;
mod retry;
mod service;
mod state;
mod usage;

pub use error::{CapacityError, DeliveryError, PermanentError, SystemError, TemporaryError};
pub use optimizer::{OptimizerConfig, SendTimeOptimizer, TimezoneSendWindow};
pub use processor::{
    DeliveryContext, DeliveryProcessor, Deferral, EntryOutcome, PassReport, StopReport,
};
pub use queue::{Claim, DeliveryQueue};
pub use rate_limiter::{ProviderRateLimit, RateLimitConfig, RateLimiter};
pub use retry::RetryPolicy;
pub use service::DeliveryQueryService;
pub use state::{EntryProgress, RecipientState};
pub use usage::{PlanTable, Reservation, UsageDecision, UsageLimiter, WindowUsage};
