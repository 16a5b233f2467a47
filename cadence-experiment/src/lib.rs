//! A/B test engine for campaign content
//!
//! Recipients are partitioned across variants once and stay put. Each
//! variant is delivered as its own schedule entry, sharing the user's plan
//! budget with every other send. Results are recomputed from the send log
//! and engagement events, and a one-sided two-proportion z-test decides
//! whether a variant beats the control.

mod assignment;
mod engine;
mod error;
pub mod stats;

pub use assignment::{assign_recipients, assign_recipients_with, validate_partition};
pub use engine::{ExperimentContext, ExperimentEngine, TestAnalysis};
pub use error::ExperimentError;
pub use stats::{StatisticalAnalysis, VariantMetrics, VariantRates, VariantResult};
