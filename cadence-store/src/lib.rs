//! Schedule store for the cadence campaign scheduler
//!
//! Persistence is expressed through two traits: [`BackingStore`] for the
//! mutable entities (campaigns, schedule entries, users, A/B tests and alert
//! rules) and [`EventLog`] for the append-only send log and engagement
//! events. [`ScheduleStore`] layers the schedule entry state machine and
//! recurrence expansion on top of a backing store.

pub mod backends;
pub mod config;
pub mod error;
pub mod recurrence;
pub mod schedule;
pub mod r#trait;

pub use backends::{MemoryBackingStore, TestBackingStore};
pub use config::ScheduleConfig;
pub use error::{Result, ScheduleError, SerializationError, StoreError};
pub use schedule::{EntrySummary, ScheduleStore, SyncReport, Transition};
pub use r#trait::{BackingStore, EntryFilter, EventLog};
