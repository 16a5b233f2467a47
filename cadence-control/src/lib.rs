//! Control protocol for managing a running cadence scheduler
//!
//! Requests travel as length-prefixed bincode frames over a Unix domain
//! socket that only its owner may open. Commands are grouped by concern:
//! - Schedule entries and campaign delivery (pause, resume, cancel, stop)
//! - A/B tests
//! - Real-time statistics, alerts and status badges
//! - Usage limits
//! - System status

pub mod auth;
pub mod client;
pub mod codec;
pub mod error;
pub mod protocol;
pub mod server;

pub use auth::ControlAuthConfig;
pub use client::ControlClient;
pub use error::{ControlError, Result};
pub use protocol::{
    ExperimentCommand, MonitorCommand, PROTOCOL_VERSION, Request, RequestCommand, Response,
    ResponseData, ResponsePayload, ScheduleCommand, SystemCommand, SystemStatus, UsageCommand,
};
pub use server::{CommandHandler, ControlServer};

/// Default path for the control socket
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/cadence.sock";
