//! The cadence scheduler daemon
//!
//! Wires the schedule store, delivery processor, experiment engine and
//! monitor together and exposes them over the control socket.

pub mod control_handler;
pub mod controller;

pub use control_handler::CadenceControlHandler;
pub use controller::{Cadence, SHUTDOWN_BROADCAST, Services, locate_from};
