//! Backing store implementations
//!
//! - `memory`: in-memory tables with optional bincode snapshots
//! - `test`: wrapper adding fault injection and synchronisation for tests

pub mod memory;
pub mod test;

pub use memory::MemoryBackingStore;
pub use test::TestBackingStore;
