//! Versioned record stores the update workers contend on.

pub mod base;
pub mod memory;
pub mod postgres;

pub use base::{LockPolicy, Record, RecordConnection, RecordStore, UpdateOutcome};
