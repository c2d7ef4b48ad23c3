//! Lease-based mutual exclusion arbitrated by a shared relational store.
//!
//! This crate defines what every participant shares, independent of the
//! database engine:
//! - `LeaseStore`: the logical store operations each engine adapter implements
//! - `LeaseManager`: per-process coordinator running maintenance cycles
//! - `LeaseHandle`: one participant's claim on one named lease
//! - `MemoryStore`: process-local store with the same claim semantics

mod clock;
mod config;
mod error;
mod handle;
mod manager;
mod memory;
mod scheduler;
mod store;
mod worker;

pub use clock::{Clock, OffsetClock, SystemClock};
pub use config::{LeaseConfig, DEFAULT_LEASE_DURATION};
pub use error::LeaseError;
pub use handle::{LeaseEvent, LeaseHandle, LeaseState, TransitionCallback};
pub use manager::LeaseManager;
pub use memory::MemoryStore;
pub use store::{LeaseRecord, LeaseStore};
