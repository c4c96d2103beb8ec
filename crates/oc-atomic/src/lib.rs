//! Multi-location atomic commit for oxidized-cell PS3 emulator
//!
//! This crate lets emulator subsystems update several independent 64-bit
//! memory cells all-or-nothing without a global lock. A caller loads the
//! cells it needs into a [`Transaction`], sets new values and commits; the
//! commit either applies every write at one linearization point or changes
//! nothing and reports `false`.
//!
//! Commits pick one of three strategies: a double-word compare-and-swap
//! for a single cell, a restricted hardware transaction when the CPU has
//! one, and a lock-free slot-based protocol in which threads that run into
//! each other's pending updates help them finish instead of waiting.

pub mod cell;
pub mod commit;
pub mod htm;
pub(crate) mod pool;
pub mod retry;
pub mod runtime;
pub mod stats;
pub mod transaction;

pub use cell::AtomicCell;
pub use commit::Strategy;
pub use oc_core::error::AtomicError;
pub use pool::SLOT_COUNT;
pub use retry::{transaction, try_transaction};
pub use runtime::{capabilities, init, Capabilities};
pub use stats::{reset_stats, stats, CommitStats};
pub use transaction::{Participant, Transaction, MAX_PARTICIPANTS};
