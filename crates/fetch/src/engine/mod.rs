//! Fetch engine
//!
//! This module provides:
//! - [`FetchEngine`] - the self-rescheduling fetch cycle for one worker slot
//! - [`WorkAssigner`] - where retrieved units are handed off
//! - [`FetchControl`] / [`FetchSignal`] - the shutdown flag, owned by the
//!   supervisor and observed by every engine
//!
//! # Cycle
//!
//! ```text
//!  Idle ──► Retrieving ──┬──► Assigned            (supervisor calls fetch again)
//!                        ├──► Empty ──► Rescheduled (after the strategy's idle delay)
//!                        └──► Failed ──► BackingOff ──► Rescheduled
//! ```

mod assign;
mod fetcher;
mod signal;

pub use assign::WorkAssigner;
pub use fetcher::{CycleOutcome, FetchEngine};
pub use signal::{FetchControl, FetchSignal};
