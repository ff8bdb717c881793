//! Cooperative cancellation and time-boxing.
//!
//! This module provides:
//! - CancellationToken for cooperative cancellation
//! - `run_time_boxed` for deadline- and token-bounded calls

mod timebox;
mod token;

pub use timebox::run_time_boxed;
pub use token::CancellationToken;
