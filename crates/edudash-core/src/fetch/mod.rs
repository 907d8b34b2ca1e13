//! Cancellable, retrying fetches for UI logic.
//!
//! A `FetchController` runs one operation at a time. Starting a new one
//! cancels the previous one (latest wins), transient failures are retried
//! with a fixed backoff, and the observable `FetchState` only ever reflects
//! the most recently started operation.

pub mod controller;
pub mod state;

pub use controller::{FetchController, FetchOptions};
pub use state::FetchState;
