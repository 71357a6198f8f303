//! Persistent queue of mutating requests that could not reach the network.
//!
//! Records are immutable once stored and ordered by `created_at`, then
//! `id`. Retry bookkeeping lives in a side table so a record only ever
//! changes by being deleted.

mod retry;
mod store;
mod types;

pub use retry::{RetryDecision, RetryPolicy};
pub use store::QueueStore;
pub use types::{AttemptState, FailedMutation, NewMutation, PendingMutation, QueuedMutation};
