pub mod api;
pub mod backoff;
pub mod conditions;

pub use backoff::BackoffTracker;
