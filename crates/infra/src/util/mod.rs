//! Shared infrastructure helpers.

pub mod backoff;

pub use backoff::BackoffPolicy;
