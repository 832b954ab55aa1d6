//! Append-only event log boundary.
//!
//! The log is the authoritative store: per-entity streams with dense,
//! zero-based sequences, and a strictly increasing global position across all
//! entities. Everything downstream (read models, side effects) is derivable
//! from it.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventLog;
pub use postgres::PostgresEventLog;
pub use r#trait::{EventLog, EventLogError, NewEvent};
