//! Aggregate traits for event-sourced domain models.

/// Aggregate root marker + minimal interface.
///
/// Intentionally small so domain modules decide how they model state
/// transitions without pulling in infrastructure concerns.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Number of events applied so far.
    ///
    /// With dense, zero-based sequences this is also the next unused
    /// sequence number of the aggregate's stream.
    fn version(&self) -> u64;
}

/// Event-sourced aggregate lifecycle: decide, then evolve.
///
/// `handle` validates a command against current state and returns the events
/// it produces without mutating anything. `apply` folds a single event into
/// state. Both must be deterministic and perform no IO; replaying the same
/// stream twice yields identical state.
pub trait Aggregate: AggregateRoot {
    type Command;
    type Event;
    type Error;

    /// Decide events for a command (pure, no mutation).
    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    /// Fold one event into state.
    fn apply(&mut self, event: &Self::Event);
}
