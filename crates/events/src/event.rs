use chrono::{DateTime, Utc};

/// A domain event: an immutable fact about what happened to one entity.
///
/// Events are append-only and replayable; state is rebuilt by folding them in
/// order. Payload schemas are versioned implicitly by kind name — a breaking
/// change introduces a new kind (e.g. `BillCreatedV2`) and consumers handle
/// both, so there is no separate numeric schema version.
///
/// Events must own all their data (`'static`) and cross thread boundaries
/// (`Send + Sync`): they are cloned into aggregates, projections and the
/// wakeup bus.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event kind identifier (e.g. "BillCreated").
    ///
    /// Used for codec dispatch and consumer filtering. Never change it for an
    /// existing kind; historical payloads are decoded by this name.
    fn kind(&self) -> &'static str;

    /// When the event occurred (business time, stamped by the command side's
    /// clock; the log enforces per-entity monotonicity on top).
    fn occurred_at(&self) -> DateTime<Utc>;
}
