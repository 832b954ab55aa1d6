use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use billflow_core::BillId;

/// A committed event as the log stores and serves it.
///
/// This is the unit of persistence and of consumption: `sequence` is the
/// dense, zero-based index within the entity's stream, `position` the
/// strictly increasing global index across all entities. The per-entity order
/// is a subsequence of the global order, so a consumer tailing by position
/// sees every entity's events in lifecycle order.
///
/// `payload` is the kind-specific JSON object produced by the explicit codec;
/// infrastructure never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub kind: String,
    pub entity_id: BillId,
    pub sequence: u64,
    pub position: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: JsonValue,
}
