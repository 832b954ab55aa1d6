use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Duration;

use billflow_core::BillId;
use billflow_events::{EventBus, EventRecord, InMemoryEventBus, Subscription};

use super::r#trait::{EventLog, EventLogError, NewEvent};

#[derive(Debug, Default)]
struct LogState {
    /// All committed events in position order. `global[i]` has position
    /// `i + 1`.
    global: Vec<EventRecord>,
    /// Per-entity indices into `global`, in sequence order.
    streams: HashMap<BillId, Vec<usize>>,
}

/// In-memory append-only event log.
///
/// Intended for tests/dev. Not optimized for performance; the write lock is
/// the global serialization point.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    state: RwLock<LogState>,
    wakeups: InMemoryEventBus<u64>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventLog for InMemoryEventLog {
    fn append(
        &self,
        bill_id: &BillId,
        expected_next_sequence: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        if events.is_empty() {
            return Err(EventLogError::InvalidAppend("empty batch".to_string()));
        }

        let last_position;
        let committed;
        {
            let mut guard = self
                .state
                .write()
                .map_err(|_| EventLogError::StorageUnavailable("lock poisoned".to_string()))?;
            let state = &mut *guard;

            let next_sequence = state.streams.get(bill_id).map_or(0, |s| s.len() as u64);
            if expected_next_sequence != next_sequence {
                return Err(EventLogError::ConcurrencyConflict {
                    bill_id: bill_id.clone(),
                    expected: expected_next_sequence,
                    found: next_sequence,
                });
            }

            // Timestamps must strictly increase within the entity; clamp a
            // non-advancing clock reading forward.
            let mut last_timestamp = state
                .streams
                .get(bill_id)
                .and_then(|s| s.last())
                .map(|&idx| state.global[idx].timestamp);

            let mut records = Vec::with_capacity(events.len());
            let mut sequence = next_sequence;

            for event in events {
                let mut timestamp = event.occurred_at;
                if let Some(last) = last_timestamp {
                    if timestamp <= last {
                        timestamp = last + Duration::microseconds(1);
                    }
                }
                last_timestamp = Some(timestamp);

                let idx = state.global.len();
                let record = EventRecord {
                    kind: event.kind.to_string(),
                    entity_id: bill_id.clone(),
                    sequence,
                    position: idx as u64 + 1,
                    timestamp,
                    payload: event.payload,
                };
                sequence += 1;
                state.global.push(record.clone());
                state.streams.entry(bill_id.clone()).or_default().push(idx);
                records.push(record);
            }

            last_position = state.global.len() as u64;
            committed = records;
        }

        // Wakeup after the write lock is released; subscribers re-read from
        // the log, so a lost message only costs a poll tick.
        let _ = self.wakeups.publish(last_position);

        Ok(committed)
    }

    fn read_entity(
        &self,
        bill_id: &BillId,
        from_sequence: u64,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        let state = self
            .state
            .read()
            .map_err(|_| EventLogError::StorageUnavailable("lock poisoned".to_string()))?;

        let records = state
            .streams
            .get(bill_id)
            .map(|indices| {
                indices
                    .iter()
                    .map(|&idx| state.global[idx].clone())
                    .filter(|r| r.sequence >= from_sequence)
                    .collect()
            })
            .unwrap_or_default();

        Ok(records)
    }

    fn read_since(&self, position: u64, limit: usize) -> Result<Vec<EventRecord>, EventLogError> {
        let state = self
            .state
            .read()
            .map_err(|_| EventLogError::StorageUnavailable("lock poisoned".to_string()))?;

        let start = position.min(state.global.len() as u64) as usize;
        Ok(state.global[start..]
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    fn current_position(&self) -> Result<u64, EventLogError> {
        let state = self
            .state
            .read()
            .map_err(|_| EventLogError::StorageUnavailable("lock poisoned".to_string()))?;
        Ok(state.global.len() as u64)
    }

    fn subscribe_wakeups(&self) -> Subscription<u64> {
        self.wakeups.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn new_event(kind: &'static str) -> NewEvent {
        NewEvent {
            kind,
            payload: json!({}),
            occurred_at: Utc::now(),
        }
    }

    fn id(s: &str) -> BillId {
        BillId::new(s).unwrap()
    }

    #[test]
    fn sequences_are_dense_and_positions_global() {
        let log = InMemoryEventLog::new();

        let a = log.append(&id("a"), 0, vec![new_event("E1"), new_event("E2")]).unwrap();
        let b = log.append(&id("b"), 0, vec![new_event("E1")]).unwrap();
        let a2 = log.append(&id("a"), 2, vec![new_event("E3")]).unwrap();

        assert_eq!(a.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(a.iter().map(|r| r.position).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(b[0].sequence, 0);
        assert_eq!(b[0].position, 3);
        assert_eq!(a2[0].sequence, 2);
        assert_eq!(a2[0].position, 4);
        assert_eq!(log.current_position().unwrap(), 4);
    }

    #[test]
    fn stale_expected_sequence_conflicts_and_writes_nothing() {
        let log = InMemoryEventLog::new();
        log.append(&id("a"), 0, vec![new_event("E1")]).unwrap();

        let err = log.append(&id("a"), 0, vec![new_event("E2")]).unwrap_err();
        assert!(matches!(err, EventLogError::ConcurrencyConflict { expected: 0, found: 1, .. }));
        assert_eq!(log.read_entity(&id("a"), 0).unwrap().len(), 1);
        assert_eq!(log.current_position().unwrap(), 1);
    }

    #[test]
    fn conflicts_are_per_entity() {
        let log = InMemoryEventLog::new();
        log.append(&id("a"), 0, vec![new_event("E1")]).unwrap();
        // A different entity at its own sequence 0 does not conflict.
        assert!(log.append(&id("b"), 0, vec![new_event("E1")]).is_ok());
    }

    #[test]
    fn read_since_returns_everything_after_the_cursor_in_order() {
        let log = InMemoryEventLog::new();
        log.append(&id("a"), 0, vec![new_event("E1")]).unwrap();
        log.append(&id("b"), 0, vec![new_event("E1")]).unwrap();
        log.append(&id("a"), 1, vec![new_event("E2")]).unwrap();

        let tail = log.read_since(1, 100).unwrap();
        assert_eq!(tail.iter().map(|r| r.position).collect::<Vec<_>>(), vec![2, 3]);

        let limited = log.read_since(0, 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn per_entity_timestamps_strictly_increase() {
        let log = InMemoryEventLog::new();
        let now = Utc::now();
        let same_instant = vec![
            NewEvent { kind: "E1", payload: json!({}), occurred_at: now },
            NewEvent { kind: "E2", payload: json!({}), occurred_at: now },
        ];
        let records = log.append(&id("a"), 0, same_instant).unwrap();
        assert!(records[1].timestamp > records[0].timestamp);

        // A clock that went backwards is clamped forward too.
        let earlier = vec![NewEvent {
            kind: "E3",
            payload: json!({}),
            occurred_at: now - chrono::Duration::seconds(10),
        }];
        let next = log.append(&id("a"), 2, earlier).unwrap();
        assert!(next[0].timestamp > records[1].timestamp);
    }

    #[test]
    fn wakeups_carry_committed_positions() {
        let log = InMemoryEventLog::new();
        let sub = log.subscribe_wakeups();
        log.append(&id("a"), 0, vec![new_event("E1"), new_event("E2")]).unwrap();
        assert_eq!(sub.recv().unwrap(), 2);
    }
}
