//! Generic log consumer loop.
//!
//! A consumer tails the log from its tracking token, hands each event to its
//! handler, and commits the handler's row changes together with the token
//! advance. Handler failures retry with backoff up to the poison budget;
//! after that the event is dead-lettered and the token advances anyway, so
//! one poison event cannot stall the pipeline.
//!
//! At-least-once delivery + idempotent handlers = exactly-once effects.

use std::sync::mpsc;
use std::thread;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use billflow_events::EventRecord;

use crate::config::ConsumerConfig;
use crate::event_log::EventLog;
use crate::read_model::{DeadLetterRow, ReadModelStore, RowChange};
use crate::util::BackoffPolicy;

/// Handler failure classification.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Worth retrying (storage hiccup, external service down).
    #[error("transient: {0}")]
    Transient(String),

    /// Deterministic failure; retrying cannot help.
    #[error("{0}")]
    Permanent(String),
}

/// A named log consumer: projections and reactive handlers implement this.
///
/// `handle` decides row changes for one event; it may read the store and
/// perform (idempotent) side effects, but all row writes go through the
/// returned changes so they commit atomically with the token.
pub trait LogHandler: Send {
    fn consumer_name(&self) -> &'static str;

    fn handle(&mut self, record: &EventRecord) -> Result<Vec<RowChange>, HandlerError>;

    /// Drop any cached rows; called when a commit failed or a replay starts.
    fn on_reset(&mut self) {}
}

/// Handle to control and join a running consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Request graceful shutdown and wait for the consumer to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawns and drives consumers.
pub struct LogConsumer;

impl LogConsumer {
    /// Spawn a consumer daemon thread.
    pub fn spawn<L, S, H>(log: L, store: S, handler: H, config: ConsumerConfig) -> ConsumerHandle
    where
        L: EventLog + 'static,
        S: ReadModelStore + 'static,
        H: LogHandler + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let name = handler.consumer_name();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || consumer_loop(log, store, handler, config, shutdown_rx))
            .expect("failed to spawn consumer thread");

        ConsumerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }

    /// Process everything currently in the log, synchronously. Returns the
    /// final tracking position. Used by replays and tests.
    pub fn drain<L, S, H>(
        log: &L,
        store: &S,
        handler: &mut H,
        config: &ConsumerConfig,
    ) -> Result<u64, HandlerError>
    where
        L: EventLog,
        S: ReadModelStore,
        H: LogHandler,
    {
        let backoff = BackoffPolicy::default();
        loop {
            match step(log, store, handler, config, &backoff) {
                Step::Progressed => continue,
                Step::Idle(position) => return Ok(position),
                Step::Failed(message) => return Err(HandlerError::Transient(message)),
            }
        }
    }

    /// Reset a consumer to position zero and re-consume the whole log:
    /// truncate its rows, drop handler caches, then drain.
    pub fn replay<L, S, H>(
        log: &L,
        store: &S,
        handler: &mut H,
        config: &ConsumerConfig,
    ) -> Result<u64, HandlerError>
    where
        L: EventLog,
        S: ReadModelStore,
        H: LogHandler,
    {
        store
            .reset(handler.consumer_name())
            .map_err(|e| HandlerError::Transient(e.to_string()))?;
        handler.on_reset();
        Self::drain(log, store, handler, config)
    }
}

enum Step {
    /// Committed a batch; more may be waiting.
    Progressed,
    /// Nothing to read; the token is at this position.
    Idle(u64),
    /// Infrastructure failure; retry after a pause without advancing.
    Failed(String),
}

fn consumer_loop<L, S, H>(
    log: L,
    store: S,
    mut handler: H,
    config: ConsumerConfig,
    shutdown_rx: mpsc::Receiver<()>,
) where
    L: EventLog,
    S: ReadModelStore,
    H: LogHandler,
{
    let name = handler.consumer_name();
    let wakeups = log.subscribe_wakeups();
    let backoff = BackoffPolicy::default();
    let mut failures = 0u32;

    info!(consumer = name, "consumer started");

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match step(&log, &store, &mut handler, &config, &backoff) {
            Step::Progressed => {
                failures = 0;
            }
            Step::Idle(_) => {
                failures = 0;
                // Park until new events commit or the tick elapses.
                let _ = wakeups.recv_timeout(config.poll_interval);
            }
            Step::Failed(message) => {
                warn!(consumer = name, error = %message, "consumer step failed, backing off");
                handler.on_reset();
                backoff.sleep(failures);
                failures = failures.saturating_add(1);
            }
        }
    }

    info!(consumer = name, "consumer stopped");
}

fn step<L, S, H>(
    log: &L,
    store: &S,
    handler: &mut H,
    config: &ConsumerConfig,
    backoff: &BackoffPolicy,
) -> Step
where
    L: EventLog,
    S: ReadModelStore,
    H: LogHandler,
{
    let name = handler.consumer_name();

    let token = match store.tracking_position(name) {
        Ok(token) => token,
        Err(e) => return Step::Failed(e.to_string()),
    };

    let batch = match log.read_since(token, config.batch_size.max(1)) {
        Ok(batch) => batch,
        Err(e) => return Step::Failed(e.to_string()),
    };

    if batch.is_empty() {
        return Step::Idle(token);
    }

    let mut changes = Vec::new();
    let mut last_position = token;

    for record in &batch {
        match handle_with_budget(handler, record, config, backoff) {
            Ok(mut decided) => changes.append(&mut decided),
            Err(message) => {
                // Alert and advance: the event is recorded, the pipeline
                // moves on.
                error!(
                    consumer = name,
                    position = record.position,
                    kind = %record.kind,
                    bill_id = %record.entity_id,
                    error = %message,
                    "dead-lettering event"
                );
                changes.push(RowChange::DeadLetter(DeadLetterRow {
                    consumer: name.to_string(),
                    position: record.position,
                    kind: record.kind.clone(),
                    bill_id: record.entity_id.clone(),
                    error: message,
                    recorded_at: Utc::now(),
                }));
            }
        }
        last_position = record.position;
    }

    match store.apply(name, last_position, &changes) {
        Ok(()) => {
            debug!(consumer = name, position = last_position, "batch committed");
            Step::Progressed
        }
        Err(e) => Step::Failed(e.to_string()),
    }
}

fn handle_with_budget<H>(
    handler: &mut H,
    record: &EventRecord,
    config: &ConsumerConfig,
    backoff: &BackoffPolicy,
) -> Result<Vec<RowChange>, String>
where
    H: LogHandler,
{
    let mut attempt = 0u32;
    loop {
        match handler.handle(record) {
            Ok(changes) => return Ok(changes),
            Err(HandlerError::Permanent(message)) => return Err(message),
            Err(HandlerError::Transient(message)) => {
                attempt += 1;
                if attempt >= config.poison_budget.max(1) {
                    return Err(message);
                }
                debug!(
                    consumer = handler.consumer_name(),
                    position = record.position,
                    attempt,
                    error = %message,
                    "handler failed, retrying"
                );
                backoff.sleep(attempt - 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerConfig;
    use crate::event_log::{InMemoryEventLog, NewEvent};
    use crate::read_model::InMemoryReadModelStore;
    use billflow_core::BillId;
    use serde_json::json;
    use std::time::Duration;

    struct CountingHandler {
        seen: Vec<u64>,
        fail_position: Option<u64>,
        failures_left: u32,
    }

    impl LogHandler for CountingHandler {
        fn consumer_name(&self) -> &'static str {
            "counting"
        }

        fn handle(&mut self, record: &EventRecord) -> Result<Vec<RowChange>, HandlerError> {
            if self.fail_position == Some(record.position) && self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(HandlerError::Transient("boom".to_string()));
            }
            self.seen.push(record.position);
            Ok(vec![])
        }
    }

    fn seed(log: &InMemoryEventLog, bill: &str, count: usize) {
        let id = BillId::new(bill).unwrap();
        for i in 0..count {
            log.append(
                &id,
                i as u64,
                vec![NewEvent {
                    kind: "Test",
                    payload: json!({ "i": i }),
                    occurred_at: Utc::now(),
                }],
            )
            .unwrap();
        }
    }

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig {
            batch_size: 1,
            poison_budget: 3,
            poll_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn drain_processes_in_order_and_advances_token() {
        let log = InMemoryEventLog::new();
        let store = InMemoryReadModelStore::new();
        seed(&log, "a", 3);
        seed(&log, "b", 2);

        let mut handler = CountingHandler {
            seen: vec![],
            fail_position: None,
            failures_left: 0,
        };
        let token = LogConsumer::drain(&log, &store, &mut handler, &fast_config()).unwrap();

        assert_eq!(token, 5);
        assert_eq!(handler.seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(store.tracking_position("counting").unwrap(), 5);
    }

    #[test]
    fn transient_failures_retry_within_budget() {
        let log = InMemoryEventLog::new();
        let store = InMemoryReadModelStore::new();
        seed(&log, "a", 2);

        let mut handler = CountingHandler {
            seen: vec![],
            fail_position: Some(2),
            failures_left: 2, // under the budget of 3
        };
        LogConsumer::drain(&log, &store, &mut handler, &fast_config()).unwrap();

        assert_eq!(handler.seen, vec![1, 2]);
        assert!(store.dead_letters().unwrap().is_empty());
    }

    #[test]
    fn exhausted_budget_dead_letters_and_advances() {
        let log = InMemoryEventLog::new();
        let store = InMemoryReadModelStore::new();
        seed(&log, "a", 3);

        let mut handler = CountingHandler {
            seen: vec![],
            fail_position: Some(2),
            failures_left: 99,
        };
        let token = LogConsumer::drain(&log, &store, &mut handler, &fast_config()).unwrap();

        assert_eq!(token, 3);
        assert_eq!(handler.seen, vec![1, 3]);
        let dead = store.dead_letters().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].position, 2);
        assert_eq!(dead[0].consumer, "counting");
    }

    #[test]
    fn spawned_consumer_catches_up_and_follows() {
        let log = std::sync::Arc::new(InMemoryEventLog::new());
        let store = std::sync::Arc::new(InMemoryReadModelStore::new());
        seed(&log, "a", 2);

        struct NoopHandler;
        impl LogHandler for NoopHandler {
            fn consumer_name(&self) -> &'static str {
                "noop"
            }
            fn handle(&mut self, _record: &EventRecord) -> Result<Vec<RowChange>, HandlerError> {
                Ok(vec![])
            }
        }

        let handle = LogConsumer::spawn(log.clone(), store.clone(), NoopHandler, fast_config());

        // Live follow: an event appended after startup is also consumed.
        std::thread::sleep(Duration::from_millis(50));
        seed_more(&log);

        wait_until(|| store.tracking_position("noop").unwrap() == 3);
        handle.shutdown();
        assert_eq!(store.tracking_position("noop").unwrap(), 3);
    }

    fn seed_more(log: &InMemoryEventLog) {
        let id = BillId::new("a").unwrap();
        log.append(
            &id,
            2,
            vec![NewEvent {
                kind: "Test",
                payload: json!({}),
                occurred_at: Utc::now(),
            }],
        )
        .unwrap();
    }

    fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached within timeout");
    }
}
