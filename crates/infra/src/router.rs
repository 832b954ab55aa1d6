//! Command execution pipeline.
//!
//! Flow: command → per-entity lock → load (cache or replay) → decide →
//! append → update cache.
//!
//! The router is the only writer to the log and performs no other side
//! effects; OCR, blob, and SMTP work is driven by reactive consumers reading
//! the log.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use billflow_billing::{Bill, BillCommand, codec};
use billflow_core::{Aggregate, AggregateRoot, BillId, CancelToken, RejectionCode};

use crate::config::{FilePolicy, RouterConfig};
use crate::error::ServiceError;
use crate::event_log::{EventLog, EventLogError, NewEvent};
use crate::util::BackoffPolicy;

const TRANSIENT_ATTEMPTS: u32 = 3;

/// Result of a successfully dispatched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReceipt {
    pub bill_id: BillId,
    /// The entity's next unused sequence after this command.
    pub next_sequence: u64,
    /// Global position of the last event appended.
    pub last_position: u64,
}

/// Hot-entity state cache with LRU eviction.
#[derive(Debug, Default)]
struct StateCache {
    capacity: usize,
    map: HashMap<BillId, Bill>,
    order: VecDeque<BillId>,
}

impl StateCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, id: &BillId) -> Option<Bill> {
        let bill = self.map.get(id).cloned()?;
        self.touch(id);
        Some(bill)
    }

    fn put(&mut self, id: BillId, bill: Bill) {
        if self.capacity == 0 {
            return;
        }
        self.map.insert(id.clone(), bill);
        self.touch(&id);
        while self.map.len() > self.capacity {
            match self.order.pop_front() {
                Some(evicted) => {
                    self.map.remove(&evicted);
                }
                None => break,
            }
        }
    }

    fn invalidate(&mut self, id: &BillId) {
        self.map.remove(id);
        self.order.retain(|other| other != id);
    }

    fn touch(&mut self, id: &BillId) {
        self.order.retain(|other| other != id);
        self.order.push_back(id.clone());
    }
}

/// Routes commands to bill entities with at-most-one in-flight command per
/// entity id. Distinct entities proceed in parallel.
pub struct CommandRouter<L> {
    log: L,
    policy: FilePolicy,
    retry_on_conflict: u32,
    backoff: BackoffPolicy,
    cache: Mutex<StateCache>,
    locks: Mutex<HashMap<BillId, Arc<Mutex<()>>>>,
    poisoned: Mutex<HashSet<BillId>>,
}

impl<L> CommandRouter<L>
where
    L: EventLog,
{
    pub fn new(log: L, config: RouterConfig, policy: FilePolicy) -> Self {
        Self {
            log,
            policy,
            retry_on_conflict: config.retry_on_conflict,
            backoff: BackoffPolicy::default(),
            cache: Mutex::new(StateCache::new(config.cache_size)),
            locks: Mutex::new(HashMap::new()),
            poisoned: Mutex::new(HashSet::new()),
        }
    }

    /// Dispatch a command on behalf of an (opaque, unvalidated) caller.
    pub fn dispatch(&self, command: BillCommand, caller: &str) -> Result<CommandReceipt, ServiceError> {
        self.dispatch_with_cancel(command, caller, &CancelToken::new())
    }

    /// Dispatch with best-effort cancellation: the token is checked on entry
    /// and immediately before the append; once the append has begun it runs
    /// to completion.
    pub fn dispatch_with_cancel(
        &self,
        command: BillCommand,
        caller: &str,
        cancel: &CancelToken,
    ) -> Result<CommandReceipt, ServiceError> {
        if cancel.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }

        let bill_id = command.bill_id().clone();
        debug!(bill_id = %bill_id, caller = %caller, "dispatching command");

        let entity_lock = self.entity_lock(&bill_id);
        let _serialized = entity_lock
            .lock()
            .map_err(|_| ServiceError::InternalError("entity lock poisoned".to_string()))?;

        if self.is_poisoned(&bill_id) {
            return Err(ServiceError::InternalError(format!(
                "bill {bill_id} is poisoned; operator intervention required"
            )));
        }

        self.check_policy(&command)?;

        let mut conflict_attempts = 0u32;
        loop {
            let mut bill = self.load(&bill_id)?;

            let events = bill.handle(&command).map_err(ServiceError::from)?;
            let new_events = events
                .iter()
                .map(NewEvent::from_event)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ServiceError::InternalError(e.to_string()))?;

            if cancel.is_cancelled() {
                return Err(ServiceError::Cancelled);
            }

            match self.append_with_retry(&bill_id, bill.version(), new_events) {
                Ok(records) => {
                    for event in &events {
                        bill.apply(event);
                    }
                    let last_position = records.last().map(|r| r.position).unwrap_or_default();
                    let next_sequence = bill.version();
                    if let Ok(mut cache) = self.cache.lock() {
                        cache.put(bill_id.clone(), bill);
                    }
                    return Ok(CommandReceipt {
                        bill_id,
                        next_sequence,
                        last_position,
                    });
                }
                Err(EventLogError::ConcurrencyConflict { expected, found, .. }) => {
                    // Our snapshot was stale (another process appended).
                    // Reload and re-validate against fresh state.
                    self.invalidate(&bill_id);
                    conflict_attempts += 1;
                    if conflict_attempts > self.retry_on_conflict {
                        warn!(bill_id = %bill_id, "giving up after {conflict_attempts} conflicting appends");
                        return Err(ServiceError::ConcurrencyConflict(format!(
                            "expected sequence {expected}, log at {found}"
                        )));
                    }
                    debug!(bill_id = %bill_id, attempt = conflict_attempts, "stale state, retrying");
                }
                Err(err @ EventLogError::StorageUnavailable(_)) => {
                    return Err(ServiceError::TransientFailure(err.to_string()));
                }
                Err(err) => {
                    return Err(ServiceError::InternalError(err.to_string()));
                }
            }
        }
    }

    /// Clear a poisoned entity after operator intervention. The next command
    /// reloads it from the log.
    pub fn clear_poison(&self, bill_id: &BillId) {
        if let Ok(mut poisoned) = self.poisoned.lock() {
            poisoned.remove(bill_id);
        }
        self.invalidate(bill_id);
    }

    fn entity_lock(&self, bill_id: &BillId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(bill_id.clone()).or_default().clone()
    }

    fn is_poisoned(&self, bill_id: &BillId) -> bool {
        self.poisoned
            .lock()
            .map(|set| set.contains(bill_id))
            .unwrap_or(false)
    }

    fn poison(&self, bill_id: &BillId) {
        error!(bill_id = %bill_id, "poisoning entity after replay failure");
        if let Ok(mut poisoned) = self.poisoned.lock() {
            poisoned.insert(bill_id.clone());
        }
        self.invalidate(bill_id);
    }

    fn invalidate(&self, bill_id: &BillId) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.invalidate(bill_id);
        }
    }

    /// Configuration-level validation that is independent of entity state.
    fn check_policy(&self, command: &BillCommand) -> Result<(), ServiceError> {
        if let BillCommand::AttachFile(cmd) = command {
            if cmd.size_bytes > self.policy.max_bytes {
                return Err(ServiceError::BusinessRuleViolation {
                    code: RejectionCode::FileTooLarge,
                    message: format!(
                        "file of {} bytes exceeds limit of {} bytes",
                        cmd.size_bytes, self.policy.max_bytes
                    ),
                });
            }
            if !self.policy.allows_content_type(&cmd.content_type) {
                return Err(ServiceError::BusinessRuleViolation {
                    code: RejectionCode::ContentTypeNotAllowed,
                    message: format!("content type {:?} is not accepted", cmd.content_type),
                });
            }
        }
        Ok(())
    }

    fn load(&self, bill_id: &BillId) -> Result<Bill, ServiceError> {
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(bill) = cache.get(bill_id) {
                return Ok(bill);
            }
        }

        let records = self.read_with_retry(bill_id)?;

        let mut bill = Bill::empty(bill_id.clone());
        let mut expected_sequence = 0u64;
        for record in &records {
            if record.sequence != expected_sequence {
                self.poison(bill_id);
                return Err(ServiceError::InternalError(format!(
                    "stream for {bill_id} is not dense: expected {expected_sequence}, found {}",
                    record.sequence
                )));
            }
            expected_sequence += 1;

            match codec::decode_record(record) {
                Ok(event) => bill.apply(&event),
                Err(e) => {
                    self.poison(bill_id);
                    return Err(ServiceError::InternalError(format!(
                        "replay of {bill_id} failed at sequence {}: {e}",
                        record.sequence
                    )));
                }
            }
        }

        Ok(bill)
    }

    fn read_with_retry(
        &self,
        bill_id: &BillId,
    ) -> Result<Vec<billflow_events::EventRecord>, ServiceError> {
        let mut attempt = 0u32;
        loop {
            match self.log.read_entity(bill_id, 0) {
                Ok(records) => return Ok(records),
                Err(e) if e.is_transient() && attempt + 1 < TRANSIENT_ATTEMPTS => {
                    self.backoff.sleep(attempt);
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(ServiceError::TransientFailure(e.to_string()));
                }
                Err(e) => return Err(ServiceError::InternalError(e.to_string())),
            }
        }
    }

    fn append_with_retry(
        &self,
        bill_id: &BillId,
        expected_next_sequence: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<billflow_events::EventRecord>, EventLogError> {
        let mut attempt = 0u32;
        loop {
            match self.log.append(bill_id, expected_next_sequence, events.clone()) {
                Err(e) if e.is_transient() && attempt + 1 < TRANSIENT_ATTEMPTS => {
                    self.backoff.sleep(attempt);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
