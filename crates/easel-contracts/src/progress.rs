use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{EventPayload, EventWriter};
use crate::sync::CancelToken;

/// Event emitted by the ledger. Delivery is synchronous and in order;
/// any number of subscribers may listen without affecting core behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started {
        message_id: String,
        total: u64,
    },
    Updated {
        message_id: String,
        total: u64,
        completed: u64,
        succeeded: u64,
        failed: u64,
    },
    AllComplete {
        message_id: String,
        total: u64,
        succeeded: u64,
        failed: u64,
        duration_ms: u64,
    },
    Cleared {
        message_id: String,
    },
}

impl ProgressEvent {
    pub fn message_id(&self) -> &str {
        match self {
            Self::Started { message_id, .. }
            | Self::Updated { message_id, .. }
            | Self::AllComplete { message_id, .. }
            | Self::Cleared { message_id } => message_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "progress_started",
            Self::Updated { .. } => "progress_updated",
            Self::AllComplete { .. } => "progress_all_complete",
            Self::Cleared { .. } => "progress_cleared",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total: u64,
    pub completed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug)]
struct ProgressRecord {
    total: u64,
    completed: u64,
    succeeded: u64,
    failed: u64,
    started_at: Instant,
    complete_emitted: bool,
}

impl ProgressRecord {
    fn is_complete(&self) -> bool {
        self.completed >= self.total
    }

    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total,
            completed: self.completed,
            succeeded: self.succeeded,
            failed: self.failed,
        }
    }
}

/// Why `wait_all_complete` gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    TimedOut { waited_ms: u64 },
    Aborted,
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimedOut { waited_ms } => {
                write!(f, "timed out after {waited_ms}ms waiting for tasks to complete")
            }
            Self::Aborted => write!(f, "wait aborted by cancellation"),
        }
    }
}

impl std::error::Error for WaitError {}

pub type ProgressListener = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

// Abort has no condvar of its own, so blocked waits wake on short slices
// to re-check the token.
const WAIT_SLICE: Duration = Duration::from_millis(25);

/// Process-wide ledger of per-message task totals and completions,
/// decoupled from any view. All mutation is synchronous under one lock;
/// callers must re-check state after any blocking wait.
pub struct ProgressLedger {
    state: Mutex<BTreeMap<String, ProgressRecord>>,
    changed: Condvar,
    listeners: Mutex<Vec<(u64, ProgressListener)>>,
    next_listener_id: AtomicU64,
    audit: Option<EventWriter>,
}

impl ProgressLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BTreeMap::new()),
            changed: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            audit: None,
        }
    }

    /// Same ledger, with every event mirrored to an append-only jsonl
    /// audit trail.
    pub fn with_audit(audit: EventWriter) -> Self {
        let mut ledger = Self::new();
        ledger.audit = Some(audit);
        ledger
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&ProgressEvent) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.lock_listeners().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.lock_listeners().retain(|(entry, _)| *entry != id);
    }

    /// Registers `n` tasks for a message. The first call initializes the
    /// record and emits `Started`; later calls grow the total so new
    /// prompts can be discovered mid-stream without resetting completed
    /// counts.
    pub fn register_task(&self, message_id: &str, n: u64) {
        let mut events = Vec::new();
        {
            let mut state = self.lock_state();
            match state.get_mut(message_id) {
                None => {
                    state.insert(
                        message_id.to_string(),
                        ProgressRecord {
                            total: n,
                            completed: 0,
                            succeeded: 0,
                            failed: 0,
                            started_at: Instant::now(),
                            complete_emitted: false,
                        },
                    );
                    events.push(ProgressEvent::Started {
                        message_id: message_id.to_string(),
                        total: n,
                    });
                }
                Some(record) => {
                    record.total += n;
                    if record.completed < record.total {
                        record.complete_emitted = false;
                    }
                    events.push(updated_event(message_id, record));
                }
            }
        }
        self.finish_mutation(events);
    }

    pub fn complete_task(&self, message_id: &str) {
        self.settle_task(message_id, true);
    }

    pub fn fail_task(&self, message_id: &str) {
        self.settle_task(message_id, false);
    }

    fn settle_task(&self, message_id: &str, succeeded: bool) {
        let mut events = Vec::new();
        {
            let mut state = self.lock_state();
            let Some(record) = state.get_mut(message_id) else {
                drop(state);
                self.warn_unknown(message_id, if succeeded { "complete_task" } else { "fail_task" });
                return;
            };
            record.completed += 1;
            if succeeded {
                record.succeeded += 1;
            } else {
                record.failed += 1;
            }
            events.push(updated_event(message_id, record));
            if record.is_complete() && !record.complete_emitted {
                record.complete_emitted = true;
                events.push(ProgressEvent::AllComplete {
                    message_id: message_id.to_string(),
                    total: record.total,
                    succeeded: record.succeeded,
                    failed: record.failed,
                    duration_ms: record.started_at.elapsed().as_millis() as u64,
                });
            }
        }
        self.finish_mutation(events);
    }

    /// Replaces the denominator without touching completed counts.
    pub fn update_total(&self, message_id: &str, new_total: u64) {
        let mut events = Vec::new();
        {
            let mut state = self.lock_state();
            let Some(record) = state.get_mut(message_id) else {
                drop(state);
                self.warn_unknown(message_id, "update_total");
                return;
            };
            record.total = new_total;
            if record.completed < record.total {
                record.complete_emitted = false;
            }
            events.push(updated_event(message_id, record));
            if record.is_complete() && !record.complete_emitted {
                record.complete_emitted = true;
                events.push(ProgressEvent::AllComplete {
                    message_id: message_id.to_string(),
                    total: record.total,
                    succeeded: record.succeeded,
                    failed: record.failed,
                    duration_ms: record.started_at.elapsed().as_millis() as u64,
                });
            }
        }
        self.finish_mutation(events);
    }

    /// Shrinks the denominator when queued-but-not-started work is
    /// cancelled. Auto-clears the record once the new total is zero or
    /// already met.
    pub fn decrement_total(&self, message_id: &str, n: u64) {
        let mut events = Vec::new();
        {
            let mut state = self.lock_state();
            let Some(record) = state.get_mut(message_id) else {
                drop(state);
                self.warn_unknown(message_id, "decrement_total");
                return;
            };
            record.total = record.total.saturating_sub(n);
            if record.total == 0 || record.is_complete() {
                state.remove(message_id);
                events.push(ProgressEvent::Cleared {
                    message_id: message_id.to_string(),
                });
            } else {
                let record = state.get(message_id).expect("record present");
                events.push(updated_event(message_id, record));
            }
        }
        self.finish_mutation(events);
    }

    pub fn clear(&self, message_id: &str) {
        let mut events = Vec::new();
        {
            let mut state = self.lock_state();
            if state.remove(message_id).is_some() {
                events.push(ProgressEvent::Cleared {
                    message_id: message_id.to_string(),
                });
            }
        }
        self.finish_mutation(events);
    }

    pub fn is_complete(&self, message_id: &str) -> bool {
        self.lock_state()
            .get(message_id)
            .map(ProgressRecord::is_complete)
            .unwrap_or(false)
    }

    pub fn is_tracked(&self, message_id: &str) -> bool {
        self.lock_state().contains_key(message_id)
    }

    pub fn snapshot(&self, message_id: &str) -> Option<ProgressSnapshot> {
        self.lock_state()
            .get(message_id)
            .map(ProgressRecord::snapshot)
    }

    /// Blocks until every registered task for the message has settled.
    /// Resolves immediately when the message is untracked or already
    /// complete, even on a token already cancelled on entry; errs when
    /// `timeout` elapses first or `cancel` fires while work remains.
    pub fn wait_all_complete(
        &self,
        message_id: &str,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<(), WaitError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut state = self.lock_state();
        loop {
            let done = state
                .get(message_id)
                .map(ProgressRecord::is_complete)
                .unwrap_or(true);
            if done {
                return Ok(());
            }
            if cancel.map(CancelToken::is_cancelled).unwrap_or(false) {
                return Err(WaitError::Aborted);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::TimedOut {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            let slice = WAIT_SLICE.min(deadline - now);
            let (guard, _) = self
                .changed
                .wait_timeout(state, slice)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn warn_unknown(&self, message_id: &str, operation: &str) {
        if let Some(audit) = &self.audit {
            let mut payload = EventPayload::new();
            payload.insert(
                "message_id".to_string(),
                Value::String(message_id.to_string()),
            );
            payload.insert(
                "operation".to_string(),
                Value::String(operation.to_string()),
            );
            let _ = audit.emit("progress_warning_unregistered", payload);
        }
    }

    fn finish_mutation(&self, events: Vec<ProgressEvent>) {
        if events.is_empty() {
            return;
        }
        self.changed.notify_all();
        // Snapshot subscribers first so a listener can call back into the
        // ledger without deadlocking.
        let listeners: Vec<ProgressListener> = self
            .lock_listeners()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for event in &events {
            if let Some(audit) = &self.audit {
                let _ = audit.emit(event.kind(), audit_payload(event));
            }
            for listener in &listeners {
                listener(event);
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BTreeMap<String, ProgressRecord>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<(u64, ProgressListener)>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ProgressLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn updated_event(message_id: &str, record: &ProgressRecord) -> ProgressEvent {
    ProgressEvent::Updated {
        message_id: message_id.to_string(),
        total: record.total,
        completed: record.completed,
        succeeded: record.succeeded,
        failed: record.failed,
    }
}

fn audit_payload(event: &ProgressEvent) -> EventPayload {
    let mut payload = EventPayload::new();
    payload.insert(
        "message_id".to_string(),
        Value::String(event.message_id().to_string()),
    );
    match event {
        ProgressEvent::Started { total, .. } => {
            payload.insert("total".to_string(), Value::Number((*total).into()));
        }
        ProgressEvent::Updated {
            total,
            completed,
            succeeded,
            failed,
            ..
        } => {
            payload.insert("total".to_string(), Value::Number((*total).into()));
            payload.insert("completed".to_string(), Value::Number((*completed).into()));
            payload.insert("succeeded".to_string(), Value::Number((*succeeded).into()));
            payload.insert("failed".to_string(), Value::Number((*failed).into()));
        }
        ProgressEvent::AllComplete {
            total,
            succeeded,
            failed,
            duration_ms,
            ..
        } => {
            payload.insert("total".to_string(), Value::Number((*total).into()));
            payload.insert("succeeded".to_string(), Value::Number((*succeeded).into()));
            payload.insert("failed".to_string(), Value::Number((*failed).into()));
            payload.insert(
                "duration_ms".to_string(),
                Value::Number((*duration_ms).into()),
            );
        }
        ProgressEvent::Cleared { .. } => {}
    }
    payload
}
