use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use serde_json::Value;

use easel_contracts::events::{EventPayload, EventWriter};
use easel_contracts::progress::ProgressLedger;
use easel_contracts::prompt::{GenerationQueue, PromptOutcome, PromptState, QueuedPrompt};
use easel_contracts::sync::CancelToken;

use crate::insert::DeferredImage;
use crate::{GenerateRequest, ImageProvider, StyleOptions};

/// Hard ceiling for simultaneous backend calls.
pub const MAX_CONCURRENT_LIMIT: usize = 4;

const SETTLE_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub max_concurrent: usize,
    pub style: StyleOptions,
    pub out_dir: PathBuf,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            style: StyleOptions::default(),
            out_dir: std::env::temp_dir().join("easel"),
        }
    }
}

/// Bounded-concurrency queue drain. Launches are gated on a live atomic
/// counter, never a semaphore; each launched generation runs on its own
/// worker thread and re-triggers the drain when it settles.
#[derive(Clone)]
pub struct QueueProcessor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    message_id: String,
    queue: Arc<Mutex<GenerationQueue>>,
    provider: Arc<dyn ImageProvider>,
    progress: Arc<ProgressLedger>,
    cancel: CancelToken,
    audit: Option<EventWriter>,
    max_concurrent: usize,
    style: StyleOptions,
    out_dir: PathBuf,
    active: AtomicUsize,
    draining: AtomicBool,
    sealed: AtomicBool,
    deferred: Mutex<Vec<DeferredImage>>,
}

impl QueueProcessor {
    pub fn new(
        message_id: &str,
        queue: Arc<Mutex<GenerationQueue>>,
        provider: Arc<dyn ImageProvider>,
        progress: Arc<ProgressLedger>,
        cancel: CancelToken,
        config: ProcessorConfig,
        audit: Option<EventWriter>,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                message_id: message_id.to_string(),
                queue,
                provider,
                progress,
                cancel,
                audit,
                max_concurrent: config.max_concurrent.clamp(1, MAX_CONCURRENT_LIMIT),
                style: config.style,
                out_dir: config.out_dir,
                active: AtomicUsize::new(0),
                draining: AtomicBool::new(false),
                sealed: AtomicBool::new(false),
                deferred: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.inner.message_id
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Backend calls currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Begins draining. Counters start at zero on construction; this is
    /// the explicit entry point a fresh session calls once wiring is done.
    pub fn start(&self) {
        self.trigger();
    }

    /// Idempotent drain entry point, safe to call from any thread at any
    /// time (the monitor calls it whenever new prompts land). A no-op
    /// when a drain is already in progress; the re-check loop closes the
    /// window where a worker settles between our drain and our return.
    pub fn trigger(&self) {
        loop {
            if self.inner.draining.swap(true, Ordering::SeqCst) {
                return;
            }
            self.drain();
            self.inner.draining.store(false, Ordering::SeqCst);
            if !self.work_ready() {
                return;
            }
        }
    }

    fn drain(&self) {
        while !self.inner.cancel.is_cancelled() && !self.inner.sealed.load(Ordering::SeqCst) {
            if self.inner.active.load(Ordering::SeqCst) >= self.inner.max_concurrent {
                break;
            }
            let Some(entry) = self.claim_next() else {
                break;
            };
            self.inner.active.fetch_add(1, Ordering::SeqCst);
            let worker = self.clone();
            let job = entry.clone();
            let spawned = thread::Builder::new()
                .name("easel-generate".to_string())
                .spawn(move || worker.run_worker(job));
            if let Err(err) = spawned {
                // Could not even start the thread; settle the entry as a
                // failure so finalization is not left hanging.
                self.inner.active.fetch_sub(1, Ordering::SeqCst);
                self.record_failure(&entry, &format!("worker spawn failed: {err}"), Instant::now());
                self.settle_progress(&entry);
            }
        }
    }

    fn run_worker(self, entry: QueuedPrompt) {
        self.generate_one(&entry);
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
        self.settle_progress(&entry);
        self.trigger();
    }

    /// Final drain. Seals the processor so no further workers launch (the
    /// caller has stopped the monitor, so no new work arrives either),
    /// blocks until every in-flight generation settles, then processes
    /// anything still queued strictly one at a time so shutdown never
    /// bursts the backend.
    pub fn process_remaining(&self, timeout: Duration) -> Result<()> {
        self.inner.sealed.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        // A settling worker decrements the counter before it re-triggers,
        // so the counter alone can read zero while a drain is mid-claim.
        // The drain flag covers that window; sealed drains launch nothing.
        while self.inner.draining.load(Ordering::SeqCst)
            || self.inner.active.load(Ordering::SeqCst) > 0
        {
            if self.inner.cancel.is_cancelled() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "timed out waiting for {} in-flight generation(s) to settle",
                    self.inner.active.load(Ordering::SeqCst)
                );
            }
            thread::sleep(SETTLE_POLL);
        }
        while !self.inner.cancel.is_cancelled() {
            let Some(entry) = self.claim_next() else {
                break;
            };
            self.generate_one(&entry);
            self.settle_progress(&entry);
        }
        Ok(())
    }

    /// Accumulated successes, in completion order.
    pub fn deferred_images(&self) -> Vec<DeferredImage> {
        self.lock_deferred().clone()
    }

    /// Entries still waiting when the session is torn down.
    pub fn pending_count(&self) -> usize {
        self.lock_queue().stats().queued
    }

    fn claim_next(&self) -> Option<QueuedPrompt> {
        let mut queue = self.lock_queue();
        let id = queue.next_pending()?.id.clone();
        queue.update_state(&id, PromptState::Generating, PromptOutcome::None);
        queue.get(&id).cloned()
    }

    fn work_ready(&self) -> bool {
        !self.inner.cancel.is_cancelled()
            && !self.inner.sealed.load(Ordering::SeqCst)
            && self.inner.active.load(Ordering::SeqCst) < self.inner.max_concurrent
            && self.lock_queue().next_pending().is_some()
    }

    fn generate_one(&self, entry: &QueuedPrompt) {
        let request = GenerateRequest {
            prompt: self.inner.style.apply(&entry.text),
            model: self.inner.style.model.clone(),
            size: self.inner.style.size.clone(),
            out_dir: self.inner.out_dir.clone(),
        };
        let started = Instant::now();
        let result = self.inner.provider.generate(&request);
        let discarded = self.inner.cancel.is_cancelled();
        match result {
            Ok(generated) if !generated.url.is_empty() => {
                self.lock_queue().update_state(
                    &entry.id,
                    PromptState::Completed,
                    PromptOutcome::ImageUrl(generated.url.clone()),
                );
                if !discarded {
                    self.lock_deferred().push(DeferredImage {
                        prompt: entry.text.clone(),
                        raw_tag: entry.raw.clone(),
                        image_url: generated.url.clone(),
                        regen: entry.regen.clone(),
                    });
                }
                self.audit_generation(entry, "generation_completed", started, |payload| {
                    payload.insert("image_url".to_string(), Value::String(generated.url));
                });
            }
            Ok(_) => self.record_failure(entry, "backend returned an empty image url", started),
            Err(err) => self.record_failure(entry, &format!("{err:#}"), started),
        }
    }

    fn record_failure(&self, entry: &QueuedPrompt, message: &str, started: Instant) {
        self.lock_queue().update_state(
            &entry.id,
            PromptState::Failed,
            PromptOutcome::Error(message.to_string()),
        );
        let message = message.to_string();
        self.audit_generation(entry, "generation_failed", started, move |payload| {
            payload.insert("error".to_string(), Value::String(message));
        });
    }

    // Failure counts as completed for progress purposes; it never blocks
    // finalization. Ordering matters: the in-flight counter is already
    // decremented by the caller before progress settles, so a completion
    // listener that drains remaining work does not wait on this worker.
    fn settle_progress(&self, entry: &QueuedPrompt) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        let succeeded = self
            .lock_queue()
            .get(&entry.id)
            .map(|current| current.state == PromptState::Completed)
            .unwrap_or(false);
        if succeeded {
            self.inner.progress.complete_task(&self.inner.message_id);
        } else {
            self.inner.progress.fail_task(&self.inner.message_id);
        }
    }

    fn audit_generation(
        &self,
        entry: &QueuedPrompt,
        event_type: &str,
        started: Instant,
        extend: impl FnOnce(&mut EventPayload),
    ) {
        let Some(audit) = &self.inner.audit else {
            return;
        };
        let mut payload = EventPayload::new();
        payload.insert(
            "message_id".to_string(),
            Value::String(self.inner.message_id.clone()),
        );
        payload.insert("prompt_id".to_string(), Value::String(entry.id.clone()));
        payload.insert(
            "duration_ms".to_string(),
            Value::Number((started.elapsed().as_millis() as u64).into()),
        );
        extend(&mut payload);
        let _ = audit.emit(event_type, payload);
    }

    fn lock_queue(&self) -> MutexGuard<'_, GenerationQueue> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_deferred(&self) -> MutexGuard<'_, Vec<DeferredImage>> {
        self.inner
            .deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
