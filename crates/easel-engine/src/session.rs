use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;
use uuid::Uuid;

use easel_contracts::events::{EventPayload, EventWriter};
use easel_contracts::progress::{ProgressEvent, ProgressLedger};
use easel_contracts::prompt::{
    extract_prompts, GenerationQueue, InsertionMode, PromptPattern, RegenTarget,
};
use easel_contracts::sync::CancelToken;
use easel_contracts::transcript::TranscriptStore;

use crate::insert::BatchInserter;
use crate::monitor::{StreamingMonitor, DEFAULT_POLL_INTERVAL};
use crate::processor::{ProcessorConfig, QueueProcessor};
use crate::{ImageProvider, StyleOptions};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub patterns: Vec<PromptPattern>,
    pub poll_interval: Duration,
    pub max_concurrent: usize,
    pub finalize_timeout: Duration,
    pub style: StyleOptions,
    pub out_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            patterns: easel_contracts::prompt::default_patterns(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_concurrent: 1,
            finalize_timeout: Duration::from_secs(180),
            style: StyleOptions::default(),
            out_dir: std::env::temp_dir().join("easel"),
        }
    }
}

/// The two supported session shapes. A streaming session owns a monitor;
/// a regeneration session owns a ledger subscription that auto-finalizes
/// once every queued regeneration has settled.
enum SessionKind {
    Streaming { monitor: StreamingMonitor },
    Regeneration { subscription: u64 },
}

impl SessionKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Streaming { .. } => "streaming",
            Self::Regeneration { .. } => "regeneration",
        }
    }
}

struct SessionHandle {
    session_id: String,
    kind: SessionKind,
    queue: Arc<Mutex<GenerationQueue>>,
    processor: QueueProcessor,
    cancel: CancelToken,
    started_at: Instant,
    finalizing: Arc<AtomicBool>,
}

/// Top-level coordinator. Enforces at-most-one-session-per-message and
/// runs the streaming and regeneration lifecycles to completion. One
/// instance is constructed by the host at startup and shared; there is no
/// process-global state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    transcript: Arc<dyn TranscriptStore>,
    provider: Arc<dyn ImageProvider>,
    inserter: Arc<dyn BatchInserter>,
    progress: Arc<ProgressLedger>,
    config: SessionConfig,
    audit: Option<EventWriter>,
    sessions: Mutex<BTreeMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new(
        transcript: Arc<dyn TranscriptStore>,
        provider: Arc<dyn ImageProvider>,
        inserter: Arc<dyn BatchInserter>,
        progress: Arc<ProgressLedger>,
        config: SessionConfig,
        audit: Option<EventWriter>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                transcript,
                provider,
                inserter,
                progress,
                config,
                audit,
                sessions: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn progress(&self) -> &Arc<ProgressLedger> {
        &self.inner.progress
    }

    pub fn active_session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn session_kind(&self, message_id: &str) -> Option<&'static str> {
        self.lock_sessions()
            .get(message_id)
            .map(|handle| handle.kind.name())
    }

    /// Host signal: a new output chunk arrived for this message. Starts
    /// (or returns) the streaming session; repeated signals for the same
    /// message are idempotent. A regeneration session for the same id is
    /// superseded — cancelled before the streaming session starts.
    pub fn start_streaming_session(&self, message_id: &str) -> String {
        let superseded = {
            let mut sessions = self.lock_sessions();
            let existing_streaming = sessions
                .get(message_id)
                .filter(|handle| {
                    matches!(handle.kind, SessionKind::Streaming { .. })
                        && !handle.finalizing.load(Ordering::SeqCst)
                })
                .map(|handle| handle.session_id.clone());
            if let Some(session_id) = existing_streaming {
                return session_id;
            }
            sessions.remove(message_id)
        };
        if let Some(old) = superseded {
            self.teardown(old, "superseded");
        }

        let queue = Arc::new(Mutex::new(GenerationQueue::new()));
        let cancel = CancelToken::new();
        let processor = self.build_processor(message_id, Arc::clone(&queue), cancel.clone());

        let callback_processor = processor.clone();
        let callback_progress = Arc::clone(&self.inner.progress);
        let callback_message = message_id.to_string();
        let monitor = StreamingMonitor::start(
            message_id,
            Arc::clone(&self.inner.transcript),
            Arc::clone(&queue),
            self.inner.config.patterns.clone(),
            self.inner.config.poll_interval,
            Box::new(move |added| {
                callback_progress.register_task(&callback_message, added as u64);
                callback_processor.trigger();
            }),
            self.inner.audit.clone(),
        );
        processor.start();

        let session_id = Uuid::new_v4().to_string();
        let handle = SessionHandle {
            session_id: session_id.clone(),
            kind: SessionKind::Streaming { monitor },
            queue,
            processor,
            cancel,
            started_at: Instant::now(),
            finalizing: Arc::new(AtomicBool::new(false)),
        };
        self.audit_session("session_started", message_id, &handle, None);
        self.lock_sessions().insert(message_id.to_string(), handle);
        session_id
    }

    /// Host signal: generation of this message has fully ended. Two-phase
    /// shutdown: (1) final scan, stop the monitor, seal the progress
    /// total to the queue's current size; (2) drain what is left, wait
    /// for every in-flight generation to settle, then hand all deferred
    /// images to the inserter as one atomic batch. The handle stays
    /// registered, flagged finalizing, for the whole drain so a chat
    /// switch can still cancel the wait. Returns the number of images
    /// inserted (0 for a session that produced nothing).
    pub fn finalize_streaming_and_insert(&self, message_id: &str) -> Result<usize> {
        let (session_id, processor, cancel, queued_total) = {
            let mut sessions = self.lock_sessions();
            let Some(handle) = sessions.get_mut(message_id) else {
                return Ok(0);
            };
            if handle.finalizing.swap(true, Ordering::SeqCst) {
                return Ok(0);
            }
            if let SessionKind::Streaming { monitor } = &mut handle.kind {
                monitor.final_scan();
                monitor.stop();
            }
            let total = self.lock_queue_len(handle);
            (
                handle.session_id.clone(),
                handle.processor.clone(),
                handle.cancel.clone(),
                total,
            )
        };
        if self.inner.progress.is_tracked(message_id) {
            self.inner
                .progress
                .update_total(message_id, queued_total as u64);
        }

        let finished = self.drain_and_insert(message_id, &processor, &cancel);
        // Remove only our own handle; a cancel or supersession during the
        // drain may already have replaced it.
        let handle = {
            let mut sessions = self.lock_sessions();
            let ours = sessions
                .get(message_id)
                .is_some_and(|current| current.session_id == session_id);
            if ours {
                sessions.remove(message_id)
            } else {
                None
            }
        };
        match finished {
            Ok(inserted) => {
                if let Some(handle) = &handle {
                    self.audit_session(
                        "session_finalized",
                        message_id,
                        handle,
                        Some(("inserted", Value::Number((inserted as u64).into()))),
                    );
                }
                Ok(inserted)
            }
            Err(err) => {
                self.inner.progress.clear(message_id);
                if let Some(handle) = &handle {
                    self.audit_session(
                        "session_finalize_failed",
                        message_id,
                        handle,
                        Some(("error", Value::String(format!("{err:#}")))),
                    );
                }
                Err(err)
            }
        }
    }

    /// Queues one regeneration request. Reuses (or creates) the
    /// regeneration session for this message; each request gets a fresh
    /// unique queue entry even for textually identical prompts, so rapid
    /// repeated clicks coexist and batch into a single transcript write
    /// once the last one settles.
    pub fn queue_regeneration(
        &self,
        message_id: &str,
        prompt_text: &str,
        target_image_url: Option<&str>,
        mode: InsertionMode,
    ) -> Result<()> {
        let superseded = {
            let mut sessions = self.lock_sessions();
            let other_kind = sessions
                .get(message_id)
                .is_some_and(|handle| !matches!(handle.kind, SessionKind::Regeneration { .. }));
            if other_kind {
                sessions.remove(message_id)
            } else {
                None
            }
        };
        if let Some(old) = superseded {
            self.teardown(old, "superseded");
        }

        let processor = {
            let mut sessions = self.lock_sessions();
            if !sessions.contains_key(message_id) {
                let handle = self.build_regeneration_session(message_id);
                sessions.insert(message_id.to_string(), handle);
            }
            let handle = sessions
                .get(message_id)
                .context("regeneration session vanished during setup")?;
            // The progress total must grow before the entry becomes
            // claimable, or an in-flight sibling settling right now could
            // cross AllComplete and finalize underneath this request.
            self.inner.progress.register_task(message_id, 1);
            let target = RegenTarget {
                target_image_url: target_image_url.map(str::to_string),
                target_prompt: Some(prompt_text.to_string()),
                mode,
            };
            handle
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .add_regeneration(prompt_text, target);
            handle.processor.clone()
        };

        processor.trigger();
        Ok(())
    }

    /// Cancels and removes the session for a message (chat switch,
    /// supersession). Advisory: in-flight backend calls are not
    /// interrupted, their eventual results are discarded; completed work
    /// is never reverted.
    pub fn cancel_session(&self, message_id: &str) -> bool {
        let Some(handle) = self.lock_sessions().remove(message_id) else {
            return false;
        };
        handle.cancel.cancel();
        let pending = handle.processor.pending_count() as u64;
        self.teardown(handle, "cancelled");
        if pending > 0 {
            self.inner.progress.decrement_total(message_id, pending);
        }
        // Drops whatever remains (in-flight work whose results are now
        // discarded); a no-op when the decrement already auto-cleared.
        self.inner.progress.clear(message_id);
        true
    }

    /// Host signal: a complete message arrived outside of streaming.
    /// Direct path: extract once over the full text, process serially,
    /// insert, clear. No monitor and no registered session.
    pub fn process_complete_message(&self, message_id: &str) -> Result<usize> {
        let Some(text) = self.inner.transcript.read(message_id) else {
            return Ok(0);
        };
        let matches = extract_prompts(&text, &self.inner.config.patterns);
        if matches.is_empty() {
            return Ok(0);
        }

        let queue = Arc::new(Mutex::new(GenerationQueue::new()));
        let mut queued = 0u64;
        {
            let mut guard = queue.lock().unwrap_or_else(PoisonError::into_inner);
            for found in matches {
                if guard
                    .add_prompt(&found.text, &found.raw, found.start, found.end)
                    .is_some()
                {
                    queued += 1;
                }
            }
        }
        if queued == 0 {
            return Ok(0);
        }

        let cancel = CancelToken::new();
        let processor = self.build_processor(message_id, queue, cancel.clone());
        self.inner.progress.register_task(message_id, queued);
        let result = processor
            .process_remaining(self.inner.config.finalize_timeout)
            .and_then(|_| {
                self.inner
                    .progress
                    .wait_all_complete(
                        message_id,
                        self.inner.config.finalize_timeout,
                        Some(&cancel),
                    )
                    .map_err(anyhow::Error::from)
            })
            .and_then(|_| {
                self.inner
                    .inserter
                    .insert(&processor.deferred_images(), message_id)
            });
        self.inner.progress.clear(message_id);
        result
    }

    fn build_processor(
        &self,
        message_id: &str,
        queue: Arc<Mutex<GenerationQueue>>,
        cancel: CancelToken,
    ) -> QueueProcessor {
        QueueProcessor::new(
            message_id,
            queue,
            Arc::clone(&self.inner.provider),
            Arc::clone(&self.inner.progress),
            cancel,
            ProcessorConfig {
                max_concurrent: self.inner.config.max_concurrent,
                style: self.inner.config.style.clone(),
                out_dir: self.inner.config.out_dir.clone(),
            },
            self.inner.audit.clone(),
        )
    }

    fn build_regeneration_session(&self, message_id: &str) -> SessionHandle {
        let queue = Arc::new(Mutex::new(GenerationQueue::new()));
        let cancel = CancelToken::new();
        let processor = self.build_processor(message_id, Arc::clone(&queue), cancel.clone());
        let finalizing = Arc::new(AtomicBool::new(false));

        let listener_manager = self.clone();
        let listener_message = message_id.to_string();
        let subscription = self.inner.progress.subscribe(move |event| {
            if let ProgressEvent::AllComplete { message_id, .. } = event {
                if *message_id == listener_message {
                    let _ = listener_manager.finalize_regeneration(&listener_message);
                }
            }
        });

        let handle = SessionHandle {
            session_id: Uuid::new_v4().to_string(),
            kind: SessionKind::Regeneration { subscription },
            queue,
            processor,
            cancel,
            started_at: Instant::now(),
            finalizing,
        };
        self.audit_session("session_started", message_id, &handle, None);
        handle
    }

    /// Runs on the worker thread that settles the last regeneration task.
    fn finalize_regeneration(&self, message_id: &str) -> Result<usize> {
        let handle = {
            let mut sessions = self.lock_sessions();
            let claimed = match sessions.get(message_id) {
                Some(existing) if matches!(existing.kind, SessionKind::Regeneration { .. }) => {
                    // Finalize-once guard; a serial tail drain can fire a
                    // second AllComplete for the same crossing.
                    !existing.finalizing.swap(true, Ordering::SeqCst)
                }
                _ => false,
            };
            if claimed {
                sessions.remove(message_id)
            } else {
                None
            }
        };
        let Some(handle) = handle else {
            return Ok(0);
        };
        if let SessionKind::Regeneration { subscription } = &handle.kind {
            self.inner.progress.unsubscribe(*subscription);
        }

        let finished = self.drain_and_insert(message_id, &handle.processor, &handle.cancel);
        match finished {
            Ok(inserted) => {
                self.audit_session(
                    "session_finalized",
                    message_id,
                    &handle,
                    Some(("inserted", Value::Number((inserted as u64).into()))),
                );
                Ok(inserted)
            }
            Err(err) => {
                self.inner.progress.clear(message_id);
                self.audit_session(
                    "session_finalize_failed",
                    message_id,
                    &handle,
                    Some(("error", Value::String(format!("{err:#}")))),
                );
                Err(err)
            }
        }
    }

    /// Phase two shared by both lifecycles: drain, rendezvous with the
    /// ledger, insert once, clear tracking.
    fn drain_and_insert(
        &self,
        message_id: &str,
        processor: &QueueProcessor,
        cancel: &CancelToken,
    ) -> Result<usize> {
        processor.process_remaining(self.inner.config.finalize_timeout)?;
        self.inner
            .progress
            .wait_all_complete(message_id, self.inner.config.finalize_timeout, Some(cancel))
            .context("session finalization wait failed")?;
        if cancel.is_cancelled() {
            // Cancelled mid-drain; results are discarded, nothing lands.
            return Ok(0);
        }

        let deferred = processor.deferred_images();
        let inserted = if deferred.is_empty() {
            0
        } else {
            self.inner.inserter.insert(&deferred, message_id)?
        };
        self.inner.progress.clear(message_id);
        Ok(inserted)
    }

    fn teardown(&self, mut handle: SessionHandle, reason: &str) {
        handle.cancel.cancel();
        match &mut handle.kind {
            SessionKind::Streaming { monitor } => monitor.stop(),
            SessionKind::Regeneration { subscription } => {
                self.inner.progress.unsubscribe(*subscription);
            }
        }
        self.audit_session(
            "session_cancelled",
            handle.processor.message_id(),
            &handle,
            Some(("reason", Value::String(reason.to_string()))),
        );
    }

    fn lock_queue_len(&self, handle: &SessionHandle) -> usize {
        handle
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn audit_session(
        &self,
        event_type: &str,
        message_id: &str,
        handle: &SessionHandle,
        extra: Option<(&str, Value)>,
    ) {
        let Some(audit) = &self.inner.audit else {
            return;
        };
        let mut payload = EventPayload::new();
        payload.insert(
            "message_id".to_string(),
            Value::String(message_id.to_string()),
        );
        payload.insert(
            "session_id".to_string(),
            Value::String(handle.session_id.clone()),
        );
        payload.insert(
            "session_kind".to_string(),
            Value::String(handle.kind.name().to_string()),
        );
        payload.insert(
            "elapsed_ms".to_string(),
            Value::Number((handle.started_at.elapsed().as_millis() as u64).into()),
        );
        if let Some((key, value)) = extra {
            payload.insert(key.to_string(), value);
        }
        let _ = audit.emit(event_type, payload);
    }

    fn lock_sessions(&self) -> MutexGuard<'_, BTreeMap<String, SessionHandle>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use easel_contracts::progress::{ProgressEvent, ProgressLedger};
    use easel_contracts::prompt::InsertionMode;
    use easel_contracts::transcript::{InMemoryTranscript, TranscriptStore};

    use crate::insert::MarkdownInserter;
    use crate::{GenerateRequest, GeneratedImage, ImageProvider};

    use super::{SessionConfig, SessionManager};

    struct CountingProvider {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingProvider {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
            }
        }
    }

    impl ImageProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        fn generate(&self, request: &GenerateRequest) -> anyhow::Result<GeneratedImage> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            Ok(GeneratedImage {
                url: format!(
                    "file:///{}-{call}.png",
                    request.prompt.replace(' ', "-")
                ),
                width: 8,
                height: 8,
            })
        }
    }

    fn manager_with(
        provider: Arc<CountingProvider>,
    ) -> (SessionManager, Arc<InMemoryTranscript>, Arc<ProgressLedger>) {
        let transcript = Arc::new(InMemoryTranscript::new());
        let progress = Arc::new(ProgressLedger::new());
        let manager = SessionManager::new(
            Arc::clone(&transcript) as Arc<dyn TranscriptStore>,
            provider,
            Arc::new(MarkdownInserter::new(
                Arc::clone(&transcript) as Arc<dyn TranscriptStore>
            )),
            Arc::clone(&progress),
            SessionConfig {
                poll_interval: Duration::from_millis(20),
                finalize_timeout: Duration::from_secs(10),
                ..SessionConfig::default()
            },
            None,
        );
        (manager, transcript, progress)
    }

    #[test]
    fn streaming_session_discovers_processes_and_inserts() -> anyhow::Result<()> {
        let provider = Arc::new(CountingProvider::new(Duration::from_millis(10)));
        let (manager, transcript, progress) = manager_with(Arc::clone(&provider));

        manager.start_streaming_session("m");
        transcript.append("m", "once upon <img-prompt=\"a fox\"> a time");
        thread::sleep(Duration::from_millis(60));
        transcript.append("m", " the end {{illustrate:a wolf}} really");

        let inserted = manager.finalize_streaming_and_insert("m")?;
        assert_eq!(inserted, 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.active_session_count(), 0);
        assert!(!progress.is_tracked("m"));

        let text = transcript.read("m").unwrap();
        assert!(text.contains("![a fox](file:///"));
        assert!(text.contains("![a wolf](file:///"));
        Ok(())
    }

    #[test]
    fn repeated_start_signals_reuse_the_session() {
        let provider = Arc::new(CountingProvider::new(Duration::from_millis(1)));
        let (manager, _transcript, _progress) = manager_with(provider);
        let first = manager.start_streaming_session("m");
        let second = manager.start_streaming_session("m");
        assert_eq!(first, second);
        assert_eq!(manager.active_session_count(), 1);
        assert!(manager.cancel_session("m"));
    }

    #[test]
    fn prompts_found_across_growth_steps_are_processed_once() -> anyhow::Result<()> {
        let provider = Arc::new(CountingProvider::new(Duration::from_millis(5)));
        let (manager, transcript, _progress) = manager_with(Arc::clone(&provider));

        manager.start_streaming_session("m");
        // ~50-char buffer with one directive, then growth past 120 chars
        // repeating the same directive text plus a fresh one.
        transcript.append("m", "start <img-prompt=\"a fox\"> padding padding");
        thread::sleep(Duration::from_millis(60));
        transcript.append(
            "m",
            " more padding <img-prompt=\"a fox\"> and <img-prompt=\"a wolf\"> tail",
        );
        thread::sleep(Duration::from_millis(60));

        let inserted = manager.finalize_streaming_and_insert("m")?;
        assert_eq!(inserted, 2);
        // Duplicate text was never re-processed.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn finalize_without_prompts_is_a_noop_insertion() -> anyhow::Result<()> {
        let provider = Arc::new(CountingProvider::new(Duration::from_millis(1)));
        let (manager, transcript, _progress) = manager_with(Arc::clone(&provider));
        manager.start_streaming_session("m");
        transcript.append("m", "plain prose, no directives at all");
        thread::sleep(Duration::from_millis(50));
        let inserted = manager.finalize_streaming_and_insert("m")?;
        assert_eq!(inserted, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn rapid_regenerations_batch_into_one_finalize() -> anyhow::Result<()> {
        let provider = Arc::new(CountingProvider::new(Duration::from_millis(40)));
        let (manager, transcript, progress) = manager_with(Arc::clone(&provider));
        transcript.write("m", "text ![a fox](file:///old.png) tail");

        let finalizes = Arc::new(AtomicUsize::new(0));
        let cleared = Arc::clone(&finalizes);
        progress.subscribe(move |event| {
            if matches!(event, ProgressEvent::Cleared { .. }) {
                cleared.fetch_add(1, Ordering::SeqCst);
            }
        });

        manager.queue_regeneration(
            "m",
            "a fox",
            Some("file:///old.png"),
            InsertionMode::Append,
        )?;
        manager.queue_regeneration(
            "m",
            "a fox",
            Some("file:///old.png"),
            InsertionMode::Append,
        )?;
        assert_eq!(manager.active_session_count(), 1);
        assert_eq!(progress.snapshot("m").map(|snap| snap.total), Some(2));

        // Both settle, the completion listener finalizes exactly once.
        // Clearing is the last finalization step, so once a Cleared event
        // lands the batch insert has already happened.
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while finalizes.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(finalizes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_session_count(), 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        let text = transcript.read("m").unwrap();
        assert_eq!(text.matches("![a fox](").count(), 3);
        Ok(())
    }

    #[test]
    fn cancel_during_finalize_aborts_the_wait() -> anyhow::Result<()> {
        let provider = Arc::new(CountingProvider::new(Duration::from_millis(250)));
        let (manager, transcript, progress) = manager_with(Arc::clone(&provider));
        manager.start_streaming_session("m");
        transcript.append("m", "x <img-prompt=\"a fox\"> y");
        thread::sleep(Duration::from_millis(60));

        let finalizer = {
            let manager = manager.clone();
            thread::spawn(move || manager.finalize_streaming_and_insert("m"))
        };
        thread::sleep(Duration::from_millis(60));
        // The handle stays registered while the drain blocks on the
        // in-flight generation, so a chat switch can still reach it.
        assert!(manager.cancel_session("m"));

        let inserted = finalizer.join().expect("finalizer thread")?;
        assert_eq!(inserted, 0);
        assert_eq!(manager.active_session_count(), 0);
        assert!(!progress.is_tracked("m"));
        Ok(())
    }

    #[test]
    fn cancel_session_clears_progress_and_stops_scheduling() {
        let provider = Arc::new(CountingProvider::new(Duration::from_millis(30)));
        let (manager, transcript, progress) = manager_with(provider);
        manager.start_streaming_session("m");
        transcript.append("m", "x <img-prompt=\"a fox\"> y <img-prompt=\"a wolf\"> z");
        thread::sleep(Duration::from_millis(40));

        assert!(manager.cancel_session("m"));
        assert!(!manager.cancel_session("m"));
        assert_eq!(manager.active_session_count(), 0);
        assert!(!progress.is_tracked("m"));
    }

    #[test]
    fn process_complete_message_handles_the_direct_path() -> anyhow::Result<()> {
        let provider = Arc::new(CountingProvider::new(Duration::from_millis(5)));
        let (manager, transcript, progress) = manager_with(Arc::clone(&provider));
        transcript.write("m", "full text <img-prompt=\"a fox\"> done");

        let inserted = manager.process_complete_message("m")?;
        assert_eq!(inserted, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(!progress.is_tracked("m"));
        assert!(transcript.read("m").unwrap().contains("![a fox]("));
        Ok(())
    }

    #[test]
    fn unknown_message_finalize_is_a_noop() -> anyhow::Result<()> {
        let provider = Arc::new(CountingProvider::new(Duration::from_millis(1)));
        let (manager, _transcript, _progress) = manager_with(provider);
        assert_eq!(manager.finalize_streaming_and_insert("ghost")?, 0);
        Ok(())
    }
}
