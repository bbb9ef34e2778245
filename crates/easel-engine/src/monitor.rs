use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;

use easel_contracts::events::{EventPayload, EventWriter};
use easel_contracts::prompt::{extract_prompts, GenerationQueue, PromptPattern};
use easel_contracts::transcript::TranscriptStore;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(300);

// Stop responsiveness while sleeping between ticks.
const STOP_POLL: Duration = Duration::from_millis(50);

pub type NewPromptsCallback = Box<dyn Fn(usize) + Send + Sync>;

/// Polls a live, mutating message buffer, diffs it against the last-seen
/// snapshot, and feeds newly appeared directives into the queue. Purely
/// additive: it never removes or mutates existing queue entries.
pub struct StreamingMonitor {
    core: Arc<MonitorCore>,
    stop_flag: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

struct MonitorCore {
    message_id: String,
    transcript: Arc<dyn TranscriptStore>,
    queue: Arc<Mutex<GenerationQueue>>,
    patterns: Vec<PromptPattern>,
    last_seen: Mutex<String>,
    on_new_prompts: NewPromptsCallback,
    audit: Option<EventWriter>,
}

impl MonitorCore {
    /// One tick: read the buffer, bail early when unchanged, extract over
    /// the full current text, queue everything not already present (by
    /// text), then fire the callback exactly once when anything was
    /// added. Returns the number of newly queued prompts.
    fn scan(&self) -> usize {
        let Some(text) = self.transcript.read(&self.message_id) else {
            return 0;
        };
        {
            let mut last_seen = self
                .last_seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *last_seen == text {
                return 0;
            }
            *last_seen = text.clone();
        }

        let matches = extract_prompts(&text, &self.patterns);
        let mut added = 0;
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            for found in matches {
                if queue
                    .add_prompt(&found.text, &found.raw, found.start, found.end)
                    .is_some()
                {
                    added += 1;
                }
            }
        }
        if added > 0 {
            if let Some(audit) = &self.audit {
                let mut payload = EventPayload::new();
                payload.insert(
                    "message_id".to_string(),
                    Value::String(self.message_id.clone()),
                );
                payload.insert("count".to_string(), Value::Number((added as u64).into()));
                let _ = audit.emit("prompts_discovered", payload);
            }
            (self.on_new_prompts)(added);
        }
        added
    }
}

impl StreamingMonitor {
    /// Spawns the poll thread: one immediate scan, then one scan per
    /// interval until stopped.
    pub fn start(
        message_id: &str,
        transcript: Arc<dyn TranscriptStore>,
        queue: Arc<Mutex<GenerationQueue>>,
        patterns: Vec<PromptPattern>,
        interval: Duration,
        on_new_prompts: NewPromptsCallback,
        audit: Option<EventWriter>,
    ) -> Self {
        let core = Arc::new(MonitorCore {
            message_id: message_id.to_string(),
            transcript,
            queue,
            patterns,
            last_seen: Mutex::new(String::new()),
            on_new_prompts,
            audit,
        });
        let stop_flag = Arc::new(AtomicBool::new(false));

        let thread_core = Arc::clone(&core);
        let thread_stop = Arc::clone(&stop_flag);
        let handle = thread::Builder::new()
            .name("easel-monitor".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::SeqCst) {
                    thread_core.scan();
                    let tick_deadline = Instant::now() + interval;
                    while Instant::now() < tick_deadline {
                        if thread_stop.load(Ordering::SeqCst) {
                            return;
                        }
                        thread::sleep(STOP_POLL.min(interval));
                    }
                }
            })
            .ok();

        Self {
            core,
            stop_flag,
            handle,
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// One last synchronous scan, for prompts that appeared between the
    /// final tick and stream completion. The caller runs this before
    /// `stop`.
    pub fn final_scan(&self) -> usize {
        self.core.scan()
    }

    /// Halts polling without losing queued work already discovered.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamingMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use easel_contracts::prompt::{default_patterns, GenerationQueue, PromptState};
    use easel_contracts::transcript::{InMemoryTranscript, TranscriptStore};

    use super::StreamingMonitor;

    fn start_monitor(
        transcript: Arc<InMemoryTranscript>,
        queue: Arc<Mutex<GenerationQueue>>,
        ticks: Arc<AtomicUsize>,
    ) -> StreamingMonitor {
        StreamingMonitor::start(
            "m",
            transcript,
            queue,
            default_patterns(),
            Duration::from_millis(20),
            Box::new(move |added| {
                ticks.fetch_add(added, Ordering::SeqCst);
            }),
            None,
        )
    }

    #[test]
    fn discovers_prompts_as_the_buffer_grows() {
        let transcript = Arc::new(InMemoryTranscript::new());
        let queue = Arc::new(Mutex::new(GenerationQueue::new()));
        let found = Arc::new(AtomicUsize::new(0));
        let mut monitor = start_monitor(
            Arc::clone(&transcript),
            Arc::clone(&queue),
            Arc::clone(&found),
        );

        transcript.append("m", "hello <img-prompt=\"a fox\"> more");
        thread::sleep(Duration::from_millis(80));
        transcript.append("m", " tail {{illustrate:a wolf}} done");
        thread::sleep(Duration::from_millis(80));
        monitor.stop();

        assert_eq!(found.load(Ordering::SeqCst), 2);
        let queue = queue.lock().unwrap();
        assert_eq!(queue.len(), 2);
        assert!(queue.has_prompt_text("a fox"));
        assert!(queue.has_prompt_text("a wolf"));
    }

    #[test]
    fn rescans_do_not_duplicate_existing_prompts() {
        let transcript = Arc::new(InMemoryTranscript::new());
        transcript.append("m", "x <img-prompt=\"a fox\"> y");
        let queue = Arc::new(Mutex::new(GenerationQueue::new()));
        let found = Arc::new(AtomicUsize::new(0));
        let mut monitor = start_monitor(
            Arc::clone(&transcript),
            Arc::clone(&queue),
            Arc::clone(&found),
        );

        thread::sleep(Duration::from_millis(60));
        // Growth that repeats the same directive text.
        transcript.append("m", " and again <img-prompt=\"a fox\"> z");
        thread::sleep(Duration::from_millis(60));
        monitor.stop();

        assert_eq!(queue.lock().unwrap().len(), 1);
        assert_eq!(found.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn final_scan_catches_late_prompts_after_stop_decision() {
        let transcript = Arc::new(InMemoryTranscript::new());
        let queue = Arc::new(Mutex::new(GenerationQueue::new()));
        let found = Arc::new(AtomicUsize::new(0));
        let mut monitor = StreamingMonitor::start(
            "m",
            Arc::clone(&transcript) as Arc<dyn TranscriptStore>,
            Arc::clone(&queue),
            default_patterns(),
            Duration::from_secs(60), // effectively never ticks again
            Box::new(move |added| {
                found.fetch_add(added, Ordering::SeqCst);
            }),
            None,
        );
        thread::sleep(Duration::from_millis(30));

        transcript.append("m", "late <img-prompt=\"a fox\">");
        assert_eq!(monitor.final_scan(), 1);
        monitor.stop();
        assert!(queue.lock().unwrap().has_prompt_text("a fox"));
    }

    #[test]
    fn monitor_never_mutates_existing_entries() {
        let transcript = Arc::new(InMemoryTranscript::new());
        transcript.append("m", "x <img-prompt=\"a fox\">");
        let queue = Arc::new(Mutex::new(GenerationQueue::new()));
        let found = Arc::new(AtomicUsize::new(0));
        let mut monitor = start_monitor(
            Arc::clone(&transcript),
            Arc::clone(&queue),
            Arc::clone(&found),
        );
        thread::sleep(Duration::from_millis(60));

        // Simulate the processor completing the entry mid-stream.
        let id = queue.lock().unwrap().next_pending().unwrap().id.clone();
        queue.lock().unwrap().update_state(
            &id,
            easel_contracts::prompt::PromptState::Generating,
            easel_contracts::prompt::PromptOutcome::None,
        );
        queue.lock().unwrap().update_state(
            &id,
            PromptState::Completed,
            easel_contracts::prompt::PromptOutcome::ImageUrl("file:///fox.png".to_string()),
        );

        transcript.append("m", " more text, no new directives");
        thread::sleep(Duration::from_millis(60));
        monitor.stop();

        let queue = queue.lock().unwrap();
        assert_eq!(queue.len(), 1);
        let entry = queue.get(&id).unwrap();
        assert_eq!(entry.state, PromptState::Completed);
        assert_eq!(entry.image_url.as_deref(), Some("file:///fox.png"));
    }
}
