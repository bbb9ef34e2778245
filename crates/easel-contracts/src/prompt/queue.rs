use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Lifecycle of one queued prompt. Transitions are monotonic:
/// `Queued -> Generating -> {Completed | Failed}`; no state is revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptState {
    Queued,
    Generating,
    Completed,
    Failed,
}

impl PromptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// How a regeneration result lands in the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertionMode {
    Replace,
    Append,
}

/// Regeneration metadata: which existing image the result targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegenTarget {
    pub target_image_url: Option<String>,
    pub target_prompt: Option<String>,
    pub mode: InsertionMode,
}

/// Terminal payload for `update_state`.
#[derive(Debug, Clone)]
pub enum PromptOutcome {
    None,
    ImageUrl(String),
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedPrompt {
    pub id: String,
    pub text: String,
    pub raw: String,
    pub start: usize,
    pub end: usize,
    pub state: PromptState,
    pub image_url: Option<String>,
    pub error: Option<String>,
    pub regen: Option<RegenTarget>,
    pub queued_at: String,
    #[serde(skip)]
    seq: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub generating: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.queued + self.generating + self.completed + self.failed
    }
}

/// Insertion-ordered collection of queued prompts, keyed by id. Owned by
/// exactly one session; all concurrency control lives in the caller.
#[derive(Debug, Default)]
pub struct GenerationQueue {
    entries: IndexMap<String, QueuedPrompt>,
    next_seq: u64,
}

impl GenerationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a newly discovered prompt. Returns `None` without touching
    /// the queue when an entry with identical text is already queued,
    /// generating, or completed — dedup is by text, not offset, because
    /// offsets shift while the buffer grows. A failed entry does not
    /// block a re-add.
    pub fn add_prompt(
        &mut self,
        text: &str,
        raw: &str,
        start: usize,
        end: usize,
    ) -> Option<QueuedPrompt> {
        if self.has_prompt_text(text) {
            return None;
        }
        let id = derive_prompt_id(text, start);
        Some(self.insert(id, text, raw, start, end, None))
    }

    /// Queues a regeneration request under a fresh unique id, bypassing
    /// text dedup so simultaneous regenerations of identical prompt text
    /// can coexist.
    pub fn add_regeneration(&mut self, text: &str, regen: RegenTarget) -> QueuedPrompt {
        let id = Uuid::new_v4().to_string();
        self.insert(id, text, text, 0, 0, Some(regen))
    }

    fn insert(
        &mut self,
        id: String,
        text: &str,
        raw: &str,
        start: usize,
        end: usize,
        regen: Option<RegenTarget>,
    ) -> QueuedPrompt {
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = QueuedPrompt {
            id: id.clone(),
            text: text.to_string(),
            raw: raw.to_string(),
            start,
            end,
            state: PromptState::Queued,
            image_url: None,
            error: None,
            regen,
            queued_at: now_utc_iso(),
            seq,
        };
        self.entries.insert(id, entry.clone());
        entry
    }

    /// Oldest entry still in `Queued`.
    pub fn next_pending(&self) -> Option<&QueuedPrompt> {
        self.entries
            .values()
            .filter(|entry| entry.state == PromptState::Queued)
            .min_by_key(|entry| entry.seq)
    }

    /// Transitions an entry. Transitions out of a terminal state are
    /// rejected: the queue is left untouched and `false` is returned so
    /// the caller can log it.
    pub fn update_state(
        &mut self,
        id: &str,
        state: PromptState,
        outcome: PromptOutcome,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        if entry.state.is_terminal() {
            return false;
        }
        entry.state = state;
        match outcome {
            PromptOutcome::None => {}
            PromptOutcome::ImageUrl(url) => entry.image_url = Some(url),
            PromptOutcome::Error(message) => entry.error = Some(message),
        }
        true
    }

    pub fn get(&self, id: &str) -> Option<&QueuedPrompt> {
        self.entries.get(id)
    }

    pub fn prompts_in_state(&self, state: PromptState) -> Vec<QueuedPrompt> {
        self.entries
            .values()
            .filter(|entry| entry.state == state)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for entry in self.entries.values() {
            match entry.state {
                PromptState::Queued => stats.queued += 1,
                PromptState::Generating => stats.generating += 1,
                PromptState::Completed => stats.completed += 1,
                PromptState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when an entry with this text exists in a state that blocks
    /// re-adding (queued, generating, or completed).
    pub fn has_prompt_text(&self, text: &str) -> bool {
        self.entries
            .values()
            .any(|entry| entry.text == text && entry.state != PromptState::Failed)
    }

    /// Shifts stored offsets of unresolved entries sitting at or after an
    /// edit point, keeping them valid after an earlier insertion mutated
    /// the buffer. Only the legacy immediate-insertion mode needs this;
    /// batch insertion leaves the buffer untouched until every image is
    /// ready.
    pub fn shift_offsets_after(&mut self, insertion_point: usize, inserted_len: usize) {
        for entry in self.entries.values_mut() {
            if entry.state.is_terminal() {
                continue;
            }
            if entry.start >= insertion_point {
                entry.start += inserted_len;
                entry.end += inserted_len;
            }
        }
    }
}

fn derive_prompt_id(text: &str, start: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update([0]);
    hasher.update(start.to_le_bytes());
    let digest = hasher.finalize();
    let mut id = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use super::{
        GenerationQueue, InsertionMode, PromptOutcome, PromptState, RegenTarget,
    };

    fn add(queue: &mut GenerationQueue, text: &str, start: usize) -> Option<String> {
        queue
            .add_prompt(text, &format!("<img-prompt=\"{text}\">"), start, start + 1)
            .map(|entry| entry.id)
    }

    #[test]
    fn add_prompt_dedups_by_text_not_offset() {
        let mut queue = GenerationQueue::new();
        assert!(add(&mut queue, "a fox", 10).is_some());
        assert!(add(&mut queue, "a fox", 99).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn repeated_adds_leave_exactly_one_entry() {
        let mut queue = GenerationQueue::new();
        let id = add(&mut queue, "a fox", 0).unwrap();
        for _ in 0..5 {
            assert!(add(&mut queue, "a fox", 0).is_none());
        }
        queue.update_state(&id, PromptState::Generating, PromptOutcome::None);
        assert!(add(&mut queue, "a fox", 0).is_none());
        queue.update_state(
            &id,
            PromptState::Completed,
            PromptOutcome::ImageUrl("file:///img.png".to_string()),
        );
        assert!(add(&mut queue, "a fox", 0).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn failed_entry_does_not_block_readd() {
        let mut queue = GenerationQueue::new();
        let id = add(&mut queue, "a fox", 0).unwrap();
        queue.update_state(&id, PromptState::Generating, PromptOutcome::None);
        queue.update_state(
            &id,
            PromptState::Failed,
            PromptOutcome::Error("backend down".to_string()),
        );
        assert!(add(&mut queue, "a fox", 0).is_some());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn next_pending_is_fifo() {
        let mut queue = GenerationQueue::new();
        let first = add(&mut queue, "one", 0).unwrap();
        let second = add(&mut queue, "two", 20).unwrap();
        assert_eq!(queue.next_pending().map(|e| e.id.clone()), Some(first.clone()));
        queue.update_state(&first, PromptState::Generating, PromptOutcome::None);
        assert_eq!(queue.next_pending().map(|e| e.id.clone()), Some(second));
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let mut queue = GenerationQueue::new();
        let id = add(&mut queue, "a fox", 0).unwrap();
        queue.update_state(&id, PromptState::Generating, PromptOutcome::None);
        assert!(queue.update_state(
            &id,
            PromptState::Completed,
            PromptOutcome::ImageUrl("file:///img.png".to_string()),
        ));
        assert!(!queue.update_state(&id, PromptState::Queued, PromptOutcome::None));
        assert!(!queue.update_state(
            &id,
            PromptState::Failed,
            PromptOutcome::Error("late".to_string()),
        ));
        let entry = queue.get(&id).unwrap();
        assert_eq!(entry.state, PromptState::Completed);
        assert!(entry.error.is_none());
    }

    #[test]
    fn unknown_id_is_a_noop() {
        let mut queue = GenerationQueue::new();
        assert!(!queue.update_state("missing", PromptState::Generating, PromptOutcome::None));
    }

    #[test]
    fn stats_count_every_state() {
        let mut queue = GenerationQueue::new();
        let a = add(&mut queue, "a", 0).unwrap();
        let b = add(&mut queue, "b", 10).unwrap();
        add(&mut queue, "c", 20).unwrap();
        queue.update_state(&a, PromptState::Generating, PromptOutcome::None);
        queue.update_state(
            &a,
            PromptState::Completed,
            PromptOutcome::ImageUrl("u".to_string()),
        );
        queue.update_state(&b, PromptState::Generating, PromptOutcome::None);
        let stats = queue.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.generating, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn regenerations_of_identical_text_coexist() {
        let mut queue = GenerationQueue::new();
        let target = RegenTarget {
            target_image_url: Some("file:///old.png".to_string()),
            target_prompt: Some("a fox".to_string()),
            mode: InsertionMode::Replace,
        };
        let first = queue.add_regeneration("a fox", target.clone());
        let second = queue.add_regeneration("a fox", target);
        assert_ne!(first.id, second.id);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.stats().queued, 2);
    }

    #[test]
    fn queued_prompt_serializes_with_snake_case_state() {
        let mut queue = GenerationQueue::new();
        let id = add(&mut queue, "a fox", 0).unwrap();
        let value = serde_json::to_value(queue.get(&id).unwrap()).unwrap();
        assert_eq!(value["state"], "queued");
        assert_eq!(value["text"], "a fox");
        assert!(value.get("seq").is_none());
    }

    #[test]
    fn shift_offsets_moves_only_unresolved_entries_after_the_edit() {
        let mut queue = GenerationQueue::new();
        let before = add(&mut queue, "before", 10).unwrap();
        let after = add(&mut queue, "after", 50).unwrap();
        let done = add(&mut queue, "done", 80).unwrap();
        queue.update_state(&done, PromptState::Generating, PromptOutcome::None);
        queue.update_state(
            &done,
            PromptState::Completed,
            PromptOutcome::ImageUrl("u".to_string()),
        );

        queue.shift_offsets_after(40, 7);
        assert_eq!(queue.get(&before).unwrap().start, 10);
        assert_eq!(queue.get(&after).unwrap().start, 57);
        assert_eq!(queue.get(&after).unwrap().end, 58);
        // Terminal entries keep their recorded offsets.
        assert_eq!(queue.get(&done).unwrap().start, 80);
    }
}
