use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Host transcript boundary: read the current text of a message and write
/// back an updated full text. Implementations must tolerate reads while
/// the text is being mutated elsewhere; the streaming monitor polls
/// through this trait on its own thread.
pub trait TranscriptStore: Send + Sync {
    fn read(&self, message_id: &str) -> Option<String>;
    fn write(&self, message_id: &str, text: &str);
}

/// Mutex-backed transcript used by tests and the CLI host simulation.
#[derive(Debug, Default)]
pub struct InMemoryTranscript {
    messages: Mutex<BTreeMap<String, String>>,
}

impl InMemoryTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a streamed chunk arriving for a message.
    pub fn append(&self, message_id: &str, chunk: &str) {
        self.lock()
            .entry(message_id.to_string())
            .or_default()
            .push_str(chunk);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TranscriptStore for InMemoryTranscript {
    fn read(&self, message_id: &str) -> Option<String> {
        self.lock().get(message_id).cloned()
    }

    fn write(&self, message_id: &str, text: &str) {
        self.lock().insert(message_id.to_string(), text.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemoryTranscript, TranscriptStore};

    #[test]
    fn append_grows_and_write_replaces() {
        let transcript = InMemoryTranscript::new();
        assert_eq!(transcript.read("m"), None);
        transcript.append("m", "hello ");
        transcript.append("m", "world");
        assert_eq!(transcript.read("m").as_deref(), Some("hello world"));
        transcript.write("m", "rewritten");
        assert_eq!(transcript.read("m").as_deref(), Some("rewritten"));
    }
}
