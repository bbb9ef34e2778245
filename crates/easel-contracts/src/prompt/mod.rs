pub mod extractor;
pub mod queue;

pub use extractor::{extract_prompts, default_patterns, PromptMatch, PromptPattern};
pub use queue::{
    GenerationQueue, InsertionMode, PromptOutcome, PromptState, QueueStats, QueuedPrompt,
    RegenTarget,
};
