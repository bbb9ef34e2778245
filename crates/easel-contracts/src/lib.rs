pub mod events;
pub mod progress;
pub mod prompt;
pub mod sync;
pub mod transcript;
