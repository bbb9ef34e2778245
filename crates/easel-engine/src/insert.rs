use std::sync::Arc;

use anyhow::Result;

use easel_contracts::prompt::{InsertionMode, RegenTarget};
use easel_contracts::transcript::TranscriptStore;

/// A successfully generated image held in memory, not yet written into
/// the transcript.
#[derive(Debug, Clone)]
pub struct DeferredImage {
    pub prompt: String,
    pub raw_tag: String,
    pub image_url: String,
    pub regen: Option<RegenTarget>,
}

/// Writes one batch of deferred images into a message, exactly once per
/// finalize. Responsible for locating each prompt's current position in
/// the (possibly changed) transcript text.
pub trait BatchInserter: Send + Sync {
    fn insert(&self, images: &[DeferredImage], message_id: &str) -> Result<usize>;
}

/// Reference inserter: markdown images placed after their directive.
/// Regeneration entries replace the targeted URL in place, or append a
/// sibling image after the targeted one.
pub struct MarkdownInserter {
    transcript: Arc<dyn TranscriptStore>,
}

impl MarkdownInserter {
    pub fn new(transcript: Arc<dyn TranscriptStore>) -> Self {
        Self { transcript }
    }
}

impl BatchInserter for MarkdownInserter {
    fn insert(&self, images: &[DeferredImage], message_id: &str) -> Result<usize> {
        if images.is_empty() {
            return Ok(0);
        }
        let Some(mut text) = self.transcript.read(message_id) else {
            return Ok(0);
        };

        let mut inserted = 0;
        for image in images {
            if place_image(&mut text, image) {
                inserted += 1;
            }
        }
        if inserted > 0 {
            self.transcript.write(message_id, &text);
        }
        Ok(inserted)
    }
}

fn place_image(text: &mut String, image: &DeferredImage) -> bool {
    if text.contains(&image.image_url) {
        // Already present; a second finalize must not duplicate it.
        return false;
    }
    match &image.regen {
        Some(target) => place_regenerated(text, image, target),
        None => place_after_directive(text, image),
    }
}

fn place_after_directive(text: &mut String, image: &DeferredImage) -> bool {
    let markdown = markdown_image(&image.prompt, &image.image_url);
    match text.find(&image.raw_tag) {
        Some(at) => {
            let after_tag = at + image.raw_tag.len();
            text.insert_str(after_tag, &format!("\n{markdown}"));
        }
        None => {
            // The directive vanished from the edited transcript; keep the
            // result rather than dropping paid-for work.
            text.push_str(&format!("\n{markdown}"));
        }
    }
    true
}

fn place_regenerated(text: &mut String, image: &DeferredImage, target: &RegenTarget) -> bool {
    let Some(old_url) = target.target_image_url.as_deref().filter(|url| !url.is_empty()) else {
        return place_after_directive(text, image);
    };
    let Some(at) = text.find(old_url) else {
        return place_after_directive(text, image);
    };
    match target.mode {
        InsertionMode::Replace => {
            text.replace_range(at..at + old_url.len(), &image.image_url);
        }
        InsertionMode::Append => {
            // Insert after the markdown image that carries the old URL;
            // fall back to right after the URL itself.
            let after = text[at..]
                .find(')')
                .map(|close| at + close + 1)
                .unwrap_or(at + old_url.len());
            text.insert_str(
                after,
                &format!("\n{}", markdown_image(&image.prompt, &image.image_url)),
            );
        }
    }
    true
}

fn markdown_image(prompt: &str, url: &str) -> String {
    format!("![{}]({})", prompt.replace(']', ""), url)
}
