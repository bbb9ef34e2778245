use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

const PLACEHOLDER: &str = "{prompt}";

/// One directive syntax: an opening literal, the prompt body, a closing
/// literal. Built from a template containing exactly one `{prompt}`
/// placeholder, e.g. `<img-prompt="{prompt}">`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPattern {
    opening: String,
    closing: String,
}

impl PromptPattern {
    pub fn from_template(template: &str) -> Result<Self> {
        let Some(split) = template.find(PLACEHOLDER) else {
            bail!("pattern template is missing the {PLACEHOLDER} placeholder: {template}");
        };
        let opening = &template[..split];
        let closing = &template[split + PLACEHOLDER.len()..];
        if closing.contains(PLACEHOLDER) {
            bail!("pattern template has more than one {PLACEHOLDER} placeholder: {template}");
        }
        if opening.is_empty() || closing.is_empty() {
            bail!("pattern template needs literal text on both sides of {PLACEHOLDER}: {template}");
        }
        Ok(Self {
            opening: opening.to_string(),
            closing: closing.to_string(),
        })
    }

    pub fn opening(&self) -> &str {
        &self.opening
    }

    pub fn closing(&self) -> &str {
        &self.closing
    }
}

/// Directive syntaxes recognized out of the box.
pub fn default_patterns() -> Vec<PromptPattern> {
    ["<img-prompt=\"{prompt}\">", "{{illustrate:{prompt}}}"]
        .iter()
        .filter_map(|template| PromptPattern::from_template(template).ok())
        .collect()
}

/// An extracted directive: prompt body, raw matched text, byte offsets
/// into the source buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMatch {
    pub text: String,
    pub raw: String,
    pub start: usize,
    pub end: usize,
}

/// Scans `buffer` with every pattern and returns complete, non-overlapping
/// directive matches ordered by start offset. A directive counts only when
/// its closing literal is present in the buffer (a live stream may end
/// mid-directive), and empty or all-whitespace bodies are skipped. When
/// two patterns match at the same position the earlier-listed pattern
/// wins. Pure: no side effects.
pub fn extract_prompts(buffer: &str, patterns: &[PromptPattern]) -> Vec<PromptMatch> {
    let mut candidates: Vec<(usize, PromptMatch)> = Vec::new();
    for (rank, pattern) in patterns.iter().enumerate() {
        let mut cursor = 0;
        while let Some(found) = buffer[cursor..].find(&pattern.opening) {
            let start = cursor + found;
            let body_start = start + pattern.opening.len();
            let Some(close) = buffer[body_start..].find(&pattern.closing) else {
                // Opened but never closed; likely a truncated stream.
                break;
            };
            let body_end = body_start + close;
            let end = body_end + pattern.closing.len();
            let body = &buffer[body_start..body_end];
            if !body.trim().is_empty() {
                candidates.push((
                    rank,
                    PromptMatch {
                        text: body.trim().to_string(),
                        raw: buffer[start..end].to_string(),
                        start,
                        end,
                    },
                ));
            }
            cursor = end;
        }
    }

    candidates.sort_by(|(rank_a, a), (rank_b, b)| {
        a.start.cmp(&b.start).then(rank_a.cmp(rank_b))
    });

    let mut matches: Vec<PromptMatch> = Vec::new();
    for (_, candidate) in candidates {
        let overlaps = matches
            .last()
            .map(|prev| candidate.start < prev.end)
            .unwrap_or(false);
        if !overlaps {
            matches.push(candidate);
        }
    }
    matches
}
