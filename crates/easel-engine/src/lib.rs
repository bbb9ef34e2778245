use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

pub mod insert;
pub mod monitor;
pub mod processor;
pub mod session;

/// Style rules applied around every prompt before it reaches a provider,
/// plus the rendering parameters providers need.
#[derive(Debug, Clone)]
pub struct StyleOptions {
    pub prompt_prefix: String,
    pub prompt_suffix: String,
    pub size: String,
    pub model: String,
}

impl Default for StyleOptions {
    fn default() -> Self {
        Self {
            prompt_prefix: String::new(),
            prompt_suffix: String::new(),
            size: "1024x1024".to_string(),
            model: "gpt-image-1".to_string(),
        }
    }
}

impl StyleOptions {
    /// Effective prompt sent to the backend: `prefix prompt suffix`,
    /// with empty parts dropped.
    pub fn apply(&self, prompt: &str) -> String {
        let mut parts: Vec<&str> = Vec::new();
        let prefix = self.prompt_prefix.trim();
        let suffix = self.prompt_suffix.trim();
        if !prefix.is_empty() {
            parts.push(prefix);
        }
        parts.push(prompt.trim());
        if !suffix.is_empty() {
            parts.push(suffix);
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub model: String,
    pub size: String,
    pub out_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

/// Image generation backend boundary. One call per prompt; the core never
/// retries — an error (or an empty response) is recorded as a failed
/// prompt and counted as completed-with-failure.
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn ImageProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Arc::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ImageProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Registry with the built-in providers.
pub fn default_provider_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(DryrunProvider);
    registry.register(OpenAiProvider::new());
    registry
}

/// Offline provider: renders a deterministic solid-color placeholder so
/// the whole pipeline runs without credentials or network.
pub struct DryrunProvider;

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage> {
        let (width, height) = parse_dims(&request.size);
        let stamp = chrono::Utc::now().timestamp_millis();
        let image_path = request
            .out_dir
            .join(format!("illustration-{stamp}-{}.png", artifact_id(&request.prompt)));
        write_placeholder_image(&image_path, width, height, &request.prompt)?;
        Ok(GeneratedImage {
            url: file_url(&image_path),
            width,
            height,
        })
    }
}

pub struct OpenAiProvider {
    api_base: String,
    http: HttpClient,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        Self {
            api_base: env::var("OPENAI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        env::var("OPENAI_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn post_json(&self, endpoint: &str, api_key: &str, payload: &Value) -> Result<Value> {
        let response = self
            .http
            .post(endpoint)
            .header(AUTHORIZATION, format!("Bearer {api_key}"))
            .header(CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .with_context(|| format!("request to {endpoint} failed"))?;
        response_json_or_error("openai", response)
    }

    fn save_image_item(&self, item: &Value, request: &GenerateRequest) -> Result<String> {
        if let Some(url) = item.get("url").and_then(Value::as_str) {
            return Ok(url.to_string());
        }
        let Some(encoded) = item.get("b64_json").and_then(Value::as_str) else {
            bail!("OpenAI image item carries neither url nor b64_json");
        };
        let bytes = BASE64
            .decode(encoded)
            .context("failed to decode b64_json image payload")?;
        let stamp = chrono::Utc::now().timestamp_millis();
        let image_path = request
            .out_dir
            .join(format!("illustration-{stamp}-{}.png", artifact_id(&request.prompt)));
        if let Some(parent) = image_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&image_path, bytes)
            .with_context(|| format!("failed to write {}", image_path.display()))?;
        Ok(file_url(&image_path))
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedImage> {
        let Some(api_key) = Self::api_key() else {
            bail!("Missing OPENAI_API_KEY for the openai provider");
        };
        let endpoint = format!("{}/images/generations", self.api_base);
        let payload = json!({
            "model": request.model,
            "prompt": request.prompt,
            "n": 1,
            "size": request.size,
        });
        let response = self.post_json(&endpoint, &api_key, &payload)?;
        let Some(item) = response
            .get("data")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
        else {
            bail!("OpenAI response returned no images");
        };
        let url = self.save_image_item(item, request)?;
        let (width, height) = parse_dims(&request.size);
        Ok(GeneratedImage { url, width, height })
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    let payload: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned non-JSON response (status {status})"))?;
    if !status.is_success() {
        let detail = payload
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or(body.as_str());
        bail!("{provider} request failed (status {status}): {detail}");
    }
    Ok(payload)
}

fn write_placeholder_image(path: &Path, width: u32, height: u32, prompt: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let (r, g, b) = color_from_prompt(prompt);
    let mut canvas = RgbImage::new(width.max(1), height.max(1));
    for pixel in canvas.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    canvas
        .save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

fn prompt_digest(prompt: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.finalize().into()
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let digest = prompt_digest(prompt);
    (digest[0], digest[1], digest[2])
}

fn artifact_id(prompt: &str) -> String {
    let digest = prompt_digest(prompt);
    let mut id = String::with_capacity(8);
    for byte in digest.iter().take(4) {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

fn parse_dims(size: &str) -> (u32, u32) {
    let mut parts = size.splitn(2, 'x');
    let width = parts
        .next()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(1024);
    let height = parts
        .next()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(width);
    (width, height)
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}
