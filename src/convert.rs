//! Conversion backends: PDF bytes in, Markdown or a mind map out.
//!
//! - [`SimpleConverter`] extracts the text layer locally with `pdf-extract`
//!   and lays it out as paragraphs under a title heading.
//! - [`GeminiConverter`] sends the PDF inline to the Gemini
//!   `generateContent` endpoint together with an instruction prompt.
//! - [`SimpleMindMapConverter`] and [`GeminiMindMapConverter`] produce a
//!   FreeMind document instead; Gemini is asked for the JSON tree described
//!   in [`crate::mindmap`].
//!
//! `converter.mode = "auto"` wraps one of each in a
//! [`RoutingConverter`](crate::routing::RoutingConverter) together with the
//! matching [`Classifier`].
//!
//! None of them renders page images, so the sink rasterizes pages itself
//! when an image asset mode is configured.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConversionMode, ConverterConfig, ConverterProvider};
use crate::mindmap::MindMap;
use crate::models::{ArtifactFormat, ConversionResult};
use crate::routing::{has_hashtag, RoutingConverter};
use crate::traits::{Classifier, Converter};

pub const DEFAULT_SIMPLE_PROMPT: &str =
    "You are a helpful assistant that converts PDF content to Markdown.";

pub const DEFAULT_GEMINI_PROMPT: &str = "You are a senior technical writer who converts PDF documents into clean Markdown. \
Preserve structure, summarize key points, and produce a single consolidated output.";

pub const DEFAULT_MINDMAP_PROMPT: &str = "Read this handwritten PDF and reconstruct it as a mind map. \
Reply with JSON only, shaped as {\"root\": {\"text\": ..., \"children\": [...]}}. \
Every node has a non-empty \"text\" and may have \"children\", \"link\", \"color\" and an integer \"priority\". \
Use no other keys.";

pub const DEFAULT_CLASSIFIER_PROMPT: &str = "Decide whether this handwritten PDF is a mind map \
(a central topic with branching ideas) or ordinary notes. \
Answer with exactly one word: mindmap or markdown.";

const EMPTY_TEXT_NOTICE: &str = "(The source PDF did not contain extractable text.)";

/// Build the converter selected in `[converter]`.
pub fn from_config(config: &ConverterConfig) -> Result<Box<dyn Converter>> {
    let prompt = optional_prompt(config.prompt_path.as_deref())?;
    let mindmap_prompt = optional_prompt(config.mindmap_prompt_path.as_deref())?;

    let gemini = match config.provider {
        ConverterProvider::Simple => None,
        ConverterProvider::Gemini => Some(Arc::new(GeminiClient::from_config(config)?)),
    };

    let markdown = || -> Box<dyn Converter> {
        match &gemini {
            None => Box::new(SimpleConverter::new(prompt.clone())),
            Some(client) => Box::new(GeminiConverter {
                client: client.clone(),
                prompt: prompt.clone().unwrap_or_else(|| DEFAULT_GEMINI_PROMPT.to_string()),
            }),
        }
    };
    let mind_map = || -> Box<dyn Converter> {
        match &gemini {
            None => Box::new(SimpleMindMapConverter),
            Some(client) => Box::new(GeminiMindMapConverter {
                client: client.clone(),
                prompt: mindmap_prompt
                    .clone()
                    .unwrap_or_else(|| DEFAULT_MINDMAP_PROMPT.to_string()),
            }),
        }
    };

    match config.mode {
        ConversionMode::Markdown => Ok(markdown()),
        ConversionMode::Mindmap => Ok(mind_map()),
        ConversionMode::Auto => {
            let classifier: Option<Box<dyn Classifier>> = if !config.classify {
                None
            } else {
                match &gemini {
                    None => Some(Box::new(SimpleClassifier::new(config.mindmap_hashtags.clone()))),
                    Some(client) => Some(Box::new(GeminiClassifier {
                        client: client.clone(),
                        prompt: optional_prompt(config.classifier_prompt_path.as_deref())?
                            .unwrap_or_else(|| DEFAULT_CLASSIFIER_PROMPT.to_string()),
                    })),
                }
            };
            Ok(Box::new(RoutingConverter::new(
                markdown(),
                mind_map(),
                config.mindmap_hashtags.clone(),
                classifier,
            )))
        }
    }
}

fn optional_prompt(path: Option<&Path>) -> Result<Option<String>> {
    path.map(load_prompt).transpose()
}

fn load_prompt(path: &Path) -> Result<String> {
    let prompt = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;
    let prompt = prompt.trim().to_string();
    if prompt.is_empty() {
        bail!("Prompt file is empty: {}", path.display());
    }
    Ok(prompt)
}

// ============ Local extraction ============

pub struct SimpleConverter {
    prompt: String,
}

impl SimpleConverter {
    pub fn new(prompt: Option<String>) -> Self {
        Self {
            prompt: prompt.unwrap_or_else(|| DEFAULT_SIMPLE_PROMPT.to_string()),
        }
    }
}

#[async_trait]
impl Converter for SimpleConverter {
    fn name(&self) -> &str {
        "simple"
    }

    async fn convert(&self, bytes: &[u8], filename: &str) -> Result<ConversionResult> {
        let text = extract_text(bytes).await?;
        Ok(ConversionResult::markdown(render_markdown(filename, &self.prompt, &text)))
    }
}

/// Root is the title, one branch per paragraph of the text layer.
pub struct SimpleMindMapConverter;

#[async_trait]
impl Converter for SimpleMindMapConverter {
    fn name(&self) -> &str {
        "simple-mindmap"
    }

    async fn convert(&self, bytes: &[u8], filename: &str) -> Result<ConversionResult> {
        let text = extract_text(bytes).await?;
        let map = MindMap::from_paragraphs(filename, &segment_paragraphs(&text));
        Ok(ConversionResult::mind_map(map.to_freemind()))
    }
}

/// Mind map when the title mentions one or the text layer carries a hashtag.
pub struct SimpleClassifier {
    hashtags: Vec<String>,
}

impl SimpleClassifier {
    pub fn new(hashtags: Vec<String>) -> Self {
        Self { hashtags }
    }
}

#[async_trait]
impl Classifier for SimpleClassifier {
    fn name(&self) -> &str {
        "simple"
    }

    async fn classify(&self, bytes: &[u8], filename: &str) -> Result<ArtifactFormat> {
        let title = filename.to_lowercase();
        if title.contains("mindmap") || title.contains("mind map") {
            return Ok(ArtifactFormat::MindMap);
        }
        let text = extract_text(bytes).await?;
        if has_hashtag(&text, &self.hashtags) {
            return Ok(ArtifactFormat::MindMap);
        }
        Ok(ArtifactFormat::Markdown)
    }
}

async fn extract_text(bytes: &[u8]) -> Result<String> {
    let owned = bytes.to_vec();
    // pdf-extract panics on some malformed inputs; a blocking task turns
    // that into a JoinError instead of taking the process down.
    tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&owned))
        .await
        .map_err(|e| anyhow!("PDF text extraction aborted: {}", e))?
        .map_err(|e| anyhow!("PDF extraction failed: {}", e))
}

fn render_markdown(title: &str, prompt: &str, text: &str) -> String {
    let mut lines = vec![format!("# {}", title), String::new(), format!("> {}", prompt), String::new()];
    for paragraph in segment_paragraphs(text) {
        lines.push(paragraph);
        lines.push(String::new());
    }
    lines.join("\n").trim().to_string()
}

/// Join consecutive non-empty lines; blank lines separate paragraphs.
fn segment_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut buffer: Vec<&str> = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            if !buffer.is_empty() {
                paragraphs.push(buffer.join(" "));
                buffer.clear();
            }
            continue;
        }
        buffer.push(line);
    }
    if !buffer.is_empty() {
        paragraphs.push(buffer.join(" "));
    }
    if paragraphs.is_empty() {
        paragraphs.push(EMPTY_TEXT_NOTICE.to_string());
    }
    paragraphs
}

// ============ Gemini ============

/// One model on the `generateContent` endpoint, shared by the Gemini
/// converters and classifier.
pub struct GeminiClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    temperature: f32,
}

impl GeminiClient {
    pub fn from_config(config: &ConverterConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow!("Gemini converter needs converter.api_key or GEMINI_API_KEY"))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("converter.model is required for gemini"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model,
            api_key,
            temperature: config.temperature,
        })
    }

    /// Send `prompt` plus the PDF and return the concatenated text parts.
    /// With `json` set the model is asked for `application/json`.
    async fn generate(&self, prompt: &str, bytes: &[u8], filename: &str, json: bool) -> Result<String> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoint, self.model
        );
        let mut generation = json!({ "temperature": self.temperature });
        if json {
            generation["responseMimeType"] = json!("application/json");
        }
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": prompt },
                    { "inline_data": {
                        "mime_type": "application/pdf",
                        "data": base64::engine::general_purpose::STANDARD.encode(bytes),
                    }},
                ],
            }],
            "generationConfig": generation,
        });

        tracing::debug!(model = %self.model, file = filename, json, "requesting gemini generation");
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Gemini API request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Gemini API error (HTTP {}): {}", status, text.trim());
        }

        let value: Value = response
            .json()
            .await
            .context("Failed to parse Gemini response")?;
        response_text(&value)
    }
}

pub struct GeminiConverter {
    client: Arc<GeminiClient>,
    prompt: String,
}

#[async_trait]
impl Converter for GeminiConverter {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn convert(&self, bytes: &[u8], filename: &str) -> Result<ConversionResult> {
        let text = self.client.generate(&self.prompt, bytes, filename, false).await?;
        Ok(ConversionResult::markdown(text))
    }
}

pub struct GeminiMindMapConverter {
    client: Arc<GeminiClient>,
    prompt: String,
}

#[async_trait]
impl Converter for GeminiMindMapConverter {
    fn name(&self) -> &str {
        "gemini-mindmap"
    }

    async fn convert(&self, bytes: &[u8], filename: &str) -> Result<ConversionResult> {
        let raw = self.client.generate(&self.prompt, bytes, filename, true).await?;
        let map = MindMap::from_json(&raw).context("Gemini returned an unusable mind map")?;
        tracing::debug!(file = filename, nodes = map.node_count(), "mind map extracted");
        Ok(ConversionResult::mind_map(map.to_freemind()))
    }
}

pub struct GeminiClassifier {
    client: Arc<GeminiClient>,
    prompt: String,
}

#[async_trait]
impl Classifier for GeminiClassifier {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn classify(&self, bytes: &[u8], filename: &str) -> Result<ArtifactFormat> {
        let answer = self.client.generate(&self.prompt, bytes, filename, false).await?;
        parse_classification(&answer)
    }
}

/// `mindmap` / `markdown`, tolerating case, quotes and trailing punctuation.
fn parse_classification(answer: &str) -> Result<ArtifactFormat> {
    let word: String = answer
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphabetic() || *c == ' ')
        .collect();
    match word.trim() {
        "mindmap" | "mind map" => Ok(ArtifactFormat::MindMap),
        "markdown" | "notes" => Ok(ArtifactFormat::Markdown),
        other => bail!("unexpected classification '{}'", other),
    }
}

/// Concatenate candidate text parts, rejecting blocked or empty responses.
fn response_text(value: &Value) -> Result<String> {
    if let Some(reason) = value
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        bail!("Gemini blocked the request: {}", reason);
    }

    let parts: Vec<&str> = value
        .get("candidates")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|c| c.pointer("/content/parts").and_then(Value::as_array))
        .flatten()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .filter(|t| !t.is_empty())
        .collect();

    let text = parts.join("\n").trim().to_string();
    if text.is_empty() {
        bail!("Gemini did not return any text content");
    }
    Ok(text)
}
