// ABOUTME: Keyword handling for image search: normalization, optimization and caching
// ABOUTME: Turns slide text into a short English query via Gemini, Ollama or Spark

use crate::config::Config;
use crate::errors::{IllustratorError, Result};
use log::{debug, info};
use regex::Regex;
use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

/// Longest optimized keyword we accept, in characters.
pub const MAX_KEYWORD_CHARS: usize = 40;

const SEARCH_PROMPT: &str = "You are helping to search images on Google Images.\n\
Given the following Japanese word or short phrase:\n\
{text}\n\n\
Task:\n\
1. Generate ONE short English search query that will find images closely related\n   \
to the meaning of this Japanese word.\n\
2. The query should be at most 4-5 English words (very short).\n\
3. Output ONLY the English query text, without any explanation, quotes or extra words.\n\
4. If the Japanese word is a concrete thing (object, animal, food, place, action),\n   \
translate or describe it directly. If it is abstract, choose a concrete visual\n   \
concept that represents it (for example, a scene or object people can see).\n\n\
English search query:";

const SHORT_PROMPT: &str = "Translate this Japanese word to a short English image search query (2-4 words only): {text}\n\
Output only the English words, nothing else:";

fn prompt_for(template: &str, text: &str) -> String {
    template.replace("{text}", text)
}

/// Strip annotation prefixes such as furigana: keep only the text after the
/// last closing bracket. `りんご（apple）` becomes `apple`.
///
/// If nothing follows the bracket the trimmed input is returned unchanged.
pub fn normalize_keyword(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.rfind(['）', ')']) {
        Some(pos) => {
            let bracket_len = trimmed[pos..].chars().next().map_or(1, char::len_utf8);
            let tail = trimmed[pos + bracket_len..].trim();
            if tail.is_empty() {
                trimmed.to_string()
            } else {
                tail.to_string()
            }
        }
        None => trimmed.to_string(),
    }
}

fn label_prefix() -> &'static Regex {
    static LABEL: OnceLock<Regex> = OnceLock::new();
    LABEL.get_or_init(|| {
        Regex::new(r"(?i)^English search query[：:]\s*").expect("label pattern is valid")
    })
}

/// Clean a raw text-generation response into a usable keyword.
///
/// First line only, known label prefix removed, one surrounding quote removed
/// on each side. Empty results and results longer than
/// [`MAX_KEYWORD_CHARS`] are rejected.
pub fn sanitize_response(content: &str) -> Option<String> {
    let first_line = content.trim().lines().next().unwrap_or("").trim();
    let without_label = label_prefix().replace(first_line, "");
    let mut keyword: &str = without_label.trim();
    if let Some(rest) = keyword.strip_prefix(['"', '\'']) {
        keyword = rest;
    }
    if let Some(rest) = keyword.strip_suffix(['"', '\'']) {
        keyword = rest;
    }
    let keyword = keyword.trim();

    if keyword.is_empty() || keyword.chars().count() > MAX_KEYWORD_CHARS {
        return None;
    }
    Some(keyword.to_string())
}

/// Raw keyword -> optimized keyword, or `None` when no optimizer produced one.
///
/// Entries are written once; a second insert for the same key is ignored.
#[derive(Debug, Default)]
pub struct OptimizedKeywordCache {
    entries: HashMap<String, Option<String>>,
}

impl OptimizedKeywordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(entry)` when `raw` was already looked up this run.
    pub fn get(&self, raw: &str) -> Option<&Option<String>> {
        self.entries.get(raw)
    }

    /// Record the result for `raw`. Returns false when an entry already existed.
    pub fn insert(&mut self, raw: &str, optimized: Option<String>) -> bool {
        if self.entries.contains_key(raw) {
            return false;
        }
        self.entries.insert(raw.to_string(), optimized);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A text-generation service that can rewrite slide text as a search query.
pub trait OptimizerBackend {
    fn name(&self) -> &'static str;

    /// Send `text` to the service and return its raw text response.
    fn complete(&self, text: &str) -> Result<String>;
}

fn post_json(
    client: &Client,
    url: &str,
    query: &[(&str, &str)],
    bearer: Option<&str>,
    payload: &Value,
    timeout: Duration,
) -> Result<Value> {
    let mut request = client.post(url).query(query).json(payload).timeout(timeout);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }
    let response = request.send()?.error_for_status()?;
    Ok(response.json::<Value>()?)
}

fn missing_field(backend: &str) -> IllustratorError {
    IllustratorError::OptimizerError(format!("{} response has no text field", backend))
}

/// Google Gemini `generateContent`.
pub struct GeminiBackend {
    client: Client,
    api_key: String,
    timeout: Duration,
}

impl GeminiBackend {
    const ENDPOINT: &'static str =
        "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash-exp:generateContent";

    pub fn new(client: Client, api_key: String, timeout: Duration) -> Self {
        Self {
            client,
            api_key,
            timeout,
        }
    }
}

impl OptimizerBackend for GeminiBackend {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn complete(&self, text: &str) -> Result<String> {
        let payload = json!({
            "contents": [{ "parts": [{ "text": prompt_for(SEARCH_PROMPT, text) }] }],
            "generationConfig": { "temperature": 0.7, "maxOutputTokens": 50 }
        });
        let body = post_json(
            &self.client,
            Self::ENDPOINT,
            &[("key", self.api_key.as_str())],
            None,
            &payload,
            self.timeout,
        )?;
        body.pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| missing_field(self.name()))
    }
}

/// Ollama `/api/generate` on a local model server.
pub struct OllamaBackend {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaBackend {
    pub fn new(client: Client, base_url: String, model: String, timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            model,
            timeout,
        }
    }
}

impl OptimizerBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn complete(&self, text: &str) -> Result<String> {
        let endpoint = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "prompt": prompt_for(SHORT_PROMPT, text),
            "stream": false,
            "options": { "temperature": 0.3, "num_predict": 20, "top_p": 0.9, "top_k": 20 }
        });
        let body = post_json(&self.client, &endpoint, &[], None, &payload, self.timeout)?;
        body.get("response")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| missing_field(self.name()))
    }
}

/// Spark OpenAI-compatible `/chat/completions`.
pub struct SparkBackend {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl SparkBackend {
    pub fn new(
        client: Client,
        api_key: String,
        base_url: String,
        model: String,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_key,
            base_url,
            model,
            timeout,
        }
    }
}

impl OptimizerBackend for SparkBackend {
    fn name(&self) -> &'static str {
        "spark"
    }

    fn complete(&self, text: &str) -> Result<String> {
        let endpoint = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt_for(SEARCH_PROMPT, text) }],
            "stream": false,
            "temperature": 0.7,
            "max_tokens": 50
        });
        let body = post_json(
            &self.client,
            &endpoint,
            &[],
            Some(&self.api_key),
            &payload,
            self.timeout,
        )?;
        body.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| missing_field(self.name()))
    }
}

/// Tries each configured backend in order and memoizes the outcome per raw
/// keyword.
pub struct KeywordOptimizer {
    backends: Vec<Box<dyn OptimizerBackend>>,
}

impl KeywordOptimizer {
    pub fn new(backends: Vec<Box<dyn OptimizerBackend>>) -> Self {
        Self { backends }
    }

    /// Build the Gemini -> Ollama -> Spark chain from configuration.
    pub fn from_config(config: &Config, client: &Client) -> Self {
        let mut backends: Vec<Box<dyn OptimizerBackend>> = Vec::new();
        if let Some(key) = &config.google_ai_api_key {
            backends.push(Box::new(GeminiBackend::new(
                client.clone(),
                key.clone(),
                config.optimizer_timeout(),
            )));
        }
        if let Some(url) = &config.ollama_base_url {
            backends.push(Box::new(OllamaBackend::new(
                client.clone(),
                url.clone(),
                config.ollama_model.clone(),
                config.ollama_timeout(),
            )));
        }
        if let Some(key) = &config.spark_api_key {
            backends.push(Box::new(SparkBackend::new(
                client.clone(),
                key.clone(),
                config.spark_base_url.clone(),
                config.spark_model.clone(),
                config.optimizer_timeout(),
            )));
        }
        Self::new(backends)
    }

    pub fn is_enabled(&self) -> bool {
        !self.backends.is_empty()
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Optimized keyword for `raw`, consulting `cache` first. Failures never
    /// propagate; an unreachable or misbehaving backend just yields `None`.
    pub fn optimize(&self, cache: &mut OptimizedKeywordCache, raw: &str) -> Option<String> {
        if let Some(cached) = cache.get(raw) {
            debug!("Using cached keyword optimization for {:?}: {:?}", raw, cached);
            return cached.clone();
        }

        let mut optimized = None;
        for backend in &self.backends {
            debug!("Optimizing keyword {:?} with {}", raw, backend.name());
            match backend.complete(raw) {
                Ok(content) => {
                    debug!(
                        "{} raw response: {}",
                        backend.name(),
                        content.chars().take(100).collect::<String>()
                    );
                    match sanitize_response(&content) {
                        Some(keyword) => {
                            info!("{} optimized {:?} -> {:?}", backend.name(), raw, keyword);
                            optimized = Some(keyword);
                            break;
                        }
                        None => debug!("{} returned an unusable keyword", backend.name()),
                    }
                }
                Err(e) => debug!("{} keyword optimization failed: {}", backend.name(), e),
            }
        }

        cache.insert(raw, optimized.clone());
        optimized
    }
}
