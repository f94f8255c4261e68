// ABOUTME: Configuration module for the slide-illustrator application
// ABOUTME: Loads provider credentials and pipeline tunables from a JSON file and the environment

use crate::errors::{IllustratorError, Result};
use log::{info, warn};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_SPARK_BASE_URL: &str = "https://spark-api-open.xf-yun.com/v2";
pub const DEFAULT_SPARK_MODEL: &str = "spark-x";
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.2";

/// Global configuration for the application
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub google_api_key: Option<String>,
    pub google_cse_id: Option<String>,
    pub google_ai_api_key: Option<String>,
    pub spark_api_key: Option<String>,
    pub spark_base_url: String,
    pub spark_model: String,
    pub ollama_base_url: Option<String>,
    pub ollama_model: String,
    pub exa_api_key: Option<String>,
    pub serp_api_key: Option<String>,
    pub images_per_slide: usize,
    pub download_attempts: u32,
    pub slide_retry_budget: u32,
    pub download_timeout_secs: u64,
    pub search_timeout_secs: u64,
    pub optimizer_timeout_secs: u64,
    pub ollama_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            google_api_key: None,
            google_cse_id: None,
            google_ai_api_key: None,
            spark_api_key: None,
            spark_base_url: DEFAULT_SPARK_BASE_URL.to_string(),
            spark_model: DEFAULT_SPARK_MODEL.to_string(),
            ollama_base_url: Some(DEFAULT_OLLAMA_BASE_URL.to_string()),
            ollama_model: DEFAULT_OLLAMA_MODEL.to_string(),
            exa_api_key: None,
            serp_api_key: None,
            images_per_slide: 2,
            download_attempts: 3,
            slide_retry_budget: 3,
            download_timeout_secs: 30,
            search_timeout_secs: 15,
            optimizer_timeout_secs: 30,
            ollama_timeout_secs: 120,
        }
    }
}

/// On-disk shape of `config.json`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    google_api_key: Option<String>,
    google_cse_id: Option<String>,
    google_ai_api_key: Option<String>,
    spark_api_key: Option<String>,
    spark_base_url: Option<String>,
    spark_model: Option<String>,
    ollama_base_url: Option<String>,
    ollama_model: Option<String>,
    exa_api_key: Option<String>,
    serp_api_key: Option<String>,
    images_per_slide: Option<usize>,
    download_attempts: Option<u32>,
    slide_retry_budget: Option<u32>,
    download_timeout_secs: Option<u64>,
    search_timeout_secs: Option<u64>,
    optimizer_timeout_secs: Option<u64>,
    ollama_timeout_secs: Option<u64>,
}

/// Treat empty or whitespace-only values as "not configured".
fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Create a new configuration instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration: defaults, then the JSON file (if it exists), then
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            if path.exists() {
                config.apply_file(path)?;
                info!("Loaded configuration from {:?}", path);
            } else {
                info!("No configuration file at {:?}, using defaults", path);
            }
        }
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON string, on top of the defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: ConfigFile = serde_json::from_str(json)
            .map_err(|e| IllustratorError::ConfigError(format!("Invalid config file: {}", e)))?;
        let mut config = Self::default();
        config.merge(file);
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let raw = fs::read_to_string(path)?;
        let file: ConfigFile = serde_json::from_str(&raw).map_err(|e| {
            IllustratorError::ConfigError(format!("Invalid config file {:?}: {}", path, e))
        })?;
        self.merge(file);
        Ok(())
    }

    fn merge(&mut self, file: ConfigFile) {
        if let Some(v) = non_empty(file.google_api_key) {
            self.google_api_key = Some(v);
        }
        if let Some(v) = non_empty(file.google_cse_id) {
            self.google_cse_id = Some(v);
        }
        if let Some(v) = non_empty(file.google_ai_api_key) {
            self.google_ai_api_key = Some(v);
        }
        if let Some(v) = non_empty(file.spark_api_key) {
            self.spark_api_key = Some(v);
        }
        if let Some(v) = non_empty(file.spark_base_url) {
            self.spark_base_url = v;
        }
        if let Some(v) = non_empty(file.spark_model) {
            self.spark_model = v;
        }
        if let Some(v) = file.ollama_base_url {
            // An explicit empty string switches the local model off.
            self.ollama_base_url = non_empty(Some(v));
        }
        if let Some(v) = non_empty(file.ollama_model) {
            self.ollama_model = v;
        }
        if let Some(v) = non_empty(file.exa_api_key) {
            self.exa_api_key = Some(v);
        }
        if let Some(v) = non_empty(file.serp_api_key) {
            self.serp_api_key = Some(v);
        }
        self.images_per_slide = file.images_per_slide.unwrap_or(self.images_per_slide);
        self.download_attempts = file.download_attempts.unwrap_or(self.download_attempts);
        self.slide_retry_budget = file.slide_retry_budget.unwrap_or(self.slide_retry_budget);
        self.download_timeout_secs = file
            .download_timeout_secs
            .unwrap_or(self.download_timeout_secs);
        self.search_timeout_secs = file.search_timeout_secs.unwrap_or(self.search_timeout_secs);
        self.optimizer_timeout_secs = file
            .optimizer_timeout_secs
            .unwrap_or(self.optimizer_timeout_secs);
        self.ollama_timeout_secs = file.ollama_timeout_secs.unwrap_or(self.ollama_timeout_secs);
    }

    /// Override values from environment variables
    fn apply_env(&mut self) {
        let var = |name: &str| non_empty(env::var(name).ok());

        if let Some(v) = var("GOOGLE_API_KEY") {
            self.google_api_key = Some(v);
        }
        if let Some(v) = var("GOOGLE_CSE_ID") {
            self.google_cse_id = Some(v);
        }
        if let Some(v) = var("GOOGLE_AI_API_KEY") {
            self.google_ai_api_key = Some(v);
        }
        if let Some(v) = var("SPARK_API_KEY") {
            self.spark_api_key = Some(v);
        }
        if let Some(v) = var("SPARK_BASE_URL") {
            self.spark_base_url = v;
        }
        if let Some(v) = var("SPARK_MODEL") {
            self.spark_model = v;
        }
        if let Some(v) = var("OLLAMA_BASE_URL") {
            self.ollama_base_url = Some(v);
        }
        if let Some(v) = var("OLLAMA_MODEL") {
            self.ollama_model = v;
        }
        if let Some(v) = var("EXA_API_KEY") {
            self.exa_api_key = Some(v);
        }
        if let Some(v) = var("SERP_API_KEY") {
            self.serp_api_key = Some(v);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.images_per_slide == 0 {
            return Err(IllustratorError::ConfigError(
                "images_per_slide must be at least 1".to_string(),
            ));
        }
        if self.download_attempts == 0 {
            return Err(IllustratorError::ConfigError(
                "download_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Both halves of the Custom Search credential are required.
    pub fn google_cse_enabled(&self) -> bool {
        self.google_api_key.is_some() && self.google_cse_id.is_some()
    }

    /// True when at least one keyword optimizer can be tried.
    pub fn any_optimizer_enabled(&self) -> bool {
        self.google_ai_api_key.is_some()
            || self.ollama_base_url.is_some()
            || self.spark_api_key.is_some()
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    pub fn optimizer_timeout(&self) -> Duration {
        Duration::from_secs(self.optimizer_timeout_secs)
    }

    pub fn ollama_timeout(&self) -> Duration {
        Duration::from_secs(self.ollama_timeout_secs)
    }

    /// Human-readable lines describing which backends are switched on.
    pub fn summary(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let on_off = |enabled: bool| if enabled { "enabled" } else { "not configured" };

        lines.push(format!(
            "Google Custom Search API: {}",
            on_off(self.google_cse_enabled())
        ));
        lines.push(format!("SerpApi: {}", on_off(self.serp_api_key.is_some())));
        lines.push(format!("Exa API: {}", on_off(self.exa_api_key.is_some())));
        lines.push("Google image page scraping: enabled (fallback)".to_string());
        lines.push(format!(
            "Gemini keyword optimizer: {}",
            on_off(self.google_ai_api_key.is_some())
        ));
        match &self.ollama_base_url {
            Some(url) => lines.push(format!(
                "Ollama keyword optimizer: {} (model: {})",
                url, self.ollama_model
            )),
            None => lines.push("Ollama keyword optimizer: not configured".to_string()),
        }
        lines.push(format!(
            "Spark keyword optimizer: {}",
            on_off(self.spark_api_key.is_some())
        ));
        if !self.any_optimizer_enabled() {
            lines.push("No keyword optimizer configured; raw slide text is searched".to_string());
        }
        lines
    }

    /// Write the summary to the log
    pub fn log_summary(&self) {
        for line in self.summary() {
            info!("{}", line);
        }
        if !self.google_cse_enabled()
            && self.serp_api_key.is_none()
            && self.exa_api_key.is_none()
        {
            warn!("No search API configured; falling back to scraping Google image results");
        }
    }
}
