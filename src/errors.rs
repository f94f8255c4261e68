// ABOUTME: Error types for the slide-illustrator application
// ABOUTME: Provides structured error handling for each stage of the pipeline

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IllustratorError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("XML error: {0}")]
    XmlError(String),

    #[error("PPTX error: {0}")]
    PptxError(String),

    #[error("Keyword optimizer error: {0}")]
    OptimizerError(String),

    #[error("Unsupported image: {0}")]
    UnsupportedImage(String),

    #[error("Input validation error: {0}")]
    ValidationError(String),

    #[error("Path not found: {0}")]
    PathNotFoundError(PathBuf),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Status server error: {0}")]
    StatusServerError(String),

    #[error("Unknown error: {0}")]
    UnknownError(String),
}

// Implement conversion from anyhow::Error to our IllustratorError
impl From<anyhow::Error> for IllustratorError {
    fn from(err: anyhow::Error) -> Self {
        IllustratorError::UnknownError(err.to_string())
    }
}

// Implement conversion from zip errors
impl From<zip::result::ZipError> for IllustratorError {
    fn from(err: zip::result::ZipError) -> Self {
        IllustratorError::PptxError(format!("ZIP operation failed: {}", err))
    }
}

impl From<quick_xml::Error> for IllustratorError {
    fn from(err: quick_xml::Error) -> Self {
        IllustratorError::XmlError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IllustratorError>;
