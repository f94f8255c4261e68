// ABOUTME: Utility functions for the slide-illustrator application
// ABOUTME: Path validation, directory creation and output naming helpers

use crate::errors::{IllustratorError, Result};
use std::path::{Path, PathBuf};

/// Validate that a file exists
pub fn validate_file_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(IllustratorError::PathNotFoundError(path.to_path_buf()));
    }
    if !path.is_file() {
        return Err(IllustratorError::ValidationError(format!(
            "Path is not a file: {:?}",
            path
        )));
    }
    Ok(())
}

/// Validate that the input is an existing `.pptx` file
pub fn validate_pptx_input(path: &Path) -> Result<()> {
    let is_pptx = path
        .extension()
        .map_or(false, |ext| ext.to_string_lossy().eq_ignore_ascii_case("pptx"));
    if !is_pptx {
        return Err(IllustratorError::ValidationError(format!(
            "Input must be a .pptx file: {:?}",
            path
        )));
    }
    validate_file_exists(path)
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_directory_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    } else if !path.is_dir() {
        return Err(IllustratorError::ValidationError(format!(
            "Path exists but is not a directory: {:?}",
            path
        )));
    }
    Ok(())
}

/// Ensure a file's parent directory exists
pub fn ensure_parent_directory_exists(file_path: &Path) -> Result<()> {
    match file_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_directory_exists(parent),
        _ => Ok(()),
    }
}

/// `talk.pptx` -> `talk_enhanced.pptx`, next to the input
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "presentation".to_string());
    input.with_file_name(format!("{}_enhanced.pptx", stem))
}
