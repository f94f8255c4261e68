// ABOUTME: Library module for the slide-illustrator program.
// ABOUTME: Finds images for slide text and lays them out on PowerPoint slides.

// Reexport modules
pub mod config;
pub mod errors;
pub mod fetch;
pub mod keywords;
pub mod layout;
pub mod normalize;
pub mod pptx;
pub mod processor;
pub mod progress;
pub mod providers;
pub mod search;
pub mod status;
pub mod utils;

// Reexport common types and functions
pub use config::Config;
pub use errors::{IllustratorError, Result};
pub use fetch::{FailedUrlSet, FetchFailure, FetchedImage, HttpTransport, ImageFetcher, ImageKind};
pub use keywords::{normalize_keyword, KeywordOptimizer, OptimizedKeywordCache, OptimizerBackend};
pub use layout::{apply_template, fit_within, Rect, SlideCanvas, TemplateSelector, TextBoxStyle};
pub use normalize::FormatNormalizer;
pub use pptx::{PptxDocument, Slide};
pub use processor::{RunSummary, SlideImageSet, SlideOutcome, SlideProcessor};
pub use progress::{
    FanOut, LogSink, NoopSink, ProgressEvent, ProgressSink, RunStatus, Severity, StatusBoard,
    StopFlag,
};
pub use providers::{providers_from_config, ImageProvider};
pub use search::{ImageCandidate, RunState, SearchOrchestrator};
pub use status::{serve, StatusServer};
