// ABOUTME: Drives a whole deck through search, download, normalization and layout
// ABOUTME: Recovers from per-slide failures and only aborts on open or save errors

use crate::config::Config;
use crate::errors::{IllustratorError, Result};
use crate::fetch::{FetchFailure, ImageFetcher, ReqwestTransport};
use crate::keywords::KeywordOptimizer;
use crate::layout::{apply_template, TemplateSelector};
use crate::normalize::FormatNormalizer;
use crate::pptx::PptxDocument;
use crate::progress::{LogSink, ProgressEvent, ProgressSink, StopFlag};
use crate::providers::{is_webp_url, providers_from_config};
use crate::search::{RunState, SearchOrchestrator};
use crate::utils;
use log::{debug, info, warn};
use reqwest::blocking::Client;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The two images laid out on one slide. When only one distinct image was
/// found, the second slot holds a copy of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlideImageSet {
    pub first: PathBuf,
    pub second: PathBuf,
    pub distinct: usize,
}

impl SlideImageSet {
    /// Build the set from the images obtained for a slide, copying the first
    /// image to `<stem>_dup.<ext>` when there is only one.
    pub fn assemble(mut images: Vec<PathBuf>) -> Result<Option<Self>> {
        if images.is_empty() {
            return Ok(None);
        }
        if images.len() == 1 {
            let single = &images[0];
            let stem = single
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "image".to_string());
            let dup = match single.extension() {
                Some(ext) => single.with_file_name(format!("{}_dup.{}", stem, ext.to_string_lossy())),
                None => single.with_file_name(format!("{}_dup", stem)),
            };
            fs::copy(single, &dup)?;
            debug!("Only one image found, duplicated to {:?}", dup);
            return Ok(Some(Self {
                first: images.remove(0),
                second: dup,
                distinct: 1,
            }));
        }
        images.truncate(2);
        let second = images.remove(1);
        Ok(Some(Self {
            first: images.remove(0),
            second,
            distinct: 2,
        }))
    }

    pub fn paths(&self) -> [&Path; 2] {
        [&self.first, &self.second]
    }
}

/// What happened to one slide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlideOutcome {
    Illustrated { template: usize, distinct: usize },
    /// The slide has no text to search for.
    NoText,
    /// Every search round came up empty; the slide is left as it was.
    NoImages,
    Failed(String),
}

/// Totals for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub output: PathBuf,
    pub total_slides: usize,
    pub illustrated: usize,
    pub skipped: usize,
    pub without_images: usize,
    pub failed: usize,
    pub stopped: bool,
    pub failed_urls: usize,
    pub optimized_keywords: usize,
}

pub struct SlideProcessor {
    search: SearchOrchestrator,
    fetcher: ImageFetcher,
    normalizer: FormatNormalizer,
    sink: Arc<dyn ProgressSink>,
    stop: StopFlag,
    images_per_slide: usize,
    retry_budget: usize,
    scratch_root: PathBuf,
}

impl SlideProcessor {
    pub fn new(search: SearchOrchestrator, fetcher: ImageFetcher) -> Self {
        let defaults = Config::default();
        Self {
            search,
            fetcher,
            normalizer: FormatNormalizer::new(),
            sink: Arc::new(LogSink),
            stop: StopFlag::new(),
            images_per_slide: defaults.images_per_slide,
            retry_budget: defaults.slide_retry_budget as usize,
            scratch_root: std::env::temp_dir().join("slide-illustrator"),
        }
    }

    /// Wire the real providers, optimizer backends and HTTP transport.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = Client::builder().build()?;
        let providers = providers_from_config(config, &client);
        let optimizer = KeywordOptimizer::from_config(config, &client);
        let search = SearchOrchestrator::new(providers, optimizer);
        let fetcher = ImageFetcher::new(
            Box::new(ReqwestTransport::new(client)),
            config.download_attempts,
            config.download_timeout(),
        );
        Ok(Self::new(search, fetcher)
            .with_images_per_slide(config.images_per_slide)
            .with_retry_budget(config.slide_retry_budget as usize))
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_scratch_root(mut self, root: PathBuf) -> Self {
        self.scratch_root = root;
        self
    }

    pub fn with_images_per_slide(mut self, count: usize) -> Self {
        self.images_per_slide = count.max(1);
        self
    }

    pub fn with_retry_budget(mut self, rounds: usize) -> Self {
        self.retry_budget = rounds;
        self
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Illustrate every slide of `input` and write the result to `output`.
    ///
    /// Only failing to open the input, prepare scratch space or save the
    /// output is an error; everything else is reported and skipped.
    pub fn run(&self, input: &Path, output: &Path) -> Result<RunSummary> {
        utils::validate_file_exists(input)?;
        let mut document = PptxDocument::open(input)?;

        let scratch = self
            .scratch_root
            .join(format!("run-{}", uuid::Uuid::new_v4().simple()));
        utils::ensure_directory_exists(&scratch)?;
        debug!("Scratch directory {:?}", scratch);

        let mut state = RunState::new();
        let mut summary = self.process_document(&mut document, &mut state, &scratch);

        document.save(output)?;
        summary.output = output.to_path_buf();

        if let Err(e) = fs::remove_dir_all(&scratch) {
            warn!("Failed to remove scratch directory {:?}: {}", scratch, e);
        }

        self.sink.emit(&ProgressEvent::RunCompleted {
            output: output.to_path_buf(),
            stopped: summary.stopped,
        });
        info!(
            "{} of {} slides illustrated ({} without text, {} without images, {} failed)",
            summary.illustrated,
            summary.total_slides,
            summary.skipped,
            summary.without_images,
            summary.failed
        );
        Ok(summary)
    }

    /// Process the slides of an open document in place, checking the stop
    /// flag between slides.
    pub fn process_document(
        &self,
        document: &mut PptxDocument,
        state: &mut RunState,
        scratch: &Path,
    ) -> RunSummary {
        let total = document.slide_count();
        let mut summary = RunSummary {
            total_slides: total,
            ..RunSummary::default()
        };
        let mut selector = TemplateSelector::new();
        self.sink.emit(&ProgressEvent::RunStarted { total });

        for index in 0..total {
            if self.stop.is_stopped() {
                info!("Stop requested, leaving remaining slides untouched");
                summary.stopped = true;
                break;
            }

            match self.process_slide(document, index, state, &mut selector, scratch) {
                SlideOutcome::Illustrated { .. } => summary.illustrated += 1,
                SlideOutcome::NoText => summary.skipped += 1,
                SlideOutcome::NoImages => summary.without_images += 1,
                SlideOutcome::Failed(_) => summary.failed += 1,
            }
            self.sink.emit(&ProgressEvent::progress(index + 1, total));
        }

        summary.failed_urls = state.failed.len();
        summary.optimized_keywords = state.keywords.len();
        summary
    }

    fn process_slide(
        &self,
        document: &mut PptxDocument,
        index: usize,
        state: &mut RunState,
        selector: &mut TemplateSelector,
        scratch: &Path,
    ) -> SlideOutcome {
        let total = document.slide_count();
        let slide_size = document.slide_size();
        let slide = &mut document.slides_mut()[index];
        let number = slide.number();
        self.sink.emit(&ProgressEvent::SlideStarted {
            index: number,
            total,
        });

        let texts = match slide.texts() {
            Ok(texts) => texts,
            Err(e) => return self.slide_failed(number, e),
        };
        if texts.is_empty() {
            self.sink.emit(&ProgressEvent::SlideSkipped {
                index: number,
                reason: "no text found".to_string(),
            });
            return SlideOutcome::NoText;
        }
        info!("Slide {} text: {}", number, texts.join(", "));

        let images = self.acquire_images(state, index, &texts, scratch);
        let set = match SlideImageSet::assemble(images) {
            Ok(Some(set)) => set,
            Ok(None) => {
                warn!(
                    "Slide {}: no images after {} search rounds, keeping original layout",
                    number,
                    self.retry_budget + 1
                );
                self.sink.emit(&ProgressEvent::SlideSkipped {
                    index: number,
                    reason: "no usable images found".to_string(),
                });
                return SlideOutcome::NoImages;
            }
            Err(e) => return self.slide_failed(number, e),
        };

        let template = selector.select(total);
        let snapshot = slide.clone();
        let text = texts.join("\n");
        match apply_template(slide, template, slide_size, &set.paths(), &text) {
            Ok(()) => {
                self.sink.emit(&ProgressEvent::SlideCompleted {
                    index: number,
                    template,
                    images: set.distinct,
                });
                SlideOutcome::Illustrated {
                    template,
                    distinct: set.distinct,
                }
            }
            Err(e) => {
                *slide = snapshot;
                self.slide_failed(number, e)
            }
        }
    }

    fn slide_failed(&self, number: usize, error: IllustratorError) -> SlideOutcome {
        let message = error.to_string();
        self.sink.emit(&ProgressEvent::SlideFailed {
            index: number,
            error: message.clone(),
        });
        SlideOutcome::Failed(message)
    }

    /// Search and download until the slide has enough images or the retry
    /// rounds run out. The first round searches the joined slide text; later
    /// rounds use the first text only, optimized on the first retry. A URL
    /// already used on this slide is not downloaded again.
    ///
    /// `index` is the 0-based slide position; downloads are written to
    /// `scratch` as `slide_{index}_img_{i}` (or `slide_{index}_retry{r}_img_{i}`).
    pub fn acquire_images(
        &self,
        state: &mut RunState,
        index: usize,
        texts: &[String],
        scratch: &Path,
    ) -> Vec<PathBuf> {
        let number = index + 1;
        let wanted = self.images_per_slide;
        let mut images: Vec<PathBuf> = Vec::new();
        let mut used: HashSet<String> = HashSet::new();
        let first_text = texts.first().cloned().unwrap_or_default();

        for round in 0..=self.retry_budget {
            if images.len() >= wanted {
                break;
            }
            let keyword = if round == 0 {
                texts.join(" ")
            } else {
                warn!(
                    "Slide {}: {}/{} images, search round {}",
                    number,
                    images.len(),
                    wanted,
                    round + 1
                );
                if round == 1 && self.search.optimizer().is_enabled() {
                    self.search
                        .optimizer()
                        .optimize(&mut state.keywords, &first_text)
                        .unwrap_or_else(|| first_text.clone())
                } else {
                    first_text.clone()
                }
            };

            let candidates = self.search.search(state, &keyword, wanted);
            for (i, candidate) in candidates.iter().enumerate() {
                if images.len() >= wanted {
                    break;
                }
                if used.contains(&candidate.url) {
                    continue;
                }
                let ordinal = images.len() + 1;
                if is_webp_url(&candidate.url) {
                    state.failed.insert(&candidate.url);
                    self.report_image(number, ordinal, &candidate.url, Err(FetchFailure::UnsupportedFormat));
                    continue;
                }

                let name = if round == 0 {
                    format!("slide_{}_img_{}", index, i)
                } else {
                    format!("slide_{}_retry{}_img_{}", index, round, i)
                };
                let fetched = self
                    .fetcher
                    .fetch(&mut state.failed, &candidate.url, &scratch.join(name));
                let fetched = match fetched {
                    Ok(image) => image,
                    Err(failure) => {
                        self.report_image(number, ordinal, &candidate.url, Err(failure));
                        continue;
                    }
                };

                match self.normalizer.normalize(&fetched.path) {
                    Some(path) => {
                        used.insert(candidate.url.clone());
                        self.report_image(number, ordinal, &candidate.url, Ok(candidate.provider));
                        images.push(path);
                    }
                    None => {
                        state.failed.insert(&candidate.url);
                        self.report_image(
                            number,
                            ordinal,
                            &candidate.url,
                            Err(FetchFailure::UnrecognizedContent),
                        );
                    }
                }
            }
        }
        images
    }

    fn report_image(
        &self,
        slide: usize,
        ordinal: usize,
        url: &str,
        result: std::result::Result<&str, FetchFailure>,
    ) {
        let (ok, detail) = match result {
            Ok(provider) => (true, provider.to_string()),
            Err(failure) => (false, failure.to_string()),
        };
        self.sink.emit(&ProgressEvent::ImageResult {
            slide,
            ordinal,
            url: url.to_string(),
            ok,
            detail,
        });
    }
}
