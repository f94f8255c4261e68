// ABOUTME: Structured progress events emitted while a deck is processed
// ABOUTME: Sinks for logging, polling front-ends, and cooperative stop requests

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lines kept by a [`StatusBoard`] before the oldest are dropped.
pub const MAX_STATUS_LOGS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        }
    }
}

/// Something that happened during a run. Slide indices are 1-based.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    RunStarted { total: usize },
    SlideStarted { index: usize, total: usize },
    SlideSkipped { index: usize, reason: String },
    ImageResult { slide: usize, ordinal: usize, url: String, ok: bool, detail: String },
    SlideCompleted { index: usize, template: usize, images: usize },
    SlideFailed { index: usize, error: String },
    Progress { current: usize, total: usize, percent: u8 },
    RunCompleted { output: PathBuf, stopped: bool },
}

impl ProgressEvent {
    /// Percent of `total` done after `current` slides.
    pub fn progress(current: usize, total: usize) -> Self {
        let percent = if total == 0 {
            100
        } else {
            (current.min(total) * 100 / total) as u8
        };
        ProgressEvent::Progress {
            current,
            total,
            percent,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            ProgressEvent::ImageResult { ok: false, .. } => Severity::Warning,
            ProgressEvent::SlideSkipped { .. } => Severity::Warning,
            ProgressEvent::SlideFailed { .. } => Severity::Error,
            ProgressEvent::Progress { .. } => Severity::Debug,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::RunStarted { total } => write!(f, "Processing {} slides", total),
            ProgressEvent::SlideStarted { index, total } => {
                write!(f, "Processing slide {}/{}", index, total)
            }
            ProgressEvent::SlideSkipped { index, reason } => {
                write!(f, "Slide {} skipped: {}", index, reason)
            }
            ProgressEvent::ImageResult {
                slide,
                ordinal,
                url,
                ok,
                detail,
            } => {
                if *ok {
                    write!(f, "Slide {} image {} downloaded from {}", slide, ordinal, url)
                } else {
                    write!(f, "Slide {} image {} failed ({}): {}", slide, ordinal, url, detail)
                }
            }
            ProgressEvent::SlideCompleted {
                index,
                template,
                images,
            } => write!(
                f,
                "Slide {} done with template {} and {} distinct images",
                index, template, images
            ),
            ProgressEvent::SlideFailed { index, error } => {
                write!(f, "Slide {} failed: {}", index, error)
            }
            ProgressEvent::Progress {
                current,
                total,
                percent,
            } => write!(f, "Progress {}/{} ({}%)", current, total, percent),
            ProgressEvent::RunCompleted { output, stopped } => {
                if *stopped {
                    write!(f, "Stopped early, partial deck saved to {:?}", output)
                } else {
                    write!(f, "Done, saved to {:?}", output)
                }
            }
        }
    }
}

/// Receives progress events. Front-ends implement this to render logs,
/// progress bars or a polled status document.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Mirrors events to the `log` facade at their severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn emit(&self, event: &ProgressEvent) {
        match event.severity() {
            Severity::Debug => debug!("{}", event),
            Severity::Info => info!("{}", event),
            Severity::Warning => warn!("{}", event),
            Severity::Error => error!("{}", event),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// Forwards every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanOut {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ProgressSink for FanOut {
    fn emit(&self, event: &ProgressEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Idle,
    Processing,
    Completed,
    Stopped,
    Failed,
}

/// JSON document served to polling front-ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    pub status: RunPhase,
    pub progress: u8,
    pub current_page: usize,
    pub total_pages: usize,
    pub logs: Vec<String>,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self {
            status: RunPhase::Idle,
            progress: 0,
            current_page: 0,
            total_pages: 0,
            logs: Vec::new(),
        }
    }
}

/// Shared, thread-safe view of the current run, fed by events.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<Mutex<RunStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RunStatus {
        self.inner.lock().clone()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }

    /// Mark the run as failed with a fatal error message.
    pub fn fail(&self, message: &str) {
        let mut status = self.inner.lock();
        status.status = RunPhase::Failed;
        push_log(&mut status, Severity::Error, message);
    }
}

fn push_log(status: &mut RunStatus, severity: Severity, message: &str) {
    let stamp = chrono::Local::now().format("%H:%M:%S");
    status
        .logs
        .push(format!("[{}] [{}] {}", stamp, severity.label(), message));
    if status.logs.len() > MAX_STATUS_LOGS {
        let excess = status.logs.len() - MAX_STATUS_LOGS;
        status.logs.drain(..excess);
    }
}

impl ProgressSink for StatusBoard {
    fn emit(&self, event: &ProgressEvent) {
        let mut status = self.inner.lock();
        match event {
            ProgressEvent::RunStarted { total } => {
                *status = RunStatus {
                    status: RunPhase::Processing,
                    total_pages: *total,
                    ..RunStatus::default()
                };
            }
            ProgressEvent::SlideStarted { index, total } => {
                status.current_page = *index;
                status.total_pages = *total;
            }
            ProgressEvent::Progress {
                current, percent, ..
            } => {
                status.current_page = *current;
                status.progress = *percent;
            }
            ProgressEvent::RunCompleted { stopped: true, .. } => {
                status.status = RunPhase::Stopped;
            }
            ProgressEvent::RunCompleted { stopped: false, .. } => {
                status.status = RunPhase::Completed;
                status.progress = 100;
            }
            _ => {}
        }
        if event.severity() > Severity::Debug {
            push_log(&mut status, event.severity(), &event.to_string());
        }
    }
}

/// Cooperative cancellation checked between slides.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
