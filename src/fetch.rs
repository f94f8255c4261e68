// ABOUTME: Image downloading with content validation, retries and a run-wide URL blacklist
// ABOUTME: Only genuine JPEG, PNG or GIF bodies are ever written to disk

use crate::providers::BROWSER_USER_AGENT;
use log::{debug, info, warn};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, REFERER, USER_AGENT};
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Bodies smaller than this are almost always error placeholders.
pub const MIN_IMAGE_BYTES: usize = 1024;

/// Upper bound on how much of a response body is read.
pub const MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;

/// URLs known to be unusable for the rest of the run.
#[derive(Debug, Default, Clone)]
pub struct FailedUrlSet {
    urls: HashSet<String>,
}

impl FailedUrlSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls.contains(url)
    }

    /// Returns true when the URL was not already blacklisted.
    pub fn insert(&mut self, url: &str) -> bool {
        self.urls.insert(url.to_string())
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

/// Raster formats the output deck can embed directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Gif,
}

impl ImageKind {
    pub fn extension(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "jpg",
            ImageKind::Png => "png",
            ImageKind::Gif => "gif",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ImageKind::Jpeg => "JPEG",
            ImageKind::Png => "PNG",
            ImageKind::Gif => "GIF",
        }
    }
}

/// Result of looking at the first bytes of a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniffed {
    Image(ImageKind),
    Webp,
    Html,
    Unknown,
}

/// Classify a body by its leading bytes.
pub fn sniff(body: &[u8]) -> Sniffed {
    if looks_like_html(body) {
        return Sniffed::Html;
    }
    if body.starts_with(&[0xFF, 0xD8]) {
        Sniffed::Image(ImageKind::Jpeg)
    } else if body.starts_with(b"\x89PNG\r\n\x1a\n") {
        Sniffed::Image(ImageKind::Png)
    } else if body.starts_with(b"GIF87a") || body.starts_with(b"GIF89a") {
        Sniffed::Image(ImageKind::Gif)
    } else if body.len() >= 12 && body.starts_with(b"RIFF") && &body[8..12] == b"WEBP" {
        Sniffed::Webp
    } else {
        Sniffed::Unknown
    }
}

fn looks_like_html(body: &[u8]) -> bool {
    let head = &body[..body.len().min(200)];
    let text = String::from_utf8_lossy(head).to_lowercase();
    let text = text.trim_start();
    text.starts_with("<!doctype")
        || text.starts_with("<html")
        || text.chars().take(100).collect::<String>().contains("<html")
}

/// Why a URL could not be turned into a local image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    #[error("URL already failed earlier in this run")]
    AlreadyFailed,

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("body too small ({0} bytes)")]
    TooSmall(usize),

    #[error("body is an HTML page, not an image")]
    HtmlBody,

    #[error("WEBP images cannot be embedded")]
    UnsupportedFormat,

    #[error("body is not a JPEG, PNG or GIF image")]
    UnrecognizedContent,

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("could not write image: {0}")]
    Io(String),
}

/// A validated image on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub url: String,
    pub path: PathBuf,
    pub kind: ImageKind,
}

pub type FetchResult = std::result::Result<FetchedImage, FetchFailure>;

/// Raw response as seen by the fetcher.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Transport-level failure, split by how the fetcher reacts to it.
#[derive(Debug, Clone)]
pub enum TransportError {
    Timeout(String),
    Connect(String),
    Other(String),
}

/// Something that can GET a URL. Production code uses [`ReqwestTransport`].
pub trait HttpTransport {
    fn get(&self, url: &str, timeout: Duration) -> std::result::Result<HttpResponse, TransportError>;
}

/// Blocking reqwest client sending browser-like headers.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(&self, url: &str, timeout: Duration) -> std::result::Result<HttpResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .header(ACCEPT, "image/webp,image/apng,image/*,*/*;q=0.8")
            .header(ACCEPT_LANGUAGE, "zh-CN,zh;q=0.9,en;q=0.8")
            .header(REFERER, "https://www.google.com/")
            .timeout(timeout)
            .send()
            .map_err(classify)?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = Vec::new();
        if status == 200 {
            let mut limited = response.take(MAX_IMAGE_BYTES);
            limited.read_to_end(&mut body).map_err(|e| {
                if e.kind() == std::io::ErrorKind::TimedOut {
                    TransportError::Timeout(e.to_string())
                } else {
                    TransportError::Other(e.to_string())
                }
            })?;
        }

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Downloads and validates candidate images.
pub struct ImageFetcher {
    transport: Box<dyn HttpTransport>,
    attempts: u32,
    timeout: Duration,
    sleep: fn(Duration),
}

impl ImageFetcher {
    pub fn new(transport: Box<dyn HttpTransport>, attempts: u32, timeout: Duration) -> Self {
        Self {
            transport,
            attempts: attempts.max(1),
            timeout,
            sleep: std::thread::sleep,
        }
    }

    /// Replace the backoff sleep, e.g. with a no-op in tests.
    pub fn with_sleep(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    /// Download `url` and write it next to `destination`, with the extension
    /// replaced by the sniffed format's.
    ///
    /// Definitive failures blacklist the URL in `failed`; a URL already in
    /// `failed` is never requested again.
    pub fn fetch(&self, failed: &mut FailedUrlSet, url: &str, destination: &Path) -> FetchResult {
        if failed.contains(url) {
            debug!("Skipping known failed URL: {}", url);
            return Err(FetchFailure::AlreadyFailed);
        }

        debug!("Downloading {} -> {:?}", url, destination);
        let mut last = FetchFailure::Exhausted {
            attempts: 0,
            last: "no attempt made".to_string(),
        };

        for attempt in 1..=self.attempts {
            if attempt > 1 {
                debug!("Retry {}/{} for {}", attempt, self.attempts, url);
            }
            let started = Instant::now();
            match self.transport.get(url, self.timeout) {
                Ok(response) => {
                    debug!(
                        "HTTP {} in {:.2}s, content-type {:?}, {} bytes",
                        response.status,
                        started.elapsed().as_secs_f64(),
                        response.content_type,
                        response.body.len()
                    );
                    if response.status != 200 {
                        last = FetchFailure::HttpStatus(response.status);
                        continue;
                    }
                    return match self.accept(url, &response, destination) {
                        Ok(image) => Ok(image),
                        Err(FetchFailure::Io(e)) => Err(FetchFailure::Io(e)),
                        Err(reason) => {
                            debug!("Rejected {}: {}", url, reason);
                            failed.insert(url);
                            Err(reason)
                        }
                    };
                }
                Err(TransportError::Timeout(e)) => {
                    debug!("Timed out fetching {}, giving up on this URL", url);
                    failed.insert(url);
                    return Err(FetchFailure::Timeout(e));
                }
                Err(TransportError::Connect(e)) => {
                    debug!("Could not connect for {}, giving up on this URL", url);
                    failed.insert(url);
                    return Err(FetchFailure::Connection(e));
                }
                Err(TransportError::Other(e)) => {
                    debug!("Transient error fetching {}: {}", url, e);
                    last = FetchFailure::Exhausted {
                        attempts: attempt,
                        last: e,
                    };
                    if attempt < self.attempts {
                        let wait = Duration::from_secs(2 * u64::from(attempt));
                        debug!("Waiting {:?} before retrying", wait);
                        (self.sleep)(wait);
                    }
                }
            }
        }

        warn!("All {} attempts failed for {}", self.attempts, url);
        failed.insert(url);
        Err(match last {
            FetchFailure::Exhausted { last, .. } => FetchFailure::Exhausted {
                attempts: self.attempts,
                last,
            },
            other => other,
        })
    }

    /// Validate a 200 response and write it out.
    fn accept(&self, url: &str, response: &HttpResponse, destination: &Path) -> FetchResult {
        if let Some(content_type) = &response.content_type {
            if content_type.to_lowercase().contains("image/webp") {
                return Err(FetchFailure::UnsupportedContentType(content_type.clone()));
            }
        }

        let body = &response.body;
        if body.len() < MIN_IMAGE_BYTES {
            return Err(FetchFailure::TooSmall(body.len()));
        }

        let kind = match sniff(body) {
            Sniffed::Image(kind) => kind,
            Sniffed::Html => return Err(FetchFailure::HtmlBody),
            Sniffed::Webp => return Err(FetchFailure::UnsupportedFormat),
            Sniffed::Unknown => return Err(FetchFailure::UnrecognizedContent),
        };

        let path = destination.with_extension(kind.extension());
        fs::write(&path, body).map_err(|e| FetchFailure::Io(e.to_string()))?;
        info!(
            "Downloaded {} ({} bytes, {}) to {:?}",
            url,
            body.len(),
            kind.label(),
            path
        );
        Ok(FetchedImage {
            url: url.to_string(),
            path,
            kind,
        })
    }
}
