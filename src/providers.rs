// ABOUTME: Image search providers: Google Custom Search, SerpApi, Exa and page scraping
// ABOUTME: Each provider turns a keyword into candidate image URLs and never fails loudly

use crate::config::Config;
use crate::errors::Result;
use log::debug;
use regex::Regex;
use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Hosts whose `<img>` links are usually full-size photos.
const STOCK_PHOTO_HOSTS: [&str; 4] = [
    "i.imgur.com",
    "images.unsplash.com",
    "pixabay.com",
    "pexels.com",
];

const THUMBNAIL_HOST: &str = "encrypted-tbn0.gstatic.com";

/// A backend that can turn a keyword into image URLs.
///
/// Implementations swallow transport and parse errors and return an empty
/// list instead.
pub trait ImageProvider {
    fn name(&self) -> &'static str;

    fn search(&self, keyword: &str, count: usize) -> Vec<String>;
}

/// WEBP cannot be embedded in the output deck, so such links are dropped
/// before anything is downloaded.
pub fn is_webp_url(url: &str) -> bool {
    url.to_lowercase().contains(".webp")
}

/// Shared tail of every provider: drop blanks, WEBP links and duplicates,
/// stop at `count`.
fn collect_urls<I>(candidates: I, count: usize) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut urls: Vec<String> = Vec::new();
    for url in candidates {
        if urls.len() >= count {
            break;
        }
        if url.is_empty() || is_webp_url(&url) || urls.contains(&url) {
            continue;
        }
        urls.push(url);
    }
    urls
}

/// Log-and-swallow wrapper used by every provider's `search`.
fn recover(provider: &str, result: Result<Vec<String>>) -> Vec<String> {
    match result {
        Ok(urls) => {
            debug!("{} returned {} image URL(s)", provider, urls.len());
            urls
        }
        Err(e) => {
            debug!("{} search failed: {}", provider, e);
            Vec::new()
        }
    }
}

fn first_str<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| item.get(*key).and_then(Value::as_str))
        .find(|value| !value.is_empty())
}

/// `items[].link` from a Custom Search response.
pub fn parse_google_cse(body: &Value, count: usize) -> Vec<String> {
    let items = body.get("items").and_then(Value::as_array);
    collect_urls(
        items
            .into_iter()
            .flatten()
            .filter_map(|item| first_str(item, &["link"]).map(str::to_string)),
        count,
    )
}

/// `images_results[].original`, falling back to `.link`.
pub fn parse_serpapi(body: &Value, count: usize) -> Vec<String> {
    let items = body.get("images_results").and_then(Value::as_array);
    collect_urls(
        items
            .into_iter()
            .flatten()
            .filter_map(|item| first_str(item, &["original", "link"]).map(str::to_string)),
        count,
    )
}

/// `results[].url`, `.image_url` or `.image`.
pub fn parse_exa(body: &Value, count: usize) -> Vec<String> {
    let items = body.get("results").and_then(Value::as_array);
    collect_urls(
        items
            .into_iter()
            .flatten()
            .filter_map(|item| first_str(item, &["url", "image_url", "image"]).map(str::to_string)),
        count,
    )
}

struct ScrapePatterns {
    original: Regex,
    quoted_image: Regex,
    img_tag: Regex,
}

fn scrape_patterns() -> &'static ScrapePatterns {
    static PATTERNS: OnceLock<ScrapePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ScrapePatterns {
        original: Regex::new(r#""ou":"([^"]+)""#).expect("valid pattern"),
        quoted_image: Regex::new(r#"(?i)"(https://[^"]+\.(?:jpg|jpeg|png)[^"]*)""#)
            .expect("valid pattern"),
        img_tag: Regex::new(r#"(?i)<img[^>]+src="(https://[^"]+)""#).expect("valid pattern"),
    })
}

fn is_sized_thumbnail(url: &str) -> bool {
    url.contains(THUMBNAIL_HOST) && url.contains("=s")
}

/// Extract image URLs from a Google image results page.
///
/// Passes run in order of confidence: embedded original-image fields, then
/// quoted jpg/png links, then `<img>` tags. Later passes only run while short
/// of `count`.
pub fn parse_google_scrape(html: &str, count: usize) -> Vec<String> {
    let patterns = scrape_patterns();
    let mut found: Vec<String> = Vec::new();
    let push = |found: &mut Vec<String>, url: String| {
        if found.len() < count && !url.is_empty() && !is_webp_url(&url) && !found.contains(&url) {
            found.push(url);
        }
    };

    for capture in patterns.original.captures_iter(html).take(count) {
        let url = capture[1].replace("\\u003d", "=").replace("\\/", "/");
        if is_sized_thumbnail(&url) {
            // Drop the size suffix to get the full image.
            let original = url.split("=s").next().unwrap_or(&url).to_string();
            push(&mut found, original);
        } else {
            push(&mut found, url);
        }
    }

    if found.len() < count {
        debug!(
            "Original-image fields gave {}/{} results, trying quoted links",
            found.len(),
            count
        );
        for capture in patterns.quoted_image.captures_iter(html) {
            let url = &capture[1];
            if !is_sized_thumbnail(url) {
                push(&mut found, url.to_string());
            }
        }
    }

    if found.len() < count {
        for capture in patterns.img_tag.captures_iter(html) {
            let url = &capture[1];
            let lower = url.to_lowercase();
            let stock = STOCK_PHOTO_HOSTS.iter().any(|host| lower.contains(host));
            let has_image_ext = [".jpg", ".jpeg", ".png"].iter().any(|ext| lower.contains(ext));
            if stock || (has_image_ext && !lower.contains("encrypted-tbn0")) {
                push(&mut found, url.to_string());
            }
        }
    }

    found
}

/// Google Custom Search JSON API in image mode.
pub struct GoogleCseProvider {
    client: Client,
    api_key: String,
    cse_id: String,
    timeout: Duration,
}

impl GoogleCseProvider {
    const ENDPOINT: &'static str = "https://www.googleapis.com/customsearch/v1";

    pub fn new(client: Client, api_key: String, cse_id: String, timeout: Duration) -> Self {
        Self {
            client,
            api_key,
            cse_id,
            timeout,
        }
    }

    fn query(&self, keyword: &str, count: usize) -> Result<Vec<String>> {
        // Ask for extra results so the WEBP filter still leaves enough.
        let num = (count * 3).min(10).to_string();
        let body: Value = self
            .client
            .get(Self::ENDPOINT)
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.cse_id.as_str()),
                ("q", keyword),
                ("searchType", "image"),
                ("num", num.as_str()),
                ("safe", "active"),
                ("imgSize", "xlarge"),
                ("imgType", "photo"),
                ("fileType", "jpg,png"),
            ])
            .timeout(self.timeout)
            .send()?
            .error_for_status()?
            .json()?;
        Ok(parse_google_cse(&body, count))
    }
}

impl ImageProvider for GoogleCseProvider {
    fn name(&self) -> &'static str {
        "google-cse"
    }

    fn search(&self, keyword: &str, count: usize) -> Vec<String> {
        debug!("Searching Google Custom Search for {:?}", keyword);
        recover(self.name(), self.query(keyword, count))
    }
}

/// SerpApi's Google Images engine.
pub struct SerpApiProvider {
    client: Client,
    api_key: String,
    timeout: Duration,
}

impl SerpApiProvider {
    const ENDPOINT: &'static str = "https://serpapi.com/search";

    pub fn new(client: Client, api_key: String, timeout: Duration) -> Self {
        Self {
            client,
            api_key,
            timeout,
        }
    }

    fn query(&self, keyword: &str, count: usize) -> Result<Vec<String>> {
        let num = count.min(20).to_string();
        let body: Value = self
            .client
            .get(Self::ENDPOINT)
            .query(&[
                ("api_key", self.api_key.as_str()),
                ("engine", "google_images"),
                ("q", keyword),
                ("num", num.as_str()),
                ("safe", "active"),
                ("ijn", "0"),
            ])
            .timeout(self.timeout)
            .send()?
            .error_for_status()?
            .json()?;
        Ok(parse_serpapi(&body, count))
    }
}

impl ImageProvider for SerpApiProvider {
    fn name(&self) -> &'static str {
        "serpapi"
    }

    fn search(&self, keyword: &str, count: usize) -> Vec<String> {
        debug!("Searching SerpApi for {:?}", keyword);
        recover(self.name(), self.query(keyword, count))
    }
}

/// Exa neural search restricted to the images category.
pub struct ExaProvider {
    client: Client,
    api_key: String,
    timeout: Duration,
}

impl ExaProvider {
    const ENDPOINT: &'static str = "https://api.exa.ai/search";

    pub fn new(client: Client, api_key: String, timeout: Duration) -> Self {
        Self {
            client,
            api_key,
            timeout,
        }
    }

    fn query(&self, keyword: &str, count: usize) -> Result<Vec<String>> {
        let payload = json!({
            "query": keyword,
            "type": "neural",
            "category": "images",
            "num_results": (count * 2).min(10),
            "use_autoprompt": false,
            "contents": { "text": true, "images": true }
        });
        let body: Value = self
            .client
            .post(Self::ENDPOINT)
            .header("x-api-key", &self.api_key)
            .json(&payload)
            .timeout(self.timeout)
            .send()?
            .error_for_status()?
            .json()?;
        Ok(parse_exa(&body, count))
    }
}

impl ImageProvider for ExaProvider {
    fn name(&self) -> &'static str {
        "exa"
    }

    fn search(&self, keyword: &str, count: usize) -> Vec<String> {
        debug!("Searching Exa for {:?}", keyword);
        recover(self.name(), self.query(keyword, count))
    }
}

/// Scrapes the public Google image results page. Needs no credentials.
pub struct GoogleScrapeProvider {
    client: Client,
    timeout: Duration,
}

impl GoogleScrapeProvider {
    const SEARCH_URL: &'static str = "https://www.google.com/search";

    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn query(&self, keyword: &str, count: usize) -> Result<Vec<String>> {
        let url = Url::parse_with_params(
            Self::SEARCH_URL,
            &[("tbm", "isch"), ("q", keyword), ("safe", "active")],
        )
        .map_err(|e| crate::errors::IllustratorError::ValidationError(e.to_string()))?;
        let html = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, BROWSER_USER_AGENT)
            .header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .header(reqwest::header::ACCEPT_LANGUAGE, "zh-CN,zh;q=0.9,en;q=0.8")
            .timeout(self.timeout)
            .send()?
            .error_for_status()?
            .text()?;
        Ok(parse_google_scrape(&html, count))
    }
}

impl ImageProvider for GoogleScrapeProvider {
    fn name(&self) -> &'static str {
        "google-scrape"
    }

    fn search(&self, keyword: &str, count: usize) -> Vec<String> {
        debug!("Scraping Google image results for {:?}", keyword);
        recover(self.name(), self.query(keyword, count))
    }
}

/// Providers in priority order: Custom Search, SerpApi, Exa, then scraping.
/// Providers without credentials are left out.
pub fn providers_from_config(config: &Config, client: &Client) -> Vec<Box<dyn ImageProvider>> {
    let timeout = config.search_timeout();
    let mut providers: Vec<Box<dyn ImageProvider>> = Vec::new();

    if let (Some(key), Some(cx)) = (&config.google_api_key, &config.google_cse_id) {
        providers.push(Box::new(GoogleCseProvider::new(
            client.clone(),
            key.clone(),
            cx.clone(),
            timeout,
        )));
    }
    if let Some(key) = &config.serp_api_key {
        providers.push(Box::new(SerpApiProvider::new(
            client.clone(),
            key.clone(),
            timeout,
        )));
    }
    if let Some(key) = &config.exa_api_key {
        providers.push(Box::new(ExaProvider::new(client.clone(), key.clone(), timeout)));
    }
    providers.push(Box::new(GoogleScrapeProvider::new(client.clone(), timeout)));
    providers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webp_detection_is_case_insensitive() {
        assert!(is_webp_url("https://x.test/a.WEBP"));
        assert!(is_webp_url("https://x.test/a.webp?w=300"));
        assert!(!is_webp_url("https://x.test/a.png"));
    }

    #[test]
    fn cse_links_skip_webp_and_respect_count() {
        let body = json!({
            "items": [
                { "link": "https://a.test/1.webp" },
                { "link": "https://a.test/2.jpg" },
                { "title": "no link" },
                { "link": "https://a.test/3.png" },
                { "link": "https://a.test/4.png" }
            ]
        });
        assert_eq!(
            parse_google_cse(&body, 2),
            vec!["https://a.test/2.jpg", "https://a.test/3.png"]
        );
    }

    #[test]
    fn missing_fields_yield_nothing() {
        let body = json!({ "error": { "code": 429 } });
        assert!(parse_google_cse(&body, 2).is_empty());
        assert!(parse_serpapi(&body, 2).is_empty());
        assert!(parse_exa(&body, 2).is_empty());
        assert!(parse_exa(&json!({ "results": "oops" }), 2).is_empty());
    }

    #[test]
    fn serpapi_prefers_original() {
        let body = json!({
            "images_results": [
                { "original": "https://s.test/full.jpg", "link": "https://s.test/page" },
                { "link": "https://s.test/only-link.png" }
            ]
        });
        assert_eq!(
            parse_serpapi(&body, 5),
            vec!["https://s.test/full.jpg", "https://s.test/only-link.png"]
        );
    }

    #[test]
    fn exa_falls_back_through_fields() {
        let body = json!({
            "results": [
                { "url": "", "image_url": "https://e.test/a.jpg" },
                { "image": "https://e.test/b.png" }
            ]
        });
        assert_eq!(
            parse_exa(&body, 5),
            vec!["https://e.test/a.jpg", "https://e.test/b.png"]
        );
    }

    #[test]
    fn scrape_prefers_original_fields() {
        let html = r#"
            ["ou":"https:\/\/photos.test\/cat.jpg"]
            ["ou":"https:\/\/encrypted-tbn0.gstatic.com\/images?q=tbn:abc=s120"]
            "https://other.test/dog.png"
        "#;
        assert_eq!(
            parse_google_scrape(html, 2),
            vec![
                "https://photos.test/cat.jpg",
                "https://encrypted-tbn0.gstatic.com/images?q=tbn:abc"
            ]
        );
    }

    #[test]
    fn scrape_falls_back_to_links_and_img_tags() {
        let html = r#"
            <a href="x">"https://pics.test/one.JPG?size=large"</a>
            <img class="t" src="https://encrypted-tbn0.gstatic.com/images?q=tbn:1&s=1">
            <img src="https://images.unsplash.com/photo-123">
        "#;
        assert_eq!(
            parse_google_scrape(html, 3),
            vec![
                "https://pics.test/one.JPG?size=large",
                "https://images.unsplash.com/photo-123"
            ]
        );
    }

    #[test]
    fn scrape_of_garbage_is_empty() {
        assert!(parse_google_scrape("<html><body>captcha</body></html>", 2).is_empty());
    }

    #[test]
    fn scrape_provider_is_always_last() {
        let config = Config {
            google_api_key: Some("k".into()),
            google_cse_id: Some("cx".into()),
            exa_api_key: Some("e".into()),
            ..Config::default()
        };
        let names: Vec<_> = providers_from_config(&config, &Client::new())
            .iter()
            .map(|p| p.name())
            .collect();
        assert_eq!(names, vec!["google-cse", "exa", "google-scrape"]);
    }
}
