// ABOUTME: Search orchestration across image providers and keyword variants
// ABOUTME: Pools candidate URLs in provider priority order, skipping known failures

use crate::fetch::FailedUrlSet;
use crate::keywords::{normalize_keyword, KeywordOptimizer, OptimizedKeywordCache};
use crate::providers::ImageProvider;
use log::{debug, info};

/// A URL and the provider that returned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCandidate {
    pub url: String,
    pub provider: &'static str,
}

/// Mutable state that lives for one run and is shared by every slide.
#[derive(Debug, Default)]
pub struct RunState {
    pub failed: FailedUrlSet,
    pub keywords: OptimizedKeywordCache,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Ordered, de-duplicated keyword variants: optimized, normalized,
/// normalized with a "japanese" suffix, then the raw text.
pub fn keyword_variants(raw: &str, normalized: &str, optimized: Option<&str>) -> Vec<String> {
    let mut variants: Vec<String> = Vec::new();
    let candidates = [
        optimized.map(str::to_string),
        Some(normalized.to_string()),
        Some(format!("{} japanese", normalized)),
        Some(raw.to_string()),
    ];
    for variant in candidates.into_iter().flatten() {
        let variant = variant.trim().to_string();
        if !variant.is_empty() && !variants.contains(&variant) {
            variants.push(variant);
        }
    }
    variants
}

pub struct SearchOrchestrator {
    providers: Vec<Box<dyn ImageProvider>>,
    optimizer: KeywordOptimizer,
}

impl SearchOrchestrator {
    /// `providers` must already be in priority order.
    pub fn new(providers: Vec<Box<dyn ImageProvider>>, optimizer: KeywordOptimizer) -> Self {
        Self {
            providers,
            optimizer,
        }
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn optimizer(&self) -> &KeywordOptimizer {
        &self.optimizer
    }

    /// Up to `count` candidate URLs for `keyword`, higher-confidence first.
    /// URLs in `state.failed` are never returned.
    pub fn search(&self, state: &mut RunState, keyword: &str, count: usize) -> Vec<ImageCandidate> {
        if count == 0 {
            return Vec::new();
        }

        let normalized = normalize_keyword(keyword);
        if normalized != keyword.trim() {
            debug!("Normalized keyword {:?} -> {:?}", keyword, normalized);
        }
        let optimized = self.optimizer.optimize(&mut state.keywords, &normalized);
        let variants = keyword_variants(keyword, &normalized, optimized.as_deref());
        info!("Searching images for {:?} (variants: {:?})", keyword, variants);

        let mut found: Vec<ImageCandidate> = Vec::new();
        for provider in &self.providers {
            if found.len() >= count {
                break;
            }
            for variant in &variants {
                if found.len() >= count {
                    break;
                }
                let wanted = count - found.len();
                let urls = provider.search(variant, wanted);
                debug!(
                    "{} returned {} URLs for {:?}",
                    provider.name(),
                    urls.len(),
                    variant
                );
                for url in urls {
                    if found.len() >= count {
                        break;
                    }
                    if state.failed.contains(&url) {
                        debug!("Dropping known failed URL {}", url);
                        continue;
                    }
                    if found.iter().any(|c| c.url == url) {
                        continue;
                    }
                    found.push(ImageCandidate {
                        url,
                        provider: provider.name(),
                    });
                }
            }
            if !found.is_empty() {
                debug!("{} candidates after {}", found.len(), provider.name());
            }
        }

        found.truncate(count);
        info!("Found {} candidate URLs for {:?}", found.len(), keyword);
        found
    }
}
