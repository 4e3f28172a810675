use regex::Regex;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::cli::config::FetchSettings;

/// Decides which URLs enter the fetch stage.
///
/// Scope checks (include/exclude patterns, domain scoping) apply to every
/// URL before fetch. The seen set deduplicates *discovered links* so crawl
/// cycles collapse to a single queue entry; a URL arriving as a task is
/// always scope-checked but never dropped for having been seen, which keeps
/// retries and operator reseeds flowing.
pub struct UrlFilter {
    include_patterns: Vec<Regex>,
    exclude_patterns: Vec<Regex>,
    allowed_domains: HashSet<String>,
    follow_external: bool,
    seen_urls: Mutex<HashSet<String>>,
}

impl UrlFilter {
    pub fn new(settings: &FetchSettings) -> Self {
        let include_patterns = settings
            .url_patterns
            .include
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!("Invalid include pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect();

        let exclude_patterns = settings
            .url_patterns
            .exclude
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!("Invalid exclude pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect();

        let allowed_domains = settings
            .allowed_domains
            .iter()
            .map(|domain| domain.to_lowercase())
            .collect();

        Self {
            include_patterns,
            exclude_patterns,
            allowed_domains,
            follow_external: settings.follow_external,
            seen_urls: Mutex::new(HashSet::new()),
        }
    }

    /// Whether this URL passes pattern and domain scoping.
    ///
    /// `site_host` is the host of the task's seed URL; without
    /// `follow_external`, links leaving that host (and the allowed domains)
    /// are rejected.
    pub fn in_scope(&self, url: &str, site_host: Option<&str>) -> bool {
        let normalized = normalize_url(url);

        let parsed = match Url::parse(&normalized) {
            Ok(url) => url,
            Err(e) => {
                debug!("Skipping invalid URL {}: {}", normalized, e);
                return false;
            }
        };

        let Some(host) = parsed.host_str().map(str::to_lowercase) else {
            debug!("Skipping URL without host: {}", normalized);
            return false;
        };

        if !self.host_in_scope(&host, site_host) {
            debug!("Skipping out-of-scope host: {}", host);
            return false;
        }

        for pattern in &self.exclude_patterns {
            if pattern.is_match(&normalized) {
                debug!("Skipping URL matching exclusion pattern: {}", normalized);
                return false;
            }
        }

        if !self.include_patterns.is_empty()
            && !self
                .include_patterns
                .iter()
                .any(|pattern| pattern.is_match(&normalized))
        {
            debug!("Skipping URL not matching any inclusion pattern: {}", normalized);
            return false;
        }

        true
    }

    /// Whether a discovered link should be emitted as a new task.
    ///
    /// Marks the URL seen; each normalized URL is emitted at most once per
    /// filter lifetime.
    pub fn should_enqueue(&self, url: &str, site_host: Option<&str>) -> bool {
        if !self.in_scope(url, site_host) {
            return false;
        }
        self.seen_urls
            .lock()
            .unwrap()
            .insert(normalize_url(url))
    }

    /// Record a URL the fetcher is processing so links back to it are not
    /// re-emitted.
    pub fn mark_seen(&self, url: &str) {
        self.seen_urls.lock().unwrap().insert(normalize_url(url));
    }

    fn host_in_scope(&self, host: &str, site_host: Option<&str>) -> bool {
        if self.follow_external {
            return true;
        }

        let domain_match = |domain: &str| host == domain || host.ends_with(&format!(".{domain}"));

        if !self.allowed_domains.is_empty() {
            return self.allowed_domains.iter().any(|d| domain_match(d));
        }
        match site_host {
            Some(seed) => domain_match(&seed.to_lowercase()),
            None => true,
        }
    }

    pub fn seen_count(&self) -> usize {
        self.seen_urls.lock().unwrap().len()
    }
}

/// Normalize a URL so trivially different spellings dedupe to one entry.
pub fn normalize_url(url: &str) -> String {
    let parsed = match Url::parse(url) {
        Ok(url) => url,
        Err(_) => return url.to_string(),
    };

    let mut normalized = parsed;

    // Default ports carry no information.
    if let Some(port) = normalized.port() {
        if (normalized.scheme() == "http" && port == 80)
            || (normalized.scheme() == "https" && port == 443)
        {
            let _ = normalized.set_port(None);
        }
    }

    if normalized.path() == "/" {
        normalized.set_path("");
    }

    // Sort query parameters so ordering differences dedupe.
    if let Some(query) = normalized.query() {
        if !query.is_empty() {
            let mut params: Vec<(String, String)> = query
                .split('&')
                .map(|pair| {
                    let mut kv = pair.split('=');
                    (
                        kv.next().unwrap_or("").to_string(),
                        kv.next().unwrap_or("").to_string(),
                    )
                })
                .collect();
            params.sort_by(|a, b| a.0.cmp(&b.0));

            let sorted_query = params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<String>>()
                .join("&");
            normalized.set_query(Some(&sorted_query));
        }
    }

    normalized.set_fragment(None);

    normalized.to_string()
}
