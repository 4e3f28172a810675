use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::envelope::{PageContent, PageEnvelope};
use super::handler::{HandlerError, HandlerResult, Stage, StageHandler};
use super::page_parser::{parse_page, ExtractedPage};
use super::url_filter::UrlFilter;
use crate::cli::config::FetchSettings;
use crate::error::{PipelineError, Result};
use crate::queue::manager::QueueManager;
use crate::utils::{hash, mime};

/// Transport-level fetch outcome. HTTP status classification is the
/// handler's job; only connection-level failures are errors here.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("fetch failed: {0}")]
    Other(String),
}

/// Content retrieval seam. The pipeline only depends on this contract; the
/// HTTP client below is the default implementation.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> std::result::Result<FetchedPage, FetchError>;
}

/// reqwest-backed fetcher with a bounded request timeout.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(settings: &FetchSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<FetchedPage, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else if e.is_connect() {
                FetchError::Connect(e.to_string())
            } else {
                FetchError::Other(e.to_string())
            }
        })?;

        let status_code = response.status().as_u16();
        let final_url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect::<HashMap<_, _>>();
        let content_type = headers.get("content-type").cloned();

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Other(e.to_string()))?
            .to_vec();

        Ok(FetchedPage {
            final_url,
            status_code,
            headers,
            body,
            content_type,
        })
    }
}

/// Fetch stage: lease a URL, retrieve it, enrich the envelope with content,
/// metadata and the content hash, and feed discovered links back into the
/// fetch queue.
pub struct FetchHandler {
    settings: FetchSettings,
    filter: UrlFilter,
    fetcher: Arc<dyn PageFetcher>,
    queue: Arc<QueueManager>,
    /// Queue discovered links re-enter; also this handler's own input.
    input_queue: String,
    handler_id: String,
    pages_fetched: AtomicUsize,
}

impl FetchHandler {
    pub fn new(
        settings: FetchSettings,
        fetcher: Arc<dyn PageFetcher>,
        queue: Arc<QueueManager>,
        input_queue: String,
        handler_id: String,
    ) -> Self {
        let filter = UrlFilter::new(&settings);
        Self {
            settings,
            filter,
            fetcher,
            queue,
            input_queue,
            handler_id,
            pages_fetched: AtomicUsize::new(0),
        }
    }

    /// Fetch with bounded in-worker retries for connection-level failures.
    async fn fetch_with_retries(&self, url: &str) -> std::result::Result<FetchedPage, HandlerError> {
        let mut delay = Duration::from_millis(self.settings.retry_base_delay_ms);
        let attempts = self.settings.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.fetcher.fetch(url).await {
                Ok(page) => return Ok(page),
                Err(err @ (FetchError::Timeout | FetchError::Connect(_))) => {
                    last_error = err.to_string();
                    if attempt < attempts {
                        debug!(url, attempt, error = %last_error, "retrying fetch");
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
                Err(FetchError::Other(detail)) => {
                    return Err(HandlerError::Permanent(format!("fetch failed: {detail}")));
                }
            }
        }
        Err(HandlerError::Transient(last_error))
    }

    async fn emit_links(&self, links: &[String], site_id: &str, site_host: Option<&str>) {
        for link in links {
            if !self.filter.should_enqueue(link, site_host) {
                continue;
            }
            let mut seed = PageEnvelope::seed(link.clone(), site_id);
            seed.timestamp = Some(Utc::now());
            if let Err(err) = self.queue.enqueue(&self.input_queue, seed, None).await {
                warn!(link = %link, error = %err, "failed to enqueue discovered link");
            }
        }
    }

    /// Fetch `/sitemap.xml` from the URL's origin and seed every `<loc>`
    /// entry that passes the filter.
    async fn discover_sitemap(&self, base: &Url, site_id: &str, site_host: Option<&str>) {
        let Ok(sitemap_url) = base.join("/sitemap.xml") else {
            return;
        };
        let Ok(page) = self.fetcher.fetch(sitemap_url.as_str()).await else {
            debug!(url = %sitemap_url, "sitemap fetch failed");
            return;
        };
        if page.status_code != 200 {
            return;
        }
        let body = String::from_utf8_lossy(&page.body);
        let loc_pattern = Regex::new(r"<loc>\s*([^<]+?)\s*</loc>").expect("static pattern");
        let locations: Vec<String> = loc_pattern
            .captures_iter(&body)
            .map(|cap| cap[1].to_string())
            .collect();
        debug!(url = %sitemap_url, count = locations.len(), "sitemap entries discovered");
        self.emit_links(&locations, site_id, site_host).await;
    }
}

#[async_trait]
impl StageHandler for FetchHandler {
    fn name(&self) -> &str {
        &self.handler_id
    }

    fn stage(&self) -> Stage {
        Stage::Fetch
    }

    async fn process(&self, envelope: PageEnvelope) -> HandlerResult {
        let url = envelope.url.clone();
        let parsed = Url::parse(&url)
            .map_err(|e| HandlerError::Permanent(format!("invalid URL {url}: {e}")))?;
        let site_host = parsed.host_str().map(str::to_string);
        let site_host = site_host.as_deref();

        // Filtering happens before fetch; a filtered URL completes with no
        // downstream output.
        if !self.filter.in_scope(&url, site_host) {
            debug!(url = %url, "URL filtered before fetch");
            return Ok(None);
        }
        if self.pages_fetched.load(Ordering::Relaxed) >= self.settings.max_pages {
            debug!(url = %url, "page budget exhausted, skipping fetch");
            return Ok(None);
        }
        self.filter.mark_seen(&url);

        let page = self.fetch_with_retries(&url).await?;

        match page.status_code {
            200..=299 => {}
            429 => {
                return Err(HandlerError::Transient(
                    "rate limited (HTTP 429)".to_string(),
                ))
            }
            500..=599 => {
                return Err(HandlerError::Transient(format!(
                    "server error (HTTP {})",
                    page.status_code
                )))
            }
            other => {
                return Err(HandlerError::Permanent(format!("HTTP {other}")));
            }
        }

        self.pages_fetched.fetch_add(1, Ordering::Relaxed);

        let mimetype = mime::resolve(page.content_type.as_deref(), &url);
        let extracted = if mime::is_html(&mimetype) {
            let html = String::from_utf8_lossy(&page.body);
            parse_page(&html, &parsed)
        } else {
            ExtractedPage::default()
        };

        if self.settings.discover_sitemaps {
            self.discover_sitemap(&parsed, &envelope.site_id, site_host)
                .await;
        }
        self.emit_links(&extracted.links, &envelope.site_id, site_host)
            .await;

        let mut output = envelope;
        output.content = Some(PageContent::from_bytes(&page.body));
        output.status_code = Some(page.status_code);
        output.headers = page.headers;
        output.links = extracted.links;
        output.mimetype = Some(mimetype);
        output.metadata = extracted.metadata;
        output.content_hash = Some(hash::content_hash(&page.body));
        output.timestamp = Some(Utc::now());
        output.crawler_id = Some(self.handler_id.clone());
        output.crawler_type = Some("http".to_string());

        Ok(Some(output))
    }
}
