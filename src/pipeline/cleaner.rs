use async_trait::async_trait;
use chrono::Utc;
use scraper::{ElementRef, Html, Node, Selector};
use std::sync::Arc;
use tracing::debug;

use super::envelope::PageEnvelope;
use super::handler::{HandlerError, HandlerResult, Stage, StageHandler};
use crate::storage::DocumentStore;
use crate::utils::mime;

/// Conversion strategy selected from the envelope mimetype.
///
/// The built-in strategies cover html, markdown and plaintext; heavier
/// converters (pdf, docx, search-result pages) plug in through this same
/// trait at factory time.
#[async_trait]
pub trait CleanStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn handles(&self, mimetype: &str) -> bool;

    async fn clean(&self, envelope: &PageEnvelope) -> Result<String, HandlerError>;
}

fn content_text(envelope: &PageEnvelope) -> Result<String, HandlerError> {
    let content = envelope
        .content
        .as_ref()
        .ok_or_else(|| HandlerError::Permanent("envelope has no content to clean".to_string()))?;
    match content.as_text() {
        Some(text) => Ok(text.to_string()),
        None => Ok(String::from_utf8_lossy(&content.to_bytes()).into_owned()),
    }
}

pub struct HtmlCleanStrategy;

#[async_trait]
impl CleanStrategy for HtmlCleanStrategy {
    fn name(&self) -> &'static str {
        "html"
    }

    fn handles(&self, mimetype: &str) -> bool {
        mime::is_html(mimetype)
    }

    async fn clean(&self, envelope: &PageEnvelope) -> Result<String, HandlerError> {
        Ok(html_to_markdown(&content_text(envelope)?))
    }
}

pub struct MarkdownCleanStrategy;

#[async_trait]
impl CleanStrategy for MarkdownCleanStrategy {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn handles(&self, mimetype: &str) -> bool {
        mime::essence(mimetype) == mime::MARKDOWN
    }

    async fn clean(&self, envelope: &PageEnvelope) -> Result<String, HandlerError> {
        content_text(envelope)
    }
}

pub struct PlaintextCleanStrategy;

#[async_trait]
impl CleanStrategy for PlaintextCleanStrategy {
    fn name(&self) -> &'static str {
        "plaintext"
    }

    fn handles(&self, mimetype: &str) -> bool {
        mime::essence(mimetype) == mime::PLAINTEXT
    }

    async fn clean(&self, envelope: &PageEnvelope) -> Result<String, HandlerError> {
        content_text(envelope)
    }
}

pub fn default_strategies() -> Vec<Arc<dyn CleanStrategy>> {
    vec![
        Arc::new(HtmlCleanStrategy),
        Arc::new(MarkdownCleanStrategy),
        Arc::new(PlaintextCleanStrategy),
    ]
}

/// Clean stage: convert fetched content to markdown.
///
/// When the document store already holds the envelope's content hash, the
/// stored clean content is forwarded instead of re-converting; the persister
/// then decides whether to drop it.
pub struct CleanHandler {
    strategies: Vec<Arc<dyn CleanStrategy>>,
    store: Arc<dyn DocumentStore>,
    handler_id: String,
}

impl CleanHandler {
    pub fn new(
        strategies: Vec<Arc<dyn CleanStrategy>>,
        store: Arc<dyn DocumentStore>,
        handler_id: String,
    ) -> Self {
        Self {
            strategies,
            store,
            handler_id,
        }
    }
}

#[async_trait]
impl StageHandler for CleanHandler {
    fn name(&self) -> &str {
        &self.handler_id
    }

    fn stage(&self) -> Stage {
        Stage::Clean
    }

    async fn process(&self, envelope: PageEnvelope) -> HandlerResult {
        if let Some(hash) = envelope.content_hash.as_deref() {
            let known = self
                .store
                .find_by_hash(hash)
                .await
                .map_err(|e| HandlerError::Transient(e.to_string()))?;
            if let Some(existing) = known {
                debug!(url = %envelope.url, hash, "content hash already stored, skipping conversion");
                let mut output = envelope;
                output.clean_content = Some(existing.clean_content);
                output.updated_at = Some(Utc::now());
                return Ok(Some(output));
            }
        }

        let mimetype = envelope
            .mimetype
            .clone()
            .unwrap_or_else(|| mime::HTML.to_string());
        let strategy = self
            .strategies
            .iter()
            .find(|s| s.handles(&mimetype))
            .ok_or_else(|| {
                HandlerError::Permanent(format!("no clean strategy for mimetype {mimetype}"))
            })?;

        debug!(url = %envelope.url, strategy = strategy.name(), "cleaning content");
        let clean_content = strategy.clean(&envelope).await?;

        let mut output = envelope;
        output.clean_content = Some(clean_content);
        output.updated_at = Some(Utc::now());
        Ok(Some(output))
    }
}

/// Minimal HTML to markdown conversion: headings, paragraphs, lists, links,
/// emphasis and code survive; scripts, styles and markup noise do not.
pub fn html_to_markdown(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();

    let body = Selector::parse("body")
        .ok()
        .and_then(|selector| document.select(&selector).next());
    match body {
        Some(body) => render_children(body, &mut out),
        None => {
            if let Some(root) = ElementRef::wrap(document.tree.root()) {
                render_children(root, &mut out);
            }
        }
    }

    // Collapse runs of blank lines left by block handling.
    let mut lines: Vec<&str> = Vec::new();
    let mut blank = true;
    for line in out.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            if !blank {
                lines.push("");
            }
            blank = true;
        } else {
            lines.push(trimmed);
            blank = false;
        }
    }
    lines.join("\n").trim().to_string()
}

fn render_children(element: ElementRef, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
                if !collapsed.is_empty() {
                    if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                        out.push(' ');
                    }
                    out.push_str(&collapsed);
                }
            }
            Node::Element(_) => {
                if let Some(child_ref) = ElementRef::wrap(child) {
                    render_element(child_ref, out);
                }
            }
            _ => {}
        }
    }
}

fn inline_text(element: ElementRef) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn open_block(out: &mut String) {
    while out.ends_with(' ') {
        out.pop();
    }
    if !out.is_empty() && !out.ends_with("\n\n") {
        while out.ends_with('\n') {
            out.pop();
        }
        out.push_str("\n\n");
    }
}

fn render_element(element: ElementRef, out: &mut String) {
    let name = element.value().name();
    match name {
        "script" | "style" | "noscript" | "template" | "iframe" => {}
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = name[1..].parse::<usize>().unwrap_or(1);
            let text = inline_text(element);
            if !text.is_empty() {
                open_block(out);
                out.push_str(&"#".repeat(level));
                out.push(' ');
                out.push_str(&text);
                out.push_str("\n\n");
            }
        }
        "p" | "div" | "section" | "article" | "main" | "blockquote" | "table" | "tr" => {
            open_block(out);
            render_children(element, out);
            out.push_str("\n\n");
        }
        "ul" | "ol" => {
            open_block(out);
            render_children(element, out);
            out.push_str("\n\n");
        }
        "li" => {
            while out.ends_with(' ') {
                out.pop();
            }
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("- ");
            render_children(element, out);
            out.push('\n');
        }
        "a" => {
            let text = inline_text(element);
            if text.is_empty() {
                return;
            }
            if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                out.push(' ');
            }
            match element.value().attr("href") {
                Some(href) if !href.starts_with('#') => {
                    out.push_str(&format!("[{text}]({href})"));
                }
                _ => out.push_str(&text),
            }
        }
        "strong" | "b" => {
            let text = inline_text(element);
            if !text.is_empty() {
                if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                    out.push(' ');
                }
                out.push_str(&format!("**{text}**"));
            }
        }
        "em" | "i" => {
            let text = inline_text(element);
            if !text.is_empty() {
                if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                    out.push(' ');
                }
                out.push_str(&format!("*{text}*"));
            }
        }
        "code" => {
            let text = inline_text(element);
            if !text.is_empty() {
                if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                    out.push(' ');
                }
                out.push_str(&format!("`{text}`"));
            }
        }
        "pre" => {
            let text = element.text().collect::<String>();
            open_block(out);
            out.push_str("```\n");
            out.push_str(text.trim_matches('\n'));
            out.push_str("\n```\n\n");
        }
        "br" => out.push('\n'),
        _ => render_children(element, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::envelope::PageContent;
    use crate::storage::{MemoryDocumentStore, NewDocument};

    fn envelope_with(mimetype: &str, body: &str) -> PageEnvelope {
        let mut envelope = PageEnvelope::seed("https://example.com/doc", "demo");
        envelope.mimetype = Some(mimetype.to_string());
        envelope.content = Some(PageContent::Text(body.to_string()));
        envelope.content_hash = Some(crate::utils::hash::content_hash(body.as_bytes()));
        envelope
    }

    fn handler(store: Arc<dyn DocumentStore>) -> CleanHandler {
        CleanHandler::new(default_strategies(), store, "clean-worker-0".to_string())
    }

    #[test]
    fn headings_and_lists_convert() {
        let markdown = html_to_markdown(
            "<html><body>\
             <h1>Title</h1>\
             <p>Intro with <strong>bold</strong> text.</p>\
             <ul><li>first</li><li>second</li></ul>\
             <script>alert(1)</script>\
             </body></html>",
        );
        assert!(markdown.starts_with("# Title"));
        assert!(markdown.contains("Intro with **bold** text."));
        assert!(markdown.contains("- first"));
        assert!(markdown.contains("- second"));
        assert!(!markdown.contains("alert"));
    }

    #[test]
    fn links_become_markdown_links() {
        let markdown = html_to_markdown(r#"<body><p>See <a href="/docs">the docs</a>.</p></body>"#);
        assert!(markdown.contains("[the docs](/docs)"));
    }

    #[test]
    fn code_blocks_are_fenced() {
        let markdown = html_to_markdown("<body><pre>let x = 1;</pre></body>");
        assert!(markdown.contains("```\nlet x = 1;\n```"));
    }

    #[tokio::test]
    async fn html_envelope_gains_clean_content() {
        let store = Arc::new(MemoryDocumentStore::new());
        let handler = handler(store);

        let output = handler
            .process(envelope_with(
                "text/html",
                "<html><body><h1>Doc</h1><p>Body text.</p></body></html>",
            ))
            .await
            .unwrap()
            .expect("cleaned envelope should forward");

        let clean = output.clean_content.unwrap();
        assert!(clean.contains("# Doc"));
        assert!(clean.contains("Body text."));
        // Upstream fields survive verbatim.
        assert_eq!(output.url, "https://example.com/doc");
        assert!(output.content.is_some());
    }

    #[tokio::test]
    async fn markdown_and_plaintext_pass_through() {
        let store = Arc::new(MemoryDocumentStore::new());
        let handler = handler(store);

        let output = handler
            .process(envelope_with("text/markdown", "# Already markdown"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.clean_content.as_deref(), Some("# Already markdown"));

        let output = handler
            .process(envelope_with("text/plain", "just words"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.clean_content.as_deref(), Some("just words"));
    }

    #[tokio::test]
    async fn unknown_mimetype_is_permanent() {
        let store = Arc::new(MemoryDocumentStore::new());
        let handler = handler(store);

        let err = handler
            .process(envelope_with("application/pdf", "%PDF-1.4"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Permanent(_)));
    }

    #[tokio::test]
    async fn known_hash_skips_conversion() {
        let store = Arc::new(MemoryDocumentStore::new());
        let envelope = envelope_with("text/html", "<body><p>cached</p></body>");
        let hash = envelope.content_hash.clone().unwrap();

        store
            .insert_version(NewDocument {
                url: envelope.url.clone(),
                site_id: "demo".to_string(),
                content_hash: hash,
                clean_content: "previously cleaned".to_string(),
                title: None,
                mimetype: Some("text/html".to_string()),
                version: 1,
            })
            .await
            .unwrap();

        let handler = handler(store);
        let output = handler.process(envelope).await.unwrap().unwrap();
        assert_eq!(output.clean_content.as_deref(), Some("previously cleaned"));
    }

    #[tokio::test]
    async fn missing_content_is_permanent() {
        let store = Arc::new(MemoryDocumentStore::new());
        let handler = handler(store);
        let mut envelope = PageEnvelope::seed("https://example.com/empty", "demo");
        envelope.mimetype = Some("text/html".to_string());

        let err = handler.process(envelope).await.unwrap_err();
        assert!(matches!(err, HandlerError::Permanent(_)));
    }
}
