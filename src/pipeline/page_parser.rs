use scraper::{Html, Selector};
use url::Url;

use super::envelope::{ImageRef, PageMetadata};

/// Links and metadata the fetcher lifts out of an HTML document.
#[derive(Debug, Clone, Default)]
pub struct ExtractedPage {
    pub metadata: PageMetadata,
    pub links: Vec<String>,
}

/// Parse an HTML document and extract page metadata and absolute links.
///
/// Parsing is synchronous and self-contained: the parsed DOM never crosses
/// an await point.
pub fn parse_page(html: &str, base_url: &Url) -> ExtractedPage {
    let document = Html::parse_document(html);

    let metadata = PageMetadata {
        title: select_text(&document, "title"),
        description: select_meta(&document, "meta[name='description']"),
        keywords: select_meta(&document, "meta[name='keywords']"),
        og_title: select_meta(&document, "meta[property='og:title']"),
        og_description: select_meta(&document, "meta[property='og:description']"),
        og_image: select_meta(&document, "meta[property='og:image']"),
        h1: select_all_text(&document, "h1"),
        h2: select_all_text(&document, "h2"),
        images: extract_images(&document, base_url),
    };

    ExtractedPage {
        metadata,
        links: extract_links(&document, base_url),
    }
}

fn select_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn select_all_text(document: &Html, selector: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse(selector) else {
        return Vec::new();
    };
    document
        .select(&selector)
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn select_meta(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|element| element.value().attr("content"))
        .map(|content| content.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn extract_images(document: &Html, base_url: &Url) -> Vec<ImageRef> {
    let Ok(selector) = Selector::parse("img[src]") else {
        return Vec::new();
    };
    document
        .select(&selector)
        .filter_map(|element| {
            let src = element.value().attr("src")?;
            let absolute = base_url.join(src.trim()).ok()?;
            Some(ImageRef {
                src: absolute.to_string(),
                alt: element.value().attr("alt").unwrap_or("").to_string(),
            })
        })
        .collect()
}

fn extract_links(document: &Html, base_url: &Url) -> Vec<String> {
    let mut links = Vec::new();

    if let Ok(selector) = Selector::parse("a[href]") {
        for element in document.select(&selector) {
            if element.value().attr("download").is_some() {
                continue;
            }
            if let Some(href) = element.value().attr("href") {
                if let Some(absolute) = resolve_link(href, base_url) {
                    links.push(absolute);
                }
            }
        }
    }

    if let Ok(selector) = Selector::parse("link[rel='canonical'][href]") {
        for element in document.select(&selector) {
            if let Some(href) = element.value().attr("href") {
                if let Some(absolute) = resolve_link(href, base_url) {
                    links.push(absolute);
                }
            }
        }
    }

    links
}

/// Resolve an href to an absolute http(s) URL, dropping non-navigational
/// schemes and same-page anchors.
fn resolve_link(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    if href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
    {
        return None;
    }

    match base_url.join(href) {
        Ok(absolute) if absolute.scheme() == "http" || absolute.scheme() == "https" => {
            Some(absolute.to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"<html>
        <head>
            <title>Release Notes</title>
            <meta name="description" content="What changed in 2.0">
            <meta name="keywords" content="release, notes">
            <meta property="og:title" content="Release Notes 2.0">
            <link rel="canonical" href="https://example.com/releases/2.0">
        </head>
        <body>
            <h1>Version 2.0</h1>
            <h2>Breaking changes</h2>
            <h2>Fixes</h2>
            <a href="/releases/1.0">previous</a>
            <a href="https://example.com/download" download>installer</a>
            <a href="mailto:team@example.com">contact</a>
            <a href="#fixes">jump</a>
            <img src="/img/banner.png" alt="banner">
        </body>
    </html>"##;

    #[test]
    fn extracts_metadata_fields() {
        let base = Url::parse("https://example.com/releases/2.0").unwrap();
        let page = parse_page(SAMPLE, &base);

        assert_eq!(page.metadata.title.as_deref(), Some("Release Notes"));
        assert_eq!(
            page.metadata.description.as_deref(),
            Some("What changed in 2.0")
        );
        assert_eq!(page.metadata.og_title.as_deref(), Some("Release Notes 2.0"));
        assert_eq!(page.metadata.h1, vec!["Version 2.0"]);
        assert_eq!(page.metadata.h2, vec!["Breaking changes", "Fixes"]);
        assert_eq!(page.metadata.images.len(), 1);
        assert_eq!(
            page.metadata.images[0].src,
            "https://example.com/img/banner.png"
        );
    }

    #[test]
    fn extracts_only_navigational_links() {
        let base = Url::parse("https://example.com/releases/2.0").unwrap();
        let page = parse_page(SAMPLE, &base);

        assert_eq!(
            page.links,
            vec![
                "https://example.com/releases/1.0".to_string(),
                "https://example.com/releases/2.0".to_string(),
            ]
        );
    }

    #[test]
    fn relative_links_resolve_against_base() {
        let base = Url::parse("https://example.com/docs/guide/").unwrap();
        let page = parse_page(r#"<a href="../intro">intro</a>"#, &base);
        assert_eq!(page.links, vec!["https://example.com/docs/intro".to_string()]);
    }
}
