/// Mimetypes the cleaner dispatches on.
pub const HTML: &str = "text/html";
pub const MARKDOWN: &str = "text/markdown";
pub const PLAINTEXT: &str = "text/plain";
pub const PDF: &str = "application/pdf";
pub const DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Strip parameters from a Content-Type value ("text/html; charset=utf-8"
/// becomes "text/html").
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase()
}

/// Resolve a mimetype from the response Content-Type header, falling back to
/// the URL's file extension.
pub fn resolve(content_type: Option<&str>, url: &str) -> String {
    if let Some(value) = content_type {
        let essence = essence(value);
        if !essence.is_empty() {
            return essence;
        }
    }
    from_extension(url)
}

fn from_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let extension = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match extension.as_str() {
        "md" | "markdown" => MARKDOWN.to_string(),
        "txt" => PLAINTEXT.to_string(),
        "pdf" => PDF.to_string(),
        "docx" => DOCX.to_string(),
        _ => HTML.to_string(),
    }
}

pub fn is_html(mimetype: &str) -> bool {
    matches!(essence(mimetype).as_str(), "text/html" | "application/xhtml+xml")
}
