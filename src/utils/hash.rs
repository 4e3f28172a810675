use sha2::{Digest, Sha256};

/// Stable hex digest of page content, used as the idempotency key between
/// the persist and index stages.
///
/// Text is normalized before hashing (lowercased, punctuation stripped,
/// whitespace collapsed) so cosmetic markup churn does not read as a content
/// change. Binary payloads are hashed as raw bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => content_hash_text(text),
        Err(_) => hex_digest(bytes),
    }
}

/// Digest of normalized text content.
pub fn content_hash_text(text: &str) -> String {
    let normalized = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    hex_digest(normalized.as_bytes())
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
