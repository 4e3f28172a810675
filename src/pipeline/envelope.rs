use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Body of a fetched page as it travels through the queues.
///
/// Text content is carried verbatim; binary content is base64-encoded so the
/// envelope stays valid JSON inside the queue backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PageContent {
    Text(String),
    Binary { b64: String },
}

impl PageContent {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => PageContent::Text(text.to_string()),
            Err(_) => PageContent::Binary {
                b64: STANDARD.encode(bytes),
            },
        }
    }

    /// Decoded bytes of the content.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            PageContent::Text(text) => text.as_bytes().to_vec(),
            PageContent::Binary { b64 } => STANDARD.decode(b64).unwrap_or_default(),
        }
    }

    /// The content as text, when it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PageContent::Text(text) => Some(text),
            PageContent::Binary { .. } => None,
        }
    }
}

/// Page metadata extracted by the fetcher from the document head and body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub og_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub og_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub og_image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub h1: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub h2: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageRef>,
}

impl PageMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.keywords.is_none()
            && self.og_title.is_none()
            && self.og_description.is_none()
            && self.og_image.is_none()
            && self.h1.is_empty()
            && self.h2.is_empty()
            && self.images.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRef {
    pub src: String,
    #[serde(default)]
    pub alt: String,
}

/// Index operation decided by the persister and honoured by the indexer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndexOperation {
    New,
    Edit,
    Delete,
}

/// The append-only record that flows through every pipeline stage.
///
/// Each stage may add fields but never removes or rewrites earlier ones.
/// Fields set by an upstream stage must be preserved verbatim downstream;
/// unknown fields round-trip through `extra` so older envelopes survive
/// newer readers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageEnvelope {
    pub url: String,
    pub site_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawler_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawler_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawler_config: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<PageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,

    #[serde(default, skip_serializing_if = "PageMetadata::is_empty")]
    pub metadata: PageMetadata,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_operation: Option<IndexOperation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PageEnvelope {
    /// A fresh envelope carrying only identity fields, as seeded into the
    /// `url` queue.
    pub fn seed(url: impl Into<String>, site_id: impl Into<String>) -> Self {
        PageEnvelope {
            url: url.into(),
            site_id: site_id.into(),
            crawler_id: None,
            crawler_type: None,
            crawler_config: None,
            content: None,
            clean_content: None,
            mimetype: None,
            status_code: None,
            headers: HashMap::new(),
            links: Vec::new(),
            metadata: PageMetadata::default(),
            content_hash: None,
            version: None,
            index_operation: None,
            timestamp: None,
            created_at: Some(Utc::now()),
            updated_at: None,
            extra: serde_json::Map::new(),
        }
    }

    /// A deletion signal seeded directly at the persist stage. Carries an
    /// empty `clean_content` so the indexer can remove by key.
    pub fn delete_signal(url: impl Into<String>, site_id: impl Into<String>) -> Self {
        let mut envelope = Self::seed(url, site_id);
        envelope.index_operation = Some(IndexOperation::Delete);
        envelope.clean_content = Some(String::new());
        envelope
    }

    /// Hex digest the envelope carries, or the empty string.
    pub fn hash_or_empty(&self) -> &str {
        self.content_hash.as_deref().unwrap_or("")
    }
}
