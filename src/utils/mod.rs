pub mod hash;
pub mod logging;
pub mod mime;

// Re-export common functions
pub use hash::{content_hash, content_hash_text};
pub use logging::init_logging;
