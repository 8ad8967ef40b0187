//! # Codec Module
//!
//! Stateless decoders for payloads that arrive wrapped inside upstream frames.
//!
//! ## Contained Modules:
//! - **`subdoc`**: turns a base64 + raw-deflate compressed topic value back into
//!   a plain JSON value, and knows the `.z` naming convention of compressed topics.

/// Decoder for compressed sub-documents carried by `*.z` topics.
pub mod subdoc;

pub use subdoc::{base_topic, decode_compressed, COMPRESSED_SUFFIX};
