//! # Compressed Sub-document Decoder
//!
//! A few upstream topics (`CarData.z`, `Position.z`) are too large to ship as
//! plain JSON. Their value is a base64 string whose bytes are a raw deflate
//! stream (no zlib or gzip header) of UTF-8 JSON text.
//!
//! Decoding is bounded work with no I/O, so it is safe to call inline from the
//! frame handler.

use std::io::Read;

use base64::{engine::general_purpose, Engine as _};
use flate2::read::DeflateDecoder;
use serde_json::Value;

use crate::error::DecodeError;

/// Suffix that marks a topic name as the compressed variant of a base topic.
pub const COMPRESSED_SUFFIX: &str = ".z";

/// Returns the base topic name if `topic` is a compressed variant.
///
/// `"CarData.z"` yields `Some("CarData")`; `"TimingData"` yields `None`. A bare
/// `".z"` is not treated as compressed since it has no base name.
pub fn base_topic(topic: &str) -> Option<&str> {
    topic
        .strip_suffix(COMPRESSED_SUFFIX)
        .filter(|base| !base.is_empty())
}

/// Decodes a base64-encoded, raw-deflate-compressed JSON document.
///
/// # Errors
/// One [`DecodeError`] variant per stage: base64, inflate, UTF-8, JSON.
pub fn decode_compressed(payload: &str) -> Result<Value, DecodeError> {
    let compressed = general_purpose::STANDARD.decode(payload.trim())?;

    let mut inflated = Vec::with_capacity(compressed.len() * 4);
    DeflateDecoder::new(compressed.as_slice())
        .read_to_end(&mut inflated)
        .map_err(DecodeError::Inflate)?;

    let text = String::from_utf8(inflated)?;
    Ok(serde_json::from_str(&text)?)
}

/// Decodes the value of a compressed topic, which must be a JSON string.
pub fn decode_topic_value(topic: &str, value: &Value) -> Result<Value, DecodeError> {
    match value {
        Value::String(payload) => decode_compressed(payload),
        _ => Err(DecodeError::NotAString(topic.to_string())),
    }
}
