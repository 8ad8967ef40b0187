//! # lib_common
//!
//! Shared library for the live timing relay. Each folder is a concern and is
//! compiled in only when its cargo feature is enabled:
//!
//! - **`codec`**: decoding of compressed sub-documents carried by `*.z` topics.
//! - **`core`**: the state merger, the consolidated state store, the subscriber
//!   registry and the fixed-cadence broadcast scheduler.
//! - **`retrieve`**: a generic HTTP client with retry middleware and a bounded timeout.
//! - **`ingestors`**: session negotiation, the upstream frame protocol and the
//!   streaming reader that feeds the state store.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

#[cfg(any(feature = "codec", feature = "retrieve"))]
pub mod error;

#[cfg(feature = "codec")]
pub mod codec;

#[cfg(feature = "core")]
pub mod core;

#[cfg(feature = "retrieve")]
pub mod retrieve;

#[cfg(feature = "ingestors")]
pub mod ingestors;
