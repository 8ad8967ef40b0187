//! # Data Retrieval Module
//!
//! Generic HTTP clients and utilities used by the ingestors.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: an `ApiClient` built on `reqwest` and `reqwest-middleware`
//!   with optional transient-error retries, a hard per-request timeout and
//!   response metadata (status, headers) kept alongside the decoded body.

/// Generic HTTP API client with retry middleware for resilient network requests.
pub mod ky_http;
