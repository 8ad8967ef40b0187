//! # Data Ingestors Module
//!
//! Everything that talks to the upstream live timing hub.
//!
//! ## Contained Modules:
//! - **`negotiate`**: the HTTP handshake that yields a connection token and a
//!   session cookie.
//! - **`protocol`**: the hub's JSON frame envelope; builds the subscription
//!   frame and turns inbound frames into update events.
//! - **`livetiming_wss`**: the resilient websocket reader that owns the state
//!   writer and reconnects with backoff.

/// Session handshake with the upstream hub.
pub mod negotiate;
/// Upstream frame model and classification.
pub mod protocol;
/// The websocket reader and reconnect supervisor.
pub mod livetiming_wss;

// --- Public API Re-exports ---
pub use livetiming_wss::{process_frame, LiveTimingConfig, LiveTimingIngestor};
pub use negotiate::{Negotiator, NegotiatorConfig, Session};
pub use protocol::{default_topics, parse_frame, subscribe_frame, DEFAULT_TOPICS};
