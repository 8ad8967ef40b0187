//! # Error Taxonomy
//!
//! Every failure the relay core can observe. None of these is fatal to the
//! process: callers log them, drop the affected unit of work and continue.

#[cfg(feature = "ingestors")]
use std::time::Duration;
use thiserror::Error;

/// A compressed sub-document could not be turned back into JSON.
#[cfg(feature = "codec")]
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload was not valid standard base64.
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    /// The decoded bytes were not a valid raw deflate stream.
    #[error("corrupt deflate stream: {0}")]
    Inflate(#[source] std::io::Error),
    /// The inflated bytes were not UTF-8 text.
    #[error("inflated payload is not utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    /// The inflated text was not a JSON document.
    #[error("inflated payload is not json: {0}")]
    Json(#[from] serde_json::Error),
    /// The compressed topic carried something other than a string.
    #[error("compressed topic '{0}' does not carry a string payload")]
    NotAString(String),
}

/// Failure of the generic HTTP client in [`crate::retrieve`].
#[cfg(feature = "retrieve")]
#[derive(Debug, Error)]
pub enum RetrieveError {
    /// The endpoint URL could not be built.
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    /// The request did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,
    /// Transport-level failure (connect, TLS, middleware).
    #[error("transport error: {0}")]
    Transport(#[source] reqwest_middleware::Error),
    /// Client construction failed, or the response body could not be read or deserialized.
    #[error("http client error: {0}")]
    Http(#[source] reqwest::Error),
}

#[cfg(feature = "retrieve")]
impl From<reqwest_middleware::Error> for RetrieveError {
    fn from(err: reqwest_middleware::Error) -> Self {
        match &err {
            reqwest_middleware::Error::Reqwest(inner) if inner.is_timeout() => RetrieveError::Timeout,
            _ => RetrieveError::Transport(err),
        }
    }
}

#[cfg(feature = "retrieve")]
impl From<reqwest::Error> for RetrieveError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RetrieveError::Timeout
        } else {
            RetrieveError::Http(err)
        }
    }
}

/// The handshake with the upstream hub did not yield a usable session.
///
/// Surfaces to operators as "no live session currently available".
#[cfg(feature = "ingestors")]
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The negotiate endpoint could not be built from the configured base URL.
    #[error("invalid negotiate endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    /// The upstream URL uses a scheme with no websocket counterpart.
    #[error("unsupported upstream scheme '{0}' (expected http or https)")]
    UnsupportedScheme(String),
    /// The handshake request exceeded its time budget.
    #[error("negotiation timed out after {0:?}")]
    Timeout(Duration),
    /// The handshake request failed before a response was read.
    #[error("negotiation request failed: {0}")]
    Request(#[source] RetrieveError),
    /// The upstream answered with a non-success status.
    #[error("negotiation returned status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw error body, when one was readable.
        body: Option<String>,
    },
    /// The response carried no session cookie.
    #[error("negotiation response carried no session cookie")]
    MissingCookie,
    /// The response body carried no connection token.
    #[error("negotiation response carried no connection token")]
    MissingToken,
}

/// A single inbound upstream frame could not be interpreted.
#[cfg(feature = "ingestors")]
#[derive(Debug, Error)]
pub enum FrameParseError {
    /// The frame text was not JSON.
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame was JSON but a record inside it had an unusable shape.
    #[error("frame has an invalid shape: {0}")]
    Shape(String),
    /// A compressed sub-document inside the frame failed to decode.
    #[error("compressed payload for '{topic}' failed to decode: {source}")]
    Decode {
        /// Topic name as it appeared on the wire.
        topic: String,
        /// Underlying decode failure.
        #[source]
        source: DecodeError,
    },
}

/// The upstream transport is gone; the supervisor will reconnect.
#[cfg(feature = "ingestors")]
#[derive(Debug, Error)]
pub enum ConnectionLost {
    /// The streaming URL or its request headers could not be built.
    #[error("could not build streaming request: {0}")]
    Request(String),
    /// The websocket handshake failed.
    #[error("websocket connect failed: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),
    /// The subscription frame could not be sent.
    #[error("subscription send failed: {0}")]
    Subscribe(#[source] tokio_tungstenite::tungstenite::Error),
    /// The transport reported an error while reading.
    #[error("websocket read error: {0}")]
    Transport(#[source] tokio_tungstenite::tungstenite::Error),
    /// The remote end closed the stream.
    #[error("stream closed by remote host")]
    Closed,
    /// Nothing arrived from upstream for longer than the inactivity timeout.
    #[error("no upstream activity for {0:?}")]
    Inactive(Duration),
}
