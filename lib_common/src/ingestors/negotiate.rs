//! # Upstream Session Negotiator
//!
//! Before the hub accepts a websocket it wants an HTTP handshake:
//! `GET {base}/negotiate?connectionData=[{"name":hub}]&clientProtocol=1.5`.
//! A usable answer carries a session cookie (`Set-Cookie`) and a
//! `ConnectionToken` in its JSON body; both are needed to open the stream.
//!
//! A failed handshake means "no live session right now". The negotiator never
//! retries on its own; the ingestor's reconnect loop decides when to try again.

use std::time::Duration;

use reqwest::header::{HeaderMap, SET_COOKIE};
use reqwest::{Method, Url};
use serde_json::{json, Value};

use crate::error::{NegotiationError, RetrieveError};
use crate::retrieve::ky_http::{ApiClient, ApiClientOptions};

/// Default upstream hub endpoint.
pub const DEFAULT_UPSTREAM_URL: &str = "https://livetiming.formula1.com/signalr";
/// Default hub name.
pub const DEFAULT_HUB: &str = "Streaming";
/// Protocol version announced during negotiation and connect.
pub const DEFAULT_CLIENT_PROTOCOL: &str = "1.5";

/// Where and how to negotiate.
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Base URL of the hub, e.g. `https://host/signalr`.
    pub base_url: String,
    /// Logical channel (hub) name.
    pub hub: String,
    /// Protocol version string.
    pub client_protocol: String,
    /// Upper bound for the handshake request.
    pub timeout: Duration,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_UPSTREAM_URL.to_string(),
            hub: DEFAULT_HUB.to_string(),
            client_protocol: DEFAULT_CLIENT_PROTOCOL.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Everything needed to open the streaming connection.
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque token issued by the hub.
    pub connection_token: String,
    /// `Cookie` header value built from the `Set-Cookie` response headers.
    pub cookie: String,
    /// Fully-built `ws(s)://.../connect?...` URL.
    pub stream_url: Url,
}

pub struct Negotiator {
    client: ApiClient,
    config: NegotiatorConfig,
}

impl Negotiator {
    /// Builds a negotiator for `config`.
    ///
    /// # Errors
    /// [`NegotiationError::Endpoint`] if the base URL is not absolute.
    pub fn new(config: NegotiatorConfig) -> Result<Self, NegotiationError> {
        let options = ApiClientOptions {
            timeout: config.timeout,
            max_retries: 0,
        };
        let client = ApiClient::new(&config.base_url, options).map_err(|e| match e {
            RetrieveError::Url(parse) => NegotiationError::Endpoint(parse),
            other => NegotiationError::Request(other),
        })?;
        Ok(Self { client, config })
    }

    /// The hub this negotiator targets.
    pub fn hub(&self) -> &str {
        &self.config.hub
    }

    /// JSON `connectionData` parameter naming the hub.
    pub fn connection_data(&self) -> String {
        json!([{ "name": self.config.hub }]).to_string()
    }

    /// Performs the handshake.
    ///
    /// # Errors
    /// See [`NegotiationError`]: transport failure, timeout, non-2xx status, or
    /// a response missing the cookie or the token.
    pub async fn negotiate(&self) -> Result<Session, NegotiationError> {
        let connection_data = self.connection_data();
        let url = self
            .client
            .endpoint(
                "negotiate",
                &[
                    ("connectionData", connection_data.as_str()),
                    ("clientProtocol", self.config.client_protocol.as_str()),
                ],
            )
            .map_err(NegotiationError::Request)?;

        log::debug!("Negotiating session: {}", url);
        let response = self
            .client
            .request::<Value>(Method::GET, url, None)
            .await
            .map_err(|e| match e {
                RetrieveError::Timeout => NegotiationError::Timeout(self.config.timeout),
                other => NegotiationError::Request(other),
            })?;

        if !response.success {
            return Err(NegotiationError::Status {
                status: response.status,
                body: response.error_body,
            });
        }

        let cookie = session_cookie(&response.headers).ok_or(NegotiationError::MissingCookie)?;
        let connection_token = response
            .data
            .as_ref()
            .and_then(|body| body.get("ConnectionToken"))
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .ok_or(NegotiationError::MissingToken)?
            .to_string();

        let stream_url = self.stream_url(&connection_token, &connection_data)?;
        Ok(Session {
            connection_token,
            cookie,
            stream_url,
        })
    }

    fn stream_url(&self, token: &str, connection_data: &str) -> Result<Url, NegotiationError> {
        let mut url = self.client.base_url().join("connect")?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(NegotiationError::UnsupportedScheme(other.to_string())),
        };
        url.set_scheme(scheme)
            .map_err(|_| NegotiationError::UnsupportedScheme(url.scheme().to_string()))?;

        url.query_pairs_mut()
            .append_pair("clientProtocol", &self.config.client_protocol)
            .append_pair("transport", "webSockets")
            .append_pair("connectionToken", token)
            .append_pair("connectionData", connection_data);
        Ok(url)
    }
}

/// Folds every `Set-Cookie` header into one `Cookie` header value.
///
/// Only the leading `name=value` pair of each header is kept; attributes such
/// as `Path` or `HttpOnly` are for the cookie jar, not for the server.
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let pairs: Vec<&str> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .map(str::trim)
        .filter(|pair| pair.contains('='))
        .collect();

    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn cookie_keeps_name_value_pairs_only() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("GCLB=abc123; path=/; HttpOnly"));
        headers.append(SET_COOKIE, HeaderValue::from_static("ARRAffinity=zz; Secure"));
        assert_eq!(session_cookie(&headers).unwrap(), "GCLB=abc123; ARRAffinity=zz");
    }

    #[test]
    fn no_cookie_headers_means_none() {
        assert!(session_cookie(&HeaderMap::new()).is_none());
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("; path=/"));
        assert!(session_cookie(&headers).is_none());
    }

    #[test]
    fn stream_url_switches_scheme_and_carries_token() {
        let negotiator = Negotiator::new(NegotiatorConfig::default()).unwrap();
        let url = negotiator.stream_url("tok/en+=", &negotiator.connection_data()).unwrap();

        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/signalr/connect");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("transport".into(), "webSockets".into())));
        assert!(pairs.contains(&("connectionToken".into(), "tok/en+=".into())));
        assert!(pairs.contains(&("connectionData".into(), r#"[{"name":"Streaming"}]"#.into())));
        assert!(pairs.contains(&("clientProtocol".into(), "1.5".into())));
    }

    #[test]
    fn plain_http_maps_to_ws() {
        let config = NegotiatorConfig {
            base_url: "http://127.0.0.1:9/signalr".into(),
            ..NegotiatorConfig::default()
        };
        let negotiator = Negotiator::new(config).unwrap();
        let url = negotiator.stream_url("t", "[]").unwrap();
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn relative_base_is_an_endpoint_error() {
        let config = NegotiatorConfig {
            base_url: "livetiming/signalr".into(),
            ..NegotiatorConfig::default()
        };
        assert!(matches!(Negotiator::new(config), Err(NegotiationError::Endpoint(_))));
    }
}
