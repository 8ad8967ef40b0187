//! # Live Timing WSS Ingestor
//!
//! Owns the upstream websocket and the [`StateWriter`].
//!
//! One pass of the supervisor loop: negotiate, connect, reset state, subscribe,
//! then read frames until the link drops. Every inbound text frame goes through
//! [`process_frame`]; a frame that fails to parse is logged and dropped and the
//! loop carries on with the next one. After a lost link or a failed handshake
//! the loop sleeps with capped exponential backoff and starts over.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, ACCEPT_ENCODING, COOKIE, USER_AGENT};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use crate::core::backoff::Backoff;
use crate::core::state::{LinkState, StateWriter};
use crate::error::{ConnectionLost, FrameParseError, NegotiationError};
use crate::ingestors::negotiate::{Negotiator, NegotiatorConfig, Session};
use crate::ingestors::protocol::{default_topics, parse_frame, subscribe_frame};

/// Configuration for the live timing stream.
#[derive(Debug, Clone)]
pub struct LiveTimingConfig {
    pub negotiator: NegotiatorConfig,
    pub topics: Vec<String>,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Silence longer than this is treated as a dead link.
    pub inactivity_timeout: Duration,
}

impl Default for LiveTimingConfig {
    fn default() -> Self {
        Self {
            negotiator: NegotiatorConfig::default(),
            topics: default_topics(),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(60),
        }
    }
}

/// Parses one frame and merges everything it carries.
///
/// Returns the number of update units applied. On error nothing is merged.
pub fn process_frame(writer: &StateWriter, text: &str) -> Result<u64, FrameParseError> {
    let events = parse_frame(text)?;
    Ok(writer.apply(events))
}

/// Why a session ended without a shutdown request.
#[derive(Debug)]
enum SessionError {
    Negotiation(NegotiationError),
    Lost(ConnectionLost),
}

impl From<NegotiationError> for SessionError {
    fn from(err: NegotiationError) -> Self {
        SessionError::Negotiation(err)
    }
}

impl From<ConnectionLost> for SessionError {
    fn from(err: ConnectionLost) -> Self {
        SessionError::Lost(err)
    }
}

pub struct LiveTimingIngestor {
    config: LiveTimingConfig,
    negotiator: Negotiator,
    writer: StateWriter,
}

impl LiveTimingIngestor {
    /// Creates the ingestor. It does nothing until [`run`](Self::run) is awaited.
    pub fn new(config: LiveTimingConfig, writer: StateWriter) -> Result<Self, NegotiationError> {
        let negotiator = Negotiator::new(config.negotiator.clone())?;
        Ok(Self {
            config,
            negotiator,
            writer,
        })
    }

    /// Supervisor loop with reconnection. Returns only on shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = Backoff::new(self.config.reconnect_base_delay, self.config.reconnect_max_delay);

        loop {
            log::info!("connecting to live timing stream...");
            self.writer.set_link(LinkState::Negotiating);

            match self.session(&mut shutdown, &mut backoff).await {
                Ok(()) => break,
                Err(SessionError::Negotiation(e)) => {
                    log::warn!("negotiation failed. is there a live session? ({})", e);
                }
                Err(SessionError::Lost(e)) => {
                    log::warn!("upstream connection lost: {}", e);
                }
            }
            self.writer.set_link(LinkState::Disconnected);

            let delay = backoff.next_delay();
            log::info!("Reconnecting to upstream in {:?}", delay);
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = sleep(delay) => {}
            }
        }

        self.writer.set_link(LinkState::Disconnected);
        log::info!("Upstream ingestor stopped.");
    }

    /// One negotiate/connect/read cycle. `Ok(())` means shutdown was requested.
    async fn session(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
        backoff: &mut Backoff,
    ) -> Result<(), SessionError> {
        let session = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            session = self.negotiator.negotiate() => session?,
        };
        log::info!("negotiation complete");

        let request = stream_request(&session)?;
        let (ws_stream, _) = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            connected = connect_async(request) => connected.map_err(ConnectionLost::Connect)?,
        };
        log::info!("websocket open");

        self.writer.reset();
        let (mut write, mut read) = ws_stream.split();

        let subscribe = subscribe_frame(self.negotiator.hub(), &self.config.topics);
        write
            .send(Message::Text(subscribe.into()))
            .await
            .map_err(ConnectionLost::Subscribe)?;
        log::info!("Subscribed to {} topics on hub '{}'", self.config.topics.len(), self.negotiator.hub());
        self.writer.set_link(LinkState::Connected);

        let mut last_activity = Instant::now();
        let mut healthy = false;
        let mut watchdog = interval(Duration::from_secs(1));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("Upstream shutting down...");
                    let _ = write.close().await;
                    return Ok(());
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_activity = Instant::now();
                            let units = self.handle_text(text.as_str());
                            note_units(units, &mut healthy, backoff);
                        }
                        Some(Ok(Message::Binary(bin))) => {
                            last_activity = Instant::now();
                            let units = self.handle_binary(&bin);
                            note_units(units, &mut healthy, backoff);
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            last_activity = Instant::now();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            log::debug!("Close frame from upstream: {:?}", frame);
                            return Err(ConnectionLost::Closed.into());
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => return Err(ConnectionLost::Transport(e).into()),
                        None => return Err(ConnectionLost::Closed.into()),
                    }
                }
                _ = watchdog.tick() => {
                    if last_activity.elapsed() > self.config.inactivity_timeout {
                        let _ = write.close().await;
                        return Err(ConnectionLost::Inactive(self.config.inactivity_timeout).into());
                    }
                }
            }
        }
    }

    fn handle_binary(&self, bin: &[u8]) -> u64 {
        match std::str::from_utf8(bin) {
            Ok(text) => self.handle_text(text),
            Err(_) => {
                log::warn!("Dropping {} byte non-utf8 binary frame", bin.len());
                0
            }
        }
    }

    fn handle_text(&self, text: &str) -> u64 {
        match process_frame(&self.writer, text) {
            Ok(units) => {
                if units > 0 {
                    log::trace!("Merged {} update units", units);
                }
                units
            }
            Err(e) => {
                log::warn!("could not update data: {}", e);
                0
            }
        }
    }
}

/// The first units on a connection mark it healthy and reset the reconnect backoff.
fn note_units(units: u64, healthy: &mut bool, backoff: &mut Backoff) {
    if units > 0 && !*healthy {
        *healthy = true;
        backoff.reset();
    }
}

/// Builds the websocket upgrade request with the session cookie attached.
fn stream_request(session: &Session) -> Result<Request, ConnectionLost> {
    let mut request = session
        .stream_url
        .as_str()
        .into_client_request()
        .map_err(|e| ConnectionLost::Request(e.to_string()))?;

    let cookie = HeaderValue::from_str(&session.cookie).map_err(|e| ConnectionLost::Request(e.to_string()))?;
    let headers = request.headers_mut();
    headers.insert(USER_AGENT, HeaderValue::from_static("BestHTTP"));
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip,identity"));
    headers.insert(COOKIE, cookie);
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::state_store;
    use reqwest::Url;
    use serde_json::json;

    #[test]
    fn process_frame_counts_and_merges() {
        let (writer, reader) = state_store();
        let units = process_frame(
            &writer,
            r#"{"R":{"LapCount":{"CurrentLap":1,"TotalLaps":57},"TrackStatus":{"Status":"1"}},"I":"1"}"#,
        )
        .unwrap();
        assert_eq!(units, 2);

        let units = process_frame(&writer, r#"{"M":[{"M":"feed","A":{"field":"LapCount","value":{"CurrentLap":2}}}]}"#).unwrap();
        assert_eq!(units, 1);

        let snap = reader.current();
        assert_eq!(snap.updates, 3);
        assert_eq!(snap.tree["LapCount"], json!({"CurrentLap": 2, "TotalLaps": 57}));
    }

    #[test]
    fn failed_frame_merges_nothing() {
        let (writer, reader) = state_store();
        let bad = r#"{"M":[{"M":"feed","A":{"field":"LapCount","value":{"CurrentLap":5}}},{"M":"feed","A":{"field":"CarData.z","value":"%%"}}]}"#;
        assert!(process_frame(&writer, bad).is_err());

        let snap = reader.current();
        assert!(snap.tree.is_empty());
        assert_eq!(snap.updates, 0);
    }

    #[test]
    fn binary_frames_merge_like_text_frames() {
        let (writer, reader) = state_store();
        let ingestor = LiveTimingIngestor::new(LiveTimingConfig::default(), writer).unwrap();

        let frame = br#"{"M":[{"M":"feed","A":{"field":"TrackStatus","value":{"Status":"4"}}}]}"#;
        assert_eq!(ingestor.handle_binary(frame), 1);
        assert_eq!(ingestor.handle_binary(&[0xff, 0xfe, 0x00]), 0);

        let snap = reader.current();
        assert_eq!(snap.updates, 1);
        assert_eq!(snap.tree["TrackStatus"], json!({"Status": "4"}));
    }

    #[test]
    fn first_units_reset_backoff_once() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        let mut healthy = false;

        note_units(0, &mut healthy, &mut backoff);
        assert!(!healthy);
        assert_eq!(backoff.clone().next_delay(), Duration::from_secs(4));

        note_units(2, &mut healthy, &mut backoff);
        assert!(healthy);
        assert_eq!(backoff.clone().next_delay(), Duration::from_secs(1));

        backoff.next_delay();
        note_units(1, &mut healthy, &mut backoff);
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn stream_request_carries_headers() {
        let session = Session {
            connection_token: "t".into(),
            cookie: "GCLB=abc".into(),
            stream_url: Url::parse("wss://example.com/signalr/connect?transport=webSockets").unwrap(),
        };
        let request = stream_request(&session).unwrap();
        assert_eq!(request.headers()[USER_AGENT], "BestHTTP");
        assert_eq!(request.headers()[ACCEPT_ENCODING], "gzip,identity");
        assert_eq!(request.headers()[COOKIE], "GCLB=abc");
        assert_eq!(request.uri().host(), Some("example.com"));
    }

    #[test]
    fn cookie_with_newline_is_rejected() {
        let session = Session {
            connection_token: "t".into(),
            cookie: "a=b\nc".into(),
            stream_url: Url::parse("wss://example.com/signalr/connect").unwrap(),
        };
        assert!(matches!(stream_request(&session), Err(ConnectionLost::Request(_))));
    }

    #[tokio::test]
    async fn run_returns_promptly_on_shutdown() {
        let (writer, reader) = state_store();
        let config = LiveTimingConfig {
            negotiator: NegotiatorConfig {
                // Nothing listens on the discard port; negotiation fails fast and the loop backs off.
                base_url: "http://127.0.0.1:9/signalr".into(),
                timeout: Duration::from_millis(200),
                ..NegotiatorConfig::default()
            },
            reconnect_base_delay: Duration::from_secs(30),
            ..LiveTimingConfig::default()
        };
        let ingestor = LiveTimingIngestor::new(config, writer).unwrap();
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(ingestor.run(rx));

        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(reader.current().link, LinkState::Disconnected);
    }
}
