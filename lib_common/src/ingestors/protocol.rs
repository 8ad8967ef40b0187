//! # Upstream Frame Protocol
//!
//! The live timing hub speaks a small JSON envelope over websocket text frames:
//!
//! - outbound, once after connect: `{"H": hub, "M": "Subscribe", "A": [[topics...]], "I": 1}`
//! - inbound snapshot (reply to the subscription): `{"R": {topic: value, ...}, "I": "1"}`
//! - inbound feed batch: `{"M": [{"M": "feed", "A": {"field": topic, "value": value}}, ...]}`
//!
//! Feed arguments also come in the positional form `"A": [topic, value, timestamp]`.
//!
//! [`parse_frame`] turns one frame into the [`UpdateEvent`]s it carries. It
//! decodes compressed `*.z` topics and renames them to their base topic. It
//! either succeeds for the whole frame or fails without producing anything, so
//! a bad record never leaves a partial merge behind.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::codec::subdoc::{base_topic, decode_topic_value};
use crate::core::state::UpdateEvent;
use crate::error::FrameParseError;

/// Hub method used to subscribe to topics.
pub const SUBSCRIBE_METHOD: &str = "Subscribe";
/// Hub method carrying an incremental topic update.
pub const FEED_METHOD: &str = "feed";
/// Invocation id of our subscription.
pub const SUBSCRIBE_INVOCATION_ID: u32 = 1;
/// The same id as the hub echoes it back on the snapshot reply.
const SUBSCRIBE_REPLY_ID: &str = "1";

/// Topics subscribed to when none are configured.
pub const DEFAULT_TOPICS: [&str; 16] = [
    "Heartbeat",
    "CarData.z",
    "Position.z",
    "ExtrapolatedClock",
    "TopThree",
    "RcmSeries",
    "TimingStats",
    "TimingAppData",
    "WeatherData",
    "TrackStatus",
    "DriverList",
    "RaceControlMessages",
    "SessionInfo",
    "SessionData",
    "LapCount",
    "TimingData",
];

/// The owned default topic list.
pub fn default_topics() -> Vec<String> {
    DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect()
}

/// Serializes the subscription request for `topics` on `hub`.
pub fn subscribe_frame(hub: &str, topics: &[String]) -> String {
    json!({
        "H": hub,
        "M": SUBSCRIBE_METHOD,
        "A": [topics],
        "I": SUBSCRIBE_INVOCATION_ID,
    })
    .to_string()
}

/// Arguments of a `feed` invocation.
#[derive(Deserialize)]
#[serde(untagged)]
enum FeedArgs {
    Named { field: String, value: Value },
    Positional(Vec<Value>),
}

impl FeedArgs {
    fn into_parts(self) -> Result<(String, Value), FrameParseError> {
        match self {
            FeedArgs::Named { field, value } => Ok((field, value)),
            FeedArgs::Positional(args) => {
                let mut args = args.into_iter();
                match (args.next(), args.next()) {
                    (Some(Value::String(field)), Some(value)) => Ok((field, value)),
                    _ => Err(FrameParseError::Shape(
                        "positional feed arguments must start with [topic, value]".to_string(),
                    )),
                }
            }
        }
    }
}

/// Resolves a wire topic to its base name, decoding the value when compressed.
fn resolve_topic(topic: String, value: Value) -> Result<(String, Value), FrameParseError> {
    match base_topic(&topic) {
        Some(base) => {
            let decoded = decode_topic_value(&topic, &value)
                .map_err(|source| FrameParseError::Decode { topic: topic.clone(), source })?;
            Ok((base.to_string(), decoded))
        }
        None => Ok((topic, value)),
    }
}

fn parse_feed_batch(records: Vec<Value>) -> Result<Vec<UpdateEvent>, FrameParseError> {
    let mut events = Vec::with_capacity(records.len());

    for record in records {
        let Value::Object(mut record) = record else {
            continue;
        };
        if record.get("M").and_then(Value::as_str) != Some(FEED_METHOD) {
            continue;
        }

        let args = record
            .remove("A")
            .ok_or_else(|| FrameParseError::Shape("feed record without arguments".to_string()))?;
        let args: FeedArgs = serde_json::from_value(args)
            .map_err(|e| FrameParseError::Shape(format!("unusable feed arguments: {e}")))?;
        let (field, value) = args.into_parts()?;
        let (topic, value) = resolve_topic(field, value)?;
        events.push(UpdateEvent::Feed { topic, value });
    }

    Ok(events)
}

fn parse_snapshot(result: Map<String, Value>) -> Result<UpdateEvent, FrameParseError> {
    let (compressed, plain): (Vec<_>, Vec<_>) = result
        .into_iter()
        .partition(|(topic, _)| base_topic(topic).is_some());

    // Decoded variants are inserted last so they win over a plain duplicate.
    // The event then counts one unit per resulting topic, so a `CarData` +
    // `CarData.z` pair counts once.
    let mut values = Map::new();
    for (topic, value) in plain.into_iter().chain(compressed) {
        let (topic, value) = resolve_topic(topic, value)?;
        values.insert(topic, value);
    }
    Ok(UpdateEvent::Snapshot { values })
}

fn is_subscription_reply(invocation: Option<&Value>) -> bool {
    invocation.and_then(Value::as_str) == Some(SUBSCRIBE_REPLY_ID)
}

/// Parses one inbound text frame.
///
/// Frames that are valid JSON but neither shape (keep-alives, empty batches,
/// other invocations) produce no events and no error.
///
/// # Errors
/// [`FrameParseError`] when the text is not JSON, a feed record is unusable, or
/// a compressed payload fails to decode. No events are returned in that case.
pub fn parse_frame(text: &str) -> Result<Vec<UpdateEvent>, FrameParseError> {
    let Value::Object(mut frame) = serde_json::from_str::<Value>(text)? else {
        return Ok(Vec::new());
    };

    if let Some(Value::Array(records)) = frame.remove("M") {
        return parse_feed_batch(records);
    }

    if is_subscription_reply(frame.get("I")) {
        if let Some(Value::Object(result)) = frame.remove("R") {
            if !result.is_empty() {
                return Ok(vec![parse_snapshot(result)?]);
            }
        }
    }

    Ok(Vec::new())
}
