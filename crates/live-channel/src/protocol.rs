//! Wire protocol: JSON text frames of the form `{"event": <name>, "data": <value>}`.

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::types::{ForcedLogout, Outbound, ServerEvent, TopicUpdate};

// ---------------------------------------------------------------------------
// Event name constants
// ---------------------------------------------------------------------------

pub mod event {
    pub const FORCED_LOGOUT: &str = "forced_logout";
    pub const DATA_UPDATE: &str = "data_update";
    pub const BROADCAST_UPDATE: &str = "broadcast_update";
    /// Topic-scoped events are named `<topic>_update`.
    pub const TOPIC_UPDATE_SUFFIX: &str = "_update";
}

/// Default `type` for updates that do not carry one.
pub const DEFAULT_UPDATE_KIND: &str = "update";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UpdatePayload {
    topic: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    data: Option<serde_json::Value>,
    id: Option<String>,
    timestamp: Option<i64>,
}

#[derive(Serialize)]
struct OutboundUpdate<'a> {
    topic: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
}

// ---------------------------------------------------------------------------
// Encode / decode helpers
// ---------------------------------------------------------------------------

pub fn encode_frame(frame: &Outbound) -> Result<String, serde_json::Error> {
    let wire = match frame {
        Outbound::Broadcast(update) => WireFrame {
            event: event::BROADCAST_UPDATE.to_string(),
            data: serde_json::to_value(OutboundUpdate {
                topic: &update.topic,
                kind: &update.kind,
                data: &update.data,
                id: update.id.as_deref(),
                timestamp: update.timestamp,
            })?,
        },
        Outbound::Custom { name, data } => WireFrame {
            event: name.clone(),
            data: data.clone(),
        },
    };
    serde_json::to_string(&wire)
}

pub fn decode_frame(text: &str) -> Result<ServerEvent, serde_json::Error> {
    let frame: WireFrame = serde_json::from_str(text)?;
    classify(frame)
}

fn classify(frame: WireFrame) -> Result<ServerEvent, serde_json::Error> {
    match frame.event.as_str() {
        event::FORCED_LOGOUT => {
            let logout = if frame.data.is_null() {
                ForcedLogout::default()
            } else {
                serde_json::from_value(frame.data)?
            };
            Ok(ServerEvent::ForcedLogout(logout))
        }
        // Relays may echo other clients' broadcasts under their original name.
        event::DATA_UPDATE | event::BROADCAST_UPDATE => {
            let payload: UpdatePayload = serde_json::from_value(frame.data)?;
            let topic = payload
                .topic
                .clone()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| serde_json::Error::custom("cross-topic update without topic"))?;
            Ok(ServerEvent::DataUpdate(into_update(topic, payload)))
        }
        name => match name
            .strip_suffix(event::TOPIC_UPDATE_SUFFIX)
            .filter(|t| !t.is_empty())
        {
            Some(topic) => Ok(ServerEvent::TopicUpdate(topic_update(topic, frame.data)?)),
            None => Ok(ServerEvent::Custom {
                name: frame.event,
                data: frame.data,
            }),
        },
    }
}

/// A topic-scoped payload is either an envelope carrying `data` or the bare
/// snapshot itself.
fn topic_update(topic: &str, data: serde_json::Value) -> Result<TopicUpdate, serde_json::Error> {
    let is_envelope = data.as_object().is_some_and(|o| o.contains_key("data"));
    if !is_envelope {
        return Ok(TopicUpdate::new(topic, DEFAULT_UPDATE_KIND, data));
    }
    let payload: UpdatePayload = serde_json::from_value(data)?;
    Ok(into_update(topic.to_string(), payload))
}

fn into_update(topic: String, payload: UpdatePayload) -> TopicUpdate {
    TopicUpdate {
        topic,
        kind: payload
            .kind
            .unwrap_or_else(|| DEFAULT_UPDATE_KIND.to_string()),
        data: payload.data.unwrap_or(serde_json::Value::Null),
        id: payload.id,
        timestamp: payload.timestamp,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
