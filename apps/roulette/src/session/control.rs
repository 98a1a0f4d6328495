use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON envelope carried on the `chat` data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlEnvelope {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Chat(String),
}

pub const CHAT_EVENT: &str = "chat";

impl ControlMessage {
    pub fn encode(&self) -> String {
        let envelope = match self {
            ControlMessage::Chat(text) => ControlEnvelope {
                event: CHAT_EVENT.to_owned(),
                payload: Value::String(text.clone()),
            },
        };
        serde_json::to_string(&envelope).unwrap_or_default()
    }

    /// Parses an inbound envelope. Malformed input and unknown events yield
    /// `None` and are dropped by the caller.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        let envelope: ControlEnvelope = match serde_json::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(error = %err, "dropping malformed control message");
                return None;
            }
        };
        match envelope.event.as_str() {
            CHAT_EVENT => match envelope.payload {
                Value::String(text) => Some(ControlMessage::Chat(text)),
                other => {
                    tracing::debug!(payload = %other, "chat payload is not a string");
                    None
                }
            },
            unknown => {
                tracing::trace!(event = unknown, "ignoring control event");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_envelope_shape() {
        let raw = ControlMessage::Chat("hi there".into()).encode();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value, serde_json::json!({"event": "chat", "payload": "hi there"}));
        assert_eq!(
            ControlMessage::decode(raw.as_bytes()),
            Some(ControlMessage::Chat("hi there".into()))
        );
    }

    #[test]
    fn unknown_and_malformed_events_are_ignored() {
        assert_eq!(ControlMessage::decode(br#"{"event":"typing","payload":true}"#), None);
        assert_eq!(ControlMessage::decode(b"not json"), None);
        assert_eq!(ControlMessage::decode(br#"{"event":"chat","payload":7}"#), None);
        assert_eq!(ControlMessage::decode(br#"{"payload":"x"}"#), None);
    }
}
