//! Signaling protocol shared by the matchmaking server and roulette clients.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// WebSocket close codes used on the signaling channel.
pub mod close {
    pub const NORMAL: u16 = 1000;
    pub const PROTOCOL: u16 = 1002;
    pub const INTERNAL: u16 = 1011;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalKind {
    RequestOffer,
    Offer,
    Answer,
    AnswerAck,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::RequestOffer => "requestOffer",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::AnswerAck => "answerAck",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message on the signaling channel.
///
/// The payload is an opaque session description (`{"type": .., "sdp": ..}`);
/// relays forward it untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl SignalMessage {
    pub fn request_offer() -> Self {
        Self {
            kind: SignalKind::RequestOffer,
            payload: None,
        }
    }

    pub fn offer(description: Value) -> Self {
        Self {
            kind: SignalKind::Offer,
            payload: Some(description),
        }
    }

    pub fn answer(description: Value) -> Self {
        Self {
            kind: SignalKind::Answer,
            payload: Some(description),
        }
    }

    pub fn answer_ack() -> Self {
        Self {
            kind: SignalKind::AnswerAck,
            payload: None,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }

    pub fn to_json(&self) -> String {
        // A struct of an enum and a serde_json::Value cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Takes the session description, failing if the message carries none.
    pub fn into_description(self) -> Result<Value, ProtocolError> {
        match self.payload {
            Some(Value::Null) | None => Err(ProtocolError::MissingPayload(self.kind)),
            Some(value) => Ok(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed signaling message: {0}")]
    Malformed(String),
    #[error("unexpected {got} message while {state}")]
    Unexpected { state: HandshakeState, got: SignalKind },
    #[error("expected {expected} message, got {got}")]
    WrongReply {
        expected: SignalKind,
        got: SignalKind,
    },
    #[error("{0} message carries no session description")]
    MissingPayload(SignalKind),
    #[error("no local description is pending while {0}")]
    NoPendingDescription(HandshakeState),
}

/// Per-participant handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    /// Asked to offer; the local offer is being created.
    AwaitingLocalOffer,
    /// Received an offer; the local answer is being created.
    AwaitingLocalAnswer,
    /// Offer sent; waiting for the counterpart's answer.
    AwaitingAnswer,
    Complete,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HandshakeState::Idle => "idle",
            HandshakeState::AwaitingLocalOffer => "creating offer",
            HandshakeState::AwaitingLocalAnswer => "creating answer",
            HandshakeState::AwaitingAnswer => "awaiting answer",
            HandshakeState::Complete => "complete",
        };
        f.write_str(text)
    }
}

/// What the participant must do after feeding a message to [`Handshake::receive`].
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeAction {
    /// Create an offer, install it locally, then call
    /// [`Handshake::local_description_ready`].
    CreateOffer,
    /// Install the remote offer, create an answer, install it locally, then
    /// call [`Handshake::local_description_ready`].
    AnswerOffer(Value),
    /// Install the remote answer. The handshake is complete; an
    /// `answerAck` may be sent back.
    AcceptAnswer(Value),
    /// A trailing acknowledgement; nothing to do.
    Acknowledged,
}

/// Client-side state machine for the four-message exchange.
///
/// Either side may end up as offerer; which one is decided by who receives
/// `requestOffer` first. Any message that does not fit the current state is
/// a protocol error and ends the handshake.
#[derive(Debug, Clone)]
pub struct Handshake {
    state: HandshakeState,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == HandshakeState::Complete
    }

    pub fn receive(&mut self, message: SignalMessage) -> Result<HandshakeAction, ProtocolError> {
        let kind = message.kind;
        match (self.state, kind) {
            (HandshakeState::Idle, SignalKind::RequestOffer) => {
                self.state = HandshakeState::AwaitingLocalOffer;
                Ok(HandshakeAction::CreateOffer)
            }
            (HandshakeState::Idle, SignalKind::Offer) => {
                let offer = message.into_description()?;
                self.state = HandshakeState::AwaitingLocalAnswer;
                Ok(HandshakeAction::AnswerOffer(offer))
            }
            (HandshakeState::AwaitingAnswer, SignalKind::Answer) => {
                let answer = message.into_description()?;
                self.state = HandshakeState::Complete;
                Ok(HandshakeAction::AcceptAnswer(answer))
            }
            (HandshakeState::Complete, SignalKind::AnswerAck) => Ok(HandshakeAction::Acknowledged),
            (state, got) => Err(ProtocolError::Unexpected { state, got }),
        }
    }

    /// Records that the local description has been created and installed,
    /// returning the message that carries it to the counterpart.
    ///
    /// Producing an answer completes the handshake on this side.
    pub fn local_description_ready(
        &mut self,
        description: Value,
    ) -> Result<SignalMessage, ProtocolError> {
        match self.state {
            HandshakeState::AwaitingLocalOffer => {
                self.state = HandshakeState::AwaitingAnswer;
                Ok(SignalMessage::offer(description))
            }
            HandshakeState::AwaitingLocalAnswer => {
                self.state = HandshakeState::Complete;
                Ok(SignalMessage::answer(description))
            }
            state => Err(ProtocolError::NoPendingDescription(state)),
        }
    }
}

/// Checks that a reply has the type the caller asked for.
pub fn expect_kind(message: &SignalMessage, expected: SignalKind) -> Result<(), ProtocolError> {
    if message.kind == expected {
        Ok(())
    } else {
        Err(ProtocolError::WrongReply {
            expected,
            got: message.kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct ScriptedPeer {
        name: &'static str,
        handshake: Handshake,
        local: Option<Value>,
        remote: Option<Value>,
    }

    impl ScriptedPeer {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                ..Default::default()
            }
        }

        /// Feeds one message and returns whatever the peer sends back.
        fn handle(&mut self, message: SignalMessage) -> Option<SignalMessage> {
            match self.handshake.receive(message).expect("valid transition") {
                HandshakeAction::CreateOffer => {
                    let offer = json!({"type": "offer", "sdp": format!("offer-from-{}", self.name)});
                    self.local = Some(offer.clone());
                    Some(self.handshake.local_description_ready(offer).unwrap())
                }
                HandshakeAction::AnswerOffer(offer) => {
                    self.remote = Some(offer);
                    let answer =
                        json!({"type": "answer", "sdp": format!("answer-from-{}", self.name)});
                    self.local = Some(answer.clone());
                    Some(self.handshake.local_description_ready(answer).unwrap())
                }
                HandshakeAction::AcceptAnswer(answer) => {
                    self.remote = Some(answer);
                    Some(SignalMessage::answer_ack())
                }
                HandshakeAction::Acknowledged => None,
            }
        }
    }

    fn relay(offerer: &mut ScriptedPeer, answerer: &mut ScriptedPeer) {
        let offer = offerer.handle(SignalMessage::request_offer()).unwrap();
        assert_eq!(offer.kind, SignalKind::Offer);
        let answer = answerer.handle(offer).unwrap();
        assert_eq!(answer.kind, SignalKind::Answer);
        assert!(answerer.handshake.is_complete());
        let ack = offerer.handle(answer).unwrap();
        assert_eq!(ack.kind, SignalKind::AnswerAck);
        assert!(answerer.handle(ack).is_none());
    }

    #[test]
    fn handshake_yields_matching_descriptions_for_either_offerer() {
        for a_offers in [true, false] {
            let mut a = ScriptedPeer::new("a");
            let mut b = ScriptedPeer::new("b");
            if a_offers {
                relay(&mut a, &mut b);
            } else {
                relay(&mut b, &mut a);
            }
            assert!(a.handshake.is_complete());
            assert!(b.handshake.is_complete());
            assert!(a.local.is_some() && b.local.is_some());
            assert_eq!(a.local, b.remote);
            assert_eq!(a.remote, b.local);
        }
    }

    #[test]
    fn out_of_order_messages_are_protocol_errors() {
        let mut handshake = Handshake::new();
        let err = handshake
            .receive(SignalMessage::answer(json!({"type": "answer", "sdp": ""})))
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Unexpected {
                state: HandshakeState::Idle,
                got: SignalKind::Answer
            }
        );

        let mut handshake = Handshake::new();
        handshake.receive(SignalMessage::request_offer()).unwrap();
        assert!(handshake.receive(SignalMessage::request_offer()).is_err());
    }

    #[test]
    fn offer_without_payload_is_rejected() {
        let mut handshake = Handshake::new();
        let message = SignalMessage::from_json(r#"{"type":"offer","payload":null}"#).unwrap();
        assert_eq!(
            handshake.receive(message),
            Err(ProtocolError::MissingPayload(SignalKind::Offer))
        );
    }

    #[test]
    fn wire_format_matches_camel_case_types() {
        assert_eq!(
            SignalMessage::request_offer().to_json(),
            r#"{"type":"requestOffer"}"#
        );
        let parsed = SignalMessage::from_json(r#"{"type":"answerAck"}"#).unwrap();
        assert_eq!(parsed, SignalMessage::answer_ack());
        assert!(matches!(
            SignalMessage::from_json(r#"{"type":"hangup"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn local_description_without_pending_request_fails() {
        let mut handshake = Handshake::new();
        assert_eq!(
            handshake.local_description_ready(json!({})),
            Err(ProtocolError::NoPendingDescription(HandshakeState::Idle))
        );
    }

    #[test]
    fn expect_kind_reports_mismatch() {
        let err = expect_kind(&SignalMessage::answer_ack(), SignalKind::Offer).unwrap_err();
        assert_eq!(err.to_string(), "expected offer message, got answerAck");
    }
}
