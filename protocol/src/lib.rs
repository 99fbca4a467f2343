//! The wire protocol between server and clients. Every WebSocket text frame
//! is one JSON [`Envelope`] carrying a strictly tagged message body, used
//! consistently across the server and the client.
//!
//! Unknown `type` values fail decoding, there is no pass-through of frames
//! the protocol does not declare.

mod frames;
mod types;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

pub use frames::{ClientFrame, DmCommand, DmEvent, GameEvent, ServerFrame, StatDeltas, TurnEndReason};
pub use types::{
    ChatEntry, ChatKind, Difficulty, ErrorCode, ParticipantInfo, ParticipantRole, PauseReason,
    SessionConfig, SessionEndReason, SessionInfo, SessionPhase, UserView,
};

/// The maximum accepted chat text length in characters.
pub const MAX_CHAT_LEN: usize = 500;

/// The envelope wrapped around every frame in both directions.
///
/// `seq` is chosen by the sending side and must be strictly increasing within
/// one connection; the server uses it for at-most-once de-duplication and for
/// error correlation. `ts` is the sender's wallclock in unix milliseconds and
/// is advisory only.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub seq: u64,
    pub ts: u64,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(seq: u64, ts: u64, body: T) -> Self {
        Envelope { seq, ts, body }
    }
}

/// Decodes one inbound text frame. Any malformed JSON, missing envelope
/// field or undeclared `type` is an error for the caller to convert into a
/// `PROTOCOL` close.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<Envelope<T>, serde_json::Error> {
    serde_json::from_str(text)
}

/// Encodes one outbound frame to its wire form.
pub fn encode<T: Serialize>(envelope: &Envelope<T>) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

/// Strips control characters and caps the length of client-supplied chat
/// text. Applied server-side before the text reaches any other participant.
pub fn sanitize_text(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control())
        .take(MAX_CHAT_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use simulation::{Action, Position, UnitId};

    #[test]
    fn client_envelope_round_trip() {
        let envelope = Envelope::new(
            7,
            1_700_000_000_000,
            ClientFrame::Intent {
                action: Action::Move {
                    unit_id: UnitId::new("u-1"),
                    target: Position::new(3, 5),
                },
            },
        );
        let wire = encode(&envelope).expect("encode");
        let decoded: Envelope<ClientFrame> = decode(&wire).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn wire_shape_matches_the_documented_envelope() {
        let envelope = Envelope::new(1, 2, ClientFrame::Ready { ready: true });
        let wire = encode(&envelope).expect("encode");
        let value: serde_json::Value = serde_json::from_str(&wire).expect("json");
        assert_eq!(value["type"], "ready");
        assert_eq!(value["payload"]["ready"], true);
        assert_eq!(value["seq"], 1);
        assert_eq!(value["ts"], 2);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"type":"warp_drive","payload":{},"seq":1,"ts":0}"#;
        assert!(decode::<ClientFrame>(raw).is_err());
    }

    #[test]
    fn dm_command_payload_is_command_tagged() {
        let raw = r#"{"type":"dm_command","payload":{"command":"grant_gold","user_id":"u2","amount":50},"seq":3,"ts":0}"#;
        let decoded: Envelope<ClientFrame> = decode(raw).expect("decode");
        assert_eq!(
            decoded.body,
            ClientFrame::DmCommand(DmCommand::GrantGold {
                user_id: "u2".into(),
                amount: 50,
            })
        );
    }

    #[test]
    fn sanitize_strips_control_chars_and_caps_length() {
        assert_eq!(sanitize_text("hi\u{0007} there\r\n"), "hi there");
        let long: String = std::iter::repeat('x').take(MAX_CHAT_LEN + 50).collect();
        assert_eq!(sanitize_text(&long).chars().count(), MAX_CHAT_LEN);
    }

    #[test]
    fn error_frame_omits_absent_fields() {
        let envelope = Envelope::new(
            1,
            0,
            ServerFrame::Error {
                code: ErrorCode::NotYourTurn,
                message: "not your turn".into(),
                retry_after_ms: None,
                correlation_seq: Some(9),
            },
        );
        let wire = encode(&envelope).expect("encode");
        assert!(!wire.contains("retry_after_ms"));
        assert!(wire.contains("\"NOT_YOUR_TURN\""));
        assert!(wire.contains("\"correlation_seq\":9"));
    }
}
