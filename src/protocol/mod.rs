use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Participant identifiers are assigned by the platform; the relay itself is
/// addressed as [`RELAY`].
pub type ParticipantId = i64;
pub const RELAY: ParticipantId = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    CallRequest,
    CallAccept,
    CallReject,
    CallEnd,
    Offer,
    Answer,
    IceCandidate,
    ChatMessage,
    ConnectionConfirmed,
    Error,
    ConnectionTest,
}

/// The wire unit exchanged over the signaling channel. `timestamp` is
/// advisory; nothing may assume ordering between distinct message types that
/// share a `sessionId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub from: ParticipantId,
    pub to: ParticipantId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub timestamp: i64,
}

impl SignalingMessage {
    pub fn new(
        kind: MessageKind,
        from: ParticipantId,
        to: ParticipantId,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            from,
            to,
            session_id: session_id.into(),
            data: None,
            timestamp: now_millis(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_payload<T: Serialize>(self, payload: &T) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(payload)?;
        Ok(self.with_data(value))
    }

    /// Decode the `data` payload into a typed view.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone().unwrap_or(Value::Null))
    }

    /// `data` as plain text, for chat and error payloads.
    pub fn text(&self) -> Option<&str> {
        self.data.as_ref().and_then(Value::as_str)
    }
}

/// Negotiation document payload for `offer` / `answer` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
    #[serde(rename = "type")]
    pub typ: String,
}

/// Connectivity fragment payload for `ice-candidate` frames. Field names
/// match what browser peers put on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// `call-request` payload: the caller's display name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerInfo {
    #[serde(rename = "callerName")]
    pub caller_name: String,
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
