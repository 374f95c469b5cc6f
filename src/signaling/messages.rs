//! Message Types für das Matrix VoIP Protokoll
//!
//! Die Strukturen bilden die `m.call.*` Event-Inhalte ab und ermöglichen
//! typsichere Kommunikation mit dem Homeserver.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Protokoll-Version, die wir selbst senden
pub const PROTOCOL_VERSION: &str = "1";

pub const EVENT_INVITE: &str = "m.call.invite";
pub const EVENT_ANSWER: &str = "m.call.answer";
pub const EVENT_CANDIDATES: &str = "m.call.candidates";
pub const EVENT_HANGUP: &str = "m.call.hangup";

// ============================================================================
// SHARED TYPES
// ============================================================================

/// Session Description (Offer oder Answer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp,
        }
    }
}

/// Ein einzelner ICE Candidate wie er über Matrix verschickt wird
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateDescriptor {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Ältere Clients senden die Version als Zahl (`0`), neuere als String
fn deserialize_version<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawVersion {
        Text(String),
        Number(u64),
    }

    Ok(match RawVersion::deserialize(deserializer)? {
        RawVersion::Text(s) => s,
        RawVersion::Number(n) => n.to_string(),
    })
}

fn protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

// ============================================================================
// EVENT CONTENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteContent {
    #[serde(default)]
    pub call_id: String,
    #[serde(default)]
    pub party_id: String,
    pub lifetime: u64,
    pub offer: SessionDescription,
    #[serde(default = "protocol_version", deserialize_with = "deserialize_version")]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerContent {
    #[serde(default)]
    pub call_id: String,
    #[serde(default)]
    pub party_id: String,
    pub answer: SessionDescription,
    #[serde(default = "protocol_version", deserialize_with = "deserialize_version")]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatesContent {
    #[serde(default)]
    pub call_id: String,
    #[serde(default)]
    pub party_id: String,
    #[serde(default = "protocol_version", deserialize_with = "deserialize_version")]
    pub version: String,
    pub candidates: Vec<CandidateDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HangupContent {
    #[serde(default)]
    pub call_id: String,
    #[serde(default)]
    pub party_id: String,
    #[serde(default = "protocol_version", deserialize_with = "deserialize_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ============================================================================
// SIGNALING MESSAGE
// ============================================================================

/// Alle Call-Control Nachrichten
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Invite(InviteContent),
    Answer(AnswerContent),
    Candidates(CandidatesContent),
    Hangup(HangupContent),
}

impl SignalingMessage {
    pub fn invite(call_id: &str, party_id: &str, lifetime: u64, sdp: String) -> Self {
        Self::Invite(InviteContent {
            call_id: call_id.to_string(),
            party_id: party_id.to_string(),
            lifetime,
            offer: SessionDescription::offer(sdp),
            version: protocol_version(),
        })
    }

    pub fn answer(call_id: &str, party_id: &str, sdp: String) -> Self {
        Self::Answer(AnswerContent {
            call_id: call_id.to_string(),
            party_id: party_id.to_string(),
            answer: SessionDescription::answer(sdp),
            version: protocol_version(),
        })
    }

    pub fn candidates(
        call_id: &str,
        party_id: &str,
        candidates: Vec<CandidateDescriptor>,
    ) -> Self {
        Self::Candidates(CandidatesContent {
            call_id: call_id.to_string(),
            party_id: party_id.to_string(),
            version: protocol_version(),
            candidates,
        })
    }

    pub fn hangup(call_id: &str, party_id: &str, reason: Option<String>) -> Self {
        Self::Hangup(HangupContent {
            call_id: call_id.to_string(),
            party_id: party_id.to_string(),
            version: protocol_version(),
            reason,
        })
    }

    /// Matrix Event-Typ dieser Nachricht
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Invite(_) => EVENT_INVITE,
            Self::Answer(_) => EVENT_ANSWER,
            Self::Candidates(_) => EVENT_CANDIDATES,
            Self::Hangup(_) => EVENT_HANGUP,
        }
    }

    pub fn call_id(&self) -> &str {
        match self {
            Self::Invite(c) => &c.call_id,
            Self::Answer(c) => &c.call_id,
            Self::Candidates(c) => &c.call_id,
            Self::Hangup(c) => &c.call_id,
        }
    }

    pub fn party_id(&self) -> &str {
        match self {
            Self::Invite(c) => &c.party_id,
            Self::Answer(c) => &c.party_id,
            Self::Candidates(c) => &c.party_id,
            Self::Hangup(c) => &c.party_id,
        }
    }

    /// Serialisiert den Event-Inhalt für den Request-Body
    pub fn to_content(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Invite(c) => serde_json::to_value(c),
            Self::Answer(c) => serde_json::to_value(c),
            Self::Candidates(c) => serde_json::to_value(c),
            Self::Hangup(c) => serde_json::to_value(c),
        }
    }

    /// Parst einen Event-Inhalt; `Ok(None)` für Event-Typen, die uns nicht interessieren
    pub fn from_event(
        event_type: &str,
        content: serde_json::Value,
    ) -> Result<Option<Self>, serde_json::Error> {
        let message = match event_type {
            EVENT_INVITE => Self::Invite(serde_json::from_value(content)?),
            EVENT_ANSWER => Self::Answer(serde_json::from_value(content)?),
            EVENT_CANDIDATES => Self::Candidates(serde_json::from_value(content)?),
            EVENT_HANGUP => Self::Hangup(serde_json::from_value(content)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

// ============================================================================
// CLIENT-SERVER API TYPES
// ============================================================================

/// Login mit Passwort
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    #[serde(rename = "type")]
    pub login_type: &'static str,
    pub identifier: UserIdentifier,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserIdentifier {
    #[serde(rename = "type")]
    pub id_type: &'static str,
    pub user: String,
}

impl LoginRequest {
    pub fn password(user: String, password: String) -> Self {
        Self {
            login_type: "m.login.password",
            identifier: UserIdentifier {
                id_type: "m.id.user",
                user,
            },
            password,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub user_id: String,
    pub access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendEventResponse {
    #[serde(default)]
    pub event_id: Option<String>,
}

/// Antwort von `/sync` (nur die Felder, die wir brauchen)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: SyncRooms,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: HashMap<String, JoinedRoom>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinedRoom {
    #[serde(default)]
    pub timeline: Timeline,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl SyncResponse {
    /// Alle `m.call.*` Nachrichten eines Raums, zusammen mit dem Absender
    pub fn call_messages(&self, room_id: &str) -> Vec<(String, SignalingMessage)> {
        let Some(room) = self.rooms.join.get(room_id) else {
            return Vec::new();
        };

        room.timeline
            .events
            .iter()
            .filter_map(|event| {
                match SignalingMessage::from_event(&event.event_type, event.content.clone()) {
                    Ok(Some(message)) => Some((event.sender.clone(), message)),
                    Ok(None) => None,
                    Err(e) => {
                        tracing::warn!("Ignoring malformed {} event: {}", event.event_type, e);
                        None
                    }
                }
            })
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
