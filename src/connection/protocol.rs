//! Duplex channel message types.
//!
//! Every frame is a JSON text message shaped `{"event": <name>, "data": {...}}`
//! with camelCase payload fields.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub long: f64,
}

/// Client-to-server message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    StartAttendance {
        classroom_id: String,
        timeout_minutes: u32,
    },
    /// Sent by a teacher closing early, and by the expiry tick.
    #[serde(rename_all = "camelCase")]
    StopAttendance { classroom_id: String },
    #[serde(rename_all = "camelCase")]
    PunchIn {
        classroom_id: String,
        location: Location,
        request_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PunchOut {
        classroom_id: String,
        location: Location,
        request_id: String,
    },
    #[serde(rename_all = "camelCase")]
    JoinClassroom { classroom_ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    NewMessage {
        classroom_id: String,
        message: String,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::StartAttendance { .. } => "start_attendance",
            ClientEvent::StopAttendance { .. } => "stop_attendance",
            ClientEvent::PunchIn { .. } => "punch_in",
            ClientEvent::PunchOut { .. } => "punch_out",
            ClientEvent::JoinClassroom { .. } => "join_classroom",
            ClientEvent::NewMessage { .. } => "new_message",
        }
    }
}

/// Server-to-client message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected,
    #[serde(rename_all = "camelCase")]
    SessionStarted {
        classroom_id: String,
        duration_minutes: u32,
    },
    #[serde(rename_all = "camelCase")]
    SessionStopped { classroom_id: String },
    #[serde(rename_all = "camelCase")]
    PunchIn {
        classroom_id: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PunchOut {
        classroom_id: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    NewMessage(serde_json::Value),
    Success {
        #[serde(default)]
        message: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    SessionStarted,
    SessionStopped,
    PunchIn,
    PunchOut,
    NewMessage,
    Success,
    Error,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::Connected => EventKind::Connected,
            ServerEvent::SessionStarted { .. } => EventKind::SessionStarted,
            ServerEvent::SessionStopped { .. } => EventKind::SessionStopped,
            ServerEvent::PunchIn { .. } => EventKind::PunchIn,
            ServerEvent::PunchOut { .. } => EventKind::PunchOut,
            ServerEvent::NewMessage(_) => EventKind::NewMessage,
            ServerEvent::Success { .. } => EventKind::Success,
            ServerEvent::Error { .. } => EventKind::Error,
        }
    }

    pub fn classroom_id(&self) -> Option<&str> {
        match self {
            ServerEvent::SessionStarted { classroom_id, .. }
            | ServerEvent::SessionStopped { classroom_id }
            | ServerEvent::PunchIn { classroom_id, .. }
            | ServerEvent::PunchOut { classroom_id, .. } => Some(classroom_id),
            _ => None,
        }
    }
}

pub fn encode(event: &ClientEvent) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

pub fn decode(text: &str) -> serde_json::Result<ServerEvent> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn punch_in_uses_wire_field_names() {
        let event = ClientEvent::PunchIn {
            classroom_id: "C1".into(),
            location: Location {
                lat: 12.5,
                long: 77.25,
            },
            request_id: "r-1".into(),
        };

        let value: serde_json::Value = serde_json::from_str(&encode(&event).unwrap()).unwrap();
        assert_eq!(value["event"], "punch_in");
        assert_eq!(value["data"]["classroomId"], "C1");
        assert_eq!(value["data"]["location"]["long"], 77.25);
    }

    #[test]
    fn session_started_decodes_duration() {
        let event =
            decode(r#"{"event":"session_started","data":{"classroomId":"C9","durationMinutes":5}}"#)
                .unwrap();
        assert_eq!(
            event,
            ServerEvent::SessionStarted {
                classroom_id: "C9".into(),
                duration_minutes: 5
            }
        );
        assert_eq!(event.classroom_id(), Some("C9"));
    }

    #[test]
    fn punch_confirmation_tolerates_extra_fields() {
        let event = decode(
            r#"{"event":"punch_in","data":{"classroomId":"C1","studentId":"s-4","at":"10:02"}}"#,
        )
        .unwrap();
        assert_eq!(event.kind(), EventKind::PunchIn);
    }

    #[test]
    fn connected_has_no_payload() {
        assert_eq!(decode(r#"{"event":"connected"}"#).unwrap(), ServerEvent::Connected);
    }

    #[test]
    fn unknown_event_fails_to_decode() {
        assert!(decode(r#"{"event":"leaderboard","data":{}}"#).is_err());
    }
}
