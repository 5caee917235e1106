//! Streaming protocol messages.
//!
//! Frames are JSON objects tagged by `type`.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::event::StatusEvent;
use crate::job::{JobId, JobStatus, Stage};

/// Client to server messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { job_id: JobId },
    Unsubscribe { job_id: JobId },
    Ping,
}

impl ClientMessage {
    /// Parse a text frame. The error string is suitable for an `error` reply.
    pub fn parse(text: &str) -> Result<Self, String> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|_| "malformed message: expected JSON".to_string())?;

        let msg_type = match value.get("type").and_then(|t| t.as_str()) {
            Some(t) => t.to_string(),
            None => return Err("malformed message: missing type".to_string()),
        };

        match msg_type.as_str() {
            "subscribe" | "unsubscribe" | "ping" => serde_json::from_value(value)
                .map_err(|e| format!("malformed {} message: {}", msg_type, e)),
            other => Err(format!("unknown message type: {}", other)),
        }
    }

    /// Job this message refers to, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            ClientMessage::Subscribe { job_id } | ClientMessage::Unsubscribe { job_id } => {
                Some(job_id)
            }
            ClientMessage::Ping => None,
        }
    }
}

/// Server to client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A job transition.
    StatusUpdate {
        job_id: JobId,
        status: JobStatus,
        stage: Stage,
        progress_pct: f64,
        timestamp: DateTime<Utc>,
        seq: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<JobError>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result_ref: Option<String>,
    },

    /// Protocol or lookup error.
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<JobId>,
        message: String,
    },

    Pong,

    Subscribed { job_id: JobId },

    Unsubscribed { job_id: JobId },
}

impl ServerMessage {
    /// Create a status update from an event.
    pub fn status_update(event: &StatusEvent) -> Self {
        ServerMessage::StatusUpdate {
            job_id: event.job_id.clone(),
            status: event.status,
            stage: event.stage,
            progress_pct: event.progress_pct,
            timestamp: event.timestamp,
            seq: event.seq,
            error: event.error.clone(),
            result_ref: event.result_ref.clone(),
        }
    }

    /// Create an error message.
    pub fn error(job_id: Option<JobId>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            job_id,
            message: message.into(),
        }
    }

    /// Only non-terminal status updates may be discarded under backpressure.
    pub fn is_droppable(&self) -> bool {
        match self {
            ServerMessage::StatusUpdate { status, .. } => !status.is_terminal(),
            _ => false,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","message":"encoding failed"}"#.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key::ContentHash;
    use crate::job::Job;

    #[test]
    fn test_parse_client_messages() {
        let msg = ClientMessage::parse(r#"{"type":"subscribe","job_id":"abc"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                job_id: JobId::from_string("abc")
            }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
    }

    #[test]
    fn test_parse_rejects_unknown_and_malformed() {
        let err = ClientMessage::parse(r#"{"type":"shutdown"}"#).unwrap_err();
        assert!(err.contains("unknown message type"));

        let err = ClientMessage::parse(r#"{"type":"subscribe"}"#).unwrap_err();
        assert!(err.contains("malformed subscribe"));

        assert!(ClientMessage::parse("not json").is_err());
        assert!(ClientMessage::parse(r#"{"job_id":"x"}"#).is_err());
    }

    #[test]
    fn test_status_update_serialization() {
        let job = Job::new("k", ContentHash::of_bytes(b"x"), "c", 3);
        let msg = ServerMessage::status_update(&StatusEvent::from_job(&job));
        let json = msg.to_json();
        assert!(json.contains("\"type\":\"status_update\""));
        assert!(json.contains("\"status\":\"queued\""));
        assert!(json.contains("\"stage\":\"queued\""));
        assert!(!json.contains("\"error\""));
        assert!(msg.is_droppable());
    }

    #[test]
    fn test_terminal_update_not_droppable() {
        let mut job = Job::new("k", ContentHash::of_bytes(b"x"), "c", 3);
        job.cancel().unwrap();
        let msg = ServerMessage::status_update(&StatusEvent::from_job(&job));
        assert!(!msg.is_droppable());
        assert!(!ServerMessage::Pong.is_droppable());
    }

    #[test]
    fn test_control_messages() {
        assert_eq!(ServerMessage::Pong.to_json(), r#"{"type":"pong"}"#);
        let json = ServerMessage::error(None, "unknown message type: x").to_json();
        assert_eq!(json, r#"{"type":"error","message":"unknown message type: x"}"#);
    }
}
