//! The typed client/server wire schema (spec §4.7) — one JSON object per
//! message, `type` as discriminator, unknown fields rejected.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCode, ManagerError};

/// Client → server requests. Internally-tagged enums support
/// `deny_unknown_fields`, which gives us the "extra fields on client
/// messages are rejected" rule from spec §6 for free.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum ClientMessage {
    #[serde(rename = "session.create")]
    SessionCreate,

    #[serde(rename = "session.attach")]
    SessionAttach { #[serde(rename = "sessionId")] session_id: Uuid },

    #[serde(rename = "session.list")]
    SessionList,

    #[serde(rename = "session.terminate")]
    SessionTerminate { #[serde(rename = "sessionId")] session_id: Uuid },

    #[serde(rename = "session.rename")]
    SessionRename {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        name: String,
    },

    #[serde(rename = "term.in")]
    TermIn {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        data: String,
    },

    #[serde(rename = "term.resize")]
    TermResize {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        cols: u16,
        rows: u16,
    },
}

impl ClientMessage {
    /// Field-level validation beyond what serde's type system encodes:
    /// `session.rename`'s name length, `term.resize`'s positivity.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ClientMessage::SessionRename { name, .. } => {
                if name.is_empty() || name.chars().count() > 100 {
                    return Err("name must be 1..100 characters".to_string());
                }
                Ok(())
            }
            ClientMessage::TermResize { cols, rows, .. } => {
                if *cols < 1 || *rows < 1 {
                    return Err("cols and rows must be >= 1".to_string());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Server → client pushes and replies.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "server.hello")]
    ServerHello {
        #[serde(rename = "serverTime")]
        server_time: String,
        #[serde(rename = "protocolVersion")]
        protocol_version: u32,
    },

    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    #[serde(rename = "session.attached")]
    SessionAttached {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        status: String,
    },

    #[serde(rename = "session.list.result")]
    SessionListResult { sessions: Vec<SessionIndexEntry> },

    #[serde(rename = "session.exited")]
    SessionExited {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
    },

    #[serde(rename = "session.renamed")]
    SessionRenamed {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        name: String,
    },

    #[serde(rename = "term.out")]
    TermOut {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        data: String,
    },

    #[serde(rename = "error")]
    Error { code: ErrorCode, message: String },
}

impl From<ManagerError> for ServerMessage {
    fn from(e: ManagerError) -> Self {
        ServerMessage::Error {
            code: e.code,
            message: e.message,
        }
    }
}

/// Mirrors `SessionMeta` plus live fields sourced from the PTY.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    #[serde(rename = "sessionId")]
    pub session_id: Uuid,
    pub status: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "lastActivityAt")]
    pub last_activity_at: String,
    #[serde(rename = "workspacePath")]
    pub workspace_path: String,
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
    #[serde(rename = "exitCode")]
    pub exit_code: Option<i32>,
    #[serde(rename = "copilotPath")]
    pub copilot_path: String,
    pub error: Option<SpawnError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnError {
    pub code: String,
    pub message: String,
}

/// One entry of the durable `index.json` catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionIndexEntry {
    #[serde(rename = "sessionId")]
    pub session_id: Uuid,
    pub status: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "lastActivityAt")]
    pub last_activity_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}
