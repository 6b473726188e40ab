//! Parse → validate → route → shape-error pipeline for inbound channel
//! messages (spec §4.8, steps 2-4). The rate-limit step (§4.8 step 1) lives
//! in `ws`, since it depends on wall-clock state kept per connection rather
//! than the message itself.

use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::ErrorCode;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::SessionManager;

/// Close code used when a connection must be torn down after replying.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// A connection's currently-bound session, shared between the receive loop
/// (which writes it on `session.create`/`session.attach`) and the output/
/// exit callbacks registered with the manager (which read it to decide
/// whether a push belongs to this connection; spec §4.8 "Output fan-out").
pub type BoundSession = Arc<Mutex<Option<Uuid>>>;

const KNOWN_TYPES: &[&str] = &[
    "session.create",
    "session.attach",
    "session.list",
    "session.terminate",
    "session.rename",
    "term.in",
    "term.resize",
];

/// What the channel endpoint should do after a message has been dispatched.
pub enum DispatchOutcome {
    Reply(ServerMessage),
    NoReply,
    /// Reply, then close the connection with the given code (unknown
    /// message type, per spec §4.8 step 3).
    CloseWithReply { reply: ServerMessage, code: u16 },
}

/// Parses `raw` as a client message, validates it, and routes it to the
/// matching session-manager operation. `attached_session` is the
/// connection's currently bound session id, read by `term.in`'s
/// not-attached check and written by successful `session.create`/`attach`.
pub async fn dispatch(
    manager: &Arc<SessionManager>,
    client_id: Uuid,
    attached_session: &BoundSession,
    raw: &str,
) -> DispatchOutcome {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            return DispatchOutcome::Reply(ServerMessage::Error {
                code: ErrorCode::InvalidMessage,
                message: format!("Invalid JSON: {e}"),
            })
        }
    };

    let msg_type = match value.get("type").and_then(|t| t.as_str()) {
        Some(t) => t.to_string(),
        None => {
            return DispatchOutcome::Reply(ServerMessage::Error {
                code: ErrorCode::InvalidMessage,
                message: "Message must have a 'type' field".to_string(),
            })
        }
    };

    if !KNOWN_TYPES.contains(&msg_type.as_str()) {
        return DispatchOutcome::CloseWithReply {
            reply: ServerMessage::Error {
                code: ErrorCode::UnknownMessageType,
                message: format!("Unknown message type: {msg_type}"),
            },
            code: CLOSE_POLICY_VIOLATION,
        };
    }

    let message: ClientMessage = match serde_json::from_value(value) {
        Ok(m) => m,
        Err(e) => {
            return DispatchOutcome::Reply(ServerMessage::Error {
                code: ErrorCode::InvalidMessage,
                message: format!("{msg_type}: {e}"),
            })
        }
    };

    if let Err(summary) = message.validate() {
        return DispatchOutcome::Reply(ServerMessage::Error {
            code: ErrorCode::InvalidMessage,
            message: summary,
        });
    }

    route(manager, client_id, attached_session, message).await
}

async fn route(
    manager: &Arc<SessionManager>,
    client_id: Uuid,
    attached_session: &BoundSession,
    message: ClientMessage,
) -> DispatchOutcome {
    match message {
        ClientMessage::SessionCreate => match manager.create_session(None).await {
            Ok(info) => {
                let session_id = info.session_id;
                *attached_session.lock().unwrap() = Some(session_id);
                let _ = manager.attach_session(session_id, client_id).await;
                DispatchOutcome::Reply(ServerMessage::SessionCreated { session: info })
            }
            Err(e) => DispatchOutcome::Reply(e.into()),
        },

        ClientMessage::SessionAttach { session_id } => {
            match manager.attach_session(session_id, client_id).await {
                Ok(status) => {
                    *attached_session.lock().unwrap() = Some(session_id);
                    DispatchOutcome::Reply(ServerMessage::SessionAttached { session_id, status })
                }
                Err(e) => DispatchOutcome::Reply(e.into()),
            }
        }

        ClientMessage::SessionList => {
            DispatchOutcome::Reply(ServerMessage::SessionListResult {
                sessions: manager.list_sessions(),
            })
        }

        ClientMessage::SessionTerminate { session_id } => {
            match manager.terminate_session(session_id).await {
                Ok(exit_code) => DispatchOutcome::Reply(ServerMessage::SessionExited { session_id, exit_code }),
                Err(e) => DispatchOutcome::Reply(e.into()),
            }
        }

        ClientMessage::SessionRename { session_id, name } => {
            match manager.rename_session(session_id, &name) {
                Ok(()) => DispatchOutcome::Reply(ServerMessage::SessionRenamed { session_id, name }),
                Err(e) => DispatchOutcome::Reply(e.into()),
            }
        }

        ClientMessage::TermIn { session_id, data } => {
            if *attached_session.lock().unwrap() != Some(session_id) {
                return DispatchOutcome::Reply(ServerMessage::Error {
                    code: ErrorCode::NotAttached,
                    message: format!("Not attached to session: {session_id}"),
                });
            }
            match manager.send_input(session_id, &data).await {
                Ok(()) => DispatchOutcome::NoReply,
                Err(e) => DispatchOutcome::Reply(e.into()),
            }
        }

        ClientMessage::TermResize { session_id, cols, rows } => {
            match manager.resize_session(session_id, cols, rows).await {
                Ok(()) => DispatchOutcome::NoReply,
                Err(e) => DispatchOutcome::Reply(e.into()),
            }
        }
    }
}
