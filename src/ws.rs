//! The channel endpoint (spec §4.8): per-connection setup, a sliding-window
//! rate limiter, the receive loop that drives the dispatcher, and the
//! per-client output/exit callbacks that gate delivery on the connection's
//! currently bound session.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{new_id, now_iso};
use crate::config::Config;
use crate::dispatcher::{self, BoundSession, DispatchOutcome};
use crate::error::ErrorCode;
use crate::protocol::ServerMessage;
use crate::session::SessionManager;

/// Close code pushed when the rate limiter trips (spec §4.8 step 1).
const CLOSE_INTERNAL_ERROR: u16 = 1011;

const RATE_LIMIT_MAX_MESSAGES: usize = 200;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

/// Timestamps of recent messages, pruned to the trailing window on each
/// check, mirroring the source's per-connection sliding-window limiter.
struct RateLimiter {
    timestamps: VecDeque<Instant>,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            timestamps: VecDeque::with_capacity(RATE_LIMIT_MAX_MESSAGES + 1),
        }
    }

    /// Records one message and reports whether the connection is over the
    /// limit for the current rolling window.
    fn check(&mut self) -> bool {
        let now = Instant::now();
        while let Some(&oldest) = self.timestamps.front() {
            if now.duration_since(oldest) > RATE_LIMIT_WINDOW {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        self.timestamps.push_back(now);
        self.timestamps.len() > RATE_LIMIT_MAX_MESSAGES
    }
}

/// The axum handler mounted at `/ws`: rejects non-loopback peers up front,
/// then upgrades and hands off to the per-connection loop.
pub async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State((manager, config)): State<(Arc<SessionManager>, Arc<Config>)>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() && !config.allow_non_localhost {
        warn!(%addr, "rejected channel handshake from non-localhost peer");
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    ws.max_message_size(config.ws_max_message_bytes)
        .on_upgrade(move |socket| handle_connection(socket, manager))
}

/// Serializes `msg` and queues it on `out_tx`; a closed channel means the
/// connection is already tearing down, so this is a silent no-op.
fn send(out_tx: &mpsc::UnboundedSender<Message>, msg: &ServerMessage) {
    match serde_json::to_string(msg) {
        Ok(text) => {
            let _ = out_tx.send(Message::Text(text.into()));
        }
        Err(e) => warn!(%e, "failed to serialize outgoing message"),
    }
}

async fn handle_connection(socket: WebSocket, manager: Arc<SessionManager>) {
    let client_id = new_id();
    let (mut sink, mut stream) = socket.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let attached_session: BoundSession = Arc::new(Mutex::new(None));

    let output_tx = out_tx.clone();
    let output_bound = Arc::clone(&attached_session);
    let on_output = Arc::new(move |session_id: Uuid, data: String| {
        let output_tx = output_tx.clone();
        let output_bound = Arc::clone(&output_bound);
        Box::pin(async move {
            if *output_bound.lock().unwrap() != Some(session_id) {
                return;
            }
            send(&output_tx, &ServerMessage::TermOut { session_id, data });
        }) as futures::future::BoxFuture<'static, ()>
    });

    let exit_tx = out_tx.clone();
    let exit_bound = Arc::clone(&attached_session);
    let on_exit = Arc::new(move |session_id: Uuid, exit_code: Option<i32>| {
        let exit_tx = exit_tx.clone();
        let exit_bound = Arc::clone(&exit_bound);
        Box::pin(async move {
            if *exit_bound.lock().unwrap() != Some(session_id) {
                return;
            }
            send(&exit_tx, &ServerMessage::SessionExited { session_id, exit_code });
        }) as futures::future::BoxFuture<'static, ()>
    });

    manager.register_client(client_id, on_output, on_exit);
    info!(%client_id, "channel connected");

    send(
        &out_tx,
        &ServerMessage::ServerHello {
            server_time: now_iso(),
            protocol_version: 1,
        },
    );

    let mut limiter = RateLimiter::new();
    let mut close_code: Option<u16> = None;

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(%client_id, %e, "channel read error");
                break;
            }
        };

        if limiter.check() {
            send(
                &out_tx,
                &ServerMessage::Error {
                    code: ErrorCode::RateLimitExceeded,
                    message: "Rate limit exceeded: 200 messages per second.".to_string(),
                },
            );
            close_code = Some(CLOSE_INTERNAL_ERROR);
            break;
        }

        match dispatcher::dispatch(&manager, client_id, &attached_session, &text).await {
            DispatchOutcome::Reply(msg) => send(&out_tx, &msg),
            DispatchOutcome::NoReply => {}
            DispatchOutcome::CloseWithReply { reply, code } => {
                send(&out_tx, &reply);
                close_code = Some(code);
                break;
            }
        }
    }

    if let Some(code) = close_code {
        let _ = out_tx.send(Message::Close(Some(CloseFrame {
            code,
            reason: "".into(),
        })));
    }

    drop(out_tx);
    let _ = writer_task.await;

    manager.unregister_client(client_id);
    manager.detach_all_sessions(client_id).await;
    info!(%client_id, "channel disconnected");
}
