//! End-to-end channel tests: start the real axum app on an ephemeral port,
//! connect with a genuine WebSocket client, and drive it through the
//! concrete scenarios the protocol promises.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use copilot_terminal_server::config::Config;
use copilot_terminal_server::http;
use copilot_terminal_server::session::SessionManager;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join("copilot-terminal-server-test")
        .join(name)
        .join(format!("{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn test_config(data_dir: PathBuf, port: u16) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port,
        data_dir,
        copilot_path: "copilot.exe".to_string(),
        max_sessions: 10,
        initial_cols: 120,
        initial_rows: 30,
        min_cols: 20,
        max_cols: 300,
        min_rows: 5,
        max_rows: 120,
        max_input_chars_per_message: 16384,
        ws_max_message_bytes: 1_048_576,
        allow_non_localhost: false,
        log_file: PathBuf::from("/tmp/unused.jsonl"),
        log_level: "INFO".to_string(),
        use_mock_pty: true,
    }
}

/// Starts the real app on a freshly bound loopback port and returns the
/// `ws://` base URL to connect to.
async fn start_test_server(name: &str) -> String {
    let dir = temp_dir(name);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let config = Arc::new(test_config(dir, addr.port()));
    let manager = SessionManager::new(Arc::clone(&config));
    let app = http::build_router(manager, config);

    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });

    format!("ws://{addr}/ws")
}

async fn connect(url: &str) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

async fn recv_json(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> Value {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return serde_json::from_str(&text).unwrap(),
            Ok(Some(Ok(_))) => continue,
            other => panic!("expected a text message, got {other:?}"),
        }
    }
}

/// Reads messages until one of type `want` arrives, discarding any others
/// in between (an early `term.out` may race a `session.created` reply per
/// the protocol's explicit tolerance for either ordering).
async fn recv_type(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    want: &str,
) -> Value {
    loop {
        let msg = recv_json(ws).await;
        if msg["type"] == want {
            return msg;
        }
    }
}

#[tokio::test]
async fn hello_on_connect() {
    let url = start_test_server("hello").await;
    let mut ws = connect(&url).await;

    let hello = recv_json(&mut ws).await;
    assert_eq!(hello["type"], "server.hello");
    assert_eq!(hello["protocolVersion"], 1);
    let server_time = hello["serverTime"].as_str().unwrap();
    assert_eq!(server_time.len(), 24);
    assert!(server_time.ends_with('Z'));
}

#[tokio::test]
async fn create_then_session_created() {
    let url = start_test_server("create").await;
    let mut ws = connect(&url).await;
    let _hello = recv_json(&mut ws).await;

    ws.send(Message::Text(json!({ "type": "session.create" }).to_string().into()))
        .await
        .unwrap();

    let reply = recv_type(&mut ws, "session.created").await;
    assert_eq!(reply["session"]["status"], "running");
    assert!(!reply["session"]["sessionId"].as_str().unwrap().is_empty());
    assert!(reply["session"]["workspacePath"]
        .as_str()
        .unwrap()
        .contains("workspace"));
}

#[tokio::test]
async fn attach_unknown_session_is_not_found() {
    let url = start_test_server("attach-unknown").await;
    let mut ws = connect(&url).await;
    let _hello = recv_json(&mut ws).await;

    ws.send(Message::Text(
        json!({ "type": "session.attach", "sessionId": "12345678-1234-1234-1234-123456789abc" })
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "SESSION_NOT_FOUND");
}

#[tokio::test]
async fn unknown_type_closes_connection() {
    let url = start_test_server("unknown-type").await;
    let mut ws = connect(&url).await;
    let _hello = recv_json(&mut ws).await;

    ws.send(Message::Text(json!({ "type": "invalid.type" }).to_string().into()))
        .await
        .unwrap();

    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "UNKNOWN_MESSAGE_TYPE");

    match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
        Ok(Some(Ok(Message::Close(frame)))) => {
            assert_eq!(frame.unwrap().code, 1008u16.into());
        }
        Ok(Some(Ok(other))) => panic!("expected close frame, got {other:?}"),
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_resize_leaves_dims_unchanged() {
    let url = start_test_server("resize").await;
    let mut ws = connect(&url).await;
    let _hello = recv_json(&mut ws).await;

    ws.send(Message::Text(json!({ "type": "session.create" }).to_string().into()))
        .await
        .unwrap();
    let created = recv_type(&mut ws, "session.created").await;
    let session_id = created["session"]["sessionId"].as_str().unwrap().to_string();
    assert_eq!(created["session"]["cols"], 120);

    ws.send(Message::Text(
        json!({ "type": "term.resize", "sessionId": session_id, "cols": 10, "rows": 24 })
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    let reply = recv_type(&mut ws, "error").await;
    assert_eq!(reply["code"], "INVALID_RESIZE");
}

#[tokio::test]
async fn terminate_emits_exited() {
    let url = start_test_server("terminate").await;
    let mut ws = connect(&url).await;
    let _hello = recv_json(&mut ws).await;

    ws.send(Message::Text(json!({ "type": "session.create" }).to_string().into()))
        .await
        .unwrap();
    let created = recv_type(&mut ws, "session.created").await;
    let session_id = created["session"]["sessionId"].as_str().unwrap().to_string();

    ws.send(Message::Text(
        json!({ "type": "session.terminate", "sessionId": session_id }).to_string().into(),
    ))
    .await
    .unwrap();

    let reply = recv_type(&mut ws, "session.exited").await;
    assert_eq!(reply["sessionId"], session_id);

    ws.send(Message::Text(
        json!({ "type": "term.in", "sessionId": session_id, "data": "x" }).to_string().into(),
    ))
    .await
    .unwrap();
    // Not bound to the (now-terminated) session after its own exit push;
    // NOT_ATTACHED and SESSION_NOT_RUNNING are both acceptable per spec.
    let reply = recv_type(&mut ws, "error").await;
    assert!(reply["code"] == "SESSION_NOT_RUNNING" || reply["code"] == "NOT_ATTACHED");
}

#[tokio::test]
async fn mock_pty_echoes_input() {
    let url = start_test_server("echo").await;
    let mut ws = connect(&url).await;
    let _hello = recv_json(&mut ws).await;

    ws.send(Message::Text(json!({ "type": "session.create" }).to_string().into()))
        .await
        .unwrap();
    let created = recv_type(&mut ws, "session.created").await;
    let session_id = created["session"]["sessionId"].as_str().unwrap().to_string();

    let welcome = loop {
        let msg = recv_json(&mut ws).await;
        if msg["type"] == "term.out" {
            break msg;
        }
    };
    assert!(welcome["data"]
        .as_str()
        .unwrap()
        .starts_with("Welcome to Copilot Terminal"));

    ws.send(Message::Text(
        json!({ "type": "term.in", "sessionId": session_id, "data": "hi" }).to_string().into(),
    ))
    .await
    .unwrap();

    let echoed = loop {
        let msg = recv_json(&mut ws).await;
        if msg["type"] == "term.out" {
            break msg;
        }
    };
    assert!(echoed["data"].as_str().unwrap().ends_with("hi\r\n$ "));
}
