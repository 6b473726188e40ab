//! Append-only per-session event log, `DATA_DIR/sessions/{id}/transcript.jsonl`
//! (spec §4.4). A single background writer task per session serializes
//! appends so ordering is preserved regardless of which path (blocking or
//! non-blocking) accepted the event.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::clock::now_iso;

#[derive(Serialize)]
struct TranscriptEvent<'a> {
    ts: String,
    #[serde(rename = "sessionId")]
    session_id: Uuid,
    seq: u64,
    #[serde(flatten)]
    body: EventBody<'a>,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum EventBody<'a> {
    #[serde(rename = "out")]
    Out { data: &'a str },
    #[serde(rename = "in")]
    In { data: &'a str },
    #[serde(rename = "resize")]
    Resize { cols: u16, rows: u16 },
    #[serde(rename = "lifecycle")]
    Lifecycle {
        event: &'a str,
        detail: serde_json::Value,
    },
}

enum WriterMsg {
    Line(String, Option<oneshot::Sender<()>>),
}

struct SessionWriter {
    tx: mpsc::UnboundedSender<WriterMsg>,
    seq: AtomicU64,
}

/// Manages transcript append tasks for every live session.
#[derive(Default)]
pub struct TranscriptStore {
    data_dir: PathBuf,
    writers: DashMap<Uuid, Arc<SessionWriter>>,
}

impl TranscriptStore {
    pub fn new(data_dir: &std::path::Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            writers: DashMap::new(),
        }
    }

    /// Reset the sequence counter, ensure the file exists empty, and spawn
    /// the session's background writer task.
    pub fn init_session(&self, id: Uuid) -> std::io::Result<()> {
        let path = crate::paths::transcript_path(&self.data_dir, id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new().create(true).write(true).open(&path)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(path, rx));
        self.writers.insert(
            id,
            Arc::new(SessionWriter {
                tx,
                seq: AtomicU64::new(0),
            }),
        );
        Ok(())
    }

    fn next_seq(&self, id: Uuid) -> Option<(Arc<SessionWriter>, u64)> {
        let writer = self.writers.get(&id)?.clone();
        let seq = writer.seq.fetch_add(1, Ordering::SeqCst) + 1;
        Some((writer, seq))
    }

    fn enqueue(&self, id: Uuid, body: EventBody<'_>, ack: Option<oneshot::Sender<()>>) {
        let Some((writer, seq)) = self.next_seq(id) else {
            tracing::warn!(%id, "transcript append with no initialized writer, dropping");
            return;
        };
        let event = TranscriptEvent {
            ts: now_iso(),
            session_id: id,
            seq,
            body,
        };
        match serde_json::to_string(&event) {
            Ok(line) => {
                if writer.tx.send(WriterMsg::Line(line, ack)).is_err() {
                    tracing::warn!(%id, "transcript writer task gone, dropping event");
                }
            }
            Err(e) => {
                tracing::error!(%id, %e, "failed to serialize transcript event");
            }
        }
    }

    /// Fire-and-forget append for the hot PTY-output path: never blocks the
    /// PTY read pump on disk I/O.
    pub fn append_output_nonblocking(&self, id: Uuid, data: &str) {
        self.enqueue(id, EventBody::Out { data }, None);
    }

    /// Append and wait for the write to land, for paths where the caller
    /// wants a durability signal before proceeding (best-effort: a write
    /// failure is logged by the writer task, not surfaced here).
    pub async fn append_input(&self, id: Uuid, data: &str) {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(id, EventBody::In { data }, Some(ack_tx));
        let _ = ack_rx.await;
    }

    /// Fire-and-forget counterpart of `append_input`, used by `send_input`'s
    /// hot path so a slow disk never stalls the caller.
    pub fn append_input_nonblocking(&self, id: Uuid, data: &str) {
        self.enqueue(id, EventBody::In { data }, None);
    }

    pub async fn append_resize(&self, id: Uuid, cols: u16, rows: u16) {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(id, EventBody::Resize { cols, rows }, Some(ack_tx));
        let _ = ack_rx.await;
    }

    pub async fn append_lifecycle(&self, id: Uuid, event: &str, detail: serde_json::Value) {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(id, EventBody::Lifecycle { event, detail }, Some(ack_tx));
        let _ = ack_rx.await;
    }
}

async fn writer_loop(path: PathBuf, mut rx: mpsc::UnboundedReceiver<WriterMsg>) {
    let mut file = match std::fs::OpenOptions::new().append(true).open(&path) {
        Ok(f) => f,
        Err(e) => {
            tracing::error!(?path, %e, "failed to open transcript file for appending");
            return;
        }
    };

    while let Some(WriterMsg::Line(mut line, ack)) = rx.recv().await {
        line.push('\n');
        if let Err(e) = file.write_all(line.as_bytes()) {
            tracing::error!(?path, %e, "transcript append failed");
        }
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn read_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
        // Give the background writer a beat to flush.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let content = std::fs::read_to_string(path).unwrap_or_default();
        content
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn seq_starts_at_one_and_increments() {
        let dir = tempdir().unwrap();
        let store = TranscriptStore::new(dir.path());
        let id = Uuid::new_v4();
        store.init_session(id).unwrap();

        store.append_input(id, "a").await;
        store.append_input(id, "b").await;
        store.append_lifecycle(id, "created", serde_json::json!({})).await;

        let path = crate::paths::transcript_path(dir.path(), id);
        let events = read_lines(&path).await;
        let seqs: Vec<u64> = events.iter().map(|e| e["seq"].as_u64().unwrap()).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn reinit_resets_sequence() {
        let dir = tempdir().unwrap();
        let store = TranscriptStore::new(dir.path());
        let id = Uuid::new_v4();
        store.init_session(id).unwrap();
        store.append_input(id, "a").await;

        store.init_session(id).unwrap();
        store.append_input(id, "b").await;

        let path = crate::paths::transcript_path(dir.path(), id);
        let events = read_lines(&path).await;
        // second init truncated neither file nor counter history; the new
        // writer starts its own counter at 1 again.
        assert_eq!(events.last().unwrap()["seq"].as_u64().unwrap(), 1);
    }

    #[tokio::test]
    async fn output_events_carry_data_field() {
        let dir = tempdir().unwrap();
        let store = TranscriptStore::new(dir.path());
        let id = Uuid::new_v4();
        store.init_session(id).unwrap();
        store.append_output_nonblocking(id, "hello");

        let path = crate::paths::transcript_path(dir.path(), id);
        let events = read_lines(&path).await;
        assert_eq!(events[0]["type"], "out");
        assert_eq!(events[0]["data"], "hello");
    }
}
