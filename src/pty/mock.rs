use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use super::{ExitCallback, OutputCallback, SpawnFailure};

const MOCK_PID: u32 = 99999;
const MOCK_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// A PTY stand-in used when no real pseudoterminal is available (spec §4.5
/// "mock variant"): spawn always succeeds with a fixed PID, the read pump
/// sends a welcome line then echoes buffered writes, and `terminate` exits
/// with code 0. Selected at runtime by `Config.use_mock_pty` as an explicit
/// testability seam.
pub struct MockPty {
    session_id: Uuid,
    on_output: OutputCallback,
    on_exit: ExitCallback,

    pid: Option<u32>,
    cols: u16,
    rows: u16,
    running: Arc<AtomicBool>,
    exit_code: Arc<std::sync::Mutex<Option<i32>>>,

    input_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    read_task: Option<JoinHandle<()>>,
}

impl MockPty {
    pub fn new(session_id: Uuid, on_output: OutputCallback, on_exit: ExitCallback) -> Self {
        Self {
            session_id,
            on_output,
            on_exit,
            pid: None,
            cols: 0,
            rows: 0,
            running: Arc::new(AtomicBool::new(false)),
            exit_code: Arc::new(std::sync::Mutex::new(None)),
            input_tx: None,
            read_task: None,
        }
    }

    pub fn spawn(
        &mut self,
        _executable: &str,
        workspace: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<(), SpawnFailure> {
        std::fs::create_dir_all(workspace)
            .map_err(|e| SpawnFailure::Other(format!("creating workspace: {e}")))?;
        self.pid = Some(MOCK_PID);
        self.cols = cols;
        self.rows = rows;
        self.running.store(true, Ordering::SeqCst);
        info!(session_id = %self.session_id, pid = MOCK_PID, "spawned mock PTY process");
        Ok(())
    }

    pub fn start_read_pump(&mut self) {
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.input_tx = Some(input_tx);

        let session_id = self.session_id;
        let on_output = self.on_output.clone();
        let on_exit = self.on_exit.clone();
        let running = self.running.clone();
        let exit_code = self.exit_code.clone();
        self.read_task = Some(tokio::spawn(async move {
            (on_output)(
                session_id,
                b"Welcome to Copilot Terminal (Mock Mode)\r\n$ ".to_vec(),
            )
            .await;

            loop {
                tokio::select! {
                    biased;
                    maybe_input = input_rx.recv() => {
                        match maybe_input {
                            Some(data) => {
                                let mut echoed = data;
                                echoed.extend_from_slice(b"\r\n$ ");
                                (on_output)(session_id, echoed).await;
                            }
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep(MOCK_POLL_INTERVAL) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                }
            }

            let code = *exit_code.lock().unwrap();
            (on_exit)(session_id, code).await;
        }));
    }

    pub fn write(&self, data: &[u8]) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = &self.input_tx {
            let _ = tx.send(data.to_vec());
        }
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        self.cols = cols;
        self.rows = rows;
        true
    }

    pub fn terminate(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        *self.exit_code.lock().unwrap() = Some(0);
    }

    pub async fn stop(&mut self) {
        if let Some(task) = self.take_consumer_task() {
            let _ = task.await;
        }
    }

    /// Detaches the read-pump join handle; also drops the input sender so
    /// the loop observes a closed channel promptly instead of waiting for
    /// its next poll tick.
    pub fn take_consumer_task(&mut self) -> Option<JoinHandle<()>> {
        self.terminate();
        self.input_tx = None;
        self.read_task.take()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap()
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }
}
