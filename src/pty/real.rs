use std::io::Read as _;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{ExitCallback, OutputCallback, SpawnFailure};

const READ_CHUNK_BYTES: usize = 4096;
const EMPTY_READ_BACKOFF: std::time::Duration = std::time::Duration::from_millis(10);

enum PumpMsg {
    Data(Vec<u8>),
    Exit(Option<i32>),
}

/// `portable-pty`-backed child process behind a real pseudoterminal.
pub struct RealPty {
    session_id: Uuid,
    on_output: OutputCallback,
    on_exit: ExitCallback,

    pid: Option<u32>,
    cols: u16,
    rows: u16,
    running: Arc<AtomicBool>,
    exit_code: Arc<Mutex<Option<i32>>>,

    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Mutex<Box<dyn std::io::Write + Send>>>,
    reader: Option<Box<dyn std::io::Read + Send>>,
    child: Option<Arc<Mutex<Box<dyn Child + Send + Sync>>>>,
    consumer_task: Option<JoinHandle<()>>,
}

impl RealPty {
    pub fn new(session_id: Uuid, on_output: OutputCallback, on_exit: ExitCallback) -> Self {
        Self {
            session_id,
            on_output,
            on_exit,
            pid: None,
            cols: 0,
            rows: 0,
            running: Arc::new(AtomicBool::new(false)),
            exit_code: Arc::new(Mutex::new(None)),
            master: None,
            writer: None,
            reader: None,
            child: None,
            consumer_task: None,
        }
    }

    pub fn spawn(
        &mut self,
        executable: &str,
        workspace: &Path,
        cols: u16,
        rows: u16,
    ) -> Result<(), SpawnFailure> {
        std::fs::create_dir_all(workspace)
            .map_err(|e| SpawnFailure::Other(format!("creating workspace: {e}")))?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SpawnFailure::Other(e.to_string()))?;

        let mut cmd = CommandBuilder::new(executable);
        cmd.cwd(workspace);

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
                if io_err.kind() == std::io::ErrorKind::NotFound {
                    return SpawnFailure::ExecutableNotFound(executable.to_string());
                }
            }
            SpawnFailure::Other(e.to_string())
        })?;
        let pid = child.process_id();
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SpawnFailure::Other(format!("cloning PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SpawnFailure::Other(format!("taking PTY writer: {e}")))?;

        self.pid = pid;
        self.cols = cols;
        self.rows = rows;
        self.running.store(true, Ordering::SeqCst);
        self.master = Some(pair.master);
        self.writer = Some(Mutex::new(writer));
        self.child = Some(Arc::new(Mutex::new(child)));

        info!(session_id = %self.session_id, pid, %executable, "spawned PTY process");
        self.reader = Some(reader);
        Ok(())
    }

    pub fn start_read_pump(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        let Some(child) = self.child.clone() else {
            return;
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<PumpMsg>();
        let session_id = self.session_id;

        std::thread::spawn(move || blocking_read_loop(session_id, reader, child, tx));

        let running = self.running.clone();
        let exit_code_state = self.exit_code.clone();
        let on_output = self.on_output.clone();
        let on_exit = self.on_exit.clone();
        self.consumer_task = Some(tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    PumpMsg::Data(bytes) => {
                        (on_output)(session_id, bytes).await;
                    }
                    PumpMsg::Exit(code) => {
                        running.store(false, Ordering::SeqCst);
                        *exit_code_state.lock().unwrap() = code;
                        (on_exit)(session_id, code).await;
                        break;
                    }
                }
            }
        }));
    }

    pub fn write(&self, data: &[u8]) {
        if !self.running.load(Ordering::SeqCst) {
            warn!(session_id = %self.session_id, "attempted to write to non-running PTY");
            return;
        }
        if let Some(writer) = &self.writer {
            let mut guard = writer.lock().unwrap();
            if let Err(e) = guard.write_all(data) {
                error!(session_id = %self.session_id, %e, "PTY write error");
            }
            let _ = guard.flush();
        }
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let Some(master) = &self.master else { return false };
        match master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            Ok(()) => {
                self.cols = cols;
                self.rows = rows;
                true
            }
            Err(e) => {
                error!(session_id = %self.session_id, %e, "PTY resize error");
                false
            }
        }
    }

    pub fn terminate(&mut self) {
        if let Some(child) = &self.child {
            let mut guard = child.lock().unwrap();
            let _ = guard.kill();
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn stop(&mut self) {
        self.terminate();
        if let Some(task) = self.take_consumer_task() {
            let _ = task.await;
        }
        self.master = None;
    }

    /// Detaches the read-pump join handle so a caller can await it without
    /// holding a lock the pump's own exit callback might need to acquire.
    pub fn take_consumer_task(&mut self) -> Option<JoinHandle<()>> {
        self.consumer_task.take()
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

fn blocking_read_loop(
    session_id: Uuid,
    mut reader: Box<dyn std::io::Read + Send>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    tx: mpsc::UnboundedSender<PumpMsg>,
) {
    let mut buf = [0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(PumpMsg::Data(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(EMPTY_READ_BACKOFF);
            }
            Err(e) => {
                error!(%session_id, %e, "PTY read error");
                break;
            }
        }
    }

    let exit_code = {
        let mut guard = child.lock().unwrap();
        match guard.wait() {
            Ok(status) => Some(status.exit_code() as i32),
            Err(e) => {
                error!(%session_id, %e, "failed to reap PTY child");
                None
            }
        }
    };
    info!(%session_id, ?exit_code, "PTY process exited");
    let _ = tx.send(PumpMsg::Exit(exit_code));
}
