//! PTY process ownership (spec §4.5): one child process behind a
//! pseudoterminal pair, exposed through a narrow spawn/read/write/resize/
//! terminate/stop API. Two implementations share this surface — a real
//! `portable-pty`-backed one and a mock used for testability (§4.5 "mock
//! variant") — selected behind an enum the way `connection::FrameReader`
//! dispatches over transports in the teacher repo.

mod mock;
mod real;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use mock::MockPty;
pub use real::RealPty;

pub type OutputCallback = Arc<dyn Fn(Uuid, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ExitCallback = Arc<dyn Fn(Uuid, Option<i32>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Why `spawn` failed. Kept as a distinct shape so the "executable not
/// found" case can be reported with its own message, per spec §4.5.
#[derive(Debug, Clone)]
pub enum SpawnFailure {
    ExecutableNotFound(String),
    Other(String),
}

impl fmt::Display for SpawnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnFailure::ExecutableNotFound(path) => write!(f, "Executable not found: {path}"),
            SpawnFailure::Other(msg) => write!(f, "{msg}"),
        }
    }
}

/// One child process behind a PTY. Not `Clone`: callers must not retain the
/// underlying handle outside the owning `Session` (spec §5).
pub enum PtyProcess {
    Real(RealPty),
    Mock(MockPty),
}

impl PtyProcess {
    pub fn new_real(session_id: Uuid, on_output: OutputCallback, on_exit: ExitCallback) -> Self {
        PtyProcess::Real(RealPty::new(session_id, on_output, on_exit))
    }

    pub fn new_mock(session_id: Uuid, on_output: OutputCallback, on_exit: ExitCallback) -> Self {
        PtyProcess::Mock(MockPty::new(session_id, on_output, on_exit))
    }

    /// Spawns `executable` with `workspace` as CWD and the given initial
    /// size. Creates `workspace` if absent.
    pub fn spawn(
        &mut self,
        executable: &str,
        workspace: &std::path::Path,
        cols: u16,
        rows: u16,
    ) -> Result<(), SpawnFailure> {
        match self {
            PtyProcess::Real(p) => p.spawn(executable, workspace, cols, rows),
            PtyProcess::Mock(p) => p.spawn(executable, workspace, cols, rows),
        }
    }

    /// Starts the single producer read task. No-op if not running.
    pub fn start_read_pump(&mut self) {
        match self {
            PtyProcess::Real(p) => p.start_read_pump(),
            PtyProcess::Mock(p) => p.start_read_pump(),
        }
    }

    pub fn write(&self, data: &[u8]) {
        match self {
            PtyProcess::Real(p) => p.write(data),
            PtyProcess::Mock(p) => p.write(data),
        }
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> bool {
        match self {
            PtyProcess::Real(p) => p.resize(cols, rows),
            PtyProcess::Mock(p) => p.resize(cols, rows),
        }
    }

    pub fn terminate(&mut self) {
        match self {
            PtyProcess::Real(p) => p.terminate(),
            PtyProcess::Mock(p) => p.terminate(),
        }
    }

    /// Composite shutdown: terminate, then cancel and await the read pump.
    pub async fn stop(&mut self) {
        match self {
            PtyProcess::Real(p) => p.stop().await,
            PtyProcess::Mock(p) => p.stop().await,
        }
    }

    /// Signals termination and hands back the read-pump join handle without
    /// blocking, so a caller holding an outer lock can release it before
    /// awaiting the handle (the pump's own exit callback may need that lock).
    pub fn take_consumer_task(&mut self) -> Option<JoinHandle<()>> {
        match self {
            PtyProcess::Real(p) => p.take_consumer_task(),
            PtyProcess::Mock(p) => p.take_consumer_task(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            PtyProcess::Real(p) => p.pid(),
            PtyProcess::Mock(p) => p.pid(),
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            PtyProcess::Real(p) => p.is_running(),
            PtyProcess::Mock(p) => p.is_running(),
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            PtyProcess::Real(p) => p.exit_code(),
            PtyProcess::Mock(p) => p.exit_code(),
        }
    }

    pub fn cols(&self) -> u16 {
        match self {
            PtyProcess::Real(p) => p.cols(),
            PtyProcess::Mock(p) => p.cols(),
        }
    }

    pub fn rows(&self) -> u16 {
        match self {
            PtyProcess::Real(p) => p.rows(),
            PtyProcess::Mock(p) => p.rows(),
        }
    }
}
