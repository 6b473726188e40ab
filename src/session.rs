//! Session lifecycle and the process-wide manager (spec §4.6). The manager
//! owns the in-memory session table behind a single `tokio::sync::Mutex`
//! that serializes lifecycle-mutating operations, plus a registry of
//! per-client output/exit callbacks that the channel endpoint installs on
//! attach and tears down on disconnect.

use std::collections::hash_map::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::{new_id, now_iso};
use crate::config::Config;
use crate::error::{ErrorCode, ManagerError, ManagerResult};
use crate::paths;
use crate::protocol::{SessionIndexEntry, SessionInfo, SpawnError};
use crate::pty::{ExitCallback as PtyExitCallback, OutputCallback as PtyOutputCallback, PtyProcess};
use crate::store::index::IndexStore;
use crate::store::meta::{MetaStore, SessionMeta};
use crate::store::transcript::TranscriptStore;

pub type ClientOutputCallback = Arc<dyn Fn(Uuid, String) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ClientExitCallback = Arc<dyn Fn(Uuid, Option<i32>) -> BoxFuture<'static, ()> + Send + Sync>;

struct ClientCallbacks {
    on_output: ClientOutputCallback,
    on_exit: ClientExitCallback,
}

/// One PTY-backed terminal session: its process, cached metadata, and the
/// set of clients currently attached to it.
pub struct Session {
    pub session_id: Uuid,
    pty: PtyProcess,
    pub meta: SessionMeta,
    pub attached_clients: HashSet<Uuid>,
}

impl Session {
    /// `SessionInfo` mirrors `meta` plus the live fields the PTY tracks.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id,
            status: self.meta.status.clone(),
            created_at: self.meta.created_at.clone(),
            last_activity_at: self.meta.last_activity_at.clone(),
            workspace_path: self.meta.workspace_path.clone(),
            pid: self.pty.pid(),
            cols: self.pty.cols(),
            rows: self.pty.rows(),
            exit_code: self.pty.exit_code(),
            copilot_path: self.meta.copilot_path.clone(),
            error: self.meta.error.clone(),
        }
    }
}

/// Process-wide owner of every live session. Constructed once at startup and
/// shared behind an `Arc` so PTY callbacks can hold a handle back to it.
pub struct SessionManager {
    data_dir: PathBuf,
    config: Arc<Config>,
    index: IndexStore,
    meta: MetaStore,
    transcript: Arc<TranscriptStore>,
    sessions: Mutex<HashMap<Uuid, Session>>,
    clients: DashMap<Uuid, ClientCallbacks>,
}

impl SessionManager {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        let data_dir = config.data_dir.clone();
        Arc::new(Self {
            index: IndexStore::new(&data_dir),
            meta: MetaStore::new(&data_dir),
            transcript: Arc::new(TranscriptStore::new(&data_dir)),
            data_dir,
            config,
            sessions: Mutex::new(HashMap::new()),
            clients: DashMap::new(),
        })
    }

    /// Registers the channel endpoint's output/exit callbacks for `client_id`.
    /// Called on connect; paired with `unregister_client` on disconnect.
    pub fn register_client(
        &self,
        client_id: Uuid,
        on_output: ClientOutputCallback,
        on_exit: ClientExitCallback,
    ) {
        self.clients.insert(client_id, ClientCallbacks { on_output, on_exit });
    }

    pub fn unregister_client(&self, client_id: Uuid) {
        self.clients.remove(&client_id);
    }

    /// Steps per spec §4.6: cap check, directories, transcript init, spawn,
    /// then persist meta/index/lifecycle and insert into the table.
    pub async fn create_session(self: &Arc<Self>, copilot_path: Option<String>) -> ManagerResult<SessionInfo> {
        let mut sessions = self.sessions.lock().await;
        let running = sessions.values().filter(|s| s.pty.is_running()).count();
        if running >= self.config.max_sessions {
            return Err(ManagerError::new(
                ErrorCode::MaxSessionsReached,
                format!("Maximum running sessions ({}) reached.", self.config.max_sessions),
            ));
        }

        let session_id = new_id();
        let workspace = paths::ensure_session_directories(&self.data_dir, session_id).map_err(|e| {
            ManagerError::new(ErrorCode::InternalError, format!("creating session directories: {e}"))
        })?;
        let workspace_path = workspace.to_string_lossy().into_owned();

        if let Err(e) = self.transcript.init_session(session_id) {
            return Err(ManagerError::new(ErrorCode::InternalError, format!("initializing transcript: {e}")));
        }

        let executable = copilot_path.unwrap_or_else(|| self.config.copilot_path.clone());
        let output_cb: PtyOutputCallback = self.output_trampoline();
        let exit_cb: PtyExitCallback = self.exit_trampoline();
        let mut pty = if self.config.use_mock_pty {
            PtyProcess::new_mock(session_id, output_cb, exit_cb)
        } else {
            PtyProcess::new_real(session_id, output_cb, exit_cb)
        };

        let cols = self.config.initial_cols;
        let rows = self.config.initial_rows;

        match pty.spawn(&executable, &workspace, cols, rows) {
            Ok(()) => {
                let meta = self
                    .meta
                    .create(session_id, workspace_path.clone(), executable.clone(), pty.pid(), cols, rows, None)
                    .map_err(|e| ManagerError::new(ErrorCode::InternalError, format!("persisting meta: {e}")))?;
                self.index
                    .add_session(SessionIndexEntry {
                        session_id,
                        status: "running".to_string(),
                        created_at: meta.created_at.clone(),
                        last_activity_at: meta.last_activity_at.clone(),
                        name: None,
                    })
                    .map_err(|e| ManagerError::new(ErrorCode::InternalError, format!("persisting index: {e}")))?;

                pty.start_read_pump();

                let session = Session {
                    session_id,
                    pty,
                    meta,
                    attached_clients: HashSet::new(),
                };
                let info = session.info();
                sessions.insert(session_id, session);
                drop(sessions);

                self.transcript
                    .append_lifecycle(session_id, "created", serde_json::json!({ "pid": info.pid }))
                    .await;
                info!(%session_id, pid = ?info.pid, "session created");
                Ok(info)
            }
            Err(failure) => {
                drop(sessions);
                let spawn_error = SpawnError {
                    code: "SPAWN_FAILED".to_string(),
                    message: failure.to_string(),
                };
                let meta = self
                    .meta
                    .create(
                        session_id,
                        workspace_path,
                        executable.clone(),
                        None,
                        cols,
                        rows,
                        Some(spawn_error.clone()),
                    )
                    .map_err(|e| ManagerError::new(ErrorCode::InternalError, format!("persisting meta: {e}")))?;
                if let Err(e) = self.index.add_session(SessionIndexEntry {
                    session_id,
                    status: "exited".to_string(),
                    created_at: meta.created_at.clone(),
                    last_activity_at: meta.last_activity_at.clone(),
                    name: None,
                }) {
                    error!(%session_id, %e, "failed to persist index entry for failed spawn");
                }
                self.transcript
                    .append_lifecycle(session_id, "spawn_failed", serde_json::json!({ "message": spawn_error.message }))
                    .await;
                warn!(%session_id, %executable, error = %failure, "session spawn failed");
                Err(ManagerError::new(
                    ErrorCode::SpawnFailed,
                    format!("Failed to start copilot.exe: {failure}"),
                ))
            }
        }
    }

    pub async fn get_session_info(&self, id: Uuid) -> Option<SessionInfo> {
        let sessions = self.sessions.lock().await;
        sessions.get(&id).map(Session::info)
    }

    /// Served from the durable index, not the in-memory table, so exited and
    /// never-spawned sessions still show up (spec §4.6).
    pub fn list_sessions(&self) -> Vec<SessionIndexEntry> {
        self.index.get_all_sessions()
    }

    pub async fn attach_session(&self, id: Uuid, client_id: Uuid) -> ManagerResult<String> {
        let status = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.get_mut(&id).ok_or_else(|| ManagerError::session_not_found(id))?;
            session.attached_clients.insert(client_id);
            session.meta.status.clone()
        };
        self.transcript
            .append_lifecycle(id, "attached", serde_json::json!({ "clientId": client_id }))
            .await;
        Ok(status)
    }

    /// Set-difference only; safe to call on an unknown id.
    pub async fn detach_session(&self, id: Uuid, client_id: Uuid) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(&id) {
            session.attached_clients.remove(&client_id);
        }
    }

    pub async fn detach_all_sessions(&self, client_id: Uuid) {
        let mut sessions = self.sessions.lock().await;
        for session in sessions.values_mut() {
            session.attached_clients.remove(&client_id);
        }
    }

    /// Stops the PTY and persists the exit, returning the exit code. Does
    /// not itself push a client-visible `session.exited`: that is the PTY
    /// exit trampoline's job, triggered by the same kill-then-exit sequence
    /// this starts. The read-pump join happens with the table lock released
    /// so the trampoline can acquire it in turn.
    pub async fn terminate_session(&self, id: Uuid) -> ManagerResult<Option<i32>> {
        let join_handle = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.get_mut(&id).ok_or_else(|| ManagerError::session_not_found(id))?;
            session.pty.terminate();
            session.pty.take_consumer_task()
        };
        if let Some(handle) = join_handle {
            let _ = handle.await;
        }

        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&id).ok_or_else(|| ManagerError::session_not_found(id))?;
        let exit_code = session.pty.exit_code();
        session.meta.status = "exited".to_string();
        session.meta.exit_code = exit_code;
        session.meta.last_activity_at = now_iso();
        drop(sessions);

        if let Err(e) = self.meta.update_status(id, "exited", exit_code) {
            error!(%id, %e, "failed to persist terminated status");
        }
        if let Err(e) = self.index.update_session_status(id, "exited", &now_iso()) {
            error!(%id, %e, "failed to update index on terminate");
        }
        self.transcript
            .append_lifecycle(id, "terminated", serde_json::json!({ "exitCode": exit_code }))
            .await;
        Ok(exit_code)
    }

    pub async fn send_input(&self, id: Uuid, data: &str) -> ManagerResult<()> {
        if data.chars().count() > self.config.max_input_chars_per_message {
            return Err(ManagerError::new(
                ErrorCode::InputTooLarge,
                format!(
                    "Input exceeds {} characters.",
                    self.config.max_input_chars_per_message
                ),
            ));
        }

        {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.get_mut(&id).ok_or_else(|| ManagerError::session_not_found(id))?;
            if !session.pty.is_running() {
                return Err(ManagerError::new(
                    ErrorCode::SessionNotRunning,
                    "Session is not running",
                ));
            }
            session.pty.write(data.as_bytes());
        }

        self.transcript.append_input_nonblocking(id, data);
        if let Err(e) = self.meta.update_activity(id) {
            error!(%id, %e, "failed to persist activity timestamp");
        }
        Ok(())
    }

    pub async fn resize_session(&self, id: Uuid, cols: u16, rows: u16) -> ManagerResult<()> {
        let (min_cols, max_cols, min_rows, max_rows) = (
            self.config.min_cols,
            self.config.max_cols,
            self.config.min_rows,
            self.config.max_rows,
        );
        if cols < min_cols || cols > max_cols || rows < min_rows || rows > max_rows {
            return Err(ManagerError::new(
                ErrorCode::InvalidResize,
                format!("cols must be {min_cols}-{max_cols} and rows must be {min_rows}-{max_rows}."),
            ));
        }

        {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.get_mut(&id).ok_or_else(|| ManagerError::session_not_found(id))?;
            if !session.pty.resize(cols, rows) {
                return Err(ManagerError::new(ErrorCode::ResizeFailed, "Failed to resize terminal."));
            }
        }

        if let Err(e) = self.meta.update_dimensions(id, cols, rows) {
            error!(%id, %e, "failed to persist resized dimensions");
        }
        self.transcript.append_resize(id, cols, rows).await;
        Ok(())
    }

    /// `session.rename` only ever touches the index (spec §9: `meta.json`
    /// carries no name field).
    pub fn rename_session(&self, id: Uuid, name: &str) -> ManagerResult<()> {
        match self.index.update_session_name(id, name) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ManagerError::session_not_found(id)),
            Err(e) => Err(ManagerError::new(ErrorCode::InternalError, format!("persisting rename: {e}"))),
        }
    }

    /// Best-effort: terminates every currently known session, logging (not
    /// propagating) individual failures, then clears the table.
    pub async fn shutdown(&self) {
        let ids: Vec<Uuid> = {
            let sessions = self.sessions.lock().await;
            sessions.keys().copied().collect()
        };
        for id in ids {
            if let Err(e) = self.terminate_session(id).await {
                warn!(%id, error = %e.message, "error terminating session during shutdown");
            }
        }
        self.sessions.lock().await.clear();
    }

    fn output_trampoline(self: &Arc<Self>) -> PtyOutputCallback {
        let manager = Arc::clone(self);
        Arc::new(move |session_id: Uuid, data: Vec<u8>| {
            let manager = Arc::clone(&manager);
            Box::pin(async move { manager.handle_pty_output(session_id, data).await })
        })
    }

    fn exit_trampoline(self: &Arc<Self>) -> PtyExitCallback {
        let manager = Arc::clone(self);
        Arc::new(move |session_id: Uuid, exit_code: Option<i32>| {
            let manager = Arc::clone(&manager);
            Box::pin(async move { manager.handle_pty_exit(session_id, exit_code).await })
        })
    }

    /// Appends to the transcript, bumps `lastActivityAt`, and fans out to
    /// every currently attached client in order. Invoked from the single
    /// PTY consumer task, so per-client delivery order matches read order.
    async fn handle_pty_output(&self, session_id: Uuid, data: Vec<u8>) {
        let text = String::from_utf8_lossy(&data).into_owned();
        let attached: Vec<Uuid> = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&session_id) {
                Some(session) => {
                    session.meta.last_activity_at = now_iso();
                    session.attached_clients.iter().copied().collect()
                }
                None => return,
            }
        };

        self.transcript.append_output_nonblocking(session_id, &text);
        if let Err(e) = self.meta.update_activity(session_id) {
            error!(%session_id, %e, "failed to persist activity timestamp");
        }

        for client_id in attached {
            if let Some(cb) = self.clients.get(&client_id) {
                (cb.on_output)(session_id, text.clone()).await;
            }
        }
    }

    async fn handle_pty_exit(&self, session_id: Uuid, exit_code: Option<i32>) {
        let attached: Vec<Uuid> = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(&session_id) {
                Some(session) => {
                    session.meta.status = "exited".to_string();
                    session.meta.exit_code = exit_code;
                    session.meta.last_activity_at = now_iso();
                    session.attached_clients.iter().copied().collect()
                }
                None => return,
            }
        };

        if let Err(e) = self.meta.update_status(session_id, "exited", exit_code) {
            error!(%session_id, %e, "failed to persist exit status");
        }
        if let Err(e) = self.index.update_session_status(session_id, "exited", &now_iso()) {
            error!(%session_id, %e, "failed to update index on exit");
        }
        self.transcript
            .append_lifecycle(session_id, "exited", serde_json::json!({ "exitCode": exit_code }))
            .await;
        info!(%session_id, ?exit_code, "session exited");

        for client_id in attached {
            if let Some(cb) = self.clients.get(&client_id) {
                (cb.on_exit)(session_id, exit_code).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::sync::Mutex as AsyncMutex;

    fn test_config(data_dir: PathBuf) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
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

    #[tokio::test]
    async fn create_session_marks_running_and_lands_in_index() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new(Arc::new(test_config(dir.path().to_path_buf())));

        let info = manager.create_session(None).await.unwrap();
        assert_eq!(info.status, "running");
        assert!(info.workspace_path.contains(&info.session_id.to_string()));

        let listed = manager.list_sessions();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, info.session_id);
        assert_eq!(listed[0].status, "running");
    }

    #[tokio::test]
    async fn max_sessions_reached_rejects_further_creates() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf());
        config.max_sessions = 1;
        let manager = SessionManager::new(Arc::new(config));

        manager.create_session(None).await.unwrap();
        let err = manager.create_session(None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::MaxSessionsReached);
    }

    #[tokio::test]
    async fn attach_unknown_session_is_not_found() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new(Arc::new(test_config(dir.path().to_path_buf())));
        let err = manager.attach_session(Uuid::new_v4(), Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionNotFound);
    }

    #[tokio::test]
    async fn send_input_rejects_oversized_payload() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf());
        config.max_input_chars_per_message = 4;
        let manager = SessionManager::new(Arc::new(config));

        let info = manager.create_session(None).await.unwrap();
        let err = manager.send_input(info.session_id, "too long").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InputTooLarge);
    }

    #[tokio::test]
    async fn resize_out_of_bounds_is_rejected_and_dims_unchanged() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new(Arc::new(test_config(dir.path().to_path_buf())));
        let info = manager.create_session(None).await.unwrap();

        let err = manager.resize_session(info.session_id, 10, 24).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidResize);

        let reloaded = manager.get_session_info(info.session_id).await.unwrap();
        assert_eq!(reloaded.cols, 120);
    }

    #[tokio::test]
    async fn terminate_session_persists_exit_and_marks_not_running() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new(Arc::new(test_config(dir.path().to_path_buf())));
        let info = manager.create_session(None).await.unwrap();

        let exit_code = manager.terminate_session(info.session_id).await.unwrap();
        assert_eq!(exit_code, Some(0));

        let reloaded = manager.get_session_info(info.session_id).await.unwrap();
        assert_eq!(reloaded.status, "exited");

        let err = manager.send_input(info.session_id, "x").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionNotRunning);
    }

    #[tokio::test]
    async fn attached_client_receives_mock_welcome_output() {
        let dir = tempdir().unwrap();
        let manager = SessionManager::new(Arc::new(test_config(dir.path().to_path_buf())));
        let info = manager.create_session(None).await.unwrap();

        let client_id = Uuid::new_v4();
        let received: Arc<AsyncMutex<Vec<String>>> = Arc::new(AsyncMutex::new(Vec::new()));
        let received_clone = received.clone();
        manager.register_client(
            client_id,
            Arc::new(move |_sid, data| {
                let received = received_clone.clone();
                Box::pin(async move { received.lock().await.push(data) })
            }),
            Arc::new(|_sid, _code| Box::pin(async {})),
        );
        manager.attach_session(info.session_id, client_id).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let seen = received.lock().await;
        assert!(seen.iter().any(|line| line.starts_with("Welcome to Copilot Terminal")));
    }
}
