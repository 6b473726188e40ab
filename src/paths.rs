//! Derivation and validation of the on-disk `DATA_DIR/sessions/{id}/...` layout.

use std::path::{Path, PathBuf};

use uuid::Uuid;

/// `DATA_DIR/sessions`.
pub fn sessions_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("sessions")
}

/// `DATA_DIR/sessions/{id}`.
pub fn session_dir(data_dir: &Path, id: Uuid) -> PathBuf {
    sessions_dir(data_dir).join(id.to_string())
}

/// `DATA_DIR/sessions/{id}/workspace`.
pub fn workspace_path(data_dir: &Path, id: Uuid) -> PathBuf {
    session_dir(data_dir, id).join("workspace")
}

/// `DATA_DIR/sessions/{id}/meta.json`.
pub fn meta_path(data_dir: &Path, id: Uuid) -> PathBuf {
    session_dir(data_dir, id).join("meta.json")
}

/// `DATA_DIR/sessions/{id}/transcript.jsonl`.
pub fn transcript_path(data_dir: &Path, id: Uuid) -> PathBuf {
    session_dir(data_dir, id).join("transcript.jsonl")
}

/// `DATA_DIR/sessions/index.json`.
pub fn index_path(data_dir: &Path) -> PathBuf {
    sessions_dir(data_dir).join("index.json")
}

/// `DATA_DIR/logs`.
pub fn logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Create `sessions/{id}` and `sessions/{id}/workspace`, returning the
/// workspace path.
pub fn ensure_session_directories(data_dir: &Path, id: Uuid) -> std::io::Result<PathBuf> {
    let session_dir = session_dir(data_dir, id);
    let workspace_dir = workspace_path(data_dir, id);
    std::fs::create_dir_all(&session_dir)?;
    std::fs::create_dir_all(&workspace_dir)?;
    Ok(workspace_dir)
}

/// True iff `path` resolves to the session's workspace directory or a
/// descendant of it. Used to keep any future path-taking operation from
/// escaping a session's sandboxed working directory.
pub fn is_valid_workspace_path(data_dir: &Path, id: Uuid, path: &Path) -> bool {
    let expected_base = match workspace_path(data_dir, id).canonicalize() {
        Ok(p) => p,
        Err(_) => return false,
    };
    let resolved = match path.canonicalize() {
        Ok(p) => p,
        Err(_) => return false,
    };
    resolved == expected_base || resolved.starts_with(&expected_base)
}
