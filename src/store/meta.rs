//! Per-session metadata, `DATA_DIR/sessions/{id}/meta.json` (spec §4.3).

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::now_iso;
use crate::protocol::SpawnError;
use crate::store::atomic::{read_json, write_json, ReadError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
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
    #[serde(default)]
    pub error: Option<SpawnError>,
}

pub struct MetaStore {
    data_dir: PathBuf,
}

impl MetaStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
        }
    }

    fn path(&self, id: Uuid) -> PathBuf {
        crate::paths::meta_path(&self.data_dir, id)
    }

    pub fn load(&self, id: Uuid) -> Option<SessionMeta> {
        match read_json(&self.path(id)) {
            Ok(meta) => Some(meta),
            Err(ReadError::NotFound(_)) => None,
            Err(ReadError::Malformed { path, source }) => {
                tracing::error!(path, %source, "meta.json is malformed");
                None
            }
        }
    }

    pub fn save(&self, meta: &SessionMeta) -> Result<()> {
        write_json(&self.path(meta.session_id), meta)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        session_id: Uuid,
        workspace_path: String,
        copilot_path: String,
        pid: Option<u32>,
        cols: u16,
        rows: u16,
        error: Option<SpawnError>,
    ) -> Result<SessionMeta> {
        let now = now_iso();
        let status = if error.is_some() { "exited" } else { "running" };
        let meta = SessionMeta {
            session_id,
            status: status.to_string(),
            created_at: now.clone(),
            last_activity_at: now,
            workspace_path,
            pid,
            cols,
            rows,
            exit_code: None,
            copilot_path,
            error,
        };
        self.save(&meta)?;
        Ok(meta)
    }

    pub fn update_activity(&self, id: Uuid) -> Result<()> {
        if let Some(mut meta) = self.load(id) {
            meta.last_activity_at = now_iso();
            self.save(&meta)?;
        }
        Ok(())
    }

    pub fn update_status(&self, id: Uuid, status: &str, exit_code: Option<i32>) -> Result<()> {
        if let Some(mut meta) = self.load(id) {
            meta.status = status.to_string();
            meta.last_activity_at = now_iso();
            if exit_code.is_some() {
                meta.exit_code = exit_code;
            }
            self.save(&meta)?;
        }
        Ok(())
    }

    pub fn update_dimensions(&self, id: Uuid, cols: u16, rows: u16) -> Result<()> {
        if let Some(mut meta) = self.load(id) {
            meta.cols = cols;
            meta.rows = rows;
            meta.last_activity_at = now_iso();
            self.save(&meta)?;
        }
        Ok(())
    }
}
