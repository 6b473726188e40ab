//! The global session catalog, `DATA_DIR/sessions/index.json` (spec §4.2).

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::now_iso;
use crate::protocol::SessionIndexEntry;
use crate::store::atomic::{read_json, write_json, ReadError};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDocument {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: u32,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
    pub sessions: Vec<SessionIndexEntry>,
}

impl IndexDocument {
    fn empty() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            updated_at: now_iso(),
            sessions: Vec::new(),
        }
    }
}

/// Single-writer discipline is enforced by the caller (the session manager
/// holds one mutex around every read-modify-write against this file).
pub struct IndexStore {
    path: PathBuf,
}

impl IndexStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: crate::paths::index_path(data_dir),
        }
    }

    pub fn load(&self) -> IndexDocument {
        match read_json(&self.path) {
            Ok(doc) => doc,
            Err(ReadError::NotFound(_)) => IndexDocument::empty(),
            Err(ReadError::Malformed { path, source }) => {
                tracing::error!(path, %source, "index.json is malformed, starting from empty index");
                IndexDocument::empty()
            }
        }
    }

    pub fn save(&self, mut doc: IndexDocument) -> Result<()> {
        doc.updated_at = now_iso();
        write_json(&self.path, &doc)
    }

    pub fn add_session(&self, entry: SessionIndexEntry) -> Result<()> {
        let mut doc = self.load();
        doc.sessions.push(entry);
        self.save(doc)
    }

    pub fn update_session_status(&self, id: Uuid, status: &str, last_activity_at: &str) -> Result<()> {
        let mut doc = self.load();
        if let Some(entry) = doc.sessions.iter_mut().find(|s| s.session_id == id) {
            entry.status = status.to_string();
            entry.last_activity_at = last_activity_at.to_string();
        }
        self.save(doc)
    }

    pub fn update_session_name(&self, id: Uuid, name: &str) -> Result<bool> {
        let mut doc = self.load();
        let found = if let Some(entry) = doc.sessions.iter_mut().find(|s| s.session_id == id) {
            entry.name = Some(name.to_string());
            true
        } else {
            false
        };
        if found {
            self.save(doc)?;
        }
        Ok(found)
    }

    /// Sorted by `createdAt` descending, as spec §3 requires of the surface
    /// clients see even though the on-disk document may be unordered.
    pub fn get_all_sessions(&self) -> Vec<SessionIndexEntry> {
        let mut sessions = self.load().sessions;
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    pub fn get_session(&self, id: Uuid) -> Option<SessionIndexEntry> {
        self.load().sessions.into_iter().find(|s| s.session_id == id)
    }

    pub fn remove_session(&self, id: Uuid) -> Result<()> {
        let mut doc = self.load();
        doc.sessions.retain(|s| s.session_id != id);
        self.save(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(id: Uuid, status: &str, created_at: &str) -> SessionIndexEntry {
        SessionIndexEntry {
            session_id: id,
            status: status.to_string(),
            created_at: created_at.to_string(),
            last_activity_at: created_at.to_string(),
            name: None,
        }
    }

    #[test]
    fn load_returns_empty_document_when_absent() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(dir.path());
        let doc = store.load();
        assert_eq!(doc.protocol_version, PROTOCOL_VERSION);
        assert!(doc.sessions.is_empty());
    }

    #[test]
    fn add_and_list_sorted_descending() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(dir.path());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.add_session(entry(a, "running", "2026-01-01T00:00:00.000Z")).unwrap();
        store.add_session(entry(b, "running", "2026-01-02T00:00:00.000Z")).unwrap();

        let all = store.get_all_sessions();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].session_id, b);
        assert_eq!(all[1].session_id, a);
    }

    #[test]
    fn update_status_and_name() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(dir.path());
        let id = Uuid::new_v4();
        store.add_session(entry(id, "running", "2026-01-01T00:00:00.000Z")).unwrap();

        store.update_session_status(id, "exited", "2026-01-01T00:00:01.000Z").unwrap();
        assert_eq!(store.get_session(id).unwrap().status, "exited");

        assert!(store.update_session_name(id, "my session").unwrap());
        assert_eq!(store.get_session(id).unwrap().name.as_deref(), Some("my session"));

        assert!(!store.update_session_name(Uuid::new_v4(), "nope").unwrap());
    }

    #[test]
    fn remove_session() {
        let dir = tempdir().unwrap();
        let store = IndexStore::new(dir.path());
        let id = Uuid::new_v4();
        store.add_session(entry(id, "running", "2026-01-01T00:00:00.000Z")).unwrap();
        store.remove_session(id).unwrap();
        assert!(store.get_session(id).is_none());
    }
}
