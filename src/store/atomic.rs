//! Crash-safe JSON persistence: write-temp-then-rename, with bounded retry
//! on transient rename failures.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

const RENAME_RETRIES: u32 = 5;
const RENAME_RETRY_BASE_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed JSON in {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Serialize `value` as pretty (two-space indent, non-ASCII preserved) JSON
/// and atomically replace `path` with it.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .context("target path for atomic write has no parent directory")?;
    std::fs::create_dir_all(parent)?;

    let tmp_path = parent.join(format!(
        ".tmp-{}-{}.json",
        path.file_stem().and_then(|s| s.to_str()).unwrap_or("write"),
        uuid::Uuid::new_v4()
    ));

    let result = (|| -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            use std::io::Write;
            file.write_all(json.as_bytes())?;
            file.flush()?;
            file.sync_all()?;
        }
        rename_with_retry(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

fn rename_with_retry(from: &Path, to: &Path) -> Result<()> {
    let mut attempt = 0;
    loop {
        match std::fs::rename(from, to) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < RENAME_RETRIES => {
                attempt += 1;
                warn!(?e, attempt, "atomic rename failed, retrying");
                std::thread::sleep(RENAME_RETRY_BASE_DELAY * attempt);
            }
            Err(e) => return Err(e).context("renaming temp file into place"),
        }
    }
}

/// Read and parse a JSON document, distinguishing "absent" from "malformed".
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ReadError> {
    let data = std::fs::read_to_string(path).map_err(|_| ReadError::NotFound(path.display().to_string()))?;
    serde_json::from_str(&data).map_err(|source| ReadError::Malformed {
        path: path.display().to_string(),
        source,
    })
}
