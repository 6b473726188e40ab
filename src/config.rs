//! Environment-backed server configuration (spec §6). Read once at startup
//! into a plain struct threaded through the rest of the process — no global
//! state, no live reload.

use std::path::PathBuf;

use anyhow::{bail, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub copilot_path: String,
    pub max_sessions: usize,
    pub initial_cols: u16,
    pub initial_rows: u16,
    pub min_cols: u16,
    pub max_cols: u16,
    pub min_rows: u16,
    pub max_rows: u16,
    pub max_input_chars_per_message: usize,
    pub ws_max_message_bytes: usize,
    pub allow_non_localhost: bool,
    pub log_file: PathBuf,
    pub log_level: String,
    /// Selects the mock PTY backend in place of a real pseudoterminal; an
    /// explicit testability seam, not something the wire protocol exposes.
    pub use_mock_pty: bool,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{key} must be a valid value, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => bail!("{key} must be a boolean, got {raw:?}"),
        },
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Reads every field from the environment, applying the defaults in
    /// spec §6's configuration table. Rejects a non-localhost `HOST` unless
    /// `ALLOW_NON_LOCALHOST` is set, so a misconfiguration surfaces at
    /// startup rather than as a silently-exposed port.
    pub fn load() -> Result<Self> {
        let data_dir = PathBuf::from(env_or("DATA_DIR", "./data"));
        let log_file = std::env::var("LOG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("logs").join("app.jsonl"));

        let config = Self {
            host: env_or("HOST", "127.0.0.1"),
            port: env_parsed("PORT", 5000)?,
            data_dir,
            copilot_path: env_or("COPILOT_PATH", "copilot.exe"),
            max_sessions: env_parsed("MAX_SESSIONS", 10)?,
            initial_cols: env_parsed("INITIAL_COLS", 120)?,
            initial_rows: env_parsed("INITIAL_ROWS", 30)?,
            min_cols: env_parsed("MIN_COLS", 20)?,
            max_cols: env_parsed("MAX_COLS", 300)?,
            min_rows: env_parsed("MIN_ROWS", 5)?,
            max_rows: env_parsed("MAX_ROWS", 120)?,
            max_input_chars_per_message: env_parsed("MAX_INPUT_CHARS_PER_MESSAGE", 16384)?,
            ws_max_message_bytes: env_parsed("WS_MAX_MESSAGE_BYTES", 1_048_576)?,
            allow_non_localhost: env_bool("ALLOW_NON_LOCALHOST", false)?,
            log_file,
            log_level: env_or("LOG_LEVEL", "INFO"),
            use_mock_pty: env_bool("COPILOT_USE_MOCK_PTY", false)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.allow_non_localhost && !is_localhost(&self.host) {
            bail!(
                "HOST {:?} is not localhost; set ALLOW_NON_LOCALHOST=true to override",
                self.host
            );
        }
        if self.min_cols > self.max_cols || self.min_rows > self.max_rows {
            bail!("MIN_COLS/MIN_ROWS must not exceed MAX_COLS/MAX_ROWS");
        }
        Ok(())
    }
}

fn is_localhost(host: &str) -> bool {
    matches!(host, "127.0.0.1" | "localhost" | "::1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_localhost_recognizes_loopback_forms() {
        assert!(is_localhost("127.0.0.1"));
        assert!(is_localhost("localhost"));
        assert!(is_localhost("::1"));
        assert!(!is_localhost("0.0.0.0"));
    }

    #[test]
    fn validate_rejects_non_localhost_without_override() {
        let mut config = sample_config();
        config.host = "0.0.0.0".to_string();
        config.allow_non_localhost = false;
        assert!(config.validate().is_err());

        config.allow_non_localhost = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_dimension_bounds() {
        let mut config = sample_config();
        config.min_cols = 300;
        config.max_cols = 20;
        assert!(config.validate().is_err());
    }

    fn sample_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 5000,
            data_dir: PathBuf::from("./data"),
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
            log_file: PathBuf::from("./data/logs/app.jsonl"),
            log_level: "INFO".to_string(),
            use_mock_pty: false,
        }
    }
}
