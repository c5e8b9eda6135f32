//! TOML-backed configuration for both daemons (§4.12/§6.4). Mirrors the
//! original's create-with-defaults-then-ask-the-operator-to-edit behavior:
//! a missing file is written out with defaults and loading fails once so
//! the operator notices before the daemon starts on unreviewed settings.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// TCP port both binaries listen on / dial by default.
pub const DEFAULT_PORT: u16 = 8081;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub path_to_watch: String,
    pub database_path: String,
    pub ca_file_path: String,
    pub millis_filesystem_watcher: u64,
    pub event_queue_size: usize,
    pub seconds_between_reconnections: u64,
    pub max_connection_retries: u32,
    pub max_server_error_retries: u32,
    pub timeout_seconds: u64,
    pub select_timeout_seconds: u64,
    pub max_response_waiting: usize,
    pub tmp_file_name_size: usize,
    pub max_data_chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            path_to_watch: String::new(),
            database_path: "clientFiles/clientDB.sqlite".to_string(),
            ca_file_path: "TLScerts/cacert.pem".to_string(),
            millis_filesystem_watcher: 5000,
            event_queue_size: 20,
            seconds_between_reconnections: 10,
            max_connection_retries: 12,
            max_server_error_retries: 5,
            timeout_seconds: 15,
            select_timeout_seconds: 5,
            max_response_waiting: 1024,
            tmp_file_name_size: 8,
            max_data_chunk_size: 16384,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server_base_path: String,
    pub temp_path: String,
    pub password_database_path: String,
    pub server_database_path: String,
    pub certificate_path: String,
    pub private_key_path: String,
    pub ca_file_path: String,
    pub listen_queue: i32,
    pub n_threads: usize,
    pub socket_queue_size: usize,
    pub select_timeout_seconds: u64,
    pub timeout_seconds: u64,
    pub tmp_file_name_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_base_path: "serverFiles/storage".to_string(),
            temp_path: "serverFiles/temp".to_string(),
            password_database_path: "serverFiles/passwordDB.sqlite".to_string(),
            server_database_path: "serverFiles/serverDB.sqlite".to_string(),
            certificate_path: "TLScerts/server_cert.pem".to_string(),
            private_key_path: "TLScerts/server_pkey.pem".to_string(),
            ca_file_path: "TLScerts/cacert.pem".to_string(),
            listen_queue: 8,
            n_threads: 4,
            socket_queue_size: 10,
            select_timeout_seconds: 5,
            timeout_seconds: 60,
            tmp_file_name_size: 8,
        }
    }
}

/// Load `path`, or create it with defaults and return `ConfigError::Read`
/// so the caller treats a first run as fatal until the operator reviews it
/// (matches the original's "file just created, edit it and restart").
pub fn load_or_init<T>(path: &Path) -> Result<T, ConfigError>
where
    T: Default + Serialize + for<'de> Deserialize<'de>,
{
    if !path.exists() {
        write_default::<T>(path)?;
        return Err(ConfigError::Read {
            path: path.display().to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "configuration file created with defaults; edit it and restart",
            ),
        });
    }

    let text = fs::read_to_string(path)
        .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
    toml::from_str(&text)
        .map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })
}

fn write_default<T: Default + Serialize>(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|source| ConfigError::Write { path: path.display().to_string(), source })?;
    }
    let text = toml::to_string_pretty(&T::default())
        .expect("default config always serializes");
    fs::write(path, text)
        .map_err(|source| ConfigError::Write { path: path.display().to_string(), source })
}

pub fn normalize_watch_path(raw: &str) -> PathBuf {
    let slashed = raw.replace('\\', "/");
    PathBuf::from(slashed.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_client_config_is_created_then_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        let err = load_or_init::<ClientConfig>(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(path.exists());

        let cfg: ClientConfig = load_or_init(&path).unwrap();
        assert_eq!(cfg.millis_filesystem_watcher, 5000);
    }

    #[test]
    fn normalize_strips_trailing_slash_and_backslashes() {
        assert_eq!(normalize_watch_path("C:\\a\\b\\"), PathBuf::from("C:/a/b"));
        assert_eq!(normalize_watch_path("/a/b/"), PathBuf::from("/a/b"));
    }

    #[test]
    fn server_defaults_match_original_constants() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen_queue, 8);
        assert_eq!(cfg.n_threads, 4);
        assert_eq!(cfg.timeout_seconds, 60);
    }
}
