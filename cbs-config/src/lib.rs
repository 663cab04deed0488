//! Server configuration.
//!
//! The configuration lives in a single JSON object. Every key is optional;
//! missing keys fall back to the defaults below, so an empty file (or an
//! absent file passed with `allow_missing`) yields a fully usable config.

use std::path::Path;

use anyhow::{format_err, Context, Error};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "./cloud-backup.conf";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP port the server listens on.
    pub server_port: u16,
    /// Directory holding the committed backup files (flat layout).
    pub backup_file_dir: String,
    /// Path of the metadata snapshot file.
    pub data_manager_filepath: String,
    /// Number of worker threads.
    pub thread_pool_threads_size: usize,
    /// Capacity of the bounded task ring.
    pub thread_pool_queue_capacity: usize,
    /// Listen backlog passed to ``listen(2)``.
    pub listen_queue_size: usize,
    /// Epoll event batch size.
    pub epoll_events_size: usize,
    /// Size of each ``read(2)`` from a client socket.
    pub tcp_buffer_read_size: usize,
    /// Upper bound on the parser window handled per scheduling pass.
    pub per_handle_request_size: usize,
    /// Upper bound on a single disk read while streaming a download.
    pub max_file_read_size: usize,
    /// Number of entries in the file prefix cache.
    #[serde(rename = "LRU_file_capacity")]
    pub lru_file_capacity: usize,
    /// Bytes of file head cached per entry.
    #[serde(rename = "LRU_file_content_size")]
    pub lru_file_content_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 8081,
            backup_file_dir: "./backup".to_string(),
            data_manager_filepath: "./cloud-backup.list".to_string(),
            thread_pool_threads_size: 4,
            thread_pool_queue_capacity: 1024,
            listen_queue_size: 128,
            epoll_events_size: 1024,
            tcp_buffer_read_size: 64 * 1024,
            per_handle_request_size: 64 * 1024,
            max_file_read_size: 1024 * 1024,
            lru_file_capacity: 16,
            lru_file_content_size: 64 * 1024,
        }
    }
}

impl Config {
    /// Load the configuration from `path`.
    ///
    /// With `allow_missing` a non-existing file yields the default
    /// configuration instead of an error.
    pub fn load<P: AsRef<Path>>(path: P, allow_missing: bool) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && allow_missing => {
                log::info!("config file {:?} not found, using defaults", path);
                return Ok(Self::default());
            }
            Err(err) => return Err(format_err!("unable to read config {:?} - {}", path, err)),
        };

        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("unable to parse config {:?}", path))?;

        if config.thread_pool_threads_size == 0 {
            return Err(format_err!("thread_pool_threads_size must not be zero"));
        }
        if config.thread_pool_queue_capacity == 0 {
            return Err(format_err!("thread_pool_queue_capacity must not be zero"));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.server_port, 8081);
        assert_eq!(config.lru_file_capacity, 16);
    }

    #[test]
    fn test_partial_override() {
        let raw = r#"{ "server_port": 9000, "LRU_file_content_size": 128 }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.server_port, 9000);
        assert_eq!(config.lru_file_content_size, 128);
        assert_eq!(config.max_file_read_size, 1024 * 1024);
    }
}
