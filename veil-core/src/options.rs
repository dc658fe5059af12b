//! Per-peer tunables. Every field has a default so partial config files load.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunk::DEFAULT_CHUNK_SIZE;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Transfer piece size in bytes.
    pub chunk_size: u32,
    /// Pieces buffered per transfer before the producer waits.
    pub max_chunks: usize,
    pub max_downloads: usize,
    pub max_uploads: usize,
    /// Folder served to Browse, Search and Download.
    pub share_folder: PathBuf,
    /// Where downloaded files land on the client.
    pub download_folder: PathBuf,
    /// Where uploaded files land on the server.
    pub upload_folder: PathBuf,
    pub ping_interval_secs: u64,
    pub restart_interval_secs: u64,
    /// Delay before a transfer job retries a refused piece.
    pub retry_interval_ms: u64,
    /// Sessions and transfers untouched this long are dropped.
    pub idle_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunks: 8,
            max_downloads: 2,
            max_uploads: 2,
            share_folder: PathBuf::from("share"),
            download_folder: PathBuf::from("downloads"),
            upload_folder: PathBuf::from("uploads"),
            ping_interval_secs: 30,
            restart_interval_secs: 10,
            retry_interval_ms: 100,
            idle_timeout_secs: 300,
            request_timeout_secs: 30,
        }
    }
}

impl Options {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn restart_interval(&self) -> Duration {
        Duration::from_secs(self.restart_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
