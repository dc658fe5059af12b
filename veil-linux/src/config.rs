//! Daemon configuration: the peer list, loaded from TOML and environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use veil_core::{Peer, Role};

/// File: $VEIL_CONFIG, ~/.config/veil/config.toml or /etc/veil/config.toml.
/// Env overrides: VEIL_PASSPHRASE, VEIL_SHARE_FOLDER, VEIL_DOWNLOAD_FOLDER,
/// VEIL_UPLOAD_FOLDER. They apply to every peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, rename = "peer")]
    pub peers: Vec<Peer>,
}

/// Default TCP port for a server peer.
pub const DEFAULT_PORT: u16 = 45680;

impl Default for Config {
    fn default() -> Self {
        Self {
            peers: vec![Peer::new("veil", Role::Server, "127.0.0.1", DEFAULT_PORT)],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("encoding config: {0}")]
    Encode(#[from] toml::ser::Error),
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let io = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        std::fs::write(path, text).map_err(io)
    }

    /// Apply overrides; `lookup` is `std::env::var` in the daemon.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let passphrase = lookup("VEIL_PASSPHRASE");
        let share = lookup("VEIL_SHARE_FOLDER").map(PathBuf::from);
        let download = lookup("VEIL_DOWNLOAD_FOLDER").map(PathBuf::from);
        let upload = lookup("VEIL_UPLOAD_FOLDER").map(PathBuf::from);
        for peer in &mut self.peers {
            if let Some(p) = &passphrase {
                peer.passphrase = Some(p.clone());
            }
            if let Some(p) = &share {
                peer.options.share_folder = p.clone();
            }
            if let Some(p) = &download {
                peer.options.download_folder = p.clone();
            }
            if let Some(p) = &upload {
                peer.options.upload_folder = p.clone();
            }
        }
    }
}

/// Candidate files, most specific first.
pub fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("VEIL_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/veil/config.toml"));
    }
    out.push(PathBuf::from("/etc/veil/config.toml"));
    out
}

/// Load config: the explicit path or first existing candidate, else default;
/// then env vars. Also returns the path `save` should write to.
pub fn load(explicit: Option<&Path>) -> Result<(Config, PathBuf), ConfigError> {
    let candidates = match explicit {
        Some(p) => vec![p.to_path_buf()],
        None => config_paths(),
    };
    let found = candidates.iter().find(|p| p.exists()).cloned();
    let (mut config, path) = match found {
        Some(path) => (Config::load_from(&path)?, path),
        None => {
            let path = candidates
                .into_iter()
                .next()
                .unwrap_or_else(|| PathBuf::from("veil.toml"));
            tracing::info!(path = %path.display(), "no config file; using defaults");
            (Config::default(), path)
        }
    };
    config.apply_env(|key| std::env::var(key).ok());
    Ok((config, path))
}
