//! Centralized path configuration for Haven.
//!
//! All local paths go through this module so the CLI and tests agree on
//! where state lives.

use std::path::PathBuf;

/// Get the Haven data directory.
///
/// Resolution order:
/// 1. `HAVEN_DATA_DIR` environment variable
/// 2. `~/.haven`
/// 3. `.haven` in the working directory if there is no home directory
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("HAVEN_DATA_DIR") {
        return PathBuf::from(dir);
    }

    dirs::home_dir().map(|h| h.join(".haven")).unwrap_or_else(|| PathBuf::from(".haven"))
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

/// Get the database path.
pub fn db_path() -> PathBuf {
    data_dir().join("haven.db")
}

/// Get the context registry path.
pub fn contexts_path() -> PathBuf {
    data_dir().join("contexts.yaml")
}

/// Get the path of the secret data key.
pub fn key_path() -> PathBuf {
    data_dir().join("data.key")
}

/// Get the default root of the filesystem configuration store.
pub fn remote_dir() -> PathBuf {
    data_dir().join("remote")
}

/// Get the default provisioner working directory.
pub fn work_dir() -> PathBuf {
    data_dir().join("stacks")
}
