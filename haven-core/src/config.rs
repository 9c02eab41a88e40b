//! Configuration management.
//!
//! - [`Config`]: local settings, JSON at [`paths::config_path`]
//! - [`ContextRegistry`]: known deployment contexts, YAML at [`paths::contexts_path`]

use crate::error::{HavenError, Result};
use crate::paths;
use crate::types::{Context, ContextUpdate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Persistent configuration for Haven.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: String,
    /// Root of the filesystem configuration store
    pub remote_store_dir: String,
    pub provisioner_program: String,
    /// Arguments placed before every provisioner subcommand
    pub provisioner_args: Vec<String>,
    pub provisioner_work_dir: String,
    pub lease_ttl_secs: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: paths::data_dir().to_string_lossy().to_string(),
            remote_store_dir: paths::remote_dir().to_string_lossy().to_string(),
            provisioner_program: "pulumi".to_string(),
            provisioner_args: Vec::new(),
            provisioner_work_dir: paths::work_dir().to_string_lossy().to_string(),
            lease_ttl_secs: 6 * 60 * 60,
            log_level: "warn".to_string(),
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_path()
    }

    /// Load configuration from disk, or defaults if there is none.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path())
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| HavenError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| HavenError::InvalidConfig {
            reason: format!("Failed to parse config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        self.save_to(Self::config_path())
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        write_file(path, serde_json::to_string_pretty(self).map_err(|e| HavenError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.provisioner_program.trim().is_empty() {
            return Err(HavenError::InvalidConfig { reason: "provisioner_program must not be empty".into() });
        }
        if self.lease_ttl_secs == 0 {
            return Err(HavenError::InvalidConfig { reason: "lease_ttl_secs must be positive".into() });
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Database inside the configured data directory.
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("haven.db")
    }

    pub fn key_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("data.key")
    }

    pub fn contexts_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("contexts.yaml")
    }
}

/// On-disk form of the registry.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    contexts: BTreeMap<String, Context>,
}

/// Known deployment contexts, keyed by name.
///
/// There is no "selected" context: callers name the context they act on.
#[derive(Debug, Clone)]
pub struct ContextRegistry {
    path: PathBuf,
    contexts: BTreeMap<String, Context>,
}

impl ContextRegistry {
    /// Load the registry at `path`, empty if the file does not exist.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self { path, contexts: BTreeMap::new() });
        }

        let content =
            std::fs::read_to_string(&path).map_err(|e| HavenError::IoError { path: path.clone(), source: e })?;
        let file: RegistryFile = serde_yaml::from_str(&content).map_err(|e| HavenError::Parse {
            source_name: path.display().to_string(),
            reason: e.to_string(),
        })?;

        for (name, context) in &file.contexts {
            context.validate()?;
            if name != context.name() {
                return Err(HavenError::validation(
                    "contexts",
                    format!("entry '{}' holds context '{}'", name, context.name()),
                ));
            }
        }
        Ok(Self { path, contexts: file.contexts })
    }

    pub fn save(&self) -> Result<()> {
        let file = RegistryFile { contexts: self.contexts.clone() };
        let content = serde_yaml::to_string(&file).map_err(HavenError::internal)?;
        write_file(&self.path, content)
    }

    /// Register a new context. Existing names are never overwritten.
    pub fn add(&mut self, context: Context) -> Result<()> {
        if self.contexts.contains_key(context.name()) {
            return Err(HavenError::validation(
                "context",
                format!("'{}' already exists; use migrate to change it", context.name()),
            ));
        }
        info!(context = %context.name(), "Added context");
        self.contexts.insert(context.name().to_string(), context);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Context> {
        self.contexts.get(name).ok_or_else(|| HavenError::NotFound { what: format!("context '{}'", name) })
    }

    /// Every context in name order.
    pub fn list(&self) -> impl Iterator<Item = &Context> {
        self.contexts.values()
    }

    /// Apply an explicit update to a context and return the new value.
    pub fn migrate(&mut self, name: &str, update: ContextUpdate) -> Result<Context> {
        let migrated = self.get(name)?.migrate(update)?;
        info!(context = %name, "Migrated context");
        self.contexts.insert(name.to_string(), migrated.clone());
        Ok(migrated)
    }
}

fn write_file(path: &Path, content: String) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| HavenError::IoError { path: parent.to_path_buf(), source: e })?;
    }
    std::fs::write(path, content).map_err(|e| HavenError::IoError { path: path.to_path_buf(), source: e })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acme() -> Context {
        Context::new("acme", "Acme Subscription", "Acme Admins", "Acme deployment").unwrap()
    }

    #[test]
    fn test_config_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(dir.path().join("config.json")).unwrap();
        assert_eq!(config.provisioner_program, "pulumi");
        assert_eq!(config.lease_ttl(), Duration::from_secs(21600));
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config { provisioner_program: "/usr/local/bin/provision".into(), ..Config::default() };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"lease_ttl_secs": 60}"#).unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.lease_ttl_secs, 60);
        assert_eq!(config.provisioner_program, "pulumi");

        std::fs::write(&path, r#"{"lease_ttl_secs": 0}"#).unwrap();
        assert!(matches!(Config::load_from(&path).unwrap_err(), HavenError::InvalidConfig { .. }));
    }

    #[test]
    fn test_registry_add_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contexts.yaml");

        let mut registry = ContextRegistry::load(&path).unwrap();
        assert_eq!(registry.list().count(), 0);
        registry.add(acme()).unwrap();
        assert!(matches!(registry.add(acme()).unwrap_err(), HavenError::Validation { .. }));
        registry.save().unwrap();

        let reloaded = ContextRegistry::load(&path).unwrap();
        assert_eq!(reloaded.get("acme").unwrap(), &acme());
        assert!(matches!(reloaded.get("other").unwrap_err(), HavenError::NotFound { .. }));
    }

    #[test]
    fn test_registry_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ContextRegistry::load(dir.path().join("contexts.yaml")).unwrap();
        registry.add(acme()).unwrap();

        let update = ContextUpdate { description: Some("Moved".into()), ..ContextUpdate::default() };
        let migrated = registry.migrate("acme", update).unwrap();
        assert_eq!(migrated.description(), "Moved");
        assert_eq!(registry.get("acme").unwrap().description(), "Moved");
        assert_eq!(migrated.subscription_name(), "Acme Subscription");
    }
}
