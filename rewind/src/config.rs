//! Configuration for the response cache.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! [cache]
//! duration_secs = 600
//! stale_while_revalidate = true
//!
//! [persistence]
//! backend = "sqlite"
//! path = "~/.rewind"
//!
//! [compression]
//! algorithm = "zstd"
//! level = 3
//!
//! [encryption]
//! key_env = "REWIND_CACHE_KEY"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::operation::CachePriority;
use crate::serialisation::{CompressionAlgorithm, EncryptionConfig};

/// File name of the SQLite database inside `persistence.path`.
pub const SQLITE_FILE_NAME: &str = "rewind.db";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RewindConfig {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub compression: CompressionAlgorithm,
    #[serde(default)]
    pub encryption: EncryptionSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSettings {
    /// Disabling the cache turns every call into a plain network call.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Default freshness window, overridable per operation.
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    #[serde(default)]
    pub compress: bool,
    /// Requires an encryption key; ignored otherwise.
    #[serde(default)]
    pub encrypt: bool,
    /// Deliver stale data alongside a network error instead of an empty
    /// response.
    #[serde(default = "default_true")]
    pub merge_on_error: bool,
    /// Return STALE hits immediately and refresh them in the background.
    #[serde(default)]
    pub stale_while_revalidate: bool,
    #[serde(default)]
    pub priority: CachePriority,
}

fn default_true() -> bool {
    true
}

fn default_duration_secs() -> u64 {
    3600
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            duration_secs: default_duration_secs(),
            compress: false,
            encrypt: false,
            merge_on_error: true,
            stale_while_revalidate: false,
            priority: CachePriority::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    File,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Directory for the file and SQLite backends.
    #[serde(default = "default_path")]
    pub path: PathBuf,
    /// Entry bound for the memory backend; also caps the SQLite table.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_path() -> PathBuf {
    PathBuf::from("~/.rewind")
}

fn default_max_entries() -> usize {
    rewind_storage::DEFAULT_MAX_ENTRIES
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            path: default_path(),
            max_entries: default_max_entries(),
        }
    }
}

impl PersistenceConfig {
    pub fn sqlite_path(&self) -> PathBuf {
        self.path.join(SQLITE_FILE_NAME)
    }
}

/// Where to find the encryption key. Never holds the key itself unless
/// `key_hex` is set explicitly.
#[derive(Clone, Default, Deserialize, Serialize)]
pub struct EncryptionSettings {
    /// Environment variable holding a 64-character hex key
    pub key_env: Option<String>,
    pub key_hex: Option<String>,
}

impl std::fmt::Debug for EncryptionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionSettings")
            .field("key_env", &self.key_env)
            .field("key_hex", &self.key_hex.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl EncryptionSettings {
    /// Resolve the configured key, if any.
    pub fn load_key(&self) -> Result<Option<EncryptionConfig>> {
        if let Some(hex_key) = &self.key_hex {
            return EncryptionConfig::from_hex(hex_key, "config").map(Some);
        }
        if let Some(env_var) = &self.key_env {
            return EncryptionConfig::from_env(env_var).map(Some);
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Filter string, overridden by RUST_LOG
    #[serde(default = "default_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

/// Expand ~ to home directory in path
pub fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let home = || {
        dirs::home_dir().ok_or_else(|| CacheError::Config("Cannot determine home directory".into()))
    };
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        Ok(home()?.join(rest))
    } else if s == "~" {
        home()
    } else {
        Ok(path.to_path_buf())
    }
}

impl RewindConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load config from a TOML file, or use defaults if it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let mut config = Self::default();
            config.expand_paths()?;
            Ok(config)
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: RewindConfig = toml::from_str(content)?;
        config.expand_paths()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    fn expand_paths(&mut self) -> Result<()> {
        self.persistence.path = expand_tilde(&self.persistence.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RewindConfig::from_toml("").unwrap();
        assert!(config.cache.enabled);
        assert_eq!(config.cache.duration_secs, 3600);
        assert!(config.cache.merge_on_error);
        assert!(!config.cache.stale_while_revalidate);
        assert_eq!(config.persistence.backend, BackendKind::Memory);
        assert_eq!(config.persistence.max_entries, 20);
        assert_eq!(config.compression, CompressionAlgorithm::Lz4);
        assert!(!config.persistence.path.starts_with("~"));
    }

    #[test]
    fn test_parse_full_config() {
        let config = RewindConfig::from_toml(
            r#"
            [cache]
            duration_secs = 60
            encrypt = true
            stale_while_revalidate = true
            priority = "fresh_preferred"

            [persistence]
            backend = "sqlite"
            path = "/tmp/rewind-test"
            max_entries = 500

            [compression]
            algorithm = "zstd"
            level = 7

            [encryption]
            key_env = "REWIND_TEST_KEY"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.duration_secs, 60);
        assert!(config.cache.encrypt);
        assert_eq!(config.cache.priority, CachePriority::FreshPreferred);
        assert_eq!(config.persistence.backend, BackendKind::Sqlite);
        assert_eq!(
            config.persistence.sqlite_path(),
            PathBuf::from("/tmp/rewind-test/rewind.db")
        );
        assert_eq!(config.compression, CompressionAlgorithm::Zstd { level: 7 });
        assert_eq!(config.encryption.key_env.as_deref(), Some("REWIND_TEST_KEY"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("rewind.toml");

        let mut config = RewindConfig::default();
        config.cache.duration_secs = 42;
        config.persistence.backend = BackendKind::File;
        config.persistence.path = dir.path().join("cache");
        config.save(&path).unwrap();

        let loaded = RewindConfig::load(&path).unwrap();
        assert_eq!(loaded.cache.duration_secs, 42);
        assert_eq!(loaded.persistence.backend, BackendKind::File);
        assert_eq!(loaded.persistence.path, dir.path().join("cache"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = RewindConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.cache.duration_secs, 3600);
    }

    #[test]
    fn test_encryption_key_resolution() {
        assert!(EncryptionSettings::default().load_key().unwrap().is_none());

        let hex_key = EncryptionConfig::generate("t").to_hex();
        let settings = EncryptionSettings {
            key_env: None,
            key_hex: Some(hex_key.clone()),
        };
        assert_eq!(settings.load_key().unwrap().unwrap().to_hex(), hex_key);
        assert!(!format!("{:?}", settings).contains(&hex_key));

        let missing = EncryptionSettings {
            key_env: Some("REWIND_SURELY_UNSET_VARIABLE".to_string()),
            key_hex: None,
        };
        assert!(missing.load_key().is_err());
    }

    #[test]
    fn test_expand_tilde() {
        let plain = expand_tilde(Path::new("/var/cache")).unwrap();
        assert_eq!(plain, PathBuf::from("/var/cache"));

        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/x")).unwrap(), home.join("x"));
        }
    }
}
