use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use crate::{SfeError, SfeResult};

/// App namespace holding the encryption switches
pub const CORE_APP: &str = "core";

/// `"yes"` / `"no"`; system value of the same name provides the default
pub const ENCRYPTION_ENABLED_KEY: &str = "encryption_enabled";

/// Id of the module used when callers do not name one
pub const DEFAULT_MODULE_KEY: &str = "default_encryption_module";

/// Top-level configuration (loaded from sfe.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SfeConfig {
    pub log: LogConfig,
    pub storage: StorageConfig,
    pub encryption: EncryptionConfig,
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the file store; user trees live at `{data_dir}/{uid}/files`
    pub data_dir: PathBuf,
    /// Alternative key storage root inside the store (empty = per-user keystores)
    pub key_storage_root: String,
}

/// A storage mount shared across users
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemMount {
    /// Mount point below each user's `files` folder, e.g. "team"
    pub mount_point: String,
    /// Users the mount applies to (empty = everyone)
    pub applicable_users: Vec<String>,
}

impl SystemMount {
    pub fn applies_to(&self, uid: &str) -> bool {
        self.applicable_users.is_empty() || self.applicable_users.iter().any(|u| u == uid)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Initial value of the global encryption switch
    pub enabled: bool,
    /// Default module id used until one is set at runtime
    pub default_module: Option<String>,
    /// Also decrypt `{uid}/files_versions` during decrypt-all
    pub decrypt_versions: bool,
    /// System-wide mounts (key directories omit the uid segment)
    pub system_mounts: Vec<SystemMount>,
}

/// Reference module key derivation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/sfe/data"),
            key_storage_root: String::new(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

// ── App-value stores ──────────────────────────────────────────────────────────

/// Key/value settings the encryption core reads and writes at runtime.
pub trait ConfigStore: Send + Sync {
    fn get_app_value(&self, app: &str, key: &str, default: &str) -> String;
    fn set_app_value(&self, app: &str, key: &str, value: &str) -> SfeResult<()>;
    fn get_system_value_bool(&self, key: &str, default: bool) -> bool;
}

type AppValues = BTreeMap<String, BTreeMap<String, String>>;

/// In-memory store (tests, embedding)
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: RwLock<AppValues>,
    system: BTreeMap<String, bool>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_bool(mut self, key: &str, value: bool) -> Self {
        self.system.insert(key.to_string(), value);
        self
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_app_value(&self, app: &str, key: &str, default: &str) -> String {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        lookup(&values, app, key).unwrap_or_else(|| default.to_string())
    }

    fn set_app_value(&self, app: &str, key: &str, value: &str) -> SfeResult<()> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values
            .entry(app.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_system_value_bool(&self, key: &str, default: bool) -> bool {
        self.system.get(key).copied().unwrap_or(default)
    }
}

/// File-backed store: app values persist to a TOML file, system values come
/// from the loaded `SfeConfig`.
#[derive(Debug)]
pub struct TomlConfigStore {
    path: PathBuf,
    values: RwLock<AppValues>,
    system: BTreeMap<String, bool>,
    fallbacks: AppValues,
}

impl TomlConfigStore {
    /// Open (or lazily create) the app-value file at `path`.
    pub fn open(path: &Path, config: &SfeConfig) -> SfeResult<Self> {
        let values: AppValues = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| SfeError::Config(format!("parsing {}: {e}", path.display())))?
        } else {
            AppValues::new()
        };

        let mut system = BTreeMap::new();
        system.insert(ENCRYPTION_ENABLED_KEY.to_string(), config.encryption.enabled);

        let mut fallbacks = AppValues::new();
        if let Some(ref id) = config.encryption.default_module {
            fallbacks
                .entry(CORE_APP.to_string())
                .or_default()
                .insert(DEFAULT_MODULE_KEY.to_string(), id.clone());
        }

        Ok(Self {
            path: path.to_path_buf(),
            values: RwLock::new(values),
            system,
            fallbacks,
        })
    }

    /// Default location inside the store: `{data_dir}/appconfig.toml`
    pub fn default_path(config: &SfeConfig) -> PathBuf {
        config.storage.data_dir.join("appconfig.toml")
    }

    fn persist(&self, values: &AppValues) -> SfeResult<()> {
        let rendered = toml::to_string_pretty(values)
            .map_err(|e| SfeError::Config(format!("serializing app values: {e}")))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, rendered)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl ConfigStore for TomlConfigStore {
    fn get_app_value(&self, app: &str, key: &str, default: &str) -> String {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        lookup(&values, app, key)
            .or_else(|| lookup(&self.fallbacks, app, key))
            .unwrap_or_else(|| default.to_string())
    }

    fn set_app_value(&self, app: &str, key: &str, value: &str) -> SfeResult<()> {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        let mut updated = values.clone();
        updated
            .entry(app.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        // the live map only changes once the file has it
        self.persist(&updated)?;
        *values = updated;
        tracing::debug!(app, key, value, path = %self.path.display(), "app value stored");
        Ok(())
    }

    fn get_system_value_bool(&self, key: &str, default: bool) -> bool {
        self.system.get(key).copied().unwrap_or(default)
    }
}

fn lookup(values: &AppValues, app: &str, key: &str) -> Option<String> {
    values.get(app).and_then(|m| m.get(key)).cloned()
}
