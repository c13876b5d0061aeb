//! Configuration management for sealfs

use crate::crypto::{ContentEncoding, IvMode};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default kernel attribute/entry cache lifetime (seconds)
pub const DEFAULT_TTL_SECS: u64 = 1;

/// Default lifetime of a cached pid resolution (seconds)
pub const DEFAULT_GATE_CACHE_TTL_SECS: u64 = 5;

/// Default number of cached pid resolutions
pub const DEFAULT_GATE_CACHE_CAPACITY: usize = 1024;

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Filesystem name shown in the mount table
    pub fs_name: String,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Attribute cache lifetime advertised to the kernel
    pub attr_ttl_secs: u64,

    /// Entry cache lifetime advertised to the kernel
    pub entry_ttl_secs: u64,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/sealfs"),
            fs_name: "sealfs".to_string(),
            allow_other: false,
            attr_ttl_secs: DEFAULT_TTL_SECS,
            entry_ttl_secs: DEFAULT_TTL_SECS,
        }
    }
}

/// Process permission policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// `pass` allows unmatched executables; anything else denies
    pub default_action: String,

    /// Executables always allowed
    pub allow: Vec<PathBuf>,

    /// Executables always denied (unless also allowed)
    pub deny: Vec<PathBuf>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            default_action: "deny".to_string(),
            allow: Vec::new(),
            deny: Vec::new(),
        }
    }
}

/// Access gate process cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        GateConfig {
            cache_ttl_secs: DEFAULT_GATE_CACHE_TTL_SECS,
            cache_capacity: DEFAULT_GATE_CACHE_CAPACITY,
        }
    }
}

/// Key-value store location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Sled database directory
    pub path: PathBuf,

    /// Keep everything in a temporary database
    pub in_memory: bool,

    /// Seal every stored value with a key derived from the passphrase
    pub encrypt_store: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            path: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("sealfs")
                .join("store"),
            in_memory: false,
            encrypt_store: true,
        }
    }
}

/// Content record layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    pub encoding: ContentEncoding,
    pub iv_mode: IvMode,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mount: MountConfig,
    pub policy: PolicyConfig,
    pub gate: GateConfig,
    pub storage: StorageConfig,
    pub content: ContentConfig,
    pub logging: LoggingConfig,
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

impl Config {
    /// Load configuration from a file (YAML or JSON), with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = if is_yaml(path_ref) {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse YAML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mount_point) = var("SEALFS_MOUNT_POINT") {
            let mount_point = mount_point.trim();
            if !mount_point.is_empty() {
                self.mount.mount_point = PathBuf::from(mount_point);
            }
        }

        if let Some(path) = var("SEALFS_STORAGE_PATH") {
            let path = path.trim();
            if !path.is_empty() {
                self.storage.path = PathBuf::from(path);
            }
        }

        if let Some(level) = var("SEALFS_LOG_LEVEL") {
            let level = level.trim();
            if !level.is_empty() {
                self.logging.level = level.to_string();
            }
        }

        if let Some(in_memory) = var("SEALFS_IN_MEMORY") {
            match in_memory.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.storage.in_memory = true,
                "0" | "false" | "no" => self.storage.in_memory = false,
                _ => {}
            }
        }
    }

    /// Save configuration to a file (format determined by extension)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();

        let content = if is_yaml(path_ref) {
            serde_yaml::to_string(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config to YAML: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config to JSON: {}", e)))?
        };

        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path_ref, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.mount.mount_point.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("mount point is required".to_string()));
        }

        if !self.storage.in_memory && self.storage.path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "storage path is required unless in_memory is set".to_string(),
            ));
        }

        if self.gate.cache_capacity == 0 {
            return Err(Error::InvalidConfig(
                "gate cache capacity must be greater than 0".to_string(),
            ));
        }

        for exe in self.policy.allow.iter().chain(&self.policy.deny) {
            if !exe.is_absolute() {
                return Err(Error::InvalidConfig(format!(
                    "policy entries must be absolute executable paths: {:?}",
                    exe
                )));
            }
        }

        if self.content.encoding == ContentEncoding::Raw && self.content.iv_mode == IvMode::PerRecord {
            return Err(Error::InvalidConfig(
                "iv_mode per-record requires the framed encoding".to_string(),
            ));
        }

        Ok(())
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sealfs")
            .join("config.yml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.policy.default_action, "deny");
        assert_eq!(config.content.encoding, ContentEncoding::Framed);
        assert_eq!(config.content.iv_mode, IvMode::Fixed);
    }

    #[test]
    fn test_load_partial_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(
            &path,
            "mount:\n  mount_point: /tmp/box\npolicy:\n  default_action: pass\n  deny: [/usr/bin/curl]\ncontent:\n  iv_mode: per-record\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.mount.mount_point, PathBuf::from("/tmp/box"));
        assert_eq!(config.policy.deny, vec![PathBuf::from("/usr/bin/curl")]);
        assert_eq!(config.content.iv_mode, IvMode::PerRecord);
        assert_eq!(config.gate.cache_capacity, DEFAULT_GATE_CACHE_CAPACITY);
    }

    #[test]
    fn test_save_load_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.policy.allow.push(PathBuf::from("/bin/ls"));
        config.storage.in_memory = true;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.policy.allow, vec![PathBuf::from("/bin/ls")]);
        assert!(loaded.storage.in_memory);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SEALFS_MOUNT_POINT", "/srv/box"),
            ("SEALFS_LOG_LEVEL", "debug"),
            ("SEALFS_IN_MEMORY", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.mount.mount_point, PathBuf::from("/srv/box"));
        assert_eq!(config.logging.level, "debug");
        assert!(config.storage.in_memory);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.policy.allow.push(PathBuf::from("ls"));
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = Config::default();
        config.content.encoding = ContentEncoding::Raw;
        config.content.iv_mode = IvMode::PerRecord;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.gate.cache_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unparseable_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "mount: [unclosed").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }
}
