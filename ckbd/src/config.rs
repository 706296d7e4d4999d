use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::keymap::{Layout, VENDOR_CORSAIR};
use crate::lighting::{DEFAULT_FPS, MAX_FPS};
use crate::profile::Profile;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ckbd/config.yaml";

const CACHE_MAGIC: u32 = 0xC4B0_0001;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid profile cache: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("profile cache {0} is too short")]
    TooShort(PathBuf),
    #[error("profile cache {0} has a bad magic number")]
    BadMagic(PathBuf),
}

/// Daemon configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
    pub device_discovery: DeviceDiscoverySettings,
    pub lighting: LightingSettings,
    pub io: IoSettings,
    pub profile_cache: ProfileCacheSettings,
}

/// Daemon-specific settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Root device node; per-device nodes are created next to it
    pub root_path: String,
    pub log_level: String,
    /// Group owning the device nodes; unset keeps the daemon's group
    pub node_group: Option<u32>,
}

/// Device discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceDiscoverySettings {
    pub vendor_id: u16,
    pub rescan_interval_ms: u64,
    pub layout: Layout,
}

/// Lighting pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightingSettings {
    pub fps: u32,
    pub dither: bool,
    /// One dimming level for every device and mode
    pub share_dimming: bool,
    /// Inactive indicator level, -1 ..= 2
    pub inactive: i8,
}

/// USB timing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoSettings {
    /// Pause after each control message
    pub usb_delay_ms: u64,
    /// Upper bound of one input read; bounds how long detach waits
    pub read_timeout_ms: i32,
}

/// Persistence of profile stores between attaches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileCacheSettings {
    pub dir: String,
    pub auto_save: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonSettings::default(),
            device_discovery: DeviceDiscoverySettings::default(),
            lighting: LightingSettings::default(),
            io: IoSettings::default(),
            profile_cache: ProfileCacheSettings::default(),
        }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            root_path: ckb_common::DEFAULT_ROOT_PATH.to_string(),
            log_level: "info".to_string(),
            node_group: None,
        }
    }
}

impl Default for DeviceDiscoverySettings {
    fn default() -> Self {
        Self {
            vendor_id: VENDOR_CORSAIR,
            rescan_interval_ms: 2000,
            layout: Layout::Ansi,
        }
    }
}

impl Default for LightingSettings {
    fn default() -> Self {
        Self {
            fps: DEFAULT_FPS,
            dither: false,
            share_dimming: false,
            inactive: 0,
        }
    }
}

impl Default for IoSettings {
    fn default() -> Self {
        Self {
            usb_delay_ms: 0,
            read_timeout_ms: 20,
        }
    }
}

impl Default for ProfileCacheSettings {
    fn default() -> Self {
        Self {
            dir: "/var/cache/ckbd".to_string(),
            auto_save: true,
        }
    }
}

impl DaemonConfig {
    /// Clamp values that would break the device loops
    pub fn sanitize(&mut self) {
        self.lighting.fps = self.lighting.fps.clamp(1, MAX_FPS);
        self.lighting.inactive = self.lighting.inactive.clamp(-1, 2);
        self.io.read_timeout_ms = self.io.read_timeout_ms.clamp(1, 1000);
        self.device_discovery.rescan_interval_ms = self.device_discovery.rescan_interval_ms.max(100);
    }
}

/// Configuration manager for the ckbd daemon
pub struct ConfigManager {
    pub config_path: PathBuf,
    pub config: DaemonConfig,
}

impl ConfigManager {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            config: DaemonConfig::default(),
        }
    }

    /// Load configuration from disk, writing the defaults out if the file is missing
    pub async fn load_config(&mut self) -> Result<(), ConfigError> {
        info!("Loading configuration from {}", self.config_path.display());

        if self.config_path.exists() {
            let content = tokio::fs::read_to_string(&self.config_path).await?;
            self.config = serde_yaml::from_str(&content)?;
            debug!("Loaded configuration from disk");
        } else {
            warn!("Configuration file not found, using defaults");
            if let Err(e) = self.save_config().await {
                warn!("Could not write default configuration: {}", e);
            }
        }
        self.config.sanitize();
        Ok(())
    }

    /// Save configuration to disk
    pub async fn save_config(&self) -> Result<(), ConfigError> {
        info!("Saving configuration to {}", self.config_path.display());
        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_yaml::to_string(&self.config)?;
        tokio::fs::write(&self.config_path, content).await?;
        debug!("Configuration saved");
        Ok(())
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn profile_cache(&self) -> ProfileCache {
        ProfileCache::new(&self.config.profile_cache.dir)
    }
}

/// Per-serial binary snapshots of profile stores
#[derive(Debug, Clone)]
pub struct ProfileCache {
    dir: PathBuf,
}

impl ProfileCache {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    pub fn path(&self, serial: &str) -> PathBuf {
        let name: String = serial
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.bin", name))
    }

    /// Load the cached profile for `serial`; `Ok(None)` when nothing was cached
    pub fn load(&self, serial: &str) -> Result<Option<Profile>, ConfigError> {
        let path = self.path(serial);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // First 4 bytes are a magic number for verification
        if content.len() < 4 {
            return Err(ConfigError::TooShort(path));
        }
        let magic = u32::from_le_bytes([content[0], content[1], content[2], content[3]]);
        if magic != CACHE_MAGIC {
            return Err(ConfigError::BadMagic(path));
        }

        let mut profile: Profile = bincode::deserialize(&content[4..])?;
        profile.sanitize();
        profile.mark_clean();
        debug!("Loaded cached profile for {}", serial);
        Ok(Some(profile))
    }

    pub fn save(&self, serial: &str, profile: &Profile) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.dir)?;
        let mut data = Vec::new();
        data.extend_from_slice(&CACHE_MAGIC.to_le_bytes());
        data.extend_from_slice(&bincode::serialize(profile)?);

        // Write then rename so a crash never leaves half a cache behind
        let path = self.path(serial);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        debug!("Saved profile for {} to {}", serial, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Rgb;

    #[tokio::test]
    async fn test_missing_config_written_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc/config.yaml");
        let mut manager = ConfigManager::new(&path);
        manager.load_config().await.unwrap();

        assert!(path.exists());
        assert_eq!(manager.config(), &DaemonConfig::default());
        assert_eq!(manager.config().device_discovery.vendor_id, 0x1b1c);
    }

    #[tokio::test]
    async fn test_partial_config_and_clamping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "daemon:\n  log_level: debug\nlighting:\n  fps: 500\n  share_dimming: true\n",
        )
        .unwrap();

        let mut manager = ConfigManager::new(&path);
        manager.load_config().await.unwrap();
        let config = manager.config();
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.daemon.root_path, ckb_common::DEFAULT_ROOT_PATH);
        assert_eq!(config.lighting.fps, MAX_FPS);
        assert!(config.lighting.share_dimming);
        assert_eq!(config.io.read_timeout_ms, 20);
    }

    #[tokio::test]
    async fn test_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "lighting: [not, a, map").unwrap();
        let mut manager = ConfigManager::new(&path);
        assert!(matches!(manager.load_config().await, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_profile_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProfileCache::new(dir.path());
        assert!(cache.load("ABC123").unwrap().is_none());

        let mut profile = Profile::new();
        profile.name = "Gaming".to_string();
        profile.mode_mut(2).unwrap().light.fill(Rgb::new(255, 0, 0));
        profile.switch_mode(2);
        cache.save("ABC123", &profile).unwrap();

        let loaded = cache.load("ABC123").unwrap().unwrap();
        assert_eq!(loaded.name, "Gaming");
        assert_eq!(loaded.current_index(), 2);
        assert_eq!(loaded.current_mode().light.colors[0], Rgb::new(255, 0, 0));
        // Loading forces the first frame out
        assert!(loaded.current_mode().light.force_update);
        assert!(!loaded.is_dirty());
    }

    #[test]
    fn test_profile_cache_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ProfileCache::new(dir.path());
        std::fs::write(cache.path("x"), [1u8, 2]).unwrap();
        assert!(matches!(cache.load("x"), Err(ConfigError::TooShort(_))));
        std::fs::write(cache.path("x"), [0u8; 16]).unwrap();
        assert!(matches!(cache.load("x"), Err(ConfigError::BadMagic(_))));
    }

    #[test]
    fn test_cache_path_is_sanitized() {
        let cache = ProfileCache::new("/tmp/c");
        assert_eq!(cache.path("../a b"), PathBuf::from("/tmp/c/___a_b.bin"));
    }
}
