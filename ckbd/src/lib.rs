//! ckbd daemon library
//!
//! This library provides the core functionality for the ckbd daemon:
//! - Device discovery, attach and detach
//! - Per-device I/O and input threads speaking each hardware family's protocol
//! - Profiles, modes, lighting animation, key actions and macros
//! - Device nodes (command and notification FIFOs, status files)
//! - Input injection via uinput

use ckb_common::{format_connected, ConnectedEntry, VERSION};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod command;
pub mod config;
pub mod device;
pub mod devnode;
pub mod injector;
pub mod input;
pub mod io_thread;
pub mod key_action;
pub mod keymap;
pub mod lighting;
pub mod macro_engine;
pub mod notify;
pub mod profile;
pub mod protocol;
pub mod security;
pub mod transport;

#[cfg(any(test, feature = "dev-hooks"))]
pub mod test_device;

use config::DaemonConfig;
use profile::BRIGHTNESS_MAX;
use security::NodePermissions;

/// Process-wide state shared by every device, created at start-up and torn down at shutdown
pub struct Registry {
    pub version: String,
    pub config: DaemonConfig,
    pub perms: NodePermissions,
    root: PathBuf,
    shared_brightness: AtomicU8,
}

impl Registry {
    /// Create the root node with its `version` and empty `connected` files
    pub fn create(config: DaemonConfig, perms: NodePermissions) -> io::Result<Arc<Self>> {
        let root = PathBuf::from(&config.daemon.root_path);
        if root.file_name().is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid root node path {}", root.display()),
            ));
        }
        let registry = Self {
            version: VERSION.to_string(),
            config,
            perms,
            root,
            shared_brightness: AtomicU8::new(BRIGHTNESS_MAX),
        };
        registry.perms.create_dir(&registry.root)?;
        registry
            .perms
            .write_file(&registry.root.join("version"), &format!("{}\n", registry.version))?;
        registry.perms.write_file(&registry.root.join("connected"), "")?;
        info!("Root node ready at {} (version {})", registry.root.display(), registry.version);
        Ok(Arc::new(registry))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of device node `index`, a sibling of the root node
    pub fn node_dir(&self, index: usize) -> PathBuf {
        self.root.with_file_name(format!("ckb{}", index))
    }

    pub fn write_connected(&self, entries: &[ConnectedEntry]) -> io::Result<()> {
        debug!("{} device(s) connected", entries.len());
        self.perms
            .write_file(&self.root.join("connected"), &format_connected(entries))
    }

    /// Dimming level used when dimming is shared across devices
    pub fn shared_brightness(&self) -> u8 {
        self.shared_brightness.load(Ordering::Relaxed)
    }

    pub fn set_shared_brightness(&self, level: u8) {
        self.shared_brightness
            .store(level.min(BRIGHTNESS_MAX), Ordering::Relaxed);
    }

    /// Remove the root node
    pub fn teardown(&self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.root.display(), e);
            }
        }
        info!("Root node removed");
    }
}

#[cfg(test)]
pub(crate) fn test_config(dir: &Path) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.daemon.root_path = dir.join("ckb0").to_string_lossy().into_owned();
    config.profile_cache.dir = dir.join("cache").to_string_lossy().into_owned();
    config.io.read_timeout_ms = 5;
    config
}

#[cfg(test)]
pub(crate) fn test_registry(dir: &Path) -> Arc<Registry> {
    Registry::create(test_config(dir), NodePermissions::default()).unwrap()
}
