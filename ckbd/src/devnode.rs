//! Per-device node directory
//!
//! `ckbN/` holds the `cmd` FIFO read by the daemon, the notify FIFOs written by it (see
//! [`crate::notify`]) and plain status files clients poll.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::security::NodePermissions;
use ckb_common::DeviceFeatures;

/// Contents of the status files at creation
#[derive(Debug, Clone)]
pub struct NodeInfo<'a> {
    pub model: &'a str,
    pub serial: &'a str,
    pub features: DeviceFeatures,
    pub fwversion: u16,
    pub pollrate: Option<u8>,
    pub status: &'a str,
}

#[derive(Debug)]
pub struct DeviceNode {
    dir: PathBuf,
    perms: NodePermissions,
}

impl DeviceNode {
    /// Create the directory, its status files and the command FIFO
    pub fn create(dir: &Path, perms: NodePermissions, info: &NodeInfo) -> io::Result<Self> {
        perms.create_dir(dir)?;
        let node = Self {
            dir: dir.to_path_buf(),
            perms,
        };
        node.write("model", info.model)?;
        node.write("serial", info.serial)?;
        node.write("features", &info.features.to_string())?;
        node.write("fwversion", &format!("{:04x}", info.fwversion))?;
        if let Some(ms) = info.pollrate {
            node.write_pollrate(ms)?;
        }
        node.write("status", info.status)?;
        perms.make_fifo(&node.cmd_path())?;
        info!("Created device node {}", dir.display());
        Ok(node)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cmd_path(&self) -> PathBuf {
        self.dir.join("cmd")
    }

    /// Replace one status file
    pub fn write(&self, name: &str, value: &str) -> io::Result<()> {
        self.perms.write_file(&self.dir.join(name), &format!("{}\n", value))
    }

    pub fn write_pollrate(&self, ms: u8) -> io::Result<()> {
        self.write("pollrate", &format!("{} ms", ms))
    }

    /// Delete the whole directory
    pub fn remove(&self) {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => info!("Removed device node {}", self.dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.dir.display(), e),
        }
    }
}

/// Start reading the device's command FIFO on the current tokio runtime.
///
/// Returns None outside a runtime; commands can then only be fed through
/// [`Device::execute_line`] directly.
pub fn spawn_listener(device: &Arc<Device>) -> Option<tokio::task::JoinHandle<()>> {
    let handle = tokio::runtime::Handle::try_current().ok()?;
    let path = device.node().cmd_path();
    let weak = Arc::downgrade(device);
    Some(handle.spawn(async move {
        if let Err(e) = listen(&path, weak).await {
            warn!("Command FIFO {} closed: {}", path.display(), e);
        }
    }))
}

async fn listen(path: &Path, device: Weak<Device>) -> io::Result<()> {
    // Opened read-write so the pipe never reports EOF when a client closes its end
    let receiver = pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(path)?;
    let mut lines = BufReader::new(receiver).lines();
    debug!("Listening on {}", path.display());

    while let Some(line) = lines.next_line().await? {
        let Some(device) = device.upgrade() else { break };
        if !device.is_active() {
            break;
        }
        // Command execution takes device locks and may wait for child processes
        let result = tokio::task::spawn_blocking(move || device.execute_line(&line)).await;
        if let Err(e) = result {
            warn!("Command task failed: {}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let node_dir = dir.path().join("ckb1");
        let info = NodeInfo {
            model: "K70 RGB",
            serial: "0123ABCD",
            features: DeviceFeatures::RGB | DeviceFeatures::BIND,
            fwversion: 0x0205,
            pollrate: Some(1),
            status: "ok",
        };
        let node = DeviceNode::create(&node_dir, NodePermissions::default(), &info).unwrap();

        let read = |name: &str| fs::read_to_string(node_dir.join(name)).unwrap();
        assert_eq!(read("model"), "K70 RGB\n");
        assert_eq!(read("serial"), "0123ABCD\n");
        assert_eq!(read("features"), "rgb bind\n");
        assert_eq!(read("fwversion"), "0205\n");
        assert_eq!(read("pollrate"), "1 ms\n");
        assert_eq!(read("status"), "ok\n");
        assert!(node.cmd_path().exists());

        node.write("status", "needs-fw-update").unwrap();
        assert_eq!(read("status"), "needs-fw-update\n");

        node.remove();
        assert!(!node_dir.exists());
        node.remove();
    }
}
