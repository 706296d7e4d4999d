//! Ownership and permissions of device nodes
//!
//! Node directories are world-readable, status files group-writable, and FIFOs restricted
//! to the owner and the configured group so only trusted clients can send commands.

use nix::sys::stat::Mode;
use nix::unistd::{self, Gid};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, info};

pub const DIR_MODE: u32 = 0o755;
pub const FILE_MODE: u32 = 0o664;
pub const FIFO_MODE: u32 = 0o660;

/// Whether the daemon runs as root
pub fn is_root() -> bool {
    unistd::getuid().is_root()
}

/// Permission policy applied to every node the daemon creates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodePermissions {
    gid: Option<u32>,
}

impl NodePermissions {
    pub fn new(gid: Option<u32>) -> Self {
        if let Some(gid) = gid {
            info!("Device nodes will belong to gid {}", gid);
        }
        Self { gid }
    }

    fn apply(&self, path: &Path, mode: u32) -> io::Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        if let Some(gid) = self.gid {
            unistd::chown(path, None, Some(Gid::from_raw(gid)))?;
            debug!("Set group of {} to gid {}", path.display(), gid);
        }
        Ok(())
    }

    /// Create a node directory (and parents) with directory permissions
    pub fn create_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)?;
        self.apply(path, DIR_MODE)
    }

    /// Write a status file with file permissions
    pub fn write_file(&self, path: &Path, contents: &str) -> io::Result<()> {
        fs::write(path, contents)?;
        self.apply(path, FILE_MODE)
    }

    /// Create a FIFO if it does not exist yet
    pub fn make_fifo(&self, path: &Path) -> io::Result<()> {
        match unistd::mkfifo(path, Mode::from_bits_truncate(FIFO_MODE)) {
            Ok(()) => {}
            Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => return Err(e.into()),
        }
        self.apply(path, FIFO_MODE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;

    #[test]
    fn test_node_modes() {
        let dir = tempfile::tempdir().unwrap();
        let perms = NodePermissions::default();

        let node = dir.path().join("ckb1");
        perms.create_dir(&node).unwrap();
        assert_eq!(fs::metadata(&node).unwrap().permissions().mode() & 0o777, DIR_MODE);

        let file = node.join("model");
        perms.write_file(&file, "K70 RGB\n").unwrap();
        assert_eq!(fs::metadata(&file).unwrap().permissions().mode() & 0o777, FILE_MODE);

        let fifo = node.join("cmd");
        perms.make_fifo(&fifo).unwrap();
        // Creating it twice is fine
        perms.make_fifo(&fifo).unwrap();
        let meta = fs::metadata(&fifo).unwrap();
        assert!(meta.file_type().is_fifo());
        assert_eq!(meta.permissions().mode() & 0o777, FIFO_MODE);
    }
}
