//! Notification FIFOs of one device node
//!
//! Writers never block: every FIFO is opened read-write and nonblocking, so a channel with no
//! reader (or a full pipe) drops records instead of stalling the input thread.

use ckb_common::{Notification, OUTFIFO_MAX};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::security::NodePermissions;

/// Open notification channels of one device
#[derive(Debug)]
pub struct NotifyHub {
    dir: PathBuf,
    perms: NodePermissions,
    channels: Vec<Option<File>>,
}

impl NotifyHub {
    pub fn new(dir: &Path, perms: NodePermissions) -> Self {
        Self {
            dir: dir.to_path_buf(),
            perms,
            channels: (0..OUTFIFO_MAX).map(|_| None).collect(),
        }
    }

    pub fn path(&self, channel: usize) -> PathBuf {
        self.dir.join(format!("notify{}", channel))
    }

    pub fn is_open(&self, channel: usize) -> bool {
        matches!(self.channels.get(channel), Some(Some(_)))
    }

    /// Create and open channel `n`. Opening an open channel is a no-op.
    pub fn open(&mut self, channel: usize) -> io::Result<()> {
        if channel >= OUTFIFO_MAX {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "notify channel out of range"));
        }
        if self.is_open(channel) {
            return Ok(());
        }
        let path = self.path(channel);
        self.perms.make_fifo(&path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)?;
        self.channels[channel] = Some(file);
        debug!("Opened {}", path.display());
        Ok(())
    }

    /// Close and remove channel `n`. Channel 0 always stays open.
    pub fn close(&mut self, channel: usize) {
        if channel == 0 || channel >= OUTFIFO_MAX {
            return;
        }
        self.remove(channel);
    }

    fn remove(&mut self, channel: usize) {
        if self.channels[channel].take().is_some() {
            let path = self.path(channel);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    /// Close every channel, including 0
    pub fn close_all(&mut self) {
        for channel in 0..OUTFIFO_MAX {
            self.remove(channel);
        }
    }

    /// Write one record to channel `n`; dropped if the channel is closed or full
    pub fn write(&mut self, channel: usize, record: &Notification) {
        let Some(Some(file)) = self.channels.get_mut(channel) else { return };
        let line = format!("{}\n", record);
        match file.write_all(line.as_bytes()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("notify{} full, dropped: {}", channel, record);
            }
            Err(e) => warn!("Failed to write notify{}: {}", channel, e),
        }
    }

    /// Write a record to every open channel
    pub fn broadcast(&mut self, record: &Notification) {
        for channel in 0..OUTFIFO_MAX {
            self.write(channel, record);
        }
    }
}
