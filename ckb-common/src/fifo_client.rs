//! Async client for the ckbd device-node interface
//!
//! The daemon exposes a root node (`ckb0`) with `version` and `connected` files and one
//! node per device holding a `cmd` FIFO, `notifyN` FIFOs and a handful of info files.
//! This module wraps those files with timeouts and error handling.

use crate::{parse_connected, ConnectedEntry, DeviceFeatures, Notification, DEFAULT_ROOT_PATH};

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::time::timeout;

/// Errors that can occur while talking to the daemon
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Daemon not running at {0}")]
    DaemonNotRunning(String),

    #[error("No reader on command FIFO {0}")]
    NoReader(String),

    #[error("Operation timeout after {0}ms")]
    OperationTimeout(u64),

    #[error("Notification channel {0} out of range")]
    InvalidChannel(usize),

    #[error("Command contains a newline")]
    InvalidCommand,

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,
}

/// Default timeout for operations (in milliseconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Delay between attempts to open a FIFO that has no reader yet
pub const DEFAULT_RETRY_DELAY_MS: u64 = 50;

/// Client for the root node of a running daemon
#[derive(Debug, Clone)]
pub struct DaemonClient {
    root: PathBuf,
    timeout: Duration,
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonClient {
    /// Create a client for the default root node
    pub fn new() -> Self {
        Self::with_root(DEFAULT_ROOT_PATH)
    }

    /// Create a client for a custom root node
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Set the timeout for operations
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Duration::from_millis(timeout_ms);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A daemon is running when its root node carries a `version` file
    pub async fn is_daemon_running(&self) -> bool {
        tokio::fs::metadata(self.root.join("version")).await.is_ok()
    }

    /// Contents of the root `version` file
    pub async fn daemon_version(&self) -> Result<String, ClientError> {
        match tokio::fs::read_to_string(self.root.join("version")).await {
            Ok(text) => Ok(text.trim().to_string()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ClientError::DaemonNotRunning(self.root.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Devices listed in the root `connected` file
    pub async fn connected_devices(&self) -> Result<Vec<ConnectedEntry>, ClientError> {
        match tokio::fs::read_to_string(self.root.join("connected")).await {
            Ok(text) => Ok(parse_connected(&text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ClientError::DaemonNotRunning(self.root.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Client for one device node, inheriting this client's timeout
    pub fn device<P: AsRef<Path>>(&self, node: P) -> DeviceNodeClient {
        DeviceNodeClient {
            node: node.as_ref().to_path_buf(),
            timeout: self.timeout,
        }
    }
}

/// Client for a single device node (`ckb1`..`ckb9`)
#[derive(Debug, Clone)]
pub struct DeviceNodeClient {
    node: PathBuf,
    timeout: Duration,
}

impl DeviceNodeClient {
    pub fn new<P: AsRef<Path>>(node: P) -> Self {
        DaemonClient::new().device(node)
    }

    /// Set the timeout for operations
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Duration::from_millis(timeout_ms);
        self
    }

    pub fn path(&self) -> &Path {
        &self.node
    }

    /// Read one of the node's info files (`model`, `serial`, `features`, ...)
    pub async fn read_info(&self, name: &str) -> Result<String, ClientError> {
        let text = tokio::fs::read_to_string(self.node.join(name)).await?;
        Ok(text.trim_end_matches('\n').to_string())
    }

    pub async fn features(&self) -> Result<DeviceFeatures, ClientError> {
        let text = self.read_info("features").await?;
        // FromStr for DeviceFeatures never fails
        Ok(text.parse().unwrap_or_default())
    }

    /// Write one command line to the node's `cmd` FIFO
    ///
    /// Opening a FIFO for writing fails with ENXIO until the daemon has it open for
    /// reading, so the open is retried until the timeout expires.
    pub async fn send_command(&self, line: &str) -> Result<(), ClientError> {
        if line.contains('\n') {
            return Err(ClientError::InvalidCommand);
        }
        let path = self.node.join("cmd");
        let timeout_ms = self.timeout.as_millis() as u64;

        let mut sender = timeout(self.timeout, async {
            loop {
                match pipe::OpenOptions::new().open_sender(&path) {
                    Ok(sender) => return Ok(sender),
                    Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                        tracing::debug!("No reader on {} yet, retrying", path.display());
                        tokio::time::sleep(Duration::from_millis(DEFAULT_RETRY_DELAY_MS)).await;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Err(ClientError::DaemonNotRunning(path.display().to_string()));
                    }
                    Err(e) => return Err(ClientError::Io(e)),
                }
            }
        })
        .await
        .map_err(|_| ClientError::NoReader(path.display().to_string()))??;

        let mut payload = line.as_bytes().to_vec();
        payload.push(b'\n');
        timeout(self.timeout, sender.write_all(&payload))
            .await
            .map_err(|_| ClientError::OperationTimeout(timeout_ms))??;
        Ok(())
    }

    /// Open notification channel `channel` (0 is always present; others after `notifyon`)
    pub async fn notifications(&self, channel: usize) -> Result<NotificationStream, ClientError> {
        if channel >= crate::OUTFIFO_MAX {
            return Err(ClientError::InvalidChannel(channel));
        }
        let path = self.node.join(format!("notify{}", channel));
        // read_write keeps the receiver from seeing EOF while the daemon reopens the FIFO
        let receiver = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&path)?;
        Ok(NotificationStream {
            reader: BufReader::new(receiver),
            timeout: self.timeout,
        })
    }
}

/// Line reader over a notification FIFO
#[derive(Debug)]
pub struct NotificationStream {
    reader: BufReader<pipe::Receiver>,
    timeout: Duration,
}

impl NotificationStream {
    /// Wait for the next record
    pub async fn next(&mut self) -> Result<Notification, ClientError> {
        let mut line = String::new();
        let read = timeout(self.timeout, self.reader.read_line(&mut line))
            .await
            .map_err(|_| ClientError::OperationTimeout(self.timeout.as_millis() as u64))??;
        if read == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        // Infallible
        Ok(line.parse().unwrap_or(Notification::Reply(line)))
    }

    /// Skip records until one matches `predicate`
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Result<Notification, ClientError>
    where
        F: FnMut(&Notification) -> bool,
    {
        loop {
            let record = self.next().await?;
            if predicate(&record) {
                return Ok(record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn fake_node(dir: &TempDir) -> PathBuf {
        let node = dir.path().join("ckb1");
        std::fs::create_dir(&node).unwrap();
        mkfifo(&node.join("cmd"), Mode::from_bits_truncate(0o660)).unwrap();
        mkfifo(&node.join("notify0"), Mode::from_bits_truncate(0o660)).unwrap();
        std::fs::write(node.join("features"), "corsair k70 rgb bind notify\n").unwrap();
        node
    }

    #[test]
    fn test_client_creation() {
        let client = DaemonClient::new();
        assert_eq!(client.root(), Path::new(DEFAULT_ROOT_PATH));
        assert_eq!(client.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));

        let custom = DaemonClient::with_root("/tmp/ckb0").with_timeout(250);
        assert_eq!(custom.timeout, Duration::from_millis(250));
        assert_eq!(custom.device("/tmp/ckb1").timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_root_files() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("ckb0");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("version"), "0.2.0\n").unwrap();
        std::fs::write(root.join("connected"), "/dev/input/ckb1 ABC\n").unwrap();

        let client = DaemonClient::with_root(&root);
        tokio_test::block_on(async {
            assert!(client.is_daemon_running().await);
            assert_eq!(client.daemon_version().await.unwrap(), "0.2.0");
            let devices = client.connected_devices().await.unwrap();
            assert_eq!(devices.len(), 1);
            assert_eq!(devices[0].serial, "ABC");
        });
    }

    #[tokio::test]
    async fn test_daemon_not_running() {
        let client = DaemonClient::with_root("/tmp/nonexistent-ckb0");
        assert!(!client.is_daemon_running().await);
        assert!(matches!(
            client.daemon_version().await,
            Err(ClientError::DaemonNotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_send_command_reaches_reader() {
        let dir = TempDir::new().unwrap();
        let node = fake_node(&dir);

        let mut receiver = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(node.join("cmd"))
            .unwrap();

        let client = DeviceNodeClient::new(&node).with_timeout(1000);
        client.send_command("rgb ff0000").await.unwrap();

        let mut buf = vec![0u8; 11];
        receiver.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"rgb ff0000\n");

        assert!(matches!(
            client.send_command("a\nb").await,
            Err(ClientError::InvalidCommand)
        ));
    }

    #[tokio::test]
    async fn test_send_command_without_reader_times_out() {
        let dir = TempDir::new().unwrap();
        let node = fake_node(&dir);

        let client = DeviceNodeClient::new(&node).with_timeout(150);
        assert!(matches!(
            client.send_command("idle").await,
            Err(ClientError::NoReader(_))
        ));
    }

    #[tokio::test]
    async fn test_notification_stream() {
        let dir = TempDir::new().unwrap();
        let node = fake_node(&dir);
        let client = DeviceNodeClient::new(&node).with_timeout(1000);

        let mut stream = client.notifications(0).await.unwrap();
        let mut writer = pipe::OpenOptions::new()
            .open_sender(node.join("notify0"))
            .unwrap();
        writer.write_all(b"key +a\nswitch 2\n").await.unwrap();

        assert_eq!(
            stream.next().await.unwrap(),
            Notification::Key { name: "a".to_string(), down: true }
        );
        let switch = stream
            .wait_for(|n| matches!(n, Notification::Switch { .. }))
            .await
            .unwrap();
        assert_eq!(switch, Notification::Switch { mode: 2 });

        assert!(matches!(
            client.notifications(crate::OUTFIFO_MAX).await,
            Err(ClientError::InvalidChannel(_))
        ));
        assert!(client.features().await.unwrap().contains(DeviceFeatures::RGB));
    }
}
