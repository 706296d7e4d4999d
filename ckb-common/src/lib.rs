//! Shared vocabulary for the ckbd daemon and its clients
//!
//! Everything that crosses the daemon boundary is line-oriented text, so this crate
//! holds the types on both ends of those lines:
//! - Device feature flags (`features` node file)
//! - The textual key-action encoding (`bind` command, persisted bindings)
//! - Notification records (notify FIFOs)
//! - The root `connected` / `version` status files
//! - A small async client for all of the above

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// Re-export common dependencies
pub use serde;
pub use tokio;
pub use tracing;

pub mod fifo_client;
pub mod key_action;

pub use key_action::{
    percent_decode, percent_encode, DpiTarget, KeyAction, KeyActionError, LightStep, LockChange,
    ModeTarget, ProgramAction, StopPolicy,
};

/// Version string written to the root `version` file
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum number of notification channels per device
pub const OUTFIFO_MAX: usize = 10;

/// Maximum number of device nodes (ckb1..ckb9); node 0 is the root
pub const DEV_MAX: usize = 9;

/// Default root device node
pub const DEFAULT_ROOT_PATH: &str = "/dev/input/ckb0";

/// Capability bitmask reported by a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFeatures(pub u16);

impl DeviceFeatures {
    pub const RGB: Self = Self(0x001);
    pub const POLLRATE: Self = Self(0x002);
    pub const ADJRATE: Self = Self(0x004);
    pub const BIND: Self = Self(0x008);
    pub const NOTIFY: Self = Self(0x010);
    pub const FWVERSION: Self = Self(0x020);
    pub const FWUPDATE: Self = Self(0x040);
    pub const HWLOAD: Self = Self(0x080);
    pub const ANSI: Self = Self(0x100);
    pub const ISO: Self = Self(0x200);
    pub const MOUSEACCEL: Self = Self(0x400);

    pub const COMMON: Self =
        Self(Self::BIND.0 | Self::NOTIFY.0 | Self::FWVERSION.0 | Self::MOUSEACCEL.0 | Self::HWLOAD.0);
    pub const STD_RGB: Self =
        Self(Self::COMMON.0 | Self::RGB.0 | Self::POLLRATE.0 | Self::FWUPDATE.0);
    pub const STD_NRGB: Self = Self::COMMON;
    pub const LAYOUT_MASK: Self = Self(Self::ANSI.0 | Self::ISO.0);

    const NAMES: [(Self, &'static str); 11] = [
        (Self::RGB, "rgb"),
        (Self::POLLRATE, "pollrate"),
        (Self::ADJRATE, "adjrate"),
        (Self::BIND, "bind"),
        (Self::NOTIFY, "notify"),
        (Self::FWVERSION, "fwversion"),
        (Self::FWUPDATE, "fwupdate"),
        (Self::HWLOAD, "hwload"),
        (Self::ANSI, "ansi"),
        (Self::ISO, "iso"),
        (Self::MOUSEACCEL, "mouseaccel"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    /// All bits of `other` are set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// At least one bit of `other` is set
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl std::ops::BitOr for DeviceFeatures {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Display for DeviceFeatures {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let words: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", words.join(" "))
    }
}

impl FromStr for DeviceFeatures {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut features = Self::empty();
        for word in s.split_whitespace() {
            match Self::NAMES.iter().find(|(_, name)| *name == word) {
                Some((flag, _)) => features = features | *flag,
                // Vendor/model words precede the flags in the node file
                None => continue,
            }
        }
        Ok(features)
    }
}

/// Host indicator LEDs
pub mod indicator {
    pub const NUM: u8 = 1;
    pub const CAPS: u8 = 2;
    pub const SCROLL: u8 = 4;
    pub const ALL: u8 = NUM | CAPS | SCROLL;

    pub const NAMES: [(u8, &str); 3] = [(NUM, "num"), (CAPS, "caps"), (SCROLL, "scroll")];

    /// Parse a comma-separated LED list (`num,caps` or `all`)
    pub fn parse_list(s: &str) -> Option<u8> {
        let mut mask = 0;
        for word in s.split(',') {
            match word {
                "all" => mask |= ALL,
                _ => mask |= NAMES.iter().find(|(_, n)| *n == word)?.0,
            }
        }
        Some(mask)
    }

    pub fn name(bit: u8) -> Option<&'static str> {
        NAMES.iter().find(|(b, _)| *b == bit).map(|(_, n)| *n)
    }
}

/// One record written to a notification FIFO
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// `key +name` / `key -name`
    Key { name: String, down: bool },
    /// `i +caps` / `i -caps`
    Indicator { name: String, on: bool },
    /// `switch N` (1-based mode number)
    Switch { mode: usize },
    /// Anything else, e.g. replies to `get`
    Reply(String),
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sign = |b: bool| if b { '+' } else { '-' };
        match self {
            Notification::Key { name, down } => write!(f, "key {}{}", sign(*down), name),
            Notification::Indicator { name, on } => write!(f, "i {}{}", sign(*on), name),
            Notification::Switch { mode } => write!(f, "switch {}", mode),
            Notification::Reply(text) => write!(f, "{}", text),
        }
    }
}

impl FromStr for Notification {
    type Err = std::convert::Infallible;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches('\n');
        let signed = |rest: &str| -> Option<(bool, String)> {
            let mut chars = rest.chars();
            let on = match chars.next()? {
                '+' => true,
                '-' => false,
                _ => return None,
            };
            let name = chars.as_str();
            if name.is_empty() || name.contains(' ') {
                return None;
            }
            Some((on, name.to_string()))
        };

        if let Some((down, name)) = line.strip_prefix("key ").and_then(signed) {
            return Ok(Notification::Key { name, down });
        }
        if let Some((on, name)) = line.strip_prefix("i ").and_then(signed) {
            return Ok(Notification::Indicator { name, on });
        }
        if let Some(mode) = line.strip_prefix("switch ").and_then(|m| m.parse().ok()) {
            return Ok(Notification::Switch { mode });
        }
        Ok(Notification::Reply(line.to_string()))
    }
}

/// One line of the root `connected` file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedEntry {
    pub path: PathBuf,
    pub serial: String,
}

impl fmt::Display for ConnectedEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.path.display(), self.serial)
    }
}

/// Parse the contents of a `connected` file, skipping blank or malformed lines
pub fn parse_connected(contents: &str) -> Vec<ConnectedEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let (path, serial) = line.trim().split_once(' ')?;
            Some(ConnectedEntry {
                path: PathBuf::from(path),
                serial: serial.trim().to_string(),
            })
        })
        .collect()
}

/// Render a `connected` file, one newline-terminated entry per device
pub fn format_connected(entries: &[ConnectedEntry]) -> String {
    entries.iter().map(|e| format!("{}\n", e)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_words() {
        let features = DeviceFeatures::RGB | DeviceFeatures::BIND | DeviceFeatures::NOTIFY;
        assert_eq!(features.to_string(), "rgb bind notify");

        let parsed: DeviceFeatures = "corsair k70 rgb bind notify".parse().unwrap();
        assert_eq!(parsed, features);
    }

    #[test]
    fn test_standard_feature_sets() {
        assert!(DeviceFeatures::STD_RGB.contains(DeviceFeatures::RGB | DeviceFeatures::FWUPDATE));
        assert!(!DeviceFeatures::STD_NRGB.intersects(DeviceFeatures::RGB));
        assert!(DeviceFeatures::STD_NRGB.contains(DeviceFeatures::HWLOAD));
    }

    #[test]
    fn test_notification_lines() {
        let key: Notification = "key +a".parse().unwrap();
        assert_eq!(key, Notification::Key { name: "a".to_string(), down: true });
        assert_eq!(key.to_string(), "key +a");

        let led: Notification = "i -caps".parse().unwrap();
        assert_eq!(led, Notification::Indicator { name: "caps".to_string(), on: false });

        let switch: Notification = "switch 2".parse().unwrap();
        assert_eq!(switch, Notification::Switch { mode: 2 });

        let reply: Notification = "mode 1 rgb ff0000".parse().unwrap();
        assert_eq!(reply, Notification::Reply("mode 1 rgb ff0000".to_string()));
    }

    #[test]
    fn test_connected_file() {
        let entries = vec![
            ConnectedEntry { path: PathBuf::from("/dev/input/ckb1"), serial: "ABC123".to_string() },
            ConnectedEntry { path: PathBuf::from("/dev/input/ckb2"), serial: "DEF456".to_string() },
        ];
        let text = format_connected(&entries);
        assert_eq!(text, "/dev/input/ckb1 ABC123\n/dev/input/ckb2 DEF456\n");
        assert_eq!(parse_connected(&text), entries);
        assert!(parse_connected("\ngarbage\n").is_empty());
    }

    #[test]
    fn test_percent_coding_at_crate_root() {
        let encoded = crate::percent_encode("My Mode");
        assert_eq!(encoded, "My%20Mode");
        assert_eq!(crate::percent_decode(&encoded), "My Mode");
    }

    #[test]
    fn test_indicator_list() {
        assert_eq!(indicator::parse_list("num,scroll"), Some(indicator::NUM | indicator::SCROLL));
        assert_eq!(indicator::parse_list("all"), Some(indicator::ALL));
        assert_eq!(indicator::parse_list("num,bogus"), None);
    }
}
