//! Textual key-action encoding
//!
//! ```text
//! ""                      → Unbound
//! a                       → Normal("a")
//! $mode:1                 → Mode(Absolute(1))
//! $mode:-3                → Mode(NextWrap)
//! $dpi:-3+800+800         → Dpi(Custom { x: 800, y: 800 })
//! $light:2                → Light(UpWrap)
//! $lock:0                 → Lock(Toggle)
//! $program:xterm+%20+1    → Program { on_press: "xterm", on_release: " ", stop: 1 }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while decoding a key action
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyActionError {
    #[error("special action without parameter: {0}")]
    MissingParameter(String),
    #[error("invalid parameter in {0}")]
    InvalidParameter(String),
    #[error("unknown special action: {0}")]
    UnknownKind(String),
    #[error("malformed program action: {0}")]
    MalformedProgram(String),
}

/// Target of a `$mode` action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModeTarget {
    Absolute(usize),
    Next,
    Prev,
    NextWrap,
    PrevWrap,
}

/// Target of a `$dpi` action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DpiTarget {
    Up,
    Down,
    /// Momentary switch to stage 0 while held
    Sniper,
    /// Momentary switch to an arbitrary X/Y while held; both must be > 0 to apply
    Custom { x: i32, y: i32 },
    /// Direct stage select; only 1..DPI_COUNT applies
    Stage(i32),
}

/// Brightness step of a `$light` action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LightStep {
    Up,
    Down,
    UpWrap,
    DownWrap,
}

/// Change applied by a `$lock` action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockChange {
    Toggle,
    On,
    Off,
}

/// Bitmask deciding which running programs get stopped on which edge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopPolicy(pub u8);

impl StopPolicy {
    /// Stop the press-program when the key is released
    pub const PRESS_STOP_ON_RELEASE: u8 = 1;
    /// Stop the release-program when the key is pressed
    pub const RELEASE_STOP_ON_PRESS: u8 = 2;
    /// Stop (and so restart) the press-program when the key is pressed again
    pub const PRESS_STOP_ON_PRESS: u8 = 4;

    pub fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// `$program` action: commands run through `sh -c`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramAction {
    pub on_press: String,
    pub on_release: String,
    pub stop: StopPolicy,
}

/// The value bound to one physical key
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KeyAction {
    #[default]
    Unbound,
    /// Passthrough of the named key
    Normal(String),
    Mode(ModeTarget),
    Dpi(DpiTarget),
    Light(LightStep),
    Lock(LockChange),
    Program(ProgramAction),
}

impl KeyAction {
    /// Binding a freshly created mode gives to `key`
    pub fn default_for(key: &str) -> KeyAction {
        let bytes = key.as_bytes();
        if bytes.len() >= 2 && bytes[0] == b'g' && bytes[1].is_ascii_digit() {
            return KeyAction::Unbound;
        }
        match key {
            "mr" => KeyAction::Unbound,
            "m1" => KeyAction::Mode(ModeTarget::Absolute(0)),
            "m2" => KeyAction::Mode(ModeTarget::Absolute(1)),
            "m3" => KeyAction::Mode(ModeTarget::Absolute(2)),
            "light" => KeyAction::Light(LightStep::UpWrap),
            "lock" => KeyAction::Lock(LockChange::Toggle),
            "dpiup" => KeyAction::Dpi(DpiTarget::Up),
            "dpidn" => KeyAction::Dpi(DpiTarget::Down),
            "sniper" => KeyAction::Dpi(DpiTarget::Sniper),
            _ => KeyAction::Normal(key.to_string()),
        }
    }

    pub fn is_special(&self) -> bool {
        !matches!(self, KeyAction::Unbound | KeyAction::Normal(_))
    }

    /// Key name passed through to the host, if any
    pub fn passthrough(&self) -> Option<&str> {
        match self {
            KeyAction::Normal(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for KeyAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyAction::Unbound => Ok(()),
            KeyAction::Normal(name) => write!(f, "{}", name),
            KeyAction::Mode(target) => {
                let param: i64 = match target {
                    ModeTarget::Absolute(i) => *i as i64,
                    ModeTarget::Next => -1,
                    ModeTarget::Prev => -2,
                    ModeTarget::NextWrap => -3,
                    ModeTarget::PrevWrap => -4,
                };
                write!(f, "$mode:{}", param)
            }
            KeyAction::Dpi(target) => match target {
                DpiTarget::Up => write!(f, "$dpi:-2"),
                DpiTarget::Down => write!(f, "$dpi:-1"),
                DpiTarget::Sniper => write!(f, "$dpi:0"),
                DpiTarget::Custom { x, y } => write!(f, "$dpi:-3+{}+{}", x, y),
                DpiTarget::Stage(stage) => write!(f, "$dpi:{}", stage),
            },
            KeyAction::Light(step) => {
                let param = match step {
                    LightStep::Up => 0,
                    LightStep::Down => 1,
                    LightStep::UpWrap => 2,
                    LightStep::DownWrap => 3,
                };
                write!(f, "$light:{}", param)
            }
            KeyAction::Lock(change) => {
                let param = match change {
                    LockChange::Toggle => 0,
                    LockChange::On => 1,
                    LockChange::Off => 2,
                };
                write!(f, "$lock:{}", param)
            }
            KeyAction::Program(program) => write!(
                f,
                "$program:{}+{}+{}",
                percent_encode(program.on_press.trim()),
                percent_encode(program.on_release.trim()),
                program.stop.0
            ),
        }
    }
}

impl FromStr for KeyAction {
    type Err = KeyActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(KeyAction::Unbound);
        }
        if !s.starts_with('$') {
            return Ok(KeyAction::Normal(s.to_string()));
        }

        let (kind, param) = s[1..]
            .split_once(':')
            .ok_or_else(|| KeyActionError::MissingParameter(s.to_string()))?;
        let invalid = || KeyActionError::InvalidParameter(s.to_string());
        let int = |p: &str| p.parse::<i64>().map_err(|_| invalid());
        let int32 = |p: &str| int(p).and_then(|v| i32::try_from(v).map_err(|_| invalid()));

        match kind {
            "mode" => {
                let target = match int(param)? {
                    -1 => ModeTarget::Next,
                    -2 => ModeTarget::Prev,
                    -3 => ModeTarget::NextWrap,
                    -4 => ModeTarget::PrevWrap,
                    n if n >= 0 => ModeTarget::Absolute(n as usize),
                    _ => return Err(invalid()),
                };
                Ok(KeyAction::Mode(target))
            }
            "dpi" => {
                let mut parts = param.split('+');
                let level = int(parts.next().unwrap_or_default())?;
                let target = match level {
                    -2 => DpiTarget::Up,
                    -1 => DpiTarget::Down,
                    0 => DpiTarget::Sniper,
                    -3 => {
                        let x = parts.next().ok_or_else(invalid)?;
                        let y = parts.next().ok_or_else(invalid)?;
                        DpiTarget::Custom { x: int32(x)?, y: int32(y)? }
                    }
                    n => DpiTarget::Stage(i32::try_from(n).map_err(|_| invalid())?),
                };
                Ok(KeyAction::Dpi(target))
            }
            "light" => {
                let step = match int(param)? {
                    0 => LightStep::Up,
                    1 => LightStep::Down,
                    2 => LightStep::UpWrap,
                    3 => LightStep::DownWrap,
                    _ => return Err(invalid()),
                };
                Ok(KeyAction::Light(step))
            }
            "lock" => {
                let change = match int(param)? {
                    0 => LockChange::Toggle,
                    1 => LockChange::On,
                    2 => LockChange::Off,
                    _ => return Err(invalid()),
                };
                Ok(KeyAction::Lock(change))
            }
            "program" => {
                let parts: Vec<&str> = param.split('+').collect();
                if parts.len() != 3 {
                    return Err(KeyActionError::MalformedProgram(s.to_string()));
                }
                let stop = parts[2]
                    .parse::<u8>()
                    .map_err(|_| KeyActionError::MalformedProgram(s.to_string()))?;
                Ok(KeyAction::Program(ProgramAction {
                    on_press: percent_decode(parts[0]),
                    on_release: percent_decode(parts[1]),
                    stop: StopPolicy(stop),
                }))
            }
            other => Err(KeyActionError::UnknownKind(other.to_string())),
        }
    }
}

/// Percent-encode everything outside the unreserved set (`A-Z a-z 0-9 - . _ ~`)
pub fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Decode `%XX` escapes; malformed escapes are kept literally
pub fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
