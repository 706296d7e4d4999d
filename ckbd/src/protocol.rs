//! USB report encoding per device family
//!
//! Report Format (control messages, 64 bytes, report ID 0 prepended by the transport):
//! ```text
//! 07 27 00 00 d8            commit RGB lighting (after 7f 01..04 data packets)
//! 07 05 LL 00 03            non-RGB backlight level
//! 07 22 NN 01 [z r g b]...  mouse zone colors
//! 07 13 XX 00 ...           DPI stage / select / enable / lift / snap
//! 07 0a 00 00 MS            poll rate
//! 07 40 NN 00 [scan act]... key binding update, up to 30 pairs per report
//! 07 04 02 / 07 04 01       software / hardware control
//! 0e 01                     firmware query
//! 0e 15 01 SS / 0e 14 SS PP / 0e 13 XX SS   hardware profile reads
//! ```

use ckb_common::DeviceFeatures;
use uuid::Uuid;

use crate::input::{InputReport, KeySet, WHEEL_DOWN, WHEEL_UP};
use crate::keymap::{self, ProductKind, MOUSE_BUTTON_BASE, N_KEYS_KB, N_MOUSE_BUTTONS, ZONE_BASE};
use crate::profile::{DpiSet, HwSlot, Lighting, Rgb, DPI_COUNT, NAME_LEN};

pub const MSG_SIZE: usize = 64;
pub type Report = [u8; MSG_SIZE];

/// Bytes of 9-bit packed lighting (3 bits per channel, two keys per byte, three planes)
pub const PACKED_LIGHTING_LEN: usize = N_KEYS_KB / 2 * 3;
/// Data bytes per lighting packet
const LIGHT_CHUNK: usize = 60;
/// Key/action pairs per binding packet
const BIND_PAIRS: usize = 30;

/// Key is handled by the keyboard as a normal HID key
pub const BIND_HARDWARE: u8 = 0x80;
/// Key is reported to the daemon only
pub const BIND_SOFTWARE: u8 = 0xc0;

const RGB_INPUT_ID: u8 = 0x03;
const RGB_INPUT_LEN: usize = 1 + N_KEYS_KB / 8;
const MOUSE_INPUT_ID: u8 = 0x01;
const MOUSE_INPUT_LEN: usize = 9;
const BOOT_REPORT_LEN: usize = 8;

fn report(header: &[u8]) -> Report {
    let mut out = [0u8; MSG_SIZE];
    out[..header.len()].copy_from_slice(header);
    out
}

/// Hardware family of a device, fixed at attach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    RgbKeyboard,
    PlainKeyboard,
    Mouse { zones: u8 },
}

impl DeviceFamily {
    /// Pick the family for a product from its kind and feature flags
    pub fn select(kind: ProductKind, features: DeviceFeatures, zones: usize) -> Self {
        match kind {
            ProductKind::Mouse => DeviceFamily::Mouse {
                zones: zones.min(keymap::N_MOUSE_ZONES) as u8,
            },
            ProductKind::Keyboard if features.contains(DeviceFeatures::RGB) => {
                DeviceFamily::RgbKeyboard
            }
            ProductKind::Keyboard => DeviceFamily::PlainKeyboard,
        }
    }

    pub fn is_keyboard(&self) -> bool {
        !matches!(self, DeviceFamily::Mouse { .. })
    }

    pub fn is_mouse(&self) -> bool {
        matches!(self, DeviceFamily::Mouse { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceFamily::RgbKeyboard => "rgb-keyboard",
            DeviceFamily::PlainKeyboard => "keyboard",
            DeviceFamily::Mouse { .. } => "mouse",
        }
    }

    /// Reports that put `frame` on the device
    pub fn lighting_frame(&self, frame: &[Rgb]) -> Vec<Report> {
        match self {
            DeviceFamily::RgbKeyboard => {
                let packed = pack_lighting(frame);
                let mut out: Vec<Report> = packed
                    .chunks(LIGHT_CHUNK)
                    .enumerate()
                    .map(|(i, chunk)| {
                        let mut r = report(&[0x7f, i as u8 + 1, chunk.len() as u8, 0x00]);
                        r[4..4 + chunk.len()].copy_from_slice(chunk);
                        r
                    })
                    .collect();
                out.push(report(&[0x07, 0x27, 0x00, 0x00, 0xd8]));
                out
            }
            DeviceFamily::PlainKeyboard => {
                // Single-color backlight: the brightest key decides the level
                let peak = frame
                    .iter()
                    .take(N_KEYS_KB)
                    .map(|c| c.r.max(c.g).max(c.b))
                    .max()
                    .unwrap_or(0);
                vec![report(&[0x07, 0x05, peak >> 6, 0x00, 0x03])]
            }
            DeviceFamily::Mouse { zones } => {
                let mut r = report(&[0x07, 0x22, *zones, 0x01]);
                for z in 0..*zones as usize {
                    let c = frame.get(ZONE_BASE + z).copied().unwrap_or_default();
                    let at = 4 + z * 4;
                    r[at..at + 4].copy_from_slice(&[z as u8 + 1, c.r, c.g, c.b]);
                }
                vec![r]
            }
        }
    }

    /// Reports telling the keyboard which keys the daemon handles
    pub fn binding_update(&self, software: &KeySet) -> Vec<Report> {
        if !self.is_keyboard() {
            return Vec::new();
        }
        let pairs: Vec<[u8; 2]> = (0..N_KEYS_KB)
            .map(|i| {
                let action = if software.get(i) { BIND_SOFTWARE } else { BIND_HARDWARE };
                [i as u8, action]
            })
            .collect();
        pairs
            .chunks(BIND_PAIRS)
            .map(|chunk| {
                let mut r = report(&[0x07, 0x40, chunk.len() as u8, 0x00]);
                for (i, pair) in chunk.iter().enumerate() {
                    r[4 + i * 2..6 + i * 2].copy_from_slice(pair);
                }
                r
            })
            .collect()
    }

    /// Reports moving the device from `last` to `dpi`; everything is sent when `last` is None
    pub fn dpi_update(&self, dpi: &DpiSet, last: Option<&DpiSet>) -> Vec<Report> {
        if !self.is_mouse() {
            return Vec::new();
        }
        let last = if dpi.force_update { None } else { last };
        let mut out = Vec::new();
        for stage in 0..DPI_COUNT {
            let changed = last.map_or(true, |l| l.x[stage] != dpi.x[stage] || l.y[stage] != dpi.y[stage]);
            if changed {
                let [xlo, xhi] = dpi.x[stage].to_le_bytes();
                let [ylo, yhi] = dpi.y[stage].to_le_bytes();
                out.push(report(&[0x07, 0x13, 0xd0 + stage as u8, 0x00, xlo, xhi, ylo, yhi]));
            }
        }
        if last.map_or(true, |l| l.enabled != dpi.enabled) {
            out.push(report(&[0x07, 0x13, 0x05, 0x00, dpi.enabled]));
        }
        if last.map_or(true, |l| l.current != dpi.current) {
            out.push(report(&[0x07, 0x13, 0x02, 0x00, dpi.current]));
        }
        if last.map_or(true, |l| l.lift != dpi.lift) {
            out.push(report(&[0x07, 0x13, 0x03, 0x00, dpi.lift]));
        }
        if last.map_or(true, |l| l.snap != dpi.snap) {
            out.push(report(&[0x07, 0x13, 0x04, 0x00, dpi.snap as u8, 0x05]));
        }
        out
    }

    /// Hand control to the daemon (`true`) or back to the device firmware
    pub fn control(&self, software: bool) -> Report {
        report(&[0x07, 0x04, if software { 0x02 } else { 0x01 }])
    }

    /// Decode one input report; malformed reports yield None
    pub fn decode_input(&self, data: &[u8]) -> Option<InputReport> {
        match self {
            DeviceFamily::RgbKeyboard => {
                if data.len() < RGB_INPUT_LEN || data[0] != RGB_INPUT_ID {
                    return None;
                }
                let mut keys = KeySet::new();
                keys.0[..N_KEYS_KB / 8].copy_from_slice(&data[1..RGB_INPUT_LEN]);
                Some(InputReport { keys, dx: 0, dy: 0 })
            }
            DeviceFamily::PlainKeyboard => {
                if data.len() < BOOT_REPORT_LEN {
                    return None;
                }
                let mut keys = KeySet::new();
                for bit in 0..8 {
                    if data[0] & (1 << bit) != 0 {
                        if let Some(input) = keymap::key_by_usage(0xe0 + bit).and_then(|k| k.input) {
                            keys.set(input);
                        }
                    }
                }
                for &usage in &data[2..BOOT_REPORT_LEN] {
                    match usage {
                        0 => {}
                        // Phantom state on rollover
                        1..=3 => return None,
                        _ => {
                            if let Some(input) = keymap::key_by_usage(usage).and_then(|k| k.input) {
                                keys.set(input);
                            }
                        }
                    }
                }
                Some(InputReport { keys, dx: 0, dy: 0 })
            }
            DeviceFamily::Mouse { .. } => {
                if data.len() < MOUSE_INPUT_LEN || data[0] != MOUSE_INPUT_ID {
                    return None;
                }
                let buttons = data[1] as u32 | (data[2] as u32) << 8 | (data[3] as u32) << 16;
                let mut keys = KeySet::new();
                for b in 0..N_MOUSE_BUTTONS {
                    if buttons & (1 << b) != 0 {
                        keys.set(MOUSE_BUTTON_BASE + b);
                    }
                }
                let wheel = data[8] as i8;
                if wheel > 0 {
                    keys.set(WHEEL_UP);
                } else if wheel < 0 {
                    keys.set(WHEEL_DOWN);
                }
                Some(InputReport {
                    keys,
                    dx: i16::from_le_bytes([data[4], data[5]]),
                    dy: i16::from_le_bytes([data[6], data[7]]),
                })
            }
        }
    }
}

/// Pack a frame into the 9-bit RGB keyboard layout
pub fn pack_lighting(frame: &[Rgb]) -> [u8; PACKED_LIGHTING_LEN] {
    let mut out = [0u8; PACKED_LIGHTING_LEN];
    let plane = N_KEYS_KB / 2;
    for key in 0..N_KEYS_KB {
        let c = frame.get(key).copied().unwrap_or_default();
        for (p, value) in [c.r, c.g, c.b].into_iter().enumerate() {
            let nibble = 7 - (value >> 5);
            let at = p * plane + key / 2;
            if key % 2 == 0 {
                out[at] |= nibble;
            } else {
                out[at] |= nibble << 4;
            }
        }
    }
    out
}

/// Inverse of [`pack_lighting`], expanding 3-bit channels to full range
pub fn unpack_lighting(packed: &[u8]) -> Lighting {
    let mut light = Lighting::default();
    let plane = N_KEYS_KB / 2;
    if packed.len() < PACKED_LIGHTING_LEN {
        return light;
    }
    let expand = |n: u8| ((7 - (n & 7)) as u32 * 255 / 7) as u8;
    for key in 0..N_KEYS_KB {
        let nibble = |p: usize| {
            let byte = packed[p * plane + key / 2];
            if key % 2 == 0 { byte & 0x0f } else { byte >> 4 }
        };
        light.set(key, Rgb::new(expand(nibble(0)), expand(nibble(1)), expand(nibble(2))));
    }
    light
}

pub fn poll_rate_report(ms: u8) -> Report {
    report(&[0x07, 0x0a, 0x00, 0x00, ms])
}

/// Poll intervals the hardware accepts, in milliseconds
pub fn valid_poll_rate(ms: u8) -> bool {
    matches!(ms, 1 | 2 | 4 | 8)
}

pub fn firmware_query() -> Report {
    report(&[0x0e, 0x01])
}

/// Firmware identity reported at attach
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub version: u16,
    pub bootloader: u16,
    pub vendor: u16,
    pub product: u16,
    /// Poll interval in milliseconds
    pub poll_rate: u8,
}

pub fn parse_firmware(reply: &[u8]) -> Option<FirmwareInfo> {
    if reply.len() < 17 || reply[0] != 0x0e || reply[1] != 0x01 {
        return None;
    }
    let word = |at: usize| u16::from_le_bytes([reply[at], reply[at + 1]]);
    Some(FirmwareInfo {
        version: word(8),
        bootloader: word(10),
        vendor: word(12),
        product: word(14),
        poll_rate: reply[16],
    })
}

/// Query for the id and name of hardware slot `slot` (0 = profile, 1.. = modes)
pub fn hw_slot_query(slot: u8) -> Report {
    report(&[0x0e, 0x15, 0x01, slot])
}

pub fn parse_hw_slot(reply: &[u8]) -> Option<HwSlot> {
    if reply.len() < 24 + NAME_LEN * 2 || reply[0] != 0x0e || reply[1] != 0x15 {
        return None;
    }
    let mut guid = [0u8; 16];
    guid.copy_from_slice(&reply[4..20]);
    let units: Vec<u16> = reply[24..24 + NAME_LEN * 2]
        .chunks(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|u| *u != 0)
        .collect();
    Some(HwSlot {
        id: Uuid::from_bytes_le(guid),
        modified: u32::from_le_bytes([reply[20], reply[21], reply[22], reply[23]]),
        name: String::from_utf16_lossy(&units),
    })
}

/// Query for part `part` (1-based) of the packed lighting in hardware mode `slot`
pub fn hw_light_query(slot: u8, part: u8) -> Report {
    report(&[0x0e, 0x14, slot, part])
}

/// Number of packets carrying a hardware lighting map
pub fn hw_light_parts() -> u8 {
    PACKED_LIGHTING_LEN.div_ceil(LIGHT_CHUNK) as u8
}

/// Data bytes carried by lighting part `part` (1-based)
pub fn hw_light_part_len(part: u8) -> usize {
    let start = (part as usize - 1) * LIGHT_CHUNK;
    PACKED_LIGHTING_LEN.saturating_sub(start).min(LIGHT_CHUNK)
}

pub fn hw_dpi_query(slot: u8, stage: u8) -> Report {
    report(&[0x0e, 0x13, 0xd0 + stage, slot])
}

pub fn parse_hw_dpi(reply: &[u8]) -> Option<(u16, u16)> {
    if reply.len() < 8 || reply[0] != 0x0e || reply[1] != 0x13 {
        return None;
    }
    Some((
        u16::from_le_bytes([reply[4], reply[5]]),
        u16::from_le_bytes([reply[6], reply[7]]),
    ))
}
