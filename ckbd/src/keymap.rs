//! Static key and product tables
//!
//! Every key the daemon knows about has one entry. Keyboard keys share their input bit and
//! their LED slot (`0..N_KEYS_KB`), mouse buttons and wheel events only have an input bit,
//! mouse lighting zones only have an LED slot.

use ckb_common::DeviceFeatures;

/// Keyboard key slots (input bits and LEDs)
pub const N_KEYS_KB: usize = 144;
/// Mouse lighting zones, stored after the keyboard LEDs
pub const N_MOUSE_ZONES: usize = 6;
/// Mouse button bits, stored after the keyboard input bits
pub const N_MOUSE_BUTTONS: usize = 20;
/// Wheel and reserved input bits
pub const N_KEYS_EXTRA: usize = 12;
pub const N_KEYS_INPUT: usize = N_KEYS_KB + N_MOUSE_BUTTONS + N_KEYS_EXTRA;
pub const N_KEYBYTES_INPUT: usize = (N_KEYS_INPUT + 7) / 8;
/// Total LED slots in a lighting frame
pub const N_LIGHTS: usize = N_KEYS_KB + N_MOUSE_ZONES;

pub const MOUSE_BUTTON_BASE: usize = N_KEYS_KB;
pub const EXTRA_BASE: usize = N_KEYS_KB + N_MOUSE_BUTTONS;
pub const ZONE_BASE: usize = N_KEYS_KB;

/// Corsair USB vendor ID
pub const VENDOR_CORSAIR: u16 = 0x1b1c;

/// Physical key layout of a keyboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    #[default]
    Ansi,
    Iso,
}

impl Layout {
    pub fn feature(self) -> DeviceFeatures {
        match self {
            Layout::Ansi => DeviceFeatures::ANSI,
            Layout::Iso => DeviceFeatures::ISO,
        }
    }
}

/// One row of the key table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    pub name: &'static str,
    /// Input bit, if the key produces input
    pub input: Option<usize>,
    /// LED slot, if the key is lit
    pub led: Option<usize>,
    /// Linux input keycode sent when passed through
    pub keycode: Option<u16>,
    /// HID usage in a boot keyboard report
    pub usage: Option<u8>,
    /// Horizontal position in key columns, used by sweeping animations
    pub x: u8,
    pub iso_only: bool,
}

const fn kb(name: &'static str, idx: usize, keycode: u16, usage: u8, x: u8) -> KeyInfo {
    KeyInfo {
        name,
        input: Some(idx),
        led: Some(idx),
        keycode: if keycode == 0 { None } else { Some(keycode) },
        usage: if usage == 0 { None } else { Some(usage) },
        x,
        iso_only: false,
    }
}

const fn iso(name: &'static str, idx: usize, keycode: u16, usage: u8, x: u8) -> KeyInfo {
    let mut key = kb(name, idx, keycode, usage, x);
    key.iso_only = true;
    key
}

const fn button(name: &'static str, bit: usize, keycode: u16) -> KeyInfo {
    KeyInfo {
        name,
        input: Some(MOUSE_BUTTON_BASE + bit),
        led: None,
        keycode: if keycode == 0 { None } else { Some(keycode) },
        usage: None,
        x: 0,
        iso_only: false,
    }
}

const fn extra(name: &'static str, bit: usize) -> KeyInfo {
    KeyInfo {
        name,
        input: Some(EXTRA_BASE + bit),
        led: None,
        keycode: None,
        usage: None,
        x: 0,
        iso_only: false,
    }
}

const fn zone(name: &'static str, z: usize) -> KeyInfo {
    KeyInfo {
        name,
        input: None,
        led: Some(ZONE_BASE + z),
        keycode: None,
        usage: None,
        x: z as u8,
        iso_only: false,
    }
}

// Mouse button keycodes
const BTN_LEFT: u16 = 0x110;
const BTN_RIGHT: u16 = 0x111;
const BTN_MIDDLE: u16 = 0x112;
const BTN_SIDE: u16 = 0x113;
const BTN_EXTRA: u16 = 0x114;
const BTN_FORWARD: u16 = 0x115;
const BTN_BACK: u16 = 0x116;
const BTN_TASK: u16 = 0x117;

pub const KEY_LEFTMETA: u16 = 125;
pub const KEY_RIGHTMETA: u16 = 126;

#[rustfmt::skip]
static KEYS: &[KeyInfo] = &[
    // Function row
    kb("esc", 0, 1, 0x29, 0),
    kb("f1", 1, 59, 0x3a, 2),
    kb("f2", 2, 60, 0x3b, 3),
    kb("f3", 3, 61, 0x3c, 4),
    kb("f4", 4, 62, 0x3d, 5),
    kb("f5", 5, 63, 0x3e, 6),
    kb("f6", 6, 64, 0x3f, 7),
    kb("f7", 7, 65, 0x40, 8),
    kb("f8", 8, 66, 0x41, 9),
    kb("f9", 9, 67, 0x42, 10),
    kb("f10", 10, 68, 0x43, 11),
    kb("f11", 11, 87, 0x44, 12),
    kb("f12", 12, 88, 0x45, 13),
    kb("prtscn", 13, 99, 0x46, 15),
    kb("scroll", 14, 70, 0x47, 16),
    kb("pause", 15, 119, 0x48, 17),
    // Media and device keys
    kb("mute", 16, 113, 0x7f, 21),
    kb("stop", 17, 166, 0, 18),
    kb("prev", 18, 165, 0, 19),
    kb("play", 19, 164, 0, 20),
    kb("next", 20, 163, 0, 21),
    kb("volup", 21, 115, 0x80, 22),
    kb("voldn", 22, 114, 0x81, 22),
    kb("light", 23, 0, 0, 18),
    kb("lock", 24, 0, 0, 19),
    kb("mr", 25, 0, 0, 0),
    kb("m1", 26, 0, 0, 1),
    kb("m2", 27, 0, 0, 2),
    kb("m3", 28, 0, 0, 3),
    kb("g1", 29, 0, 0, 0),
    kb("g2", 30, 0, 0, 0),
    kb("g3", 31, 0, 0, 0),
    kb("g4", 32, 0, 0, 0),
    kb("g5", 33, 0, 0, 0),
    kb("g6", 34, 0, 0, 0),
    kb("g7", 35, 0, 0, 0),
    kb("g8", 36, 0, 0, 0),
    kb("g9", 37, 0, 0, 0),
    kb("g10", 38, 0, 0, 0),
    kb("g11", 39, 0, 0, 0),
    kb("g12", 40, 0, 0, 0),
    kb("g13", 41, 0, 0, 0),
    kb("g14", 42, 0, 0, 0),
    kb("g15", 43, 0, 0, 0),
    kb("g16", 44, 0, 0, 0),
    kb("g17", 45, 0, 0, 0),
    kb("g18", 46, 0, 0, 0),
    // Number row
    kb("grave", 47, 41, 0x35, 0),
    kb("1", 48, 2, 0x1e, 1),
    kb("2", 49, 3, 0x1f, 2),
    kb("3", 50, 4, 0x20, 3),
    kb("4", 51, 5, 0x21, 4),
    kb("5", 52, 6, 0x22, 5),
    kb("6", 53, 7, 0x23, 6),
    kb("7", 54, 8, 0x24, 7),
    kb("8", 55, 9, 0x25, 8),
    kb("9", 56, 10, 0x26, 9),
    kb("0", 57, 11, 0x27, 10),
    kb("minus", 58, 12, 0x2d, 11),
    kb("equal", 59, 13, 0x2e, 12),
    kb("bspace", 60, 14, 0x2a, 13),
    kb("ins", 61, 110, 0x49, 15),
    kb("home", 62, 102, 0x4a, 16),
    kb("pgup", 63, 104, 0x4b, 17),
    kb("numlock", 64, 69, 0x53, 19),
    kb("numslash", 65, 98, 0x54, 20),
    kb("numstar", 66, 55, 0x55, 21),
    kb("numminus", 67, 74, 0x56, 22),
    // Top letter row
    kb("tab", 68, 15, 0x2b, 0),
    kb("q", 69, 16, 0x14, 1),
    kb("w", 70, 17, 0x1a, 2),
    kb("e", 71, 18, 0x08, 3),
    kb("r", 72, 19, 0x15, 4),
    kb("t", 73, 20, 0x17, 5),
    kb("y", 74, 21, 0x1c, 6),
    kb("u", 75, 22, 0x18, 7),
    kb("i", 76, 23, 0x0c, 8),
    kb("o", 77, 24, 0x12, 9),
    kb("p", 78, 25, 0x13, 10),
    kb("lbrace", 79, 26, 0x2f, 11),
    kb("rbrace", 80, 27, 0x30, 12),
    kb("bslash", 81, 43, 0x31, 13),
    kb("del", 82, 111, 0x4c, 15),
    kb("end", 83, 107, 0x4d, 16),
    kb("pgdn", 84, 109, 0x4e, 17),
    kb("num7", 85, 71, 0x5f, 19),
    kb("num8", 86, 72, 0x60, 20),
    kb("num9", 87, 73, 0x61, 21),
    kb("numplus", 88, 78, 0x57, 22),
    // Home row
    kb("caps", 89, 58, 0x39, 0),
    kb("a", 90, 30, 0x04, 1),
    kb("s", 91, 31, 0x16, 2),
    kb("d", 92, 32, 0x07, 3),
    kb("f", 93, 33, 0x09, 4),
    kb("g", 94, 34, 0x0a, 5),
    kb("h", 95, 35, 0x0b, 6),
    kb("j", 96, 36, 0x0d, 7),
    kb("k", 97, 37, 0x0e, 8),
    kb("l", 98, 38, 0x0f, 9),
    kb("colon", 99, 39, 0x33, 10),
    kb("quote", 100, 40, 0x34, 11),
    iso("hash", 101, 43, 0x32, 12),
    kb("enter", 102, 28, 0x28, 13),
    kb("num4", 103, 75, 0x5c, 19),
    kb("num5", 104, 76, 0x5d, 20),
    kb("num6", 105, 77, 0x5e, 21),
    // Bottom letter row
    kb("lshift", 106, 42, 0xe1, 0),
    iso("bslash_iso", 107, 86, 0x64, 1),
    kb("z", 108, 44, 0x1d, 2),
    kb("x", 109, 45, 0x1b, 3),
    kb("c", 110, 46, 0x06, 4),
    kb("v", 111, 47, 0x19, 5),
    kb("b", 112, 48, 0x05, 6),
    kb("n", 113, 49, 0x11, 7),
    kb("m", 114, 50, 0x10, 8),
    kb("comma", 115, 51, 0x36, 9),
    kb("dot", 116, 52, 0x37, 10),
    kb("slash", 117, 53, 0x38, 11),
    kb("rshift", 118, 54, 0xe5, 13),
    kb("up", 119, 103, 0x52, 16),
    kb("num1", 120, 79, 0x59, 19),
    kb("num2", 121, 80, 0x5a, 20),
    kb("num3", 122, 81, 0x5b, 21),
    kb("numenter", 123, 96, 0x58, 22),
    // Space row
    kb("lctrl", 124, 29, 0xe0, 0),
    kb("lwin", 125, KEY_LEFTMETA, 0xe3, 1),
    kb("lalt", 126, 56, 0xe2, 2),
    kb("space", 127, 57, 0x2c, 6),
    kb("ralt", 128, 100, 0xe6, 10),
    kb("rwin", 129, KEY_RIGHTMETA, 0xe7, 11),
    kb("rmenu", 130, 127, 0x65, 12),
    kb("rctrl", 131, 97, 0xe4, 13),
    kb("left", 132, 105, 0x50, 15),
    kb("down", 133, 108, 0x51, 16),
    kb("right", 134, 106, 0x4f, 17),
    kb("num0", 135, 82, 0x62, 20),
    kb("numdot", 136, 83, 0x63, 21),
    // Mouse buttons
    button("mouse1", 0, BTN_LEFT),
    button("mouse2", 1, BTN_RIGHT),
    button("mouse3", 2, BTN_MIDDLE),
    button("mouse4", 3, BTN_SIDE),
    button("mouse5", 4, BTN_EXTRA),
    button("dpiup", 5, 0),
    button("dpidn", 6, 0),
    button("sniper", 7, 0),
    button("mouse6", 8, BTN_FORWARD),
    button("mouse7", 9, BTN_BACK),
    button("mouse8", 10, BTN_TASK),
    button("mouse9", 11, 0),
    button("mouse10", 12, 0),
    button("mouse11", 13, 0),
    button("mouse12", 14, 0),
    button("mouse13", 15, 0),
    button("mouse14", 16, 0),
    button("mouse15", 17, 0),
    button("mouse16", 18, 0),
    button("mouse17", 19, 0),
    extra("wheelup", 0),
    extra("wheeldn", 1),
    // Mouse lighting zones
    zone("front", 0),
    zone("back", 1),
    zone("dpi", 2),
    zone("wheel", 3),
    zone("thumb", 4),
    zone("logo", 5),
];

/// The full key table
pub fn keys() -> &'static [KeyInfo] {
    KEYS
}

/// Look up a key by name
pub fn key_by_name(name: &str) -> Option<&'static KeyInfo> {
    KEYS.iter().find(|k| k.name == name)
}

/// Look up a key by input bit
pub fn key_by_input(index: usize) -> Option<&'static KeyInfo> {
    KEYS.iter().find(|k| k.input == Some(index))
}

/// Look up a key by boot-report HID usage
pub fn key_by_usage(usage: u8) -> Option<&'static KeyInfo> {
    KEYS.iter().find(|k| k.usage == Some(usage))
}

/// Name of the key behind an input bit
pub fn input_name(index: usize) -> Option<&'static str> {
    key_by_input(index).map(|k| k.name)
}

/// Whether the key exists on a keyboard with this layout
pub fn key_in_layout(key: &KeyInfo, layout: Layout) -> bool {
    !key.iso_only || layout == Layout::Iso
}

/// Resolve a key list as used by lighting, notify and macro commands.
///
/// Accepts comma-separated names, `all`, or `#N` raw input bits. Unknown names and keys
/// missing from `layout` are skipped; raw bits are taken as given.
pub fn parse_key_list(list: &str, want_led: bool, layout: Layout) -> Vec<usize> {
    let mut out = Vec::new();
    let slot = |k: &KeyInfo| if want_led { k.led } else { k.input };
    for word in list.split(',') {
        if word == "all" {
            out.extend(KEYS.iter().filter(|k| key_in_layout(k, layout)).filter_map(slot));
            continue;
        }
        if let Some(raw) = word.strip_prefix('#') {
            if let Ok(index) = raw.parse::<usize>() {
                let limit = if want_led { N_LIGHTS } else { N_KEYS_INPUT };
                if index < limit {
                    out.push(index);
                }
            }
            continue;
        }
        if let Some(slot) = key_by_name(word).filter(|k| key_in_layout(k, layout)).and_then(slot) {
            out.push(slot);
        }
    }
    out
}

/// Broad kind of a product
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductKind {
    Keyboard,
    Mouse,
}

/// One row of the product capability table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductInfo {
    pub product: u16,
    pub model: &'static str,
    pub kind: ProductKind,
    pub features: DeviceFeatures,
    /// Mode slots stored in hardware
    pub hw_modes: usize,
    /// Lighting zones (mice only)
    pub zones: usize,
}

const fn keyboard(product: u16, model: &'static str, rgb: bool, hw_modes: usize) -> ProductInfo {
    ProductInfo {
        product,
        model,
        kind: ProductKind::Keyboard,
        features: if rgb { DeviceFeatures::STD_RGB } else { DeviceFeatures::STD_NRGB },
        hw_modes,
        zones: 0,
    }
}

const fn mouse(product: u16, model: &'static str, zones: usize) -> ProductInfo {
    ProductInfo {
        product,
        model,
        kind: ProductKind::Mouse,
        features: DeviceFeatures(DeviceFeatures::STD_RGB.0 | DeviceFeatures::ADJRATE.0),
        hw_modes: 1,
        zones,
    }
}

static PRODUCTS: &[ProductInfo] = &[
    keyboard(0x1b17, "K65 RGB", true, 1),
    keyboard(0x1b13, "K70 RGB", true, 1),
    keyboard(0x1b09, "K70", false, 1),
    keyboard(0x1b11, "K95 RGB", true, 3),
    keyboard(0x1b08, "K95", false, 3),
    keyboard(0x1b20, "STRAFE RGB", true, 1),
    keyboard(0x1b15, "STRAFE", false, 1),
    mouse(0x1b12, "M65 RGB", 3),
    mouse(0x1b14, "Sabre RGB", 4),
    mouse(0x1b19, "Sabre RGB", 4),
    mouse(0x1b2f, "Sabre RGB", 4),
    mouse(0x1b1e, "Scimitar RGB", 4),
];

/// Capability table entry for a product ID
pub fn product_info(product: u16) -> Option<&'static ProductInfo> {
    PRODUCTS.iter().find(|p| p.product == product)
}

pub fn is_supported(vendor: u16, product: u16) -> bool {
    vendor == VENDOR_CORSAIR && product_info(product).is_some()
}
