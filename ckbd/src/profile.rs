//! Profile and mode store
//!
//! A [`Profile`] owns a fixed array of [`Mode`]s and names the current one by index, so a
//! profile can never point at a mode it does not own. The last lighting frame and DPI set
//! actually written to hardware are cached next to the modes to suppress redundant writes.

use ckb_common::{KeyAction, OUTFIFO_MAX};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::input::KeySet;
use crate::keymap::{self, Layout, N_KEYS_INPUT, N_LIGHTS};
use crate::lighting::AnimationSpec;

pub const MODE_COUNT: usize = 6;
pub const DPI_COUNT: usize = 6;
pub const LIFT_MIN: u8 = 1;
pub const LIFT_MAX: u8 = 5;
pub const MACRO_MAX: usize = 1024;
/// Most mode slots any supported device stores in hardware
pub const HWMODE_MAX: usize = 3;
/// Brightness levels run from 0 (off) to this value (full)
pub const BRIGHTNESS_MAX: u8 = 3;
/// Longest profile or mode name, in UTF-16 units
pub const NAME_LEN: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse `rrggbb`
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 6 || !s.is_ascii() {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&s[i..i + 2], 16).ok();
        Some(Self::new(channel(0)?, channel(2)?, channel(4)?))
    }

    /// Scale every channel by `num / den`
    pub fn scale(self, num: u32, den: u32) -> Self {
        if den == 0 {
            return self;
        }
        let f = |c: u8| ((c as u32 * num) / den).min(255) as u8;
        Self::new(f(self.r), f(self.g), f(self.b))
    }

    /// Linear blend towards `top` by `alpha` (0..1)
    pub fn blend(self, top: Rgb, alpha: f32) -> Self {
        let a = alpha.clamp(0.0, 1.0);
        let f = |lo: u8, hi: u8| (lo as f32 * (1.0 - a) + hi as f32 * a).round() as u8;
        Self::new(f(self.r, top.r), f(self.g, top.g), f(self.b, top.b))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Static per-LED colors of a mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lighting {
    pub colors: Vec<Rgb>,
    /// Send the next frame even if it matches the last one sent
    #[serde(skip)]
    pub force_update: bool,
}

impl Default for Lighting {
    fn default() -> Self {
        Self {
            colors: vec![Rgb::BLACK; N_LIGHTS],
            force_update: true,
        }
    }
}

impl Lighting {
    pub fn fill(&mut self, color: Rgb) {
        self.colors.iter_mut().for_each(|c| *c = color);
    }

    pub fn set(&mut self, led: usize, color: Rgb) {
        if let Some(slot) = self.colors.get_mut(led) {
            *slot = color;
        }
    }
}

/// One step of a macro
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacroAction {
    Key { input: usize, down: bool, delay_ms: u32 },
    Move { dx: i32, dy: i32, delay_ms: u32 },
}

impl MacroAction {
    pub fn delay_ms(&self) -> u32 {
        match self {
            MacroAction::Key { delay_ms, .. } | MacroAction::Move { delay_ms, .. } => *delay_ms,
        }
    }
}

/// A chorded macro. The combo and actions never change after parsing; only `triggered` does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Macro {
    pub combo: KeySet,
    pub actions: Arc<[MacroAction]>,
    #[serde(skip)]
    pub triggered: bool,
}

/// Key bindings of a mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub base: Vec<KeyAction>,
    pub macros: Vec<Macro>,
}

impl Default for Binding {
    fn default() -> Self {
        let base = (0..N_KEYS_INPUT)
            .map(|i| match keymap::input_name(i) {
                Some(name) => KeyAction::default_for(name),
                None => KeyAction::Unbound,
            })
            .collect();
        Self {
            base,
            macros: Vec::new(),
        }
    }
}

impl Binding {
    pub fn action(&self, input: usize) -> &KeyAction {
        static UNBOUND: KeyAction = KeyAction::Unbound;
        self.base.get(input).unwrap_or(&UNBOUND)
    }

    pub fn bind(&mut self, input: usize, action: KeyAction) {
        if let Some(slot) = self.base.get_mut(input) {
            *slot = action;
        }
    }

    pub fn rebind(&mut self, input: usize) {
        let action = match keymap::input_name(input) {
            Some(name) => KeyAction::default_for(name),
            None => KeyAction::Unbound,
        };
        self.bind(input, action);
    }

    /// Add a macro, replacing any macro with the same combo. Returns false when full.
    pub fn add_macro(&mut self, new: Macro) -> bool {
        if let Some(existing) = self.macros.iter_mut().find(|m| m.combo == new.combo) {
            *existing = new;
            return true;
        }
        if self.macros.len() >= MACRO_MAX {
            return false;
        }
        self.macros.push(new);
        true
    }
}

/// DPI configuration of a mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpiSet {
    pub x: [u16; DPI_COUNT],
    pub y: [u16; DPI_COUNT],
    pub current: u8,
    /// Enabled stages, one bit per stage
    pub enabled: u8,
    pub lift: u8,
    pub snap: bool,
    #[serde(skip)]
    pub force_update: bool,
}

impl Default for DpiSet {
    fn default() -> Self {
        let stages = [400, 800, 1500, 2000, 3000, 6000];
        Self {
            x: stages,
            y: stages,
            current: 1,
            enabled: 0x3f,
            lift: LIFT_MIN,
            snap: false,
            force_update: true,
        }
    }
}

impl DpiSet {
    pub fn stage_enabled(&self, stage: usize) -> bool {
        stage < DPI_COUNT && self.enabled & (1 << stage) != 0
    }

    /// Same values, ignoring the force flag
    pub fn same_settings(&self, other: &DpiSet) -> bool {
        self.x == other.x
            && self.y == other.y
            && self.current == other.current
            && self.enabled == other.enabled
            && self.lift == other.lift
            && self.snap == other.snap
    }
}

/// One complete device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mode {
    pub name: String,
    pub id: Uuid,
    pub modified: u32,
    pub light: Lighting,
    pub bind: Binding,
    pub dpi: DpiSet,
    pub notify: [KeySet; OUTFIFO_MAX],
    pub inotify: [u8; OUTFIFO_MAX],
    /// Indicators forced on / off
    pub ion: u8,
    pub ioff: u8,
    /// Dimming level when brightness is not shared
    pub brightness: u8,
    pub animations: Vec<AnimationSpec>,
}

impl Default for Mode {
    fn default() -> Self {
        Self {
            name: String::new(),
            id: Uuid::new_v4(),
            modified: 0,
            light: Lighting::default(),
            bind: Binding::default(),
            dpi: DpiSet::default(),
            notify: [KeySet::default(); OUTFIFO_MAX],
            inotify: [0; OUTFIFO_MAX],
            ion: 0,
            ioff: 0,
            brightness: BRIGHTNESS_MAX,
            animations: Vec::new(),
        }
    }
}

/// Factory-stored identity of one hardware slot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwSlot {
    pub id: Uuid,
    pub modified: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HwMode {
    pub slot: HwSlot,
    pub light: Option<Lighting>,
    pub dpi: Option<DpiSet>,
}

/// Read-only snapshot of what the device stores onboard, read once at attach
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HwProfile {
    pub profile: HwSlot,
    pub modes: Vec<HwMode>,
}

/// A named collection of modes, one of which is current
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub id: Uuid,
    pub modified: u32,
    modes: Vec<Mode>,
    current: usize,
    #[serde(skip)]
    pub last_light: Option<Vec<Rgb>>,
    #[serde(skip)]
    pub last_dpi: Option<DpiSet>,
    #[serde(skip)]
    dirty: bool,
}

impl Default for Profile {
    fn default() -> Self {
        Self::new()
    }
}

impl Profile {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            id: Uuid::new_v4(),
            modified: 0,
            modes: (0..MODE_COUNT).map(|_| Mode::default()).collect(),
            current: 0,
            last_light: None,
            last_dpi: None,
            dirty: false,
        }
    }

    /// A default profile for a keyboard with `layout`: keys it lacks are left unbound
    pub fn for_layout(layout: Layout) -> Self {
        let mut profile = Self::new();
        let missing: Vec<usize> = keymap::keys()
            .iter()
            .filter(|k| !keymap::key_in_layout(k, layout))
            .filter_map(|k| k.input)
            .collect();
        for mode in &mut profile.modes {
            for &input in &missing {
                mode.bind.bind(input, KeyAction::Unbound);
            }
        }
        profile
    }

    /// Restore invariants after deserializing
    pub fn sanitize(&mut self) {
        self.modes.resize_with(MODE_COUNT, Mode::default);
        if self.current >= MODE_COUNT {
            self.current = 0;
        }
        for mode in &mut self.modes {
            mode.light.colors.resize(N_LIGHTS, Rgb::BLACK);
            mode.light.force_update = true;
            mode.bind.base.resize(N_KEYS_INPUT, KeyAction::Unbound);
            mode.dpi.force_update = true;
            mode.brightness = mode.brightness.min(BRIGHTNESS_MAX);
        }
        self.last_light = None;
        self.last_dpi = None;
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_mode(&self) -> &Mode {
        &self.modes[self.current]
    }

    pub fn current_mode_mut(&mut self) -> &mut Mode {
        self.dirty = true;
        &mut self.modes[self.current]
    }

    pub fn mode(&self, index: usize) -> Option<&Mode> {
        self.modes.get(index)
    }

    pub fn mode_mut(&mut self, index: usize) -> Option<&mut Mode> {
        let mode = self.modes.get_mut(index)?;
        self.dirty = true;
        Some(mode)
    }

    /// Macros of the current mode, for trigger bookkeeping only; does not mark the profile dirty
    pub fn macros_mut(&mut self) -> &mut [Macro] {
        &mut self.modes[self.current].bind.macros
    }

    /// Make `index` the current mode. Out-of-range indices are ignored.
    pub fn switch_mode(&mut self, index: usize) -> bool {
        if index >= MODE_COUNT {
            return false;
        }
        if index != self.current {
            self.current = index;
            self.dirty = true;
        }
        true
    }

    /// Reset one mode to defaults
    pub fn erase_mode(&mut self, index: usize) {
        if let Some(mode) = self.modes.get_mut(index) {
            *mode = Mode::default();
            self.dirty = true;
        }
    }

    /// Reset the whole profile, keeping the current mode index
    pub fn erase(&mut self) {
        let current = self.current;
        *self = Profile::new();
        self.current = current;
        self.dirty = true;
    }

    /// Copy factory-stored names, ids and settings into the software profile
    pub fn load_hardware(&mut self, hw: &HwProfile) {
        self.name = hw.profile.name.clone();
        self.id = hw.profile.id;
        self.modified = hw.profile.modified;
        for (mode, hw_mode) in self.modes.iter_mut().zip(hw.modes.iter()) {
            mode.name = hw_mode.slot.name.clone();
            mode.id = hw_mode.slot.id;
            mode.modified = hw_mode.slot.modified;
            if let Some(light) = &hw_mode.light {
                mode.light.colors = light.colors.clone();
            }
            if let Some(dpi) = &hw_mode.dpi {
                mode.dpi = dpi.clone();
            }
            mode.light.force_update = true;
            mode.dpi.force_update = true;
        }
        self.dirty = true;
    }

    /// Record what was just written to hardware for mode `index` and drop its force flags
    pub fn mark_sent(&mut self, index: usize, light: Option<Vec<Rgb>>, dpi: Option<DpiSet>) {
        let Some(mode) = self.modes.get_mut(index) else { return };
        if let Some(light) = light {
            mode.light.force_update = false;
            self.last_light = Some(light);
        }
        if let Some(mut dpi) = dpi {
            mode.dpi.force_update = false;
            dpi.force_update = false;
            self.last_dpi = Some(dpi);
        }
    }

    /// Forget what hardware shows so the next frame and DPI set go out in full
    pub fn invalidate_sent(&mut self) {
        self.last_light = None;
        self.last_dpi = None;
    }

    pub fn rename(&mut self, name: String) {
        self.name = name;
        self.dirty = true;
    }

    pub fn set_id(&mut self, id: Uuid) {
        self.id = id;
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

/// Truncate a name to what the hardware can store
pub fn clamp_name(name: &str) -> String {
    let mut units = 0;
    name.chars()
        .take_while(|c| {
            units += c.len_utf16();
            units <= NAME_LEN
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ckb_common::{LightStep, ModeTarget};

    #[test]
    fn test_exactly_one_current_mode() {
        let mut profile = Profile::new();
        assert_eq!(profile.current_index(), 0);
        assert!(profile.switch_mode(3));
        assert_eq!(profile.current_index(), 3);
        assert!(!profile.switch_mode(MODE_COUNT));
        assert_eq!(profile.current_index(), 3);
        assert!(profile.is_dirty());
    }

    #[test]
    fn test_default_bindings() {
        let binding = Binding::default();
        let m1 = keymap::key_by_name("m1").unwrap().input.unwrap();
        let light = keymap::key_by_name("light").unwrap().input.unwrap();
        let g1 = keymap::key_by_name("g1").unwrap().input.unwrap();
        assert_eq!(binding.action(m1), &KeyAction::Mode(ModeTarget::Absolute(0)));
        assert_eq!(binding.action(light), &KeyAction::Light(LightStep::UpWrap));
        assert_eq!(binding.action(g1), &KeyAction::Unbound);
        assert_eq!(binding.action(N_KEYS_INPUT + 1), &KeyAction::Unbound);
    }

    #[test]
    fn test_layout_bindings() {
        let hash = keymap::key_by_name("hash").unwrap().input.unwrap();
        let a = keymap::key_by_name("a").unwrap().input.unwrap();
        let ansi = Profile::for_layout(Layout::Ansi);
        for mode in &ansi.modes {
            assert_eq!(mode.bind.action(hash), &KeyAction::Unbound);
            assert_eq!(mode.bind.action(a), &KeyAction::Normal("a".to_string()));
        }
        let iso = Profile::for_layout(Layout::Iso);
        assert_eq!(iso.current_mode().bind.action(hash), &KeyAction::Normal("hash".to_string()));
    }

    #[test]
    fn test_macro_replaces_same_combo() {
        let mut binding = Binding::default();
        let combo = KeySet::from_indices([1, 2]);
        let first = Macro { combo, actions: Arc::from(vec![]), triggered: false };
        let second = Macro {
            combo,
            actions: Arc::from(vec![MacroAction::Move { dx: 1, dy: 1, delay_ms: 0 }]),
            triggered: false,
        };
        assert!(binding.add_macro(first));
        assert!(binding.add_macro(second.clone()));
        assert_eq!(binding.macros, vec![second]);
    }

    #[test]
    fn test_rgb_helpers() {
        let red = Rgb::from_hex("ff0000").unwrap();
        assert_eq!(red.to_string(), "ff0000");
        assert_eq!(Rgb::from_hex("ff00"), None);
        assert_eq!(Rgb::from_hex("gg0000"), None);
        assert_eq!(red.scale(1, 3), Rgb::new(85, 0, 0));
        assert_eq!(Rgb::BLACK.blend(red, 1.0), red);
    }

    #[test]
    fn test_sanitize_restores_shape() {
        let mut profile = Profile::new();
        profile.current = 42;
        profile.modes.truncate(2);
        profile.sanitize();
        assert_eq!(profile.modes.len(), MODE_COUNT);
        assert_eq!(profile.current_index(), 0);
        assert!(profile.current_mode().light.force_update);
    }

    #[test]
    fn test_load_hardware() {
        let mut profile = Profile::new();
        let mut light = Lighting::default();
        light.fill(Rgb::new(0, 0, 255));
        let hw = HwProfile {
            profile: HwSlot { id: Uuid::new_v4(), modified: 7, name: "Gaming".to_string() },
            modes: vec![HwMode {
                slot: HwSlot { id: Uuid::new_v4(), modified: 1, name: "One".to_string() },
                light: Some(light.clone()),
                dpi: None,
            }],
        };
        profile.load_hardware(&hw);
        assert_eq!(profile.name, "Gaming");
        assert_eq!(profile.mode(0).unwrap().light.colors, light.colors);
        assert_eq!(profile.mode(1).unwrap().name, "");
    }

    #[test]
    fn test_clamp_name() {
        assert_eq!(clamp_name("short"), "short");
        assert_eq!(clamp_name("abcdefghijklmnopqrstuvwxyz").len(), NAME_LEN);
    }
}
