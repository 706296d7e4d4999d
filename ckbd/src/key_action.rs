//! Execution of bound key actions
//!
//! Mode, DPI-step, brightness and lock actions run on key-down only. Sniper/custom DPI and
//! program launch are symmetric: the release edge undoes or completes what the press did.

use ckb_common::{DpiTarget, KeyAction, LightStep, LockChange, ModeTarget, ProgramAction, StopPolicy};
use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

use crate::input::{Edge, KeySet, WHEEL_DOWN, WHEEL_UP};
use crate::keymap::{self, KEY_LEFTMETA, KEY_RIGHTMETA};
use crate::profile::{DpiSet, Profile, BRIGHTNESS_MAX, DPI_COUNT, MODE_COUNT};

/// Handle to at most one running external program
#[derive(Debug, Default)]
pub struct ProgramSlot {
    child: Option<Child>,
}

impl ProgramSlot {
    /// Whether the last launched program is still alive; reaps it if not
    pub fn is_running(&mut self) -> bool {
        let running = match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        };
        if !running {
            self.child = None;
        }
        running
    }

    /// Start `command` through `sh -c` unless a program is already running
    pub fn launch(&mut self, command: &str) -> bool {
        if command.is_empty() || self.is_running() {
            return false;
        }
        match Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                info!("Launched program (pid {}): {}", child.id(), command);
                self.child = Some(child);
                true
            }
            Err(e) => {
                warn!("Failed to launch program '{}': {}", command, e);
                false
            }
        }
    }

    /// Kill the program, if any, and wait for it to exit
    pub fn terminate_and_wait(&mut self) {
        if let Some(mut child) = self.child.take() {
            debug!("Stopping program (pid {})", child.id());
            if let Err(e) = child.kill() {
                debug!("Kill failed (already exited?): {}", e);
            }
            if let Err(e) = child.wait() {
                warn!("Failed to reap program: {}", e);
            }
        }
    }
}

/// Press- and release-triggered programs of one key
#[derive(Debug, Default)]
pub struct ProgramHandles {
    pub press: ProgramSlot,
    pub release: ProgramSlot,
}

impl ProgramHandles {
    pub fn terminate_and_wait(&mut self) {
        self.press.terminate_and_wait();
        self.release.terminate_and_wait();
    }

    pub fn on_press(&mut self, program: &ProgramAction) {
        if program.stop.has(StopPolicy::RELEASE_STOP_ON_PRESS) {
            self.release.terminate_and_wait();
        }
        if program.stop.has(StopPolicy::PRESS_STOP_ON_PRESS) {
            self.press.terminate_and_wait();
        }
        self.press.launch(&program.on_press);
    }

    pub fn on_release(&mut self, program: &ProgramAction) {
        if program.stop.has(StopPolicy::PRESS_STOP_ON_RELEASE) {
            self.press.terminate_and_wait();
        }
        self.release.launch(&program.on_release);
    }
}

/// What a momentary override changed: the stage selection and, for a custom DPI,
/// stage 0's resolution. Other stage edits made while it is held survive release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpiRestore {
    pub current: u8,
    pub stage0: Option<(u16, u16)>,
}

impl DpiRestore {
    pub fn apply(&self, dpi: &mut DpiSet) {
        dpi.current = self.current;
        if let Some((x, y)) = self.stage0 {
            dpi.x[0] = x;
            dpi.y[0] = y;
        }
    }
}

#[derive(Debug, Clone)]
struct DpiPush {
    key: usize,
    mode: usize,
    saved: DpiRestore,
}

/// Momentary DPI overrides, most recent last
#[derive(Debug, Default)]
pub struct DpiStack {
    entries: Vec<DpiPush>,
}

impl DpiStack {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, key: usize, mode: usize, saved: DpiRestore) {
        self.entries.push(DpiPush { key, mode, saved });
    }

    /// Remove the override held by `key`. Returns the mode and the state to restore when it
    /// was the active override; an override buried under a newer one hands its saved state
    /// to the one above it instead.
    pub fn pop(&mut self, key: usize) -> Option<(usize, DpiRestore)> {
        let pos = self.entries.iter().position(|e| e.key == key)?;
        let removed = self.entries.remove(pos);
        if pos == self.entries.len() {
            return Some((removed.mode, removed.saved));
        }
        let above = &mut self.entries[pos].saved;
        *above = DpiRestore {
            current: removed.saved.current,
            stage0: removed.saved.stage0.or(above.stage0),
        };
        None
    }
}

/// Side effects the device has to carry out after an action ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Key { keycode: u16, down: bool },
    Scroll(i32),
    /// Mode index switched to
    Switched(usize),
}

/// Per-device key action state
#[derive(Debug, Default)]
pub struct KeyRuntime {
    programs: HashMap<usize, ProgramHandles>,
    dpi: DpiStack,
    locked: bool,
    /// Keys whose press a macro consumed; their release is consumed too
    swallowed: KeySet,
}

fn mode_target(target: ModeTarget, current: usize) -> Option<usize> {
    match target {
        ModeTarget::Absolute(i) if i < MODE_COUNT => Some(i),
        ModeTarget::Absolute(_) => None,
        ModeTarget::Next => (current + 1 < MODE_COUNT).then_some(current + 1),
        ModeTarget::Prev => current.checked_sub(1),
        ModeTarget::NextWrap => Some((current + 1) % MODE_COUNT),
        ModeTarget::PrevWrap => Some((current + MODE_COUNT - 1) % MODE_COUNT),
    }
}

/// Apply one brightness step to a level in 0..=3
pub fn step_brightness(level: u8, step: LightStep) -> u8 {
    let level = level.min(BRIGHTNESS_MAX);
    match step {
        LightStep::Up => (level + 1).min(BRIGHTNESS_MAX),
        LightStep::Down => level.saturating_sub(1),
        LightStep::UpWrap if level == BRIGHTNESS_MAX => 0,
        LightStep::UpWrap => level + 1,
        LightStep::DownWrap if level == 0 => BRIGHTNESS_MAX,
        LightStep::DownWrap => level - 1,
    }
}

impl KeyRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn dpi_overridden(&self) -> bool {
        !self.dpi.is_empty()
    }

    /// Whether `edge` belongs to a macro and must not run its bound action.
    ///
    /// Presses of keys in `suppressed` are consumed, and so are the matching releases even
    /// if the macro has re-armed by then. Releases of keys pressed before the macro fired
    /// still go through so nothing stays stuck down.
    pub fn consume(&mut self, edge: Edge, suppressed: &KeySet) -> bool {
        if edge.down {
            let consumed = suppressed.get(edge.index);
            self.swallowed.assign(edge.index, consumed);
            consumed
        } else {
            let consumed = self.swallowed.get(edge.index);
            self.swallowed.clear(edge.index);
            consumed
        }
    }

    /// Run the action bound to the key behind `edge` in the current mode.
    ///
    /// `brightness` is the dimming level in effect, per-mode or shared; the caller stores it
    /// back afterwards.
    pub fn handle(&mut self, edge: Edge, profile: &mut Profile, brightness: &mut u8) -> Vec<Output> {
        let action = profile.current_mode().bind.action(edge.index).clone();
        let mut out = Vec::new();

        match action {
            KeyAction::Unbound => {}
            KeyAction::Normal(name) => self.passthrough(&name, edge.down, &mut out),
            KeyAction::Mode(target) if edge.down => {
                let current = profile.current_index();
                if let Some(next) = mode_target(target, current) {
                    if next != current && profile.switch_mode(next) {
                        info!("Switched to mode {}", next + 1);
                        out.push(Output::Switched(next));
                    }
                }
            }
            KeyAction::Dpi(target) => self.dpi_action(edge, target, profile),
            KeyAction::Light(step) if edge.down => {
                *brightness = step_brightness(*brightness, step);
                debug!("Brightness level {}", brightness);
            }
            KeyAction::Lock(change) if edge.down => {
                self.locked = match change {
                    LockChange::Toggle => !self.locked,
                    LockChange::On => true,
                    LockChange::Off => false,
                };
                debug!("Lock {}", if self.locked { "on" } else { "off" });
            }
            KeyAction::Program(program) => {
                let handles = self.programs.entry(edge.index).or_default();
                if edge.down {
                    handles.on_press(&program);
                } else {
                    handles.on_release(&program);
                }
            }
            // Key-up of a down-only action
            _ => {}
        }
        out
    }

    fn passthrough(&self, name: &str, down: bool, out: &mut Vec<Output>) {
        let Some(key) = keymap::key_by_name(name) else { return };
        match key.input {
            Some(WHEEL_UP) if down => out.push(Output::Scroll(1)),
            Some(WHEEL_DOWN) if down => out.push(Output::Scroll(-1)),
            Some(WHEEL_UP) | Some(WHEEL_DOWN) => {}
            _ => {
                let Some(keycode) = key.keycode else { return };
                // Win-lock swallows presses; releases still go out so nothing sticks
                if down && self.locked && (keycode == KEY_LEFTMETA || keycode == KEY_RIGHTMETA) {
                    return;
                }
                out.push(Output::Key { keycode, down });
            }
        }
    }

    fn dpi_action(&mut self, edge: Edge, target: DpiTarget, profile: &mut Profile) {
        let mode = profile.current_index();
        match target {
            DpiTarget::Sniper | DpiTarget::Custom { .. } => {
                if !edge.down {
                    if let Some((mode, saved)) = self.dpi.pop(edge.index) {
                        if let Some(m) = profile.mode_mut(mode) {
                            saved.apply(&mut m.dpi);
                        }
                    }
                    return;
                }
                if let DpiTarget::Custom { x, y } = target {
                    if x <= 0 || y <= 0 {
                        debug!("Ignoring custom DPI {}x{}", x, y);
                        return;
                    }
                }
                let dpi = &mut profile.current_mode_mut().dpi;
                let stage0 = match target {
                    DpiTarget::Custom { .. } => Some((dpi.x[0], dpi.y[0])),
                    _ => None,
                };
                self.dpi.push(edge.index, mode, DpiRestore { current: dpi.current, stage0 });
                if let DpiTarget::Custom { x, y } = target {
                    dpi.x[0] = x.min(u16::MAX as i32) as u16;
                    dpi.y[0] = y.min(u16::MAX as i32) as u16;
                }
                dpi.current = 0;
            }
            // Stage changes are ignored while an override is held
            _ if !edge.down || self.dpi_overridden() => {}
            DpiTarget::Up => {
                let dpi = &mut profile.current_mode_mut().dpi;
                if let Some(s) = ((dpi.current as usize + 1)..DPI_COUNT).find(|s| dpi.stage_enabled(*s)) {
                    dpi.current = s as u8;
                }
            }
            DpiTarget::Down => {
                let dpi = &mut profile.current_mode_mut().dpi;
                if let Some(s) = (1..dpi.current as usize).rev().find(|s| dpi.stage_enabled(*s)) {
                    dpi.current = s as u8;
                }
            }
            DpiTarget::Stage(n) => {
                if n >= 1 && (n as usize) < DPI_COUNT {
                    let dpi = &mut profile.current_mode_mut().dpi;
                    if dpi.stage_enabled(n as usize) {
                        dpi.current = n as u8;
                    }
                }
            }
        }
    }

    /// Stop the programs launched by `key`; called before its binding changes
    pub fn forget_key(&mut self, key: usize) {
        if let Some(mut handles) = self.programs.remove(&key) {
            handles.terminate_and_wait();
        }
    }

    /// Stop every launched program
    pub fn shutdown(&mut self) {
        for (_, mut handles) in self.programs.drain() {
            handles.terminate_and_wait();
        }
    }
}
