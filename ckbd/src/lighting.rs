//! Lighting frame composition
//!
//! Each tick the engine starts from the current mode's static colors, layers the mode's
//! animations on top in list order, lets a preview animation override its own keys, and then
//! applies brightness dimming, inactive-indicator dimming and optional dithering.

use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::keymap::{self, Layout, N_LIGHTS};
use crate::profile::{Profile, Rgb, BRIGHTNESS_MAX};

pub const DEFAULT_FPS: u32 = 30;
pub const MAX_FPS: u32 = 60;

/// Rightmost key column used by sweeping animations
const MAX_COLUMN: f32 = 24.0;
/// Dither bias step; hardware color depth is 3 bits per channel
const DITHER_STEP: u8 = 8;

/// Built-in animation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnimKind {
    Breathe,
    Wave,
    Spectrum,
    Fade,
}

impl FromStr for AnimKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "breathe" => Ok(AnimKind::Breathe),
            "wave" => Ok(AnimKind::Wave),
            "spectrum" => Ok(AnimKind::Spectrum),
            "fade" => Ok(AnimKind::Fade),
            _ => Err(()),
        }
    }
}

/// One configured animation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationSpec {
    pub kind: AnimKind,
    /// LED slots the animation draws on
    pub leds: Vec<usize>,
    pub color: Rgb,
    pub period_ms: u32,
    /// Wave width in key columns
    pub width: f32,
    /// Fade length after a key press
    pub duration_ms: u32,
    pub opacity: f32,
}

impl AnimationSpec {
    pub fn new(kind: AnimKind, leds: Vec<usize>) -> Self {
        Self {
            kind,
            leds,
            color: Rgb::new(255, 255, 255),
            period_ms: 2000,
            width: 4.0,
            duration_ms: 500,
            opacity: 1.0,
        }
    }

    /// Parse `<kind> <keys> [param=value...]`. Unknown or invalid parameters are skipped.
    pub fn parse(kind: &str, keys: &str, params: &[&str], layout: Layout) -> Option<Self> {
        let kind = kind.parse().ok()?;
        let leds = keymap::parse_key_list(keys, true, layout);
        if leds.is_empty() {
            return None;
        }
        let mut spec = Self::new(kind, leds);
        for param in params {
            let Some((name, value)) = param.split_once('=') else { continue };
            match name {
                "color" => {
                    if let Some(c) = Rgb::from_hex(value) {
                        spec.color = c;
                    }
                }
                "period" => {
                    if let Ok(ms) = value.parse::<u32>() {
                        spec.period_ms = ms.max(1);
                    }
                }
                "width" => {
                    if let Ok(w) = value.parse::<f32>() {
                        spec.width = w.max(0.5);
                    }
                }
                "duration" => {
                    if let Ok(ms) = value.parse::<u32>() {
                        spec.duration_ms = ms.max(1);
                    }
                }
                "opacity" => {
                    if let Ok(o) = value.parse::<f32>() {
                        spec.opacity = o.clamp(0.0, 1.0);
                    }
                }
                _ => {}
            }
        }
        Some(spec)
    }

    fn phase(&self, elapsed: Duration) -> f32 {
        let period = self.period_ms.max(1) as u128;
        (elapsed.as_millis() % period) as f32 / period as f32
    }

    /// Color and coverage of `led` at `elapsed` since the animation started.
    /// `hit` is the time since the key under `led` was last pressed.
    fn sample(&self, led: usize, elapsed: Duration, hit: Option<Duration>) -> Option<(Rgb, f32)> {
        let (color, alpha) = match self.kind {
            AnimKind::Breathe => {
                let phase = self.phase(elapsed);
                (self.color, 0.5 - 0.5 * (2.0 * PI * phase).cos())
            }
            AnimKind::Wave => {
                let center = self.phase(elapsed) * (MAX_COLUMN + self.width) - self.width / 2.0;
                let dist = (led_column(led) - center).abs();
                (self.color, 1.0 - dist / (self.width / 2.0))
            }
            AnimKind::Spectrum => (hue(self.phase(elapsed)), 1.0),
            AnimKind::Fade => {
                let since = hit?;
                let total = self.duration_ms.max(1) as f32;
                (self.color, 1.0 - since.as_millis() as f32 / total)
            }
        };
        if alpha <= 0.0 {
            return None;
        }
        Some((color, alpha.min(1.0) * self.opacity))
    }
}

/// Fully saturated color at `h` (0..1) around the hue wheel
fn hue(h: f32) -> Rgb {
    let h6 = h.fract() * 6.0;
    let x = 1.0 - (h6 % 2.0 - 1.0).abs();
    let (r, g, b) = match h6 as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    };
    let f = |v: f32| (v * 255.0).round() as u8;
    Rgb::new(f(r), f(g), f(b))
}

fn led_column(led: usize) -> f32 {
    static COLUMNS: OnceLock<Vec<u8>> = OnceLock::new();
    let columns = COLUMNS.get_or_init(|| {
        let mut columns = vec![0u8; N_LIGHTS];
        for key in keymap::keys() {
            if let Some(l) = key.led {
                columns[l] = key.x;
            }
        }
        columns
    });
    columns.get(led).copied().unwrap_or(0) as f32
}

fn led_of(name: &str) -> Option<usize> {
    keymap::key_by_name(name).and_then(|k| k.led)
}

/// Per-render inputs that live outside the profile
#[derive(Debug, Clone, Copy)]
pub struct RenderContext {
    /// Dimming level, 0 (off) ..= 3 (full)
    pub brightness: u8,
    /// Inactive indicator dimming: -1 none, 0 half, 1 quarter, 2 off
    pub inactive: i8,
    pub dither: bool,
    pub locked: bool,
}

impl Default for RenderContext {
    fn default() -> Self {
        Self {
            brightness: BRIGHTNESS_MAX,
            inactive: 0,
            dither: false,
            locked: false,
        }
    }
}

fn dim_inactive(color: Rgb, level: i8) -> Rgb {
    match level {
        0 => color.scale(1, 2),
        1 => color.scale(1, 4),
        2 => Rgb::BLACK,
        _ => color,
    }
}

/// Runtime animation state of one device
#[derive(Debug)]
pub struct LightingEngine {
    starts: Vec<Instant>,
    preview: Option<(AnimationSpec, Instant)>,
    hits: Vec<Option<Instant>>,
    frame_counter: usize,
    mode: Option<usize>,
}

impl Default for LightingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LightingEngine {
    pub fn new() -> Self {
        Self {
            starts: Vec::new(),
            preview: None,
            hits: vec![None; N_LIGHTS],
            frame_counter: 0,
            mode: None,
        }
    }

    /// Reset every animation timer to zero
    pub fn restart(&mut self, now: Instant) {
        self.starts.iter_mut().for_each(|s| *s = now);
        self.hits.iter_mut().for_each(|h| *h = None);
        if let Some((_, start)) = &mut self.preview {
            *start = now;
        }
    }

    pub fn set_preview(&mut self, spec: Option<AnimationSpec>, now: Instant) {
        self.preview = spec.map(|s| (s, now));
    }

    /// Record a key press for reactive animations
    pub fn key_hit(&mut self, led: usize, now: Instant) {
        if let Some(hit) = self.hits.get_mut(led) {
            *hit = Some(now);
        }
    }

    fn sync_timers(&mut self, mode: usize, count: usize, now: Instant) {
        if self.mode != Some(mode) {
            self.mode = Some(mode);
            self.starts = vec![now; count];
            self.hits.iter_mut().for_each(|h| *h = None);
            return;
        }
        // Appended animations start now; removed ones drop their timers
        self.starts.resize(count, now);
    }

    /// Compose the frame for the profile's current mode
    pub fn render(&mut self, profile: &Profile, ctx: &RenderContext, now: Instant) -> Vec<Rgb> {
        let current = profile.current_index();
        let mode = profile.current_mode();
        self.sync_timers(current, mode.animations.len(), now);

        let mut frame = mode.light.colors.clone();
        frame.resize(N_LIGHTS, Rgb::BLACK);

        for (spec, start) in mode.animations.iter().zip(self.starts.iter()) {
            let elapsed = now.saturating_duration_since(*start);
            for &led in spec.leds.iter().filter(|l| **l < N_LIGHTS) {
                let hit = self.hits[led].map(|h| now.saturating_duration_since(h));
                if let Some((color, alpha)) = spec.sample(led, elapsed, hit) {
                    frame[led] = frame[led].blend(color, alpha);
                }
            }
        }

        if let Some((spec, start)) = &self.preview {
            let elapsed = now.saturating_duration_since(*start);
            for &led in spec.leds.iter().filter(|l| **l < N_LIGHTS) {
                let hit = self.hits[led].map(|h| now.saturating_duration_since(h));
                frame[led] = match spec.sample(led, elapsed, hit) {
                    Some((color, alpha)) => Rgb::BLACK.blend(color, alpha),
                    None => Rgb::BLACK,
                };
            }
        }

        let level = ctx.brightness.min(BRIGHTNESS_MAX);
        if level < BRIGHTNESS_MAX {
            frame
                .iter_mut()
                .for_each(|c| *c = c.scale(level as u32, BRIGHTNESS_MAX as u32));
        }

        if ctx.inactive >= 0 {
            for (i, name) in ["m1", "m2", "m3"].iter().enumerate() {
                if i == current {
                    continue;
                }
                if let Some(led) = led_of(name) {
                    frame[led] = dim_inactive(frame[led], ctx.inactive);
                }
            }
            if !ctx.locked {
                if let Some(led) = led_of("lock") {
                    frame[led] = dim_inactive(frame[led], ctx.inactive);
                }
            }
        }

        if ctx.dither {
            for (i, c) in frame.iter_mut().enumerate() {
                let bias = ((i + self.frame_counter) % 4) as u8 * DITHER_STEP;
                let f = |v: u8| if v == 0 { 0 } else { v.saturating_add(bias) };
                *c = Rgb::new(f(c.r), f(c.g), f(c.b));
            }
            self.frame_counter = self.frame_counter.wrapping_add(1);
        }

        frame
    }
}

/// Whether a rendered frame has to go to the hardware
pub fn needs_send(frame: &[Rgb], last: Option<&[Rgb]>, force: bool) -> bool {
    force || last != Some(frame)
}
