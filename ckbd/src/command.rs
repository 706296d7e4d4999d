//! Command FIFO language
//!
//! A line is a sequence of whitespace-separated words. A keyword selects the command and the
//! words after it are its arguments until the next keyword, so `rgb esc:ff0000 f1:00ff00`
//! sets two keys. Words that do not parse are skipped; nothing is ever replied for them.

use ckb_common::{indicator, percent_decode, KeyAction, OUTFIFO_MAX};
use std::fmt::Write;
use tracing::debug;
use uuid::Uuid;

use crate::keymap::{self, Layout};
use crate::lighting::AnimationSpec;
use crate::macro_engine;
use crate::profile::{clamp_name, DpiSet, Macro, Mode, Rgb, BRIGHTNESS_MAX, DPI_COUNT, LIFT_MAX, LIFT_MIN};

/// Field requested by `get`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetField {
    Mode,
    Rgb,
    FwVersion,
    PollRate,
    Dpi,
    Lock,
    Brightness,
    HwProfileId,
}

impl GetField {
    fn parse(word: &str) -> Option<Self> {
        Some(match word.strip_prefix(':')? {
            "mode" => GetField::Mode,
            "rgb" => GetField::Rgb,
            "fwversion" => GetField::FwVersion,
            "pollrate" => GetField::PollRate,
            "dpi" => GetField::Dpi,
            "lock" => GetField::Lock,
            "brightness" => GetField::Brightness,
            "hwprofileid" => GetField::HwProfileId,
            _ => return None,
        })
    }
}

/// One parsed command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Target mode (0-based) for the commands that follow on the line
    Mode(usize),
    /// Make the target mode current
    Switch,
    /// Notify channel for replies
    Channel(usize),
    Rgb { leds: Vec<usize>, color: Rgb },
    Bind { keys: Vec<usize>, action: KeyAction },
    Unbind(Vec<usize>),
    Rebind(Vec<usize>),
    Macro(Macro),
    MacroClear,
    Notify { keys: Vec<usize>, on: bool },
    INotify { leds: u8, on: bool },
    Ion(u8),
    Ioff(u8),
    Iauto(u8),
    /// `None` disables the stage
    Dpi { stage: usize, value: Option<(u16, u16)> },
    DpiSel(u8),
    Lift(u8),
    Snap(bool),
    PollRate(u8),
    Name(String),
    ProfileName(String),
    Id(Uuid),
    ProfileId(Uuid),
    HwLoad,
    Erase,
    EraseProfile,
    NotifyOn(usize),
    NotifyOff(usize),
    Fps(u32),
    Dither(bool),
    Brightness(u8),
    Inactive(i8),
    AnimAdd(AnimationSpec),
    AnimClear,
    AnimRestart,
    AnimPreview(AnimationSpec),
    AnimStopPreview,
    Active,
    Idle,
    /// Default delay between macro actions
    Delay(u32),
    FwUpdate(String),
    Get(Vec<GetField>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keyword {
    Mode,
    Rgb,
    Bind,
    Unbind,
    Rebind,
    Macro,
    Notify,
    INotify,
    Ion,
    Ioff,
    Iauto,
    Dpi,
    DpiSel,
    Lift,
    Snap,
    PollRate,
    Name,
    ProfileName,
    Id,
    ProfileId,
    NotifyOn,
    NotifyOff,
    Fps,
    Dither,
    Brightness,
    Inactive,
    Anim,
    Delay,
    FwUpdate,
    Get,
}

enum Word {
    Immediate(Command),
    Keyword(Keyword),
}

fn classify(word: &str) -> Option<Word> {
    use Keyword as K;
    let keyword = match word {
        "switch" => return Some(Word::Immediate(Command::Switch)),
        "hwload" => return Some(Word::Immediate(Command::HwLoad)),
        "erase" => return Some(Word::Immediate(Command::Erase)),
        "eraseprofile" => return Some(Word::Immediate(Command::EraseProfile)),
        "active" => return Some(Word::Immediate(Command::Active)),
        "idle" => return Some(Word::Immediate(Command::Idle)),
        "mode" => K::Mode,
        "rgb" => K::Rgb,
        "bind" => K::Bind,
        "unbind" => K::Unbind,
        "rebind" => K::Rebind,
        "macro" => K::Macro,
        "notify" => K::Notify,
        "inotify" => K::INotify,
        "ion" => K::Ion,
        "ioff" => K::Ioff,
        "iauto" => K::Iauto,
        "dpi" => K::Dpi,
        "dpisel" => K::DpiSel,
        "lift" => K::Lift,
        "snap" => K::Snap,
        "pollrate" => K::PollRate,
        "name" => K::Name,
        "profilename" => K::ProfileName,
        "id" => K::Id,
        "profileid" => K::ProfileId,
        "notifyon" => K::NotifyOn,
        "notifyoff" => K::NotifyOff,
        "fps" => K::Fps,
        "dither" => K::Dither,
        "brightness" => K::Brightness,
        "inactive" => K::Inactive,
        "anim" => K::Anim,
        "delay" => K::Delay,
        "fwupdate" => K::FwUpdate,
        "get" => K::Get,
        _ => return None,
    };
    Some(Word::Keyword(keyword))
}

/// Split `keys:value`, defaulting the value when there is no colon
fn split_suffix<'a>(word: &'a str, default: &'a str) -> (&'a str, &'a str) {
    word.split_once(':').unwrap_or((word, default))
}

fn parse_on_off(word: &str) -> Option<bool> {
    match word {
        "on" | "1" => Some(true),
        "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_guid(word: &str) -> Option<Uuid> {
    Uuid::parse_str(word.trim_start_matches('{').trim_end_matches('}')).ok()
}

/// Arguments of one word for a single-word keyword
fn parse_argument(keyword: Keyword, word: &str, macro_delay: u32, layout: Layout) -> Option<Command> {
    use Keyword as K;
    let cmd = match keyword {
        K::Mode => {
            let n: usize = word.parse().ok()?;
            Command::Mode(n.checked_sub(1)?)
        }
        K::Rgb => match word.split_once(':') {
            Some((keys, color)) => Command::Rgb {
                leds: non_empty(keymap::parse_key_list(keys, true, layout))?,
                color: Rgb::from_hex(color)?,
            },
            None => Command::Rgb {
                leds: keymap::parse_key_list("all", true, layout),
                color: Rgb::from_hex(word)?,
            },
        },
        K::Bind => {
            let (keys, action) = word.split_once(':')?;
            Command::Bind {
                keys: non_empty(keymap::parse_key_list(keys, false, layout))?,
                action: action.parse().ok()?,
            }
        }
        K::Unbind => Command::Unbind(non_empty(keymap::parse_key_list(word, false, layout))?),
        K::Rebind => Command::Rebind(non_empty(keymap::parse_key_list(word, false, layout))?),
        K::Macro if word == "clear" => Command::MacroClear,
        K::Macro => Command::Macro(macro_engine::parse_macro(word, macro_delay, layout)?),
        K::Notify => {
            let (keys, state) = split_suffix(word, "on");
            Command::Notify {
                keys: non_empty(keymap::parse_key_list(keys, false, layout))?,
                on: parse_on_off(state)?,
            }
        }
        K::INotify => {
            let (leds, state) = split_suffix(word, "on");
            Command::INotify { leds: indicator::parse_list(leds)?, on: parse_on_off(state)? }
        }
        K::Ion => Command::Ion(indicator::parse_list(word)?),
        K::Ioff => Command::Ioff(indicator::parse_list(word)?),
        K::Iauto => Command::Iauto(indicator::parse_list(word)?),
        K::Dpi => {
            let (stage, value) = word.split_once(':')?;
            let stage: usize = stage.parse().ok()?;
            if stage >= DPI_COUNT {
                return None;
            }
            let value = if value == "off" {
                None
            } else {
                let (x, y) = value.split_once(',').unwrap_or((value, value));
                let (x, y): (u16, u16) = (x.parse().ok()?, y.parse().ok()?);
                if x == 0 || y == 0 {
                    return None;
                }
                Some((x, y))
            };
            Command::Dpi { stage, value }
        }
        K::DpiSel => {
            let stage: u8 = word.parse().ok()?;
            if stage as usize >= DPI_COUNT {
                return None;
            }
            Command::DpiSel(stage)
        }
        K::Lift => {
            let lift: u8 = word.parse().ok()?;
            if !(LIFT_MIN..=LIFT_MAX).contains(&lift) {
                return None;
            }
            Command::Lift(lift)
        }
        K::Snap => Command::Snap(parse_on_off(word)?),
        K::PollRate => Command::PollRate(word.parse().ok()?),
        K::Name => Command::Name(clamp_name(&percent_decode(word))),
        K::ProfileName => Command::ProfileName(clamp_name(&percent_decode(word))),
        K::Id => Command::Id(parse_guid(word)?),
        K::ProfileId => Command::ProfileId(parse_guid(word)?),
        K::NotifyOn => Command::NotifyOn(channel(word)?),
        K::NotifyOff => Command::NotifyOff(channel(word)?),
        K::Fps => Command::Fps(word.parse().ok().filter(|f| *f > 0)?),
        K::Dither => Command::Dither(parse_on_off(word)?),
        K::Brightness => Command::Brightness(word.parse().ok().filter(|b| *b <= BRIGHTNESS_MAX)?),
        K::Inactive => Command::Inactive(word.parse().ok().filter(|l| (-1..=2).contains(l))?),
        K::Delay => Command::Delay(word.parse().ok()?),
        K::FwUpdate => Command::FwUpdate(percent_decode(word)),
        K::Anim | K::Get => return None,
    };
    Some(cmd)
}

fn non_empty(keys: Vec<usize>) -> Option<Vec<usize>> {
    (!keys.is_empty()).then_some(keys)
}

fn channel(word: &str) -> Option<usize> {
    word.parse().ok().filter(|n| *n < OUTFIFO_MAX)
}

fn parse_anim(words: &[&str], layout: Layout) -> Option<Command> {
    let (&verb, rest) = words.split_first()?;
    match verb {
        "add" | "preview" => {
            let [kind, keys, params @ ..] = rest else { return None };
            let spec = AnimationSpec::parse(kind, keys, params, layout)?;
            Some(if verb == "add" { Command::AnimAdd(spec) } else { Command::AnimPreview(spec) })
        }
        "clear" => Some(Command::AnimClear),
        "restart" => Some(Command::AnimRestart),
        "stoppreview" => Some(Command::AnimStopPreview),
        _ => None,
    }
}

/// Emit the command of a keyword that collects every word up to the next keyword
fn flush(keyword: Option<Keyword>, pending: &mut Vec<&str>, out: &mut Vec<Command>, layout: Layout) {
    match keyword {
        Some(Keyword::Anim) => match parse_anim(pending, layout) {
            Some(cmd) => out.push(cmd),
            None => debug!("Ignoring anim {:?}", pending),
        },
        Some(Keyword::Get) => {
            let fields: Vec<GetField> = pending.iter().filter_map(|w| GetField::parse(w)).collect();
            if !fields.is_empty() {
                out.push(Command::Get(fields));
            }
        }
        _ => {}
    }
    pending.clear();
}

/// Parse one command line. `macro_delay` is the default delay for macro actions; key
/// names missing from `layout` are skipped.
pub fn parse_line(line: &str, macro_delay: u32, layout: Layout) -> Vec<Command> {
    let mut out = Vec::new();
    let mut current: Option<Keyword> = None;
    let mut pending: Vec<&str> = Vec::new();

    for word in line.split_whitespace() {
        if let Some(n) = word.strip_prefix('@') {
            match channel(n) {
                Some(n) => out.push(Command::Channel(n)),
                None => debug!("Ignoring channel {}", word),
            }
            continue;
        }

        match classify(word) {
            Some(Word::Immediate(cmd)) => {
                flush(current.take(), &mut pending, &mut out, layout);
                out.push(cmd);
            }
            Some(Word::Keyword(keyword)) => {
                flush(current.take(), &mut pending, &mut out, layout);
                current = Some(keyword);
            }
            None => match current {
                Some(Keyword::Anim) | Some(Keyword::Get) => pending.push(word),
                Some(keyword) => match parse_argument(keyword, word, macro_delay, layout) {
                    Some(cmd) => out.push(cmd),
                    None => debug!("Ignoring argument {} of {:?}", word, keyword),
                },
                None => debug!("Ignoring word {}", word),
            },
        }
    }
    flush(current, &mut pending, &mut out, layout);
    out
}

/// `get :rgb` reply body: a single color when uniform, else `name:color` pairs for the
/// keys present in `layout`
pub fn format_rgb(mode: &Mode, layout: Layout) -> String {
    let colors = &mode.light.colors;
    let lit: Vec<(&str, Rgb)> = keymap::keys()
        .iter()
        .filter(|k| keymap::key_in_layout(k, layout))
        .filter_map(|k| Some((k.name, *colors.get(k.led?)?)))
        .collect();
    if let Some((_, first)) = lit.first() {
        if lit.iter().all(|(_, c)| c == first) {
            return format!("rgb {}", first);
        }
    }
    let mut out = String::from("rgb");
    for (name, color) in &lit {
        let _ = write!(out, " {}:{}", name, color);
    }
    out
}

/// `get :dpi` reply body
pub fn format_dpi(dpi: &DpiSet) -> String {
    let mut out = String::from("dpi");
    for stage in 0..DPI_COUNT {
        if dpi.stage_enabled(stage) {
            let _ = write!(out, " {}:{},{}", stage, dpi.x[stage], dpi.y[stage]);
        } else {
            let _ = write!(out, " {}:off", stage);
        }
    }
    let _ = write!(out, " sel:{} lift:{} snap:{}", dpi.current, dpi.lift, if dpi.snap { "on" } else { "off" });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ckb_common::{LightStep, ModeTarget};

    fn input(name: &str) -> usize {
        keymap::key_by_name(name).unwrap().input.unwrap()
    }

    #[test]
    fn test_keyword_carries_over() {
        let cmds = parse_line("mode 2 rgb esc:ff0000 f1:00ff00 switch", 0, Layout::Iso);
        assert_eq!(cmds.len(), 4);
        assert_eq!(cmds[0], Command::Mode(1));
        assert_eq!(cmds[1], Command::Rgb { leds: vec![0], color: Rgb::new(255, 0, 0) });
        assert_eq!(cmds[2], Command::Rgb { leds: vec![1], color: Rgb::new(0, 255, 0) });
        assert_eq!(cmds[3], Command::Switch);
    }

    #[test]
    fn test_uniform_rgb() {
        let cmds = parse_line("rgb 0000ff", 0, Layout::Iso);
        let Command::Rgb { leds, color } = &cmds[0] else { panic!("expected rgb") };
        assert_eq!(leds.len(), keymap::N_LIGHTS);
        assert_eq!(*color, Rgb::new(0, 0, 255));
    }

    #[test]
    fn test_invalid_words_skipped() {
        let cmds = parse_line("mode 0 mode 99x rgb zzzzzz bogus dpi 1:0 lift 9 brightness 7", 0, Layout::Iso);
        assert!(cmds.is_empty());
        assert!(parse_line("", 0, Layout::Iso).is_empty());
    }

    #[test]
    fn test_bindings() {
        let cmds = parse_line("bind g1:$mode:-1 m1:a unbind g2 rebind g3", 0, Layout::Iso);
        assert_eq!(
            cmds,
            vec![
                Command::Bind { keys: vec![input("g1")], action: KeyAction::Mode(ModeTarget::Next) },
                Command::Bind { keys: vec![input("m1")], action: KeyAction::Normal("a".to_string()) },
                Command::Unbind(vec![input("g2")]),
                Command::Rebind(vec![input("g3")]),
            ]
        );
        let cmds = parse_line("bind light:$light:3", 0, Layout::Iso);
        assert_eq!(cmds[0], Command::Bind { keys: vec![input("light")], action: KeyAction::Light(LightStep::DownWrap) });
    }

    #[test]
    fn test_macro_and_notify() {
        let cmds = parse_line("@2 macro g1:+a,-a macro clear notify a,b:off inotify caps", 0, Layout::Iso);
        assert_eq!(cmds[0], Command::Channel(2));
        assert!(matches!(&cmds[1], Command::Macro(m) if m.actions.len() == 2));
        assert_eq!(cmds[2], Command::MacroClear);
        assert_eq!(cmds[3], Command::Notify { keys: vec![input("a"), input("b")], on: false });
        assert_eq!(cmds[4], Command::INotify { leds: indicator::CAPS, on: true });
    }

    #[test]
    fn test_dpi_commands() {
        let cmds = parse_line("dpi 1:1200 2:800,600 3:off dpisel 2 lift 3 snap on", 0, Layout::Iso);
        assert_eq!(
            cmds,
            vec![
                Command::Dpi { stage: 1, value: Some((1200, 1200)) },
                Command::Dpi { stage: 2, value: Some((800, 600)) },
                Command::Dpi { stage: 3, value: None },
                Command::DpiSel(2),
                Command::Lift(3),
                Command::Snap(true),
            ]
        );
    }

    #[test]
    fn test_anim_and_get_accumulate() {
        let cmds = parse_line("anim add wave all color=ff0000 period=500 get :mode :rgb :bogus", 0, Layout::Iso);
        assert_eq!(cmds.len(), 2);
        let Command::AnimAdd(spec) = &cmds[0] else { panic!("expected anim add") };
        assert_eq!(spec.color, Rgb::new(255, 0, 0));
        assert_eq!(spec.period_ms, 500);
        assert_eq!(cmds[1], Command::Get(vec![GetField::Mode, GetField::Rgb]));

        assert_eq!(parse_line("anim clear", 0, Layout::Iso), vec![Command::AnimClear]);
        assert!(parse_line("anim add sparkle all", 0, Layout::Iso).is_empty());
    }

    #[test]
    fn test_layout_filters_keys() {
        let hash = keymap::key_by_name("hash").unwrap();
        let cmds = parse_line("rgb hash:00ff00 notify hash", 0, Layout::Ansi);
        assert!(cmds.is_empty());
        let cmds = parse_line("rgb 00ff00", 0, Layout::Ansi);
        let Command::Rgb { leds, .. } = &cmds[0] else { panic!("expected rgb") };
        assert!(!leds.contains(&hash.led.unwrap()));

        let cmds = parse_line("rgb hash:00ff00", 0, Layout::Iso);
        assert_eq!(cmds, vec![Command::Rgb { leds: vec![hash.led.unwrap()], color: Rgb::new(0, 255, 0) }]);

        // An ISO-only key never shows up in an ANSI reply
        let mut mode = Mode::default();
        mode.light.fill(Rgb::new(255, 0, 0));
        mode.light.set(hash.led.unwrap(), Rgb::new(0, 0, 255));
        assert_eq!(format_rgb(&mode, Layout::Ansi), "rgb ff0000");
        assert!(format_rgb(&mode, Layout::Iso).contains(" hash:0000ff"));
        mode.light.set(0, Rgb::new(0, 0, 255));
        let ansi = format_rgb(&mode, Layout::Ansi);
        assert!(!ansi.contains("hash") && !ansi.contains("bslash_iso"), "{}", ansi);
    }

    #[test]
    fn test_names_and_ids() {
        let id = Uuid::new_v4();
        let line = format!("name My%20Mode profileid {{{}}}", id);
        let cmds = parse_line(&line, 0, Layout::Iso);
        assert_eq!(cmds[0], Command::Name("My Mode".to_string()));
        assert_eq!(cmds[1], Command::ProfileId(id));
    }

    #[test]
    fn test_format_replies() {
        let mut mode = Mode::default();
        mode.light.fill(Rgb::new(255, 0, 0));
        assert_eq!(format_rgb(&mode, Layout::Ansi), "rgb ff0000");
        mode.light.set(0, Rgb::new(0, 0, 255));
        assert!(format_rgb(&mode, Layout::Ansi).starts_with("rgb esc:0000ff f1:ff0000"));

        let mut dpi = DpiSet::default();
        dpi.enabled = 0x3d;
        let text = format_dpi(&dpi);
        assert!(text.starts_with("dpi 0:400,400 1:off 2:1500,1500"));
        assert!(text.ends_with("sel:1 lift:1 snap:off"));
    }
}
