use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::injector::Injector;
use crate::input::KeySet;
use crate::keymap::{self, Layout};
use crate::profile::{Macro, MacroAction};

/// Result of macro playback
pub type EngineResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Parse one macro action list: `+key`, `-key` or `~dx/dy`, each optionally followed by
/// `=ms`, separated by commas. `default_delay` applies where no `=ms` is given.
pub fn parse_actions(text: &str, default_delay: u32) -> Option<Vec<MacroAction>> {
    let mut actions = Vec::new();
    for item in text.split(',').filter(|s| !s.is_empty()) {
        let (body, delay_ms) = match item.split_once('=') {
            Some((body, ms)) => (body, ms.parse::<u32>().ok()?),
            None => (item, default_delay),
        };
        let mut chars = body.chars();
        let action = match chars.next()? {
            sign @ ('+' | '-') => {
                let input = keymap::key_by_name(chars.as_str())?.input?;
                MacroAction::Key { input, down: sign == '+', delay_ms }
            }
            '~' => {
                let (dx, dy) = chars.as_str().split_once('/')?;
                MacroAction::Move { dx: dx.parse().ok()?, dy: dy.parse().ok()?, delay_ms }
            }
            _ => return None,
        };
        actions.push(action);
    }
    if actions.is_empty() {
        return None;
    }
    Some(actions)
}

/// Parse `combo:actions` as given to the macro command. Combo keys are joined with `+`.
pub fn parse_macro(spec: &str, default_delay: u32, layout: Layout) -> Option<Macro> {
    let (combo, actions) = spec.split_once(':')?;
    let keys = keymap::parse_key_list(&combo.replace('+', ","), false, layout);
    if keys.is_empty() {
        return None;
    }
    Some(Macro {
        combo: KeySet::from_indices(keys),
        actions: Arc::from(parse_actions(actions, default_delay)?),
        triggered: false,
    })
}

/// Macros that fired during one evaluation, and keys whose bound actions must not run
#[derive(Debug, Default)]
pub struct MacroOutcome {
    pub fired: Vec<Arc<[MacroAction]>>,
    pub suppressed: KeySet,
}

/// Evaluate every macro against the keys currently down.
///
/// A macro fires when its whole combo is down and it has not fired since the combo was last
/// fully held; releasing any key of the combo re-arms it.
pub fn evaluate(macros: &mut [Macro], down: &KeySet) -> MacroOutcome {
    let mut outcome = MacroOutcome::default();
    for m in macros.iter_mut().filter(|m| !m.combo.is_empty()) {
        let was_triggered = m.triggered;
        if m.combo.is_subset_of(down) {
            if !m.triggered {
                m.triggered = true;
                outcome.fired.push(Arc::clone(&m.actions));
            }
        } else {
            m.triggered = false;
        }
        if was_triggered || m.triggered {
            for key in m.combo.iter() {
                outcome.suppressed.set(key);
            }
        }
    }
    outcome
}

/// Replay one action list through the injector. Delays are slept in slices of at most
/// `step`, and `keep_going` is checked before every action and slice. Returns false when
/// playback was cut short; keys the macro still held are released first.
pub fn replay(
    actions: &[MacroAction],
    injector: &dyn Injector,
    step: Duration,
    keep_going: &dyn Fn() -> bool,
) -> EngineResult<bool> {
    let mut held: Vec<u16> = Vec::new();
    for action in actions {
        if !keep_going() {
            release_held(&held, injector)?;
            return Ok(false);
        }
        match action {
            MacroAction::Key { input, down, .. } => {
                match keymap::key_by_input(*input).and_then(|k| k.keycode) {
                    Some(code) => {
                        injector.key_event(code, *down)?;
                        held.retain(|c| *c != code);
                        if *down {
                            held.push(code);
                        }
                    }
                    None => debug!("Macro key {} has no keycode, skipped", input),
                }
            }
            MacroAction::Move { dx, dy, .. } => injector.mouse_move(*dx, *dy)?,
        }
        if !sleep_while(Duration::from_millis(action.delay_ms() as u64), step, keep_going) {
            release_held(&held, injector)?;
            return Ok(false);
        }
    }
    Ok(true)
}

fn release_held(held: &[u16], injector: &dyn Injector) -> EngineResult<()> {
    for code in held.iter().rev() {
        injector.key_event(*code, false)?;
    }
    Ok(())
}

/// Sleep for `total` in slices of `step`; false if `keep_going` turned false first
fn sleep_while(total: Duration, step: Duration, keep_going: &dyn Fn() -> bool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        if !keep_going() {
            return false;
        }
        thread::sleep((deadline - now).min(step));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_device::{InjectedEvent, RecordingInjector};

    fn input(name: &str) -> usize {
        keymap::key_by_name(name).unwrap().input.unwrap()
    }

    #[test]
    fn test_parse_actions() {
        let actions = parse_actions("+a,-a=20,~5/-3", 1).unwrap();
        assert_eq!(
            actions,
            vec![
                MacroAction::Key { input: input("a"), down: true, delay_ms: 1 },
                MacroAction::Key { input: input("a"), down: false, delay_ms: 20 },
                MacroAction::Move { dx: 5, dy: -3, delay_ms: 1 },
            ]
        );
        assert!(parse_actions("*a", 0).is_none());
        assert!(parse_actions("+nosuchkey", 0).is_none());
        assert!(parse_actions("+a=x", 0).is_none());
        assert!(parse_actions("", 0).is_none());
    }

    #[test]
    fn test_parse_macro() {
        let m = parse_macro("g1+a:+b,-b", 0, Layout::Ansi).unwrap();
        assert_eq!(m.combo, KeySet::from_indices([input("g1"), input("a")]));
        assert_eq!(m.actions.len(), 2);
        assert!(!m.triggered);
        assert!(parse_macro("g1", 0, Layout::Ansi).is_none());
        assert!(parse_macro(":+b", 0, Layout::Ansi).is_none());
    }

    #[test]
    fn test_fires_once_per_press() {
        let mut macros = vec![parse_macro("a+b:+c,-c", 0, Layout::Ansi).unwrap()];
        let a = input("a");
        let b = input("b");

        assert!(evaluate(&mut macros, &KeySet::from_indices([a])).fired.is_empty());
        let outcome = evaluate(&mut macros, &KeySet::from_indices([a, b]));
        assert_eq!(outcome.fired.len(), 1);
        assert!(outcome.suppressed.get(a) && outcome.suppressed.get(b));

        // Still held: no re-fire
        assert!(evaluate(&mut macros, &KeySet::from_indices([a, b])).fired.is_empty());

        // Releasing one key re-arms; the release edge is still suppressed
        let outcome = evaluate(&mut macros, &KeySet::from_indices([b]));
        assert!(outcome.fired.is_empty());
        assert!(outcome.suppressed.get(a));
        assert_eq!(evaluate(&mut macros, &KeySet::from_indices([a, b])).fired.len(), 1);
    }

    #[test]
    fn test_order_independent() {
        let mut macros = vec![parse_macro("a+b:+c", 0, Layout::Ansi).unwrap()];
        assert!(evaluate(&mut macros, &KeySet::from_indices([input("b")])).fired.is_empty());
        let both = KeySet::from_indices([input("a"), input("b")]);
        assert_eq!(evaluate(&mut macros, &both).fired.len(), 1);
    }

    #[test]
    fn test_overlapping_macros() {
        let mut macros = vec![
            parse_macro("a:+x", 0, Layout::Ansi).unwrap(),
            parse_macro("a+b:+y", 0, Layout::Ansi).unwrap(),
        ];
        let a = KeySet::from_indices([input("a")]);
        let ab = KeySet::from_indices([input("a"), input("b")]);
        assert_eq!(evaluate(&mut macros, &a).fired.len(), 1);
        assert_eq!(evaluate(&mut macros, &ab).fired.len(), 1);
    }

    #[test]
    fn test_replay() {
        let injector = RecordingInjector::new();
        let actions = parse_actions("+a,~1/2,-a", 0).unwrap();
        let done = replay(&actions, injector.as_ref(), Duration::from_millis(5), &|| true).unwrap();
        assert!(done);
        assert_eq!(
            injector.events(),
            vec![
                InjectedEvent::Key { keycode: 30, down: true },
                InjectedEvent::Move { dx: 1, dy: 2 },
                InjectedEvent::Key { keycode: 30, down: false },
            ]
        );
    }

    #[test]
    fn test_replay_stops_when_cancelled() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let injector = RecordingInjector::new();
        let actions = parse_actions("+a,+b=3000,-b,-a", 0).unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            flag.store(false, Ordering::SeqCst);
        });

        let started = Instant::now();
        let keep_going = || running.load(Ordering::SeqCst);
        let done = replay(&actions, injector.as_ref(), Duration::from_millis(5), &keep_going).unwrap();
        stopper.join().unwrap();

        assert!(!done);
        assert!(started.elapsed() < Duration::from_millis(500));
        // Keys still held by the cut-short macro are released, most recent first
        assert_eq!(
            injector.events(),
            vec![
                InjectedEvent::Key { keycode: 30, down: true },
                InjectedEvent::Key { keycode: 48, down: true },
                InjectedEvent::Key { keycode: 48, down: false },
                InjectedEvent::Key { keycode: 30, down: false },
            ]
        );
    }
}
