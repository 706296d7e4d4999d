//! The threads of every device
//!
//! The I/O thread owns outbound traffic: queued [`IoOp`]s and the lighting/DPI refresh on the
//! frame clock. The input thread blocks on the input endpoint for at most the configured read
//! timeout, then decodes the report, runs key actions and writes notifications. Fired macros
//! go to the macro thread, which plays them back with their delays. All of them poll the
//! device's active flag at least once per read timeout and exit on their own.

use ckb_common::{indicator, Notification};
use crossbeam_channel::{select, tick, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::MutexGuard;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::device::{software_keys, Device, IoOp, IoRequest, IoState};
use crate::key_action::Output;
use crate::keymap;
use crate::lighting::needs_send;
use crate::macro_engine::{self, MacroOutcome};
use crate::profile::MacroAction;
use crate::protocol::{self, MSG_SIZE};
use crate::transport::TransportError;
use ckb_common::DeviceFeatures;

fn frame_interval(fps: u32) -> Duration {
    Duration::from_micros(1_000_000 / fps.max(1) as u64)
}

type MacroQueue = Sender<Arc<[MacroAction]>>;

/// Start the I/O, macro and input threads of `device`
pub(crate) fn spawn(device: &Arc<Device>, rx: Receiver<IoRequest>) -> io::Result<Vec<JoinHandle<()>>> {
    let name = device.name();
    let (macro_tx, macro_rx) = unbounded();

    let mut handles = vec![start(device, format!("{}-io", name), move |d| io_loop(d, rx))?];
    match start(device, format!("{}-macro", name), move |d| macro_loop(d, macro_rx)) {
        Ok(handle) => handles.push(handle),
        Err(e) => return Err(abort(device, handles, e)),
    }
    match start(device, format!("{}-input", name), move |d| input_loop(d, &macro_tx)) {
        Ok(handle) => handles.push(handle),
        Err(e) => return Err(abort(device, handles, e)),
    }
    Ok(handles)
}

fn start<F>(device: &Arc<Device>, name: String, body: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce(&Device) + Send + 'static,
{
    let device = Arc::clone(device);
    thread::Builder::new().name(name).spawn(move || body(&device))
}

/// Stop the threads already started after a later one failed to spawn
fn abort(device: &Device, handles: Vec<JoinHandle<()>>, e: io::Error) -> io::Error {
    device.active.store(false, Ordering::SeqCst);
    for handle in handles {
        let _ = handle.join();
    }
    e
}

fn io_loop(device: &Device, rx: Receiver<IoRequest>) {
    device.set_io_state(IoState::Active);
    let mut fps = device.state.lock().fps;
    let mut ticker = tick(frame_interval(fps));
    let mut failed = false;

    while device.is_active() {
        select! {
            recv(rx) -> msg => match msg {
                Ok(request) => {
                    let ok = match apply(device, request.op) {
                        Ok(()) => true,
                        Err(e) => {
                            device.fail(&format!("{:?}", request.op), &e);
                            failed = true;
                            false
                        }
                    };
                    if let Some(ack) = request.ack {
                        let _ = ack.send(ok);
                    }
                }
                Err(_) => break,
            },
            recv(ticker) -> _ => {
                if let Err(e) = refresh(device) {
                    device.fail("lighting update", &e);
                    failed = true;
                }
            }
        }

        let wanted = device.state.lock().fps;
        if wanted != fps {
            fps = wanted;
            ticker = tick(frame_interval(fps));
        }
    }

    device.set_io_state(IoState::Draining);
    while let Ok(request) = rx.try_recv() {
        let ok = !failed && apply(device, request.op).is_ok();
        failed |= !ok;
        if let Some(ack) = request.ack {
            let _ = ack.send(ok);
        }
    }
    if !failed {
        // Hand the device back to its firmware
        if let Err(e) = device.send_reports(&[device.info.family.control(false)]) {
            debug!("{}: could not return control to firmware: {}", device.name(), e);
        }
    }
    device.set_io_state(IoState::Stopped);
}

fn apply(device: &Device, op: IoOp) -> Result<(), TransportError> {
    let family = device.info.family;
    match op {
        IoOp::Bindings => {
            if !device.info.features.contains(DeviceFeatures::BIND) {
                return Ok(());
            }
            let software = device.state.lock().software;
            device.send_reports(&family.binding_update(&software_keys(software)))
        }
        IoOp::Control(software) => device.send_reports(&[family.control(software)]),
        IoOp::PollRate(ms) => {
            device.send_reports(&[protocol::poll_rate_report(ms)])?;
            device.state.lock().pollrate = ms;
            if let Err(e) = device.node().write_pollrate(ms) {
                warn!("{}: failed to update pollrate file: {}", device.name(), e);
            }
            Ok(())
        }
        IoOp::Indicators(leds) => {
            let mut guard = device.transport.lock();
            guard.as_mut().ok_or(TransportError::Disconnected)?.set_leds(leds)
        }
        IoOp::Frame => refresh(device),
    }
}

/// Render the current mode and send whatever differs from what the hardware shows
pub(crate) fn refresh(device: &Device) -> Result<(), TransportError> {
    let family = device.info.family;
    let (index, frame, dpi) = {
        let mut guard = device.state.lock();
        let st = &mut *guard;
        if !st.software {
            return Ok(());
        }
        let ctx = st.render_context(&device.registry);
        let rendered = st.lighting.render(&st.profile, &ctx, Instant::now());
        let mode = st.profile.current_mode();

        let frame = needs_send(&rendered, st.profile.last_light.as_deref(), mode.light.force_update)
            .then_some(rendered);
        let dpi_changed = mode.dpi.force_update
            || !st.profile.last_dpi.as_ref().is_some_and(|last| last.same_settings(&mode.dpi));
        let dpi = (family.is_mouse() && dpi_changed)
            .then(|| (family.dpi_update(&mode.dpi, st.profile.last_dpi.as_ref()), mode.dpi.clone()));
        (st.profile.current_index(), frame, dpi)
    };

    if let Some(frame) = &frame {
        device.send_reports(&family.lighting_frame(frame))?;
    }
    if let Some((reports, _)) = &dpi {
        device.send_reports(reports)?;
    }
    if frame.is_some() || dpi.is_some() {
        device
            .state
            .lock()
            .profile
            .mark_sent(index, frame, dpi.map(|(_, set)| set));
    }
    Ok(())
}

fn read_timeout(device: &Device) -> Duration {
    Duration::from_millis(device.registry.config.io.read_timeout_ms.max(1) as u64)
}

/// Play queued macros in order. Playback is cut short once the device goes inactive.
fn macro_loop(device: &Device, rx: Receiver<Arc<[MacroAction]>>) {
    let step = read_timeout(device);
    let keep_going = || device.is_active();
    while device.is_active() {
        let actions = match rx.recv_timeout(step) {
            Ok(actions) => actions,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match macro_engine::replay(&actions, device.injector.as_ref(), step, &keep_going) {
            Ok(true) => {}
            Ok(false) => debug!("{}: macro playback interrupted", device.name()),
            Err(e) => warn!("{}: macro playback failed: {}", device.name(), e),
        }
    }
    debug!("{}: macro thread stopped", device.name());
}

fn input_loop(device: &Device, macros: &MacroQueue) {
    let timeout = device.registry.config.io.read_timeout_ms;
    let mut buf = [0u8; MSG_SIZE];

    while device.is_active() {
        let result = {
            let mut guard = device.transport.lock();
            let result = match guard.as_mut() {
                Some(transport) => transport.read_input(&mut buf, timeout),
                None => Err(TransportError::Disconnected),
            };
            // Let a waiting I/O thread in before this loop locks again
            MutexGuard::unlock_fair(guard);
            result
        };
        match result {
            Ok(0) => {}
            Ok(len) => process_report(device, &buf[..len], macros),
            Err(e) => {
                device.fail("input read", &e);
                break;
            }
        }
        poll_indicators(device);
    }
    debug!("{}: input thread stopped", device.name());
}

/// Decode one input report and run everything that reacts to it
fn process_report(device: &Device, data: &[u8], macros: &MacroQueue) {
    let Some(report) = device.info.family.decode_input(data) else {
        debug!("{}: dropped malformed input report ({} bytes)", device.name(), data.len());
        return;
    };
    let (edges, down, motion) = {
        let mut snapshot = device.input.lock();
        let edges = snapshot.apply(&report);
        let down = snapshot.keys;
        (edges, down, snapshot.take_motion())
    };

    let mut outputs = Vec::new();
    let mut records = Vec::new();
    let mut switched = None;
    let software;
    let outcome;
    {
        let mut guard = device.state.lock();
        let st = &mut *guard;
        let now = Instant::now();
        software = st.software;
        outcome = if software {
            macro_engine::evaluate(st.profile.macros_mut(), &down)
        } else {
            MacroOutcome::default()
        };

        for edge in edges {
            if let Some(name) = keymap::input_name(edge.index) {
                let mode = st.profile.current_mode();
                for (channel, mask) in mode.notify.iter().enumerate() {
                    if mask.get(edge.index) {
                        records.push((
                            channel,
                            Notification::Key { name: name.to_string(), down: edge.down },
                        ));
                    }
                }
            }
            if edge.down {
                if let Some(led) = keymap::key_by_input(edge.index).and_then(|k| k.led) {
                    st.lighting.key_hit(led, now);
                }
            }
            if !software || st.keys.consume(edge, &outcome.suppressed) {
                continue;
            }

            let current = st.profile.current_index();
            let before = st.brightness_of(&device.registry, current);
            let mut level = before;
            for output in st.keys.handle(edge, &mut st.profile, &mut level) {
                match output {
                    Output::Switched(mode) => switched = Some(mode),
                    other => outputs.push(other),
                }
            }
            if level != before {
                st.set_brightness(&device.registry, current, level);
            }
        }
    }

    if software {
        let injector = device.injector.as_ref();
        if motion != (0, 0) {
            if let Err(e) = injector.mouse_move(motion.0, motion.1) {
                warn!("{}: mouse injection failed: {}", device.name(), e);
            }
        }
        for output in outputs {
            let result = match output {
                Output::Key { keycode, down } => injector.key_event(keycode, down),
                Output::Scroll(amount) => injector.mouse_scroll(amount),
                Output::Switched(_) => Ok(()),
            };
            if let Err(e) = result {
                warn!("{}: key injection failed: {}", device.name(), e);
            }
        }
        for actions in outcome.fired {
            if macros.send(actions).is_err() {
                debug!("{}: macro thread gone, macro dropped", device.name());
            }
        }
    }

    device.deliver(records);
    if let Some(mode) = switched {
        device.broadcast(&Notification::Switch { mode: mode + 1 });
    }
}

/// Combine host indicator state with the mode's overrides and push changes out
pub(crate) fn poll_indicators(device: &Device) {
    if !device.info.family.is_keyboard() {
        return;
    }
    let host = device.injector.read_leds();
    let (leds, records) = {
        let mut st = device.state.lock();
        let mode = st.profile.current_mode();
        let leds = (host | mode.ion) & !mode.ioff;
        if leds == st.leds && !st.leds_stale {
            return;
        }
        let changed = leds ^ st.leds;
        let mut records = Vec::new();
        for bit in [indicator::NUM, indicator::CAPS, indicator::SCROLL] {
            let Some(name) = indicator::name(bit).filter(|_| changed & bit != 0) else { continue };
            for (channel, mask) in mode.inotify.iter().enumerate() {
                if mask & bit != 0 {
                    records.push((
                        channel,
                        Notification::Indicator { name: name.to_string(), on: leds & bit != 0 },
                    ));
                }
            }
        }
        st.leds = leds;
        st.leds_stale = false;
        (leds, records)
    };
    device.submit(IoOp::Indicators(leds));
    device.deliver(records);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceManager;
    use crate::profile::{Rgb, BRIGHTNESS_MAX};
    use crate::test_device::{
        mouse_report, rgb_keyboard_report, InjectedEvent, RecordingInjector, SimulatedHardware,
        SimulatedOpener,
    };
    use std::fs::OpenOptions;
    use std::io::Read;
    use std::os::unix::fs::OpenOptionsExt;

    const WAIT: Duration = Duration::from_secs(2);

    struct Rig {
        _dir: tempfile::TempDir,
        hw: Arc<SimulatedHardware>,
        injector: Arc<RecordingInjector>,
        manager: DeviceManager,
        device: Arc<Device>,
    }

    fn rig(product: u16) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let registry = crate::test_registry(dir.path());
        let opener = SimulatedOpener::new();
        let hw = SimulatedHardware::new(product, "IO");
        opener.plug(hw.clone());
        let injector = RecordingInjector::new();
        let manager = DeviceManager::new(registry, opener, injector.clone());
        let device = manager.attach(&hw.endpoint.path).unwrap();
        assert!(device.flush(WAIT));
        Rig { _dir: dir, hw, injector, manager, device }
    }

    fn input(name: &str) -> usize {
        keymap::key_by_name(name).unwrap().input.unwrap()
    }

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_identical_frames_sent_once() {
        let rig = rig(0x1b13);
        rig.device.execute_line("rgb 00ff00");
        assert!(rig.device.flush(WAIT));
        let sent = rig.hw.rgb_frames().len();
        for _ in 0..5 {
            assert!(rig.device.flush(WAIT));
        }
        assert_eq!(rig.hw.rgb_frames().len(), sent);

        // A forced update goes out even though nothing changed
        rig.device.state.lock().profile.current_mode_mut().light.force_update = true;
        assert!(rig.device.flush(WAIT));
        assert_eq!(rig.hw.rgb_frames().len(), sent + 1);
        rig.manager.detach(&rig.device);
    }

    #[test]
    fn test_passthrough_and_edges() {
        let rig = rig(0x1b13);
        let a = input("a");
        rig.hw.push_input(&rgb_keyboard_report(&[a]));
        rig.hw.push_input(&rgb_keyboard_report(&[a]));
        rig.hw.push_input(&rgb_keyboard_report(&[]));
        assert!(wait_for(|| rig.injector.events().len() >= 2));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(
            rig.injector.events(),
            vec![
                InjectedEvent::Key { keycode: 30, down: true },
                InjectedEvent::Key { keycode: 30, down: false },
            ]
        );
        rig.manager.detach(&rig.device);
    }

    #[test]
    fn test_malformed_report_dropped() {
        let rig = rig(0x1b13);
        rig.hw.push_input(&[0x99, 0x00]);
        rig.hw.push_input(&rgb_keyboard_report(&[input("b")]));
        assert!(wait_for(|| !rig.injector.events().is_empty()));
        assert!(rig.device.is_active());
        rig.manager.detach(&rig.device);
    }

    #[test]
    fn test_macro_fires_once_and_suppresses() {
        let rig = rig(0x1b13);
        rig.device.execute_line("macro a+b:+c,-c");
        let (a, b) = (input("a"), input("b"));
        rig.hw.push_input(&rgb_keyboard_report(&[b]));
        rig.hw.push_input(&rgb_keyboard_report(&[a, b]));
        rig.hw.push_input(&rgb_keyboard_report(&[a, b]));
        rig.hw.push_input(&rgb_keyboard_report(&[]));
        assert!(wait_for(|| rig.injector.events().len() >= 4));
        thread::sleep(Duration::from_millis(20));

        let c = keymap::key_by_name("c").unwrap().keycode.unwrap();
        let events = rig.injector.events();
        let fired = events
            .iter()
            .filter(|e| **e == InjectedEvent::Key { keycode: c, down: true })
            .count();
        assert_eq!(fired, 1);
        rig.manager.detach(&rig.device);
    }

    #[test]
    fn test_detach_interrupts_long_macro() {
        let rig = rig(0x1b11);
        rig.device.execute_line("macro g1:+a=3000,-a");
        let g1 = input("g1");
        rig.hw.push_input(&rgb_keyboard_report(&[g1]));
        assert!(wait_for(|| !rig.injector.events().is_empty()));

        // Key input keeps flowing while the macro waits out its delay
        rig.hw.push_input(&rgb_keyboard_report(&[g1, input("b")]));
        assert!(wait_for(|| rig.injector.events().len() >= 2));

        let started = Instant::now();
        rig.manager.detach(&rig.device);
        assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());
        assert_eq!(rig.device.io_state(), IoState::Stopped);
        // The cut-short macro does not leave its key down
        assert_eq!(rig.injector.events().last(), Some(&InjectedEvent::Key { keycode: 30, down: false }));
    }

    #[test]
    fn test_mode_key_notifies_switch() {
        let rig = rig(0x1b13);
        let mut reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(rig.device.node_dir().join("notify0"))
            .unwrap();
        rig.device.execute_line("notify m2");
        let m2 = input("m2");
        rig.hw.push_input(&rgb_keyboard_report(&[m2]));
        rig.hw.push_input(&rgb_keyboard_report(&[]));
        assert!(wait_for(|| rig.device.profile().current_index() == 1));

        thread::sleep(Duration::from_millis(20));
        let mut buf = [0u8; 256];
        let n = reader.read(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("key +m2\nswitch 2\n"), "{}", text);
        rig.manager.detach(&rig.device);
    }

    #[test]
    fn test_brightness_key() {
        let rig = rig(0x1b13);
        let light = input("light");
        // light is bound to up-with-wrap: 3 -> 0 -> 1 -> 2 -> 3
        for expected in [0, 1, 2, BRIGHTNESS_MAX] {
            rig.hw.push_input(&rgb_keyboard_report(&[light]));
            rig.hw.push_input(&rgb_keyboard_report(&[]));
            assert!(wait_for(|| rig.device.brightness() == expected));
        }
        rig.manager.detach(&rig.device);
    }

    #[test]
    fn test_indicators_forced_and_reported() {
        let rig = rig(0x1b13);
        rig.injector.set_leds(indicator::CAPS);
        assert!(wait_for(|| rig.hw.leds().last() == Some(&indicator::CAPS)));

        rig.device.execute_line("ion num ioff caps");
        assert!(wait_for(|| rig.hw.leds().last() == Some(&indicator::NUM)));
        rig.manager.detach(&rig.device);
    }

    #[test]
    fn test_idle_skips_key_actions() {
        let rig = rig(0x1b13);
        rig.device.execute_line("idle");
        assert!(rig.device.flush(WAIT));
        assert!(!rig.hw.sent_with_prefix(&[0x07, 0x04, 0x01]).is_empty());
        rig.hw.push_input(&rgb_keyboard_report(&[input("a")]));
        thread::sleep(Duration::from_millis(50));
        assert!(rig.injector.events().is_empty());
        rig.manager.detach(&rig.device);
    }

    #[test]
    fn test_mouse_motion_and_dpi() {
        let rig = rig(0x1b12);
        assert!(!rig.hw.sent_with_prefix(&[0x07, 0x13, 0xd0]).is_empty());
        rig.hw.push_input(&mouse_report(0, 5, -3, 1));
        assert!(wait_for(|| rig.injector.events().len() >= 2));
        assert_eq!(
            rig.injector.events(),
            vec![InjectedEvent::Move { dx: 5, dy: -3 }, InjectedEvent::Scroll(1)]
        );

        rig.hw.clear_sent();
        rig.device.execute_line("dpisel 3");
        assert!(rig.device.flush(WAIT));
        assert_eq!(rig.hw.sent_with_prefix(&[0x07, 0x13, 0x02]).len(), 1);
        assert!(rig.hw.sent_with_prefix(&[0x07, 0x13, 0xd0]).is_empty());
        rig.manager.detach(&rig.device);
    }

    #[test]
    fn test_unplug_stops_threads() {
        let rig = rig(0x1b13);
        rig.hw.unplug();
        assert!(wait_for(|| !rig.device.is_active()));
        rig.manager.detach(&rig.device);
        assert_eq!(rig.device.io_state(), IoState::Stopped);
    }

    #[test]
    fn test_detach_returns_control() {
        let rig = rig(0x1b13);
        rig.hw.clear_sent();
        rig.manager.detach(&rig.device);
        assert_eq!(rig.hw.sent_with_prefix(&[0x07, 0x04, 0x01]).len(), 1);
        // Red frame setting after detach goes nowhere
        rig.device.execute_line("rgb ff0000");
        assert!(!rig.device.flush(Duration::from_millis(50)));
        assert!(rig.hw.rgb_frames().iter().all(|f| f[0] != Rgb::new(255, 0, 0)));
    }
}
