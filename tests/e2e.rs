//! End-to-end tests for the ckbd daemon
//!
//! These tests drive the daemon library the way the binary does: a registry rooted in a
//! temporary directory, a device manager over simulated hardware, and clients talking to the
//! device nodes through their FIFOs. No real keyboard, mouse or uinput device is needed.

use ckb_common::fifo_client::{DaemonClient, DeviceNodeClient};
use ckb_common::{DeviceFeatures, Notification};
use ckbd::config::DaemonConfig;
use ckbd::device::{DeviceHandle, DeviceManager, IoState};
use ckbd::keymap;
use ckbd::profile::{Rgb, BRIGHTNESS_MAX};
use ckbd::security::NodePermissions;
use ckbd::test_device::{
    mouse_report, rgb_keyboard_report, InjectedEvent, RecordingInjector, SimulatedHardware,
    SimulatedOpener,
};
use ckbd::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::info;

const K70_RGB: u16 = 0x1b13;
const M65_RGB: u16 = 0x1b12;
const WAIT: Duration = Duration::from_secs(3);

/// Daemon state rooted in a temporary directory
struct TestEnvironment {
    temp_dir: TempDir,
    registry: Arc<Registry>,
    opener: Arc<SimulatedOpener>,
    injector: Arc<RecordingInjector>,
    manager: DeviceManager,
}

impl TestEnvironment {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();

        let temp_dir = TempDir::new().unwrap();
        let mut config = DaemonConfig::default();
        config.daemon.root_path = temp_dir.path().join("ckb0").to_string_lossy().into_owned();
        config.profile_cache.dir = temp_dir.path().join("cache").to_string_lossy().into_owned();
        config.io.read_timeout_ms = 5;
        config.lighting.inactive = -1;
        let registry = Registry::create(config, NodePermissions::default()).unwrap();
        info!("Test root node at {}", registry.root().display());

        let opener = SimulatedOpener::new();
        let injector = RecordingInjector::new();
        let manager = DeviceManager::new(Arc::clone(&registry), opener.clone(), injector.clone());
        Self { temp_dir, registry, opener, injector, manager }
    }

    fn plug(&self, product: u16, serial: &str) -> (Arc<SimulatedHardware>, DeviceHandle) {
        let hw = SimulatedHardware::new(product, serial);
        self.opener.plug(hw.clone());
        let device = self.manager.attach(&hw.endpoint.path).unwrap();
        assert!(device.flush(WAIT));
        (hw, device)
    }

    fn client(&self) -> DaemonClient {
        DaemonClient::with_root(self.registry.root()).with_timeout(WAIT.as_millis() as u64)
    }

    fn node_client(&self, device: &DeviceHandle) -> DeviceNodeClient {
        self.client().device(device.node_dir())
    }

    fn cache_dir(&self) -> PathBuf {
        self.temp_dir.path().join("cache")
    }
}

impl Drop for TestEnvironment {
    fn drop(&mut self) {
        self.manager.shutdown();
        self.registry.teardown();
    }
}

fn input(name: &str) -> usize {
    keymap::key_by_name(name).unwrap().input.unwrap()
}

fn led(name: &str) -> usize {
    keymap::key_by_name(name).unwrap().led.unwrap()
}

fn keycode(name: &str) -> u16 {
    keymap::key_by_name(name).unwrap().keycode.unwrap()
}

fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

async fn wait_until_async<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_root_and_device_nodes() {
    let env = TestEnvironment::new();
    let client = env.client();
    assert!(client.is_daemon_running().await);
    assert_eq!(client.daemon_version().await.unwrap(), env.registry.version);
    assert!(client.connected_devices().await.unwrap().is_empty());

    let (_kb, keyboard) = env.plug(K70_RGB, "KB01");
    let (_mouse, mouse) = env.plug(M65_RGB, "MS01");

    let connected = client.connected_devices().await.unwrap();
    assert_eq!(connected.len(), 2);
    assert_eq!(connected[0].path, keyboard.node_dir());
    assert_eq!(connected[0].serial, "KB01");
    assert_eq!(connected[1].serial, "MS01");

    let node = env.node_client(&keyboard);
    assert_eq!(node.read_info("model").await.unwrap(), "K70 RGB");
    assert_eq!(node.read_info("serial").await.unwrap(), "KB01");
    assert_eq!(node.read_info("status").await.unwrap(), "ok");
    let features = node.features().await.unwrap();
    assert!(features.contains(DeviceFeatures::RGB | DeviceFeatures::BIND));
    assert!(!features.contains(DeviceFeatures::ADJRATE));

    let mouse_features = env.node_client(&mouse).features().await.unwrap();
    assert!(mouse_features.contains(DeviceFeatures::ADJRATE));

    env.manager.detach(&keyboard);
    assert!(!keyboard.node_dir().exists());
    let connected = client.connected_devices().await.unwrap();
    assert_eq!(connected.len(), 1);
    assert_eq!(connected[0].serial, "MS01");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_commands_through_fifo() {
    let env = TestEnvironment::new();
    let (hw, device) = env.plug(K70_RGB, "FIFO");
    let node = env.node_client(&device);
    let mut notify = node.notifications(0).await.unwrap();

    let red = Rgb::new(255, 0, 0);
    let blue = Rgb::new(0, 0, 255);
    let esc_is = |color: Rgb| {
        let hw = hw.clone();
        move || hw.rgb_frames().last().is_some_and(|f| f[led("esc")] == color)
    };

    node.send_command("rgb ff0000").await.unwrap();
    assert!(wait_until_async(esc_is(red)).await);

    node.send_command("mode 2 rgb 0000ff switch").await.unwrap();
    let record = notify.wait_for(|n| matches!(n, Notification::Switch { .. })).await.unwrap();
    assert_eq!(record, Notification::Switch { mode: 2 });
    assert!(wait_until_async(esc_is(blue)).await);

    node.send_command("mode 1 switch").await.unwrap();
    let record = notify.wait_for(|n| matches!(n, Notification::Switch { .. })).await.unwrap();
    assert_eq!(record, Notification::Switch { mode: 1 });
    assert!(wait_until_async(esc_is(red)).await);

    node.send_command("get :mode").await.unwrap();
    let reply = notify.wait_for(|n| matches!(n, Notification::Reply(_))).await.unwrap();
    assert_eq!(reply, Notification::Reply("mode 1".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_key_and_indicator_notifications() {
    let env = TestEnvironment::new();
    let (hw, device) = env.plug(K70_RGB, "NOTE");
    let node = env.node_client(&device);

    node.send_command("notifyon 3").await.unwrap();
    assert!(wait_until_async(|| device.node_dir().join("notify3").exists()).await);
    let mut notify = node.notifications(3).await.unwrap();
    node.send_command("@3 notify a inotify caps").await.unwrap();
    // Commands run in order, so an answered get means the ones before it are applied
    node.send_command("@3 get :mode").await.unwrap();
    notify.wait_for(|n| matches!(n, Notification::Reply(_))).await.unwrap();

    hw.push_input(&rgb_keyboard_report(&[input("a")]));
    hw.push_input(&rgb_keyboard_report(&[]));
    assert_eq!(
        notify.next().await.unwrap(),
        Notification::Key { name: "a".to_string(), down: true }
    );
    assert_eq!(
        notify.next().await.unwrap(),
        Notification::Key { name: "a".to_string(), down: false }
    );

    env.injector.set_leds(ckb_common::indicator::CAPS);
    assert_eq!(
        notify.next().await.unwrap(),
        Notification::Indicator { name: "caps".to_string(), on: true }
    );
    assert!(wait_until_async(|| hw.leds().last() == Some(&ckb_common::indicator::CAPS)).await);
}

#[test]
fn test_macro_fires_once_per_press() {
    let env = TestEnvironment::new();
    let (hw, device) = env.plug(K70_RGB, "MACRO");
    device.execute_line("macro lctrl+q:+w,-w,+e,-e");

    let (ctrl, q) = (input("lctrl"), input("q"));
    hw.push_input(&rgb_keyboard_report(&[ctrl]));
    hw.push_input(&rgb_keyboard_report(&[ctrl, q]));
    hw.push_input(&rgb_keyboard_report(&[ctrl, q]));
    hw.push_input(&rgb_keyboard_report(&[ctrl]));
    hw.push_input(&rgb_keyboard_report(&[ctrl, q]));
    hw.push_input(&rgb_keyboard_report(&[]));

    let w_down = InjectedEvent::Key { keycode: keycode("w"), down: true };
    assert!(wait_until(|| env.injector.events().iter().filter(|e| **e == w_down).count() == 2));
    std::thread::sleep(Duration::from_millis(50));

    let events = env.injector.events();
    assert_eq!(events.iter().filter(|e| **e == w_down).count(), 2);
    // The trigger key itself never reaches the host
    assert!(!events.iter().any(|e| matches!(e, InjectedEvent::Key { keycode: k, .. } if *k == keycode("q"))));
}

#[test]
fn test_sniper_button_on_mouse() {
    let env = TestEnvironment::new();
    let (hw, device) = env.plug(M65_RGB, "SNIPE");
    let sniper = 1 << 7;
    let stage_reports = |stage: u8| {
        hw.sent_with_prefix(&[0x07, 0x13, 0x02])
            .iter()
            .filter(|r| r[4] == stage)
            .count()
    };
    hw.clear_sent();

    hw.push_input(&mouse_report(sniper, 0, 0, 0));
    assert!(wait_until(|| device.profile().current_mode().dpi.current == 0));
    assert!(device.flush(WAIT));
    assert_eq!(stage_reports(0), 1);

    hw.push_input(&mouse_report(0, 0, 0, 0));
    assert!(wait_until(|| device.profile().current_mode().dpi.current == 1));
    assert!(device.flush(WAIT));
    assert_eq!(stage_reports(1), 1);
}

#[test]
fn test_brightness_cycles_and_dims_frames() {
    let env = TestEnvironment::new();
    let (hw, device) = env.plug(K70_RGB, "DIM");
    device.execute_line("rgb ffffff");
    assert!(device.flush(WAIT));
    assert_eq!(hw.rgb_frames().last().unwrap()[led("esc")], Rgb::new(255, 255, 255));

    let light = input("light");
    hw.push_input(&rgb_keyboard_report(&[light]));
    hw.push_input(&rgb_keyboard_report(&[]));
    assert!(wait_until(|| device.brightness() == 0));
    assert!(device.flush(WAIT));
    assert_eq!(hw.rgb_frames().last().unwrap()[led("esc")], Rgb::BLACK);

    device.execute_line(&format!("brightness {}", BRIGHTNESS_MAX));
    assert!(device.flush(WAIT));
    assert_eq!(hw.rgb_frames().last().unwrap()[led("esc")], Rgb::new(255, 255, 255));
}

#[test]
fn test_unchanged_lighting_not_resent() {
    let env = TestEnvironment::new();
    let (hw, device) = env.plug(K70_RGB, "SAME");
    device.execute_line("rgb 336699");
    assert!(device.flush(WAIT));
    let frames = hw.rgb_frames().len();

    std::thread::sleep(Duration::from_millis(150));
    for _ in 0..3 {
        assert!(device.flush(WAIT));
    }
    assert_eq!(hw.rgb_frames().len(), frames);
}

#[test]
fn test_profile_survives_replug() {
    let env = TestEnvironment::new();
    let (hw, device) = env.plug(K70_RGB, "PERSIST");
    device.execute_line("profilename Gaming mode 2 name Work rgb 00ff00");
    env.manager.detach(&device);
    assert_eq!(device.io_state(), IoState::Stopped);
    assert!(env.cache_dir().read_dir().unwrap().next().is_some());

    env.opener.unplug(&hw.endpoint.path);
    let (_hw, device) = env.plug(K70_RGB, "PERSIST");
    let profile = device.profile();
    assert_eq!(profile.name, "Gaming");
    assert_eq!(profile.mode(1).unwrap().name, "Work");
    assert_eq!(profile.mode(1).unwrap().light.colors[led("esc")], Rgb::new(0, 255, 0));
}

#[test]
fn test_unplugged_device_reaped_by_rescan() {
    let env = TestEnvironment::new();
    let (hw, device) = env.plug(K70_RGB, "GONE");
    hw.unplug();
    env.opener.unplug(&hw.endpoint.path);
    assert!(wait_until(|| !device.is_active()));

    assert_eq!(env.manager.rescan(), 0);
    assert!(env.manager.list().is_empty());
    assert_eq!(device.io_state(), IoState::Stopped);
    assert!(!device.node_dir().exists());

    // A device plugged back in gets the freed node number
    let hw = SimulatedHardware::new(K70_RGB, "BACK");
    env.opener.plug(hw);
    assert_eq!(env.manager.rescan(), 1);
    assert_eq!(env.manager.list()[0].info().index, 1);
}
