//! Attached devices and the device manager
//!
//! A [`Device`] owns its hardware handle, its profile store and two threads (see
//! [`crate::io_thread`]). The [`DeviceManager`] hands out node numbers 1..=9, attaches and
//! detaches devices and keeps the root `connected` file current.

use ckb_common::{ConnectedEntry, DeviceFeatures, Notification, DEV_MAX, OUTFIFO_MAX};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::command::{self, Command, GetField};
use crate::config::ProfileCache;
use crate::devnode::{self, DeviceNode, NodeInfo};
use crate::injector::Injector;
use crate::input::{InputSnapshot, KeySet};
use crate::io_thread;
use crate::key_action::KeyRuntime;
use crate::keymap::{self, Layout, ProductKind, N_KEYS_KB};
use crate::lighting::{LightingEngine, RenderContext, MAX_FPS};
use crate::notify::NotifyHub;
use crate::profile::{DpiSet, HwMode, HwProfile, HwSlot, Profile, DPI_COUNT, HWMODE_MAX, MODE_COUNT};
use crate::protocol::{self, DeviceFamily, FirmwareInfo, PACKED_LIGHTING_LEN};
use crate::transport::{DeviceOpener, HidEndpoint, HidTransport, TransportError};
use crate::Registry;

/// Lifecycle of a device's I/O thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    Idle,
    Active,
    Draining,
    Stopped,
}

impl IoState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => IoState::Idle,
            1 => IoState::Active,
            2 => IoState::Draining,
            _ => IoState::Stopped,
        }
    }
}

/// Device health as shown in the node's `status` file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Ok,
    /// Zero firmware version on an updatable device
    NeedsFirmwareUpdate,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Ok => "ok",
            DeviceStatus::NeedsFirmwareUpdate => "needs-fw-update",
        }
    }
}

/// Outbound work for the I/O thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    /// Tell the keyboard which keys the daemon handles
    Bindings,
    /// Take control from the firmware (`true`) or give it back
    Control(bool),
    PollRate(u8),
    Indicators(u8),
    /// Render and send a frame now instead of on the next tick
    Frame,
}

pub(crate) struct IoRequest {
    pub op: IoOp,
    pub ack: Option<Sender<bool>>,
}

/// Fixed identity of an attached device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Node number, 1..=9
    pub index: usize,
    pub path: String,
    pub vendor: u16,
    pub product: u16,
    pub serial: String,
    pub model: String,
    pub family: DeviceFamily,
    pub features: DeviceFeatures,
    pub layout: Layout,
}

/// Mutable per-device state, guarded by one lock
pub struct DeviceState {
    pub profile: Profile,
    pub hw_profile: Option<HwProfile>,
    pub firmware: FirmwareInfo,
    pub pollrate: u8,
    pub fps: u32,
    pub dither: bool,
    pub inactive: i8,
    /// Default delay between macro actions
    pub macro_delay: u32,
    /// Indicator mask last sent
    pub leds: u8,
    /// Send the indicator mask on the next poll even if unchanged
    pub leds_stale: bool,
    /// Whether the daemon rather than the firmware handles keys
    pub software: bool,
    pub status: DeviceStatus,
    pub lighting: LightingEngine,
    pub keys: KeyRuntime,
}

impl DeviceState {
    /// Dimming level of mode `index`, or the shared level
    pub fn brightness_of(&self, registry: &Registry, index: usize) -> u8 {
        if registry.config.lighting.share_dimming {
            return registry.shared_brightness();
        }
        self.profile.mode(index).map(|m| m.brightness).unwrap_or(0)
    }

    pub fn set_brightness(&mut self, registry: &Registry, index: usize, level: u8) {
        if registry.config.lighting.share_dimming {
            registry.set_shared_brightness(level);
        } else if let Some(mode) = self.profile.mode_mut(index) {
            mode.brightness = level.min(crate::profile::BRIGHTNESS_MAX);
        }
    }

    pub fn render_context(&self, registry: &Registry) -> RenderContext {
        RenderContext {
            brightness: self.brightness_of(registry, self.profile.current_index()),
            inactive: self.inactive,
            dither: self.dither,
            locked: self.keys.is_locked(),
        }
    }
}

/// Keys the daemon takes over from the firmware
pub fn software_keys(software: bool) -> KeySet {
    if software {
        KeySet::from_indices(0..N_KEYS_KB)
    } else {
        KeySet::new()
    }
}

enum Effect {
    Io(IoOp),
    Reply(usize, String),
    Broadcast(Notification),
    NotifyOn(usize),
    NotifyOff(usize),
}

/// One attached device
pub struct Device {
    pub(crate) info: DeviceInfo,
    pub(crate) active: AtomicBool,
    detached: AtomicBool,
    io_state: AtomicU8,
    pub(crate) transport: Mutex<Option<Box<dyn HidTransport>>>,
    pub(crate) input: Mutex<InputSnapshot>,
    pub(crate) state: Mutex<DeviceState>,
    pub(crate) notify: Mutex<NotifyHub>,
    queue: Sender<IoRequest>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) injector: Arc<dyn Injector>,
    node: DeviceNode,
    threads: Mutex<Vec<JoinHandle<()>>>,
    listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

pub type DeviceHandle = Arc<Device>;

impl Device {
    fn new(
        info: DeviceInfo,
        transport: Box<dyn HidTransport>,
        state: DeviceState,
        notify: NotifyHub,
        node: DeviceNode,
        registry: Arc<Registry>,
        injector: Arc<dyn Injector>,
    ) -> (Arc<Self>, Receiver<IoRequest>) {
        let (queue, rx) = crossbeam_channel::unbounded();
        let device = Arc::new(Self {
            info,
            active: AtomicBool::new(true),
            detached: AtomicBool::new(false),
            io_state: AtomicU8::new(IoState::Idle as u8),
            transport: Mutex::new(Some(transport)),
            input: Mutex::new(InputSnapshot::new()),
            state: Mutex::new(state),
            notify: Mutex::new(notify),
            queue,
            registry,
            injector,
            node,
            threads: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
        });
        (device, rx)
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn name(&self) -> String {
        format!("ckb{}", self.info.index)
    }

    pub fn node(&self) -> &DeviceNode {
        &self.node
    }

    pub fn node_dir(&self) -> &Path {
        self.node.dir()
    }

    /// False once the device failed or detach began
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn io_state(&self) -> IoState {
        IoState::from_u8(self.io_state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_io_state(&self, state: IoState) {
        let old = IoState::from_u8(self.io_state.swap(state as u8, Ordering::SeqCst));
        if old != state {
            debug!("{}: I/O {:?} -> {:?}", self.name(), old, state);
        }
    }

    pub fn status(&self) -> DeviceStatus {
        self.state.lock().status
    }

    /// Snapshot of the profile store
    pub fn profile(&self) -> Profile {
        self.state.lock().profile.clone()
    }

    /// Dimming level in effect for the current mode
    pub fn brightness(&self) -> u8 {
        let st = self.state.lock();
        st.brightness_of(&self.registry, st.profile.current_index())
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().keys.is_locked()
    }

    /// Stop the device after an unrecoverable I/O failure; the manager reaps it later
    pub(crate) fn fail(&self, what: &str, err: &TransportError) {
        if self.active.swap(false, Ordering::SeqCst) {
            error!("{}: {} failed, deactivating: {}", self.name(), what, err);
        }
    }

    /// Queue work for the I/O thread
    pub fn submit(&self, op: IoOp) {
        if self.queue.send(IoRequest { op, ack: None }).is_err() {
            debug!("{}: I/O thread gone, dropped {:?}", self.name(), op);
        }
    }

    /// Render and send a frame, waiting until the I/O thread has done so.
    /// Everything queued before this call has been applied when it returns true.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (tx, rx) = crossbeam_channel::bounded(1);
        if self.queue.send(IoRequest { op: IoOp::Frame, ack: Some(tx) }).is_err() {
            return false;
        }
        rx.recv_timeout(timeout).unwrap_or(false)
    }

    /// Send reports in order, pausing for the configured USB delay after each
    pub(crate) fn send_reports(&self, reports: &[protocol::Report]) -> Result<(), TransportError> {
        if reports.is_empty() {
            return Ok(());
        }
        let delay = Duration::from_millis(self.registry.config.io.usb_delay_ms);
        let mut guard = self.transport.lock();
        let transport = guard.as_mut().ok_or(TransportError::Disconnected)?;
        for report in reports {
            transport.send(report)?;
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
        Ok(())
    }

    /// Write notifications outside of the state lock
    pub(crate) fn deliver(&self, records: Vec<(usize, Notification)>) {
        if records.is_empty() {
            return;
        }
        let mut hub = self.notify.lock();
        for (channel, record) in &records {
            hub.write(*channel, record);
        }
    }

    pub(crate) fn broadcast(&self, record: &Notification) {
        self.notify.lock().broadcast(record);
    }

    /// Run one line from the command FIFO
    pub fn execute_line(&self, line: &str) {
        let macro_delay = self.state.lock().macro_delay;
        let commands = command::parse_line(line, macro_delay, self.info.layout);
        if commands.is_empty() {
            debug!("{}: ignored command line '{}'", self.name(), line.trim());
            return;
        }

        let mut effects = Vec::new();
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let mut target = st.profile.current_index();
            let mut channel = 0;
            for cmd in commands {
                self.apply_command(st, cmd, &mut target, &mut channel, &mut effects);
            }
        }

        for effect in effects {
            match effect {
                Effect::Io(op) => self.submit(op),
                Effect::Reply(channel, text) => {
                    self.notify.lock().write(channel, &Notification::Reply(text))
                }
                Effect::Broadcast(record) => self.broadcast(&record),
                Effect::NotifyOn(n) => {
                    if let Err(e) = self.notify.lock().open(n) {
                        warn!("{}: cannot open notify{}: {}", self.name(), n, e);
                    }
                }
                Effect::NotifyOff(n) => self.notify.lock().close(n),
            }
        }
    }

    fn apply_command(
        &self,
        st: &mut DeviceState,
        cmd: Command,
        target: &mut usize,
        channel: &mut usize,
        effects: &mut Vec<Effect>,
    ) {
        let now = Instant::now();
        match cmd {
            Command::Mode(index) => {
                if index < MODE_COUNT {
                    *target = index;
                }
            }
            Command::Switch => {
                if st.profile.current_index() != *target && st.profile.switch_mode(*target) {
                    info!("{}: switched to mode {}", self.name(), *target + 1);
                    effects.push(Effect::Broadcast(Notification::Switch { mode: *target + 1 }));
                }
            }
            Command::Channel(n) => {
                if n < OUTFIFO_MAX {
                    *channel = n;
                }
            }
            Command::Rgb { leds, color } => {
                if let Some(mode) = st.profile.mode_mut(*target) {
                    for led in leds {
                        mode.light.set(led, color);
                    }
                }
            }
            Command::Bind { keys, action } => {
                for key in keys {
                    st.keys.forget_key(key);
                    if let Some(mode) = st.profile.mode_mut(*target) {
                        mode.bind.bind(key, action.clone());
                    }
                }
            }
            Command::Unbind(keys) => {
                for key in keys {
                    st.keys.forget_key(key);
                    if let Some(mode) = st.profile.mode_mut(*target) {
                        mode.bind.bind(key, ckb_common::KeyAction::Unbound);
                    }
                }
            }
            Command::Rebind(keys) => {
                for key in keys {
                    st.keys.forget_key(key);
                    if let Some(mode) = st.profile.mode_mut(*target) {
                        mode.bind.rebind(key);
                    }
                }
            }
            Command::Macro(m) => {
                if let Some(mode) = st.profile.mode_mut(*target) {
                    if !mode.bind.add_macro(m) {
                        warn!("{}: macro table of mode {} is full", self.name(), *target + 1);
                    }
                }
            }
            Command::MacroClear => {
                if let Some(mode) = st.profile.mode_mut(*target) {
                    mode.bind.macros.clear();
                }
            }
            Command::Notify { keys, on } => {
                if let Some(mode) = st.profile.mode_mut(*target) {
                    for key in keys {
                        mode.notify[*channel].assign(key, on);
                    }
                }
            }
            Command::INotify { leds, on } => {
                if let Some(mode) = st.profile.mode_mut(*target) {
                    if on {
                        mode.inotify[*channel] |= leds;
                    } else {
                        mode.inotify[*channel] &= !leds;
                    }
                }
            }
            Command::Ion(leds) | Command::Ioff(leds) | Command::Iauto(leds) => {
                if let Some(mode) = st.profile.mode_mut(*target) {
                    mode.ion &= !leds;
                    mode.ioff &= !leds;
                    match cmd {
                        Command::Ion(_) => mode.ion |= leds,
                        Command::Ioff(_) => mode.ioff |= leds,
                        _ => {}
                    }
                }
                st.leds_stale = true;
            }
            Command::Dpi { stage, value } => {
                if let Some(mode) = st.profile.mode_mut(*target) {
                    if stage < DPI_COUNT {
                        match value {
                            Some((x, y)) => {
                                mode.dpi.x[stage] = x;
                                mode.dpi.y[stage] = y;
                                mode.dpi.enabled |= 1 << stage;
                            }
                            None => mode.dpi.enabled &= !(1 << stage),
                        }
                    }
                }
            }
            Command::DpiSel(stage) => {
                if let Some(mode) = st.profile.mode_mut(*target) {
                    if (stage as usize) < DPI_COUNT {
                        mode.dpi.current = stage;
                    }
                }
            }
            Command::Lift(lift) => {
                if let Some(mode) = st.profile.mode_mut(*target) {
                    mode.dpi.lift = lift;
                }
            }
            Command::Snap(snap) => {
                if let Some(mode) = st.profile.mode_mut(*target) {
                    mode.dpi.snap = snap;
                }
            }
            Command::PollRate(ms) => {
                if self.info.features.contains(DeviceFeatures::ADJRATE) && protocol::valid_poll_rate(ms) {
                    effects.push(Effect::Io(IoOp::PollRate(ms)));
                } else {
                    debug!("{}: poll rate {} ms not supported", self.name(), ms);
                }
            }
            Command::Name(name) => {
                if let Some(mode) = st.profile.mode_mut(*target) {
                    mode.name = name;
                }
            }
            Command::ProfileName(name) => st.profile.rename(name),
            Command::Id(id) => {
                if let Some(mode) = st.profile.mode_mut(*target) {
                    mode.id = id;
                }
            }
            Command::ProfileId(id) => st.profile.set_id(id),
            Command::HwLoad => match &st.hw_profile {
                Some(hw) => {
                    st.profile.load_hardware(hw);
                    info!("{}: loaded hardware profile", self.name());
                }
                None => debug!("{}: no hardware profile to load", self.name()),
            },
            Command::Erase => {
                st.keys.shutdown();
                st.profile.erase_mode(*target);
            }
            Command::EraseProfile => {
                st.keys.shutdown();
                st.profile.erase();
            }
            Command::NotifyOn(n) => effects.push(Effect::NotifyOn(n)),
            Command::NotifyOff(n) => effects.push(Effect::NotifyOff(n)),
            Command::Fps(fps) => st.fps = fps.clamp(1, MAX_FPS),
            Command::Dither(dither) => st.dither = dither,
            Command::Brightness(level) => st.set_brightness(&self.registry, *target, level),
            Command::Inactive(level) => st.inactive = level.clamp(-1, 2),
            Command::AnimAdd(spec) => {
                if let Some(mode) = st.profile.mode_mut(*target) {
                    mode.animations.push(spec);
                }
            }
            Command::AnimClear => {
                if let Some(mode) = st.profile.mode_mut(*target) {
                    mode.animations.clear();
                }
            }
            Command::AnimRestart => st.lighting.restart(now),
            Command::AnimPreview(spec) => st.lighting.set_preview(Some(spec), now),
            Command::AnimStopPreview => st.lighting.set_preview(None, now),
            Command::Active | Command::Idle => {
                let software = matches!(cmd, Command::Active);
                if st.software != software {
                    st.software = software;
                    if software {
                        st.profile.invalidate_sent();
                        st.leds_stale = true;
                    }
                    info!("{}: {}", self.name(), if software { "active" } else { "idle" });
                    effects.push(Effect::Io(IoOp::Control(software)));
                    effects.push(Effect::Io(IoOp::Bindings));
                }
            }
            Command::Delay(ms) => st.macro_delay = ms,
            Command::FwUpdate(path) => {
                info!("{}: firmware update requested from {}", self.name(), path);
                effects.push(Effect::Reply(*channel, format!("fwupdate {} unsupported", path)));
            }
            Command::Get(fields) => {
                let reply: Vec<String> = fields.iter().map(|f| self.get_field(st, *f, *target)).collect();
                effects.push(Effect::Reply(*channel, reply.join(" ")));
            }
        }
    }

    fn get_field(&self, st: &DeviceState, field: GetField, target: usize) -> String {
        let mode = st.profile.mode(target).unwrap_or_else(|| st.profile.current_mode());
        match field {
            GetField::Mode => format!("mode {}", st.profile.current_index() + 1),
            GetField::Rgb => command::format_rgb(mode, self.info.layout),
            GetField::FwVersion => format!("fwversion {:04x}", st.firmware.version),
            GetField::PollRate => format!("pollrate {}", st.pollrate),
            GetField::Dpi => command::format_dpi(&mode.dpi),
            GetField::Lock => format!("lock {}", if st.keys.is_locked() { "on" } else { "off" }),
            GetField::Brightness => format!("brightness {}", st.brightness_of(&self.registry, target)),
            GetField::HwProfileId => match &st.hw_profile {
                Some(hw) => format!("hwprofileid {}", hw.profile.id),
                None => "hwprofileid none".to_string(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("no device at {0}")]
    NotFound(String),
    #[error("unsupported product {0:04x}")]
    Unsupported(u16),
    #[error("{0} is already attached")]
    AlreadyAttached(String),
    #[error("no free device node")]
    NoFreeNode,
    #[error("failed to open device: {0}")]
    Open(#[from] TransportError),
    #[error("failed to create device node: {0}")]
    Node(#[source] io::Error),
    #[error("failed to start device threads: {0}")]
    Thread(#[source] io::Error),
}

/// Registry of attached devices
pub struct DeviceManager {
    registry: Arc<Registry>,
    opener: Arc<dyn DeviceOpener>,
    injector: Arc<dyn Injector>,
    cache: ProfileCache,
    slots: Mutex<Vec<Option<DeviceHandle>>>,
}

impl DeviceManager {
    pub fn new(registry: Arc<Registry>, opener: Arc<dyn DeviceOpener>, injector: Arc<dyn Injector>) -> Self {
        let cache = ProfileCache::new(&registry.config.profile_cache.dir);
        Self {
            registry,
            opener,
            injector,
            cache,
            slots: Mutex::new(vec![None; DEV_MAX]),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Attached devices in node order
    pub fn list(&self) -> Vec<DeviceHandle> {
        self.slots.lock().iter().flatten().cloned().collect()
    }

    /// Attach the device at HID path `path`
    pub fn attach(&self, path: &str) -> Result<DeviceHandle, AttachError> {
        let endpoint = self
            .opener
            .enumerate(self.registry.config.device_discovery.vendor_id)?
            .into_iter()
            .find(|e| e.path == path)
            .ok_or_else(|| AttachError::NotFound(path.to_string()))?;
        self.attach_endpoint(&endpoint)
    }

    pub fn attach_endpoint(&self, endpoint: &HidEndpoint) -> Result<DeviceHandle, AttachError> {
        let product = keymap::product_info(endpoint.product)
            .filter(|_| endpoint.vendor == keymap::VENDOR_CORSAIR)
            .ok_or(AttachError::Unsupported(endpoint.product))?;

        let mut slots = self.slots.lock();
        if slots.iter().flatten().any(|d| d.info.path == endpoint.path) {
            return Err(AttachError::AlreadyAttached(endpoint.path.clone()));
        }
        let slot = slots.iter().position(Option::is_none).ok_or(AttachError::NoFreeNode)?;
        let index = slot + 1;

        let mut transport = self.opener.open(endpoint)?;

        let layout = self.registry.config.device_discovery.layout;
        let mut features = product.features;
        if product.kind == ProductKind::Keyboard {
            features = features | layout.feature();
        }
        let family = DeviceFamily::select(product.kind, features, product.zones);

        let firmware = query_firmware(transport.as_mut(), endpoint);
        let status = if firmware.version == 0 && features.contains(DeviceFeatures::FWUPDATE) {
            warn!("{} reports firmware version 0; it needs a firmware update", endpoint.serial);
            DeviceStatus::NeedsFirmwareUpdate
        } else {
            DeviceStatus::Ok
        };

        let hw_profile = if features.contains(DeviceFeatures::HWLOAD) && status == DeviceStatus::Ok {
            match read_hw_profile(transport.as_mut(), family, product.hw_modes) {
                Ok(hw) => Some(hw),
                Err(e) => {
                    warn!("Failed to read hardware profile of {}: {}", endpoint.serial, e);
                    None
                }
            }
        } else {
            None
        };
        let profile = self.seed_profile(&endpoint.serial, hw_profile.as_ref(), layout);

        let perms = self.registry.perms;
        let pollrate = firmware.poll_rate;
        let node = DeviceNode::create(
            &self.registry.node_dir(index),
            perms,
            &NodeInfo {
                model: product.model,
                serial: &endpoint.serial,
                features,
                fwversion: firmware.version,
                pollrate: features.contains(DeviceFeatures::POLLRATE).then_some(pollrate),
                status: status.as_str(),
            },
        )
        .map_err(AttachError::Node)?;
        let mut hub = NotifyHub::new(node.dir(), perms);
        if let Err(e) = hub.open(0) {
            node.remove();
            return Err(AttachError::Node(e));
        }

        let lighting = &self.registry.config.lighting;
        let state = DeviceState {
            profile,
            hw_profile,
            firmware,
            pollrate,
            fps: lighting.fps.clamp(1, MAX_FPS),
            dither: lighting.dither,
            inactive: lighting.inactive,
            macro_delay: 0,
            leds: 0,
            leds_stale: true,
            software: true,
            status,
            lighting: LightingEngine::new(),
            keys: KeyRuntime::new(),
        };
        let info = DeviceInfo {
            index,
            path: endpoint.path.clone(),
            vendor: endpoint.vendor,
            product: endpoint.product,
            serial: endpoint.serial.clone(),
            model: product.model.to_string(),
            family,
            features,
            layout,
        };

        let (device, rx) = Device::new(
            info,
            transport,
            state,
            hub,
            node,
            Arc::clone(&self.registry),
            Arc::clone(&self.injector),
        );
        device.submit(IoOp::Control(true));
        device.submit(IoOp::Bindings);

        match io_thread::spawn(&device, rx) {
            Ok(handles) => *device.threads.lock() = handles,
            Err(e) => {
                device.node.remove();
                return Err(AttachError::Thread(e));
            }
        }
        *device.listener.lock() = devnode::spawn_listener(&device);

        slots[slot] = Some(Arc::clone(&device));
        self.write_connected(&slots);
        info!(
            "Attached {} ({}, {}) as ckb{}",
            product.model,
            endpoint.serial,
            family.name(),
            index
        );
        Ok(device)
    }

    fn seed_profile(&self, serial: &str, hw: Option<&HwProfile>, layout: Layout) -> Profile {
        match self.cache.load(serial) {
            Ok(Some(profile)) => {
                info!("Restored cached profile for {}", serial);
                return profile;
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring profile cache of {}: {}", serial, e),
        }
        let mut profile = Profile::for_layout(layout);
        if let Some(hw) = hw {
            profile.load_hardware(hw);
            profile.mark_clean();
        }
        profile
    }

    /// Stop a device and release everything it owns. Safe to call more than once.
    pub fn detach(&self, device: &DeviceHandle) {
        if device.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Detaching {}", device.name());
        device.active.store(false, Ordering::SeqCst);

        let handles: Vec<JoinHandle<()>> = device.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("{}: device thread panicked", device.name());
            }
        }
        if let Some(listener) = device.listener.lock().take() {
            listener.abort();
        }
        // All device threads are stopped; nothing else touches the handle
        device.transport.lock().take();

        {
            let mut st = device.state.lock();
            st.keys.shutdown();
            if self.registry.config.profile_cache.auto_save && st.profile.is_dirty() {
                match self.cache.save(&device.info.serial, &st.profile) {
                    Ok(()) => st.profile.mark_clean(),
                    Err(e) => warn!("Failed to save profile of {}: {}", device.info.serial, e),
                }
            }
        }
        device.notify.lock().close_all();
        device.node.remove();

        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(device.info.index - 1) {
            if slot.as_ref().is_some_and(|d| Arc::ptr_eq(d, device)) {
                *slot = None;
            }
        }
        self.write_connected(&slots);
        info!("Detached {}", device.name());
    }

    /// Attach new devices and reap failed ones. Returns the number newly attached.
    pub fn rescan(&self) -> usize {
        for device in self.list() {
            if !device.is_active() {
                warn!("{} stopped responding", device.name());
                self.detach(&device);
            }
        }

        let endpoints = match self.opener.enumerate(self.registry.config.device_discovery.vendor_id) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!("Device enumeration failed: {}", e);
                return 0;
            }
        };
        let attached: Vec<String> = self.list().iter().map(|d| d.info.path.clone()).collect();
        let mut count = 0;
        for endpoint in endpoints.iter().filter(|e| !attached.contains(&e.path)) {
            if !keymap::is_supported(endpoint.vendor, endpoint.product) {
                continue;
            }
            match self.attach_endpoint(endpoint) {
                Ok(_) => count += 1,
                Err(e) => warn!("Could not attach {}: {}", endpoint.path, e),
            }
        }
        count
    }

    /// Detach every device
    pub fn shutdown(&self) {
        for device in self.list() {
            self.detach(&device);
        }
    }

    fn write_connected(&self, slots: &[Option<DeviceHandle>]) {
        let entries: Vec<ConnectedEntry> = slots
            .iter()
            .flatten()
            .map(|d| ConnectedEntry {
                path: d.node_dir().to_path_buf(),
                serial: d.info.serial.clone(),
            })
            .collect();
        if let Err(e) = self.registry.write_connected(&entries) {
            warn!("Failed to update connected file: {}", e);
        }
    }
}

fn query_firmware(transport: &mut dyn HidTransport, endpoint: &HidEndpoint) -> FirmwareInfo {
    match transport.request(&protocol::firmware_query()) {
        Ok(reply) => match protocol::parse_firmware(&reply) {
            Some(fw) => {
                debug!("{}: firmware {:04x}", endpoint.serial, fw.version);
                fw
            }
            None => {
                warn!("{}: unexpected firmware reply", endpoint.serial);
                FirmwareInfo::default()
            }
        },
        Err(e) => {
            warn!("{}: firmware query failed: {}", endpoint.serial, e);
            FirmwareInfo::default()
        }
    }
}

fn read_slot(transport: &mut dyn HidTransport, slot: u8) -> Result<HwSlot, TransportError> {
    let reply = transport.request(&protocol::hw_slot_query(slot))?;
    protocol::parse_hw_slot(&reply).ok_or(TransportError::BadReply("slot query"))
}

/// Read the factory-stored profile: ids and names, plus lighting or DPI per mode slot
fn read_hw_profile(
    transport: &mut dyn HidTransport,
    family: DeviceFamily,
    hw_modes: usize,
) -> Result<HwProfile, TransportError> {
    let mut hw = HwProfile {
        profile: read_slot(transport, 0)?,
        modes: Vec::new(),
    };
    for n in 1..=hw_modes.min(HWMODE_MAX) as u8 {
        let mut mode = HwMode {
            slot: read_slot(transport, n)?,
            light: None,
            dpi: None,
        };
        match family {
            DeviceFamily::RgbKeyboard => {
                let mut packed = Vec::with_capacity(PACKED_LIGHTING_LEN);
                for part in 1..=protocol::hw_light_parts() {
                    let reply = transport.request(&protocol::hw_light_query(n, part))?;
                    let len = protocol::hw_light_part_len(part);
                    packed.extend_from_slice(&reply[4..4 + len]);
                }
                mode.light = Some(protocol::unpack_lighting(&packed));
            }
            DeviceFamily::Mouse { .. } => {
                let mut dpi = DpiSet::default();
                for stage in 0..DPI_COUNT {
                    let reply = transport.request(&protocol::hw_dpi_query(n, stage as u8))?;
                    let (x, y) = protocol::parse_hw_dpi(&reply).ok_or(TransportError::BadReply("dpi query"))?;
                    dpi.x[stage] = x;
                    dpi.y[stage] = y;
                }
                mode.dpi = Some(dpi);
            }
            DeviceFamily::PlainKeyboard => {}
        }
        hw.modes.push(mode);
    }
    Ok(hw)
}
