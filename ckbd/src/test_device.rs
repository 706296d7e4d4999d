//! Simulated hardware for tests.
//!
//! Compiled for unit tests and, with the `dev-hooks` feature, for the end-to-end test crate.
//! A [`SimulatedHardware`] stands in for one physical keyboard or mouse: it records every
//! control message the daemon sends, answers firmware and hardware-profile queries, and
//! replays input reports pushed by the test.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::injector::{InjectResult, Injector};
use crate::keymap::{N_LIGHTS, VENDOR_CORSAIR};
use crate::profile::Rgb;
use crate::protocol::{self, FirmwareInfo, Report, MSG_SIZE, PACKED_LIGHTING_LEN};
use crate::transport::{DeviceOpener, HidEndpoint, HidTransport, TransportError};

/// One simulated device
pub struct SimulatedHardware {
    pub endpoint: HidEndpoint,
    firmware: Mutex<FirmwareInfo>,
    hw_lighting: Mutex<[u8; PACKED_LIGHTING_LEN]>,
    hw_dpi: Mutex<(u16, u16)>,
    sent: Mutex<Vec<Report>>,
    leds: Mutex<Vec<u8>>,
    input_tx: Sender<Vec<u8>>,
    input_rx: Receiver<Vec<u8>>,
    fail_writes: AtomicBool,
    unplugged: AtomicBool,
}

impl SimulatedHardware {
    pub fn new(product: u16, serial: &str) -> Arc<Self> {
        let (input_tx, input_rx) = crossbeam_channel::unbounded();
        Arc::new(Self {
            endpoint: HidEndpoint {
                path: format!("sim:{:04x}:{}", product, serial),
                vendor: VENDOR_CORSAIR,
                product,
                serial: serial.to_string(),
                name: format!("Simulated {:04x}", product),
            },
            firmware: Mutex::new(FirmwareInfo {
                version: 0x0205,
                bootloader: 0x0003,
                vendor: VENDOR_CORSAIR,
                product,
                poll_rate: 1,
            }),
            hw_lighting: Mutex::new(protocol::pack_lighting(&[Rgb::BLACK; N_LIGHTS])),
            hw_dpi: Mutex::new((800, 800)),
            sent: Mutex::new(Vec::new()),
            leds: Mutex::new(Vec::new()),
            input_tx,
            input_rx,
            fail_writes: AtomicBool::new(false),
            unplugged: AtomicBool::new(false),
        })
    }

    pub fn set_firmware_version(&self, version: u16) {
        self.firmware.lock().version = version;
    }

    /// Lighting reported for every hardware mode slot
    pub fn set_hw_lighting(&self, colors: &[Rgb]) {
        *self.hw_lighting.lock() = protocol::pack_lighting(colors);
    }

    pub fn set_hw_dpi(&self, x: u16, y: u16) {
        *self.hw_dpi.lock() = (x, y);
    }

    /// Queue one raw input report
    pub fn push_input(&self, report: &[u8]) {
        let _ = self.input_tx.send(report.to_vec());
    }

    /// Make every following control write fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Simulate the cable being pulled
    pub fn unplug(&self) {
        self.unplugged.store(true, Ordering::SeqCst);
    }

    pub fn is_unplugged(&self) -> bool {
        self.unplugged.load(Ordering::SeqCst)
    }

    /// Every control message sent so far, queries included
    pub fn sent(&self) -> Vec<Report> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Sent messages starting with `prefix`
    pub fn sent_with_prefix(&self, prefix: &[u8]) -> Vec<Report> {
        self.sent
            .lock()
            .iter()
            .filter(|r| r.starts_with(prefix))
            .copied()
            .collect()
    }

    /// Indicator LED masks written so far
    pub fn leds(&self) -> Vec<u8> {
        self.leds.lock().clone()
    }

    /// Reassemble every committed RGB keyboard frame, in order
    pub fn rgb_frames(&self) -> Vec<Vec<Rgb>> {
        let mut frames = Vec::new();
        let mut packed = [0u8; PACKED_LIGHTING_LEN];
        for report in self.sent.lock().iter() {
            match (report[0], report[1]) {
                (0x7f, part @ 1..=4) => {
                    let start = (part as usize - 1) * 60;
                    let len = (report[2] as usize).min(PACKED_LIGHTING_LEN - start);
                    packed[start..start + len].copy_from_slice(&report[4..4 + len]);
                }
                (0x07, 0x27) => frames.push(protocol::unpack_lighting(&packed).colors),
                _ => {}
            }
        }
        frames
    }

    fn reply(&self, query: &Report) -> Report {
        let mut out = [0u8; MSG_SIZE];
        out[..4].copy_from_slice(&query[..4]);
        match (query[0], query[1]) {
            (0x0e, 0x01) => {
                let fw = *self.firmware.lock();
                out[8..10].copy_from_slice(&fw.version.to_le_bytes());
                out[10..12].copy_from_slice(&fw.bootloader.to_le_bytes());
                out[12..14].copy_from_slice(&fw.vendor.to_le_bytes());
                out[14..16].copy_from_slice(&fw.product.to_le_bytes());
                out[16] = fw.poll_rate;
            }
            (0x0e, 0x15) => {
                let slot = query[3];
                out[4] = slot + 1;
                out[20..24].copy_from_slice(&(slot as u32 + 100).to_le_bytes());
                let name = if slot == 0 { "Onboard".to_string() } else { format!("Slot {}", slot) };
                for (i, unit) in name.encode_utf16().enumerate() {
                    out[24 + i * 2..26 + i * 2].copy_from_slice(&unit.to_le_bytes());
                }
            }
            (0x0e, 0x14) => {
                let part = query[3].max(1);
                let len = protocol::hw_light_part_len(part);
                let start = (part as usize - 1) * 60;
                out[4..4 + len].copy_from_slice(&self.hw_lighting.lock()[start..start + len]);
            }
            (0x0e, 0x13) => {
                let (x, y) = *self.hw_dpi.lock();
                out[4..6].copy_from_slice(&x.to_le_bytes());
                out[6..8].copy_from_slice(&y.to_le_bytes());
            }
            _ => {}
        }
        out
    }
}

/// Transport bound to one [`SimulatedHardware`]
pub struct SimulatedTransport {
    hw: Arc<SimulatedHardware>,
}

impl SimulatedTransport {
    pub fn new(hw: Arc<SimulatedHardware>) -> Self {
        Self { hw }
    }

    fn check_write(&self) -> Result<(), TransportError> {
        if self.hw.is_unplugged() || self.hw.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

impl HidTransport for SimulatedTransport {
    fn send(&mut self, report: &Report) -> Result<(), TransportError> {
        self.check_write()?;
        self.hw.sent.lock().push(*report);
        Ok(())
    }

    fn request(&mut self, report: &Report) -> Result<Report, TransportError> {
        self.send(report)?;
        Ok(self.hw.reply(report))
    }

    fn set_leds(&mut self, leds: u8) -> Result<(), TransportError> {
        self.check_write()?;
        self.hw.leds.lock().push(leds);
        Ok(())
    }

    fn read_input(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, TransportError> {
        if self.hw.is_unplugged() {
            return Err(TransportError::Disconnected);
        }
        match self.hw.input_rx.recv_timeout(Duration::from_millis(timeout_ms.max(0) as u64)) {
            Ok(report) => {
                let len = report.len().min(buf.len());
                buf[..len].copy_from_slice(&report[..len]);
                Ok(len)
            }
            Err(RecvTimeoutError::Timeout) => Ok(0),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }
}

/// Opener listing a fixed set of simulated devices
#[derive(Default)]
pub struct SimulatedOpener {
    devices: Mutex<Vec<Arc<SimulatedHardware>>>,
    busy: Mutex<Vec<String>>,
}

impl SimulatedOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn plug(&self, hw: Arc<SimulatedHardware>) {
        self.devices.lock().push(hw);
    }

    /// Remove a device; its open transports start failing
    pub fn unplug(&self, path: &str) {
        let mut devices = self.devices.lock();
        if let Some(pos) = devices.iter().position(|d| d.endpoint.path == path) {
            devices.remove(pos).unplug();
        }
    }

    /// Make opening `path` fail as if another process held it
    pub fn set_busy(&self, path: &str, busy: bool) {
        let mut list = self.busy.lock();
        list.retain(|p| p != path);
        if busy {
            list.push(path.to_string());
        }
    }
}

impl DeviceOpener for SimulatedOpener {
    fn enumerate(&self, vendor: u16) -> Result<Vec<HidEndpoint>, TransportError> {
        Ok(self
            .devices
            .lock()
            .iter()
            .filter(|d| d.endpoint.vendor == vendor)
            .map(|d| d.endpoint.clone())
            .collect())
    }

    fn open(&self, endpoint: &HidEndpoint) -> Result<Box<dyn HidTransport>, TransportError> {
        if self.busy.lock().contains(&endpoint.path) {
            return Err(TransportError::Io(std::io::Error::from_raw_os_error(libc::EBUSY)));
        }
        let hw = self
            .devices
            .lock()
            .iter()
            .find(|d| d.endpoint.path == endpoint.path)
            .cloned()
            .ok_or(TransportError::Disconnected)?;
        Ok(Box::new(SimulatedTransport::new(hw)))
    }
}

/// One event passed to a [`RecordingInjector`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedEvent {
    Key { keycode: u16, down: bool },
    Move { dx: i32, dy: i32 },
    Scroll(i32),
}

/// Injector that records events and reports settable host LEDs
#[derive(Default)]
pub struct RecordingInjector {
    events: Mutex<Vec<InjectedEvent>>,
    leds: Mutex<u8>,
}

impl RecordingInjector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<InjectedEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn set_leds(&self, leds: u8) {
        *self.leds.lock() = leds;
    }
}

impl Injector for RecordingInjector {
    fn key_event(&self, keycode: u16, down: bool) -> InjectResult {
        self.events.lock().push(InjectedEvent::Key { keycode, down });
        Ok(())
    }

    fn mouse_move(&self, dx: i32, dy: i32) -> InjectResult {
        self.events.lock().push(InjectedEvent::Move { dx, dy });
        Ok(())
    }

    fn mouse_scroll(&self, amount: i32) -> InjectResult {
        self.events.lock().push(InjectedEvent::Scroll(amount));
        Ok(())
    }

    fn read_leds(&self) -> u8 {
        *self.leds.lock()
    }
}

/// Raw RGB keyboard input report with the given input bits down
pub fn rgb_keyboard_report(down: &[usize]) -> Vec<u8> {
    let mut report = vec![0u8; 1 + crate::keymap::N_KEYS_KB / 8];
    report[0] = 0x03;
    for &i in down {
        if i < crate::keymap::N_KEYS_KB {
            report[1 + i / 8] |= 1 << (i % 8);
        }
    }
    report
}

/// Raw mouse input report
pub fn mouse_report(buttons: u32, dx: i16, dy: i16, wheel: i8) -> Vec<u8> {
    let mut report = vec![0x01, buttons as u8, (buttons >> 8) as u8, (buttons >> 16) as u8];
    report.extend_from_slice(&dx.to_le_bytes());
    report.extend_from_slice(&dy.to_le_bytes());
    report.push(wheel as u8);
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_queries() {
        let hw = SimulatedHardware::new(0x1b13, "SIM1");
        let mut transport = SimulatedTransport::new(hw.clone());
        let reply = transport.request(&protocol::firmware_query()).unwrap();
        let fw = protocol::parse_firmware(&reply).unwrap();
        assert_eq!(fw.version, 0x0205);
        assert_eq!(fw.product, 0x1b13);

        let slot = protocol::parse_hw_slot(&transport.request(&protocol::hw_slot_query(2)).unwrap()).unwrap();
        assert_eq!(slot.name, "Slot 2");
        assert_eq!(hw.sent().len(), 2);
    }

    #[test]
    fn test_simulated_failures() {
        let hw = SimulatedHardware::new(0x1b13, "SIM2");
        let mut transport = SimulatedTransport::new(hw.clone());
        hw.fail_writes(true);
        assert!(transport.send(&protocol::firmware_query()).is_err());
        hw.fail_writes(false);
        assert!(transport.send(&protocol::firmware_query()).is_ok());

        let mut buf = [0u8; 64];
        assert_eq!(transport.read_input(&mut buf, 1).unwrap(), 0);
        hw.push_input(&[0x03, 0x01]);
        assert_eq!(transport.read_input(&mut buf, 1).unwrap(), 2);
        hw.unplug();
        assert!(transport.read_input(&mut buf, 1).is_err());
    }

    #[test]
    fn test_rgb_frame_reassembly() {
        let hw = SimulatedHardware::new(0x1b13, "SIM3");
        let mut transport = SimulatedTransport::new(hw.clone());
        let frame = vec![Rgb::new(255, 0, 0); N_LIGHTS];
        for report in protocol::DeviceFamily::RgbKeyboard.lighting_frame(&frame) {
            transport.send(&report).unwrap();
        }
        let frames = hw.rgb_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], Rgb::new(255, 0, 0));
    }
}
