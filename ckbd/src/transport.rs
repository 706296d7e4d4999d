//! Hardware handle abstraction
//!
//! The real implementation goes through hidapi; tests swap in the simulated hardware from
//! [`crate::test_device`]. A transport is owned by exactly one device and is only ever used
//! behind that device's handle lock.

use hidapi::{HidApi, HidDevice};
use parking_lot::Mutex;
use std::ffi::CString;
use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::{Report, MSG_SIZE};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HID error: {0}")]
    Hid(#[from] hidapi::HidError),
    #[error("device disconnected")]
    Disconnected,
    #[error("short reply ({0} bytes)")]
    ShortReply(usize),
    #[error("unexpected reply to {0}")]
    BadReply(&'static str),
    #[error("invalid device path: {0}")]
    InvalidPath(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exclusive handle to one device's control and input endpoints
pub trait HidTransport: Send {
    /// Send one control message
    fn send(&mut self, report: &Report) -> Result<(), TransportError>;

    /// Send one control message and read back the device's reply
    fn request(&mut self, report: &Report) -> Result<Report, TransportError>;

    /// Set the keyboard indicator LEDs (output report)
    fn set_leds(&mut self, leds: u8) -> Result<(), TransportError>;

    /// Wait up to `timeout_ms` for an input report. Returns 0 on timeout.
    fn read_input(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, TransportError>;
}

/// One enumerated device endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidEndpoint {
    pub path: String,
    pub vendor: u16,
    pub product: u16,
    pub serial: String,
    pub name: String,
}

/// Source of endpoints and transports, shared by the device manager
pub trait DeviceOpener: Send + Sync {
    fn enumerate(&self, vendor: u16) -> Result<Vec<HidEndpoint>, TransportError>;
    fn open(&self, endpoint: &HidEndpoint) -> Result<Box<dyn HidTransport>, TransportError>;
}

/// hidapi-backed opener
pub struct HidapiOpener {
    api: Mutex<HidApi>,
}

impl HidapiOpener {
    pub fn new() -> Result<Self, TransportError> {
        Ok(Self {
            api: Mutex::new(HidApi::new()?),
        })
    }
}

impl DeviceOpener for HidapiOpener {
    fn enumerate(&self, vendor: u16) -> Result<Vec<HidEndpoint>, TransportError> {
        let mut api = self.api.lock();
        api.refresh_devices()?;

        let mut endpoints: Vec<(HidEndpoint, bool)> = Vec::new();
        for info in api.device_list().filter(|d| d.vendor_id() == vendor) {
            let serial = info.serial_number().unwrap_or_default().to_string();
            // Control traffic lives on the vendor-defined usage page
            let vendor_page = info.usage_page() >= 0xff00;
            let endpoint = HidEndpoint {
                path: info.path().to_string_lossy().to_string(),
                vendor: info.vendor_id(),
                product: info.product_id(),
                serial: serial.clone(),
                name: info.product_string().unwrap_or_default().to_string(),
            };
            debug!(
                "HID interface {} of {:04x}:{:04x} at {} (usage page {:#06x})",
                info.interface_number(),
                endpoint.vendor,
                endpoint.product,
                endpoint.path,
                info.usage_page()
            );

            // One endpoint per physical device
            match endpoints
                .iter_mut()
                .find(|(e, _)| e.product == endpoint.product && e.serial == serial)
            {
                Some(existing) if vendor_page && !existing.1 => *existing = (endpoint, vendor_page),
                Some(_) => {}
                None => endpoints.push((endpoint, vendor_page)),
            }
        }
        Ok(endpoints.into_iter().map(|(e, _)| e).collect())
    }

    fn open(&self, endpoint: &HidEndpoint) -> Result<Box<dyn HidTransport>, TransportError> {
        let path = CString::new(endpoint.path.clone())
            .map_err(|_| TransportError::InvalidPath(endpoint.path.clone()))?;
        let device = self.api.lock().open_path(&path)?;
        Ok(Box::new(HidapiTransport { device }))
    }
}

/// Open hidapi handle. Control messages travel as feature reports with report ID 0.
pub struct HidapiTransport {
    device: HidDevice,
}

impl HidTransport for HidapiTransport {
    fn send(&mut self, report: &Report) -> Result<(), TransportError> {
        let mut with_report_id = [0u8; MSG_SIZE + 1];
        with_report_id[1..].copy_from_slice(report);
        self.device.send_feature_report(&with_report_id)?;
        Ok(())
    }

    fn request(&mut self, report: &Report) -> Result<Report, TransportError> {
        self.send(report)?;

        let mut response = [0u8; MSG_SIZE + 1];
        let len = self.device.get_feature_report(&mut response)?;
        if len < MSG_SIZE {
            warn!("Short reply to {:02x} {:02x}: {} bytes", report[0], report[1], len);
            return Err(TransportError::ShortReply(len));
        }

        let mut reply = [0u8; MSG_SIZE];
        reply.copy_from_slice(&response[1..]);
        Ok(reply)
    }

    fn set_leds(&mut self, leds: u8) -> Result<(), TransportError> {
        self.device.write(&[0x00, leds])?;
        Ok(())
    }

    fn read_input(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, TransportError> {
        Ok(self.device.read_timeout(buf, timeout_ms)?)
    }
}
