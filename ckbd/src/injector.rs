use ckb_common::{indicator, tracing};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{IntoRawFd, RawFd};
use tracing::{debug, info, warn};

pub type InjectResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

// Linux input event constants
const EV_SYN: u16 = 0x00;
const EV_KEY: u16 = 0x01;
const EV_REL: u16 = 0x02;
const EV_LED: u16 = 0x11;
const SYN_REPORT: u16 = 0x00;
const REL_X: u16 = 0x00;
const REL_Y: u16 = 0x01;
const REL_WHEEL: u16 = 0x08;
const LED_NUML: u16 = 0x00;
const LED_CAPSL: u16 = 0x01;
const LED_SCROLLL: u16 = 0x02;

// uinput ioctl constants
const UI_SET_EVBIT: u64 = 0x40045564; // _IOW('U', 100, int)
const UI_SET_KEYBIT: u64 = 0x40045565; // _IOW('U', 101, int)
const UI_SET_RELBIT: u64 = 0x40045566; // _IOW('U', 102, int)
const UI_SET_LEDBIT: u64 = 0x40045569; // _IOW('U', 105, int)
const UI_DEV_CREATE: u64 = 0x5501; // _IO('U', 1)
const UI_DEV_DESTROY: u64 = 0x5502; // _IO('U', 2)

/// Linux input_event structure
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct InputEvent {
    time: libc::timeval,
    type_: u16,
    code: u16,
    value: i32,
}

/// uinput_user_dev structure for device setup
#[repr(C)]
struct UinputUserDev {
    name: [u8; 80],
    id: InputId,
    ff_effects_max: u32,
    absmax: [i32; 64],
    absmin: [i32; 64],
    absfuzz: [i32; 64],
    absflat: [i32; 64],
}

#[repr(C)]
struct InputId {
    bustype: u16,
    vendor: u16,
    product: u16,
    version: u16,
}

/// Sink for synthesized input and source of host indicator state.
///
/// Called from device input threads, never from async code.
pub trait Injector: Send + Sync {
    fn key_event(&self, keycode: u16, down: bool) -> InjectResult;
    fn mouse_move(&self, dx: i32, dy: i32) -> InjectResult;
    fn mouse_scroll(&self, amount: i32) -> InjectResult;
    /// Current host indicator LEDs as an [`indicator`] mask
    fn read_leds(&self) -> u8;
}

/// Virtual keyboard + mouse created through /dev/uinput
pub struct UinputInjector {
    fd: RawFd,
    leds: Mutex<u8>,
}

impl UinputInjector {
    /// Create the virtual device
    pub fn new(name: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        info!("Initializing uinput virtual device");

        // Nonblocking so LED feedback can be drained from the input thread
        let uinput_file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/uinput")
            .map_err(|e| format!("Failed to open /dev/uinput: {}", e))?;
        let fd = uinput_file.into_raw_fd();

        let injector = Self { fd, leds: Mutex::new(0) };

        unsafe {
            for ev in [EV_KEY, EV_REL, EV_SYN, EV_LED] {
                if libc::ioctl(fd, UI_SET_EVBIT, ev as libc::c_int) < 0 {
                    return Err(format!("Failed to set event bit {}", ev).into());
                }
            }

            // Keyboard keys plus mouse buttons
            for key in (0..256u16).chain(0x110..0x118) {
                if libc::ioctl(fd, UI_SET_KEYBIT, key as libc::c_int) < 0 {
                    warn!("Failed to set keybit for key {}", key);
                }
            }

            for rel in [REL_X, REL_Y, REL_WHEEL] {
                if libc::ioctl(fd, UI_SET_RELBIT, rel as libc::c_int) < 0 {
                    warn!("Failed to set relbit {}", rel);
                }
            }

            for led in [LED_NUML, LED_CAPSL, LED_SCROLLL] {
                if libc::ioctl(fd, UI_SET_LEDBIT, led as libc::c_int) < 0 {
                    warn!("Failed to set ledbit {}", led);
                }
            }
        }

        let mut dev: UinputUserDev = unsafe { mem::zeroed() };
        let bytes = name.as_bytes();
        let len = bytes.len().min(dev.name.len() - 1);
        dev.name[..len].copy_from_slice(&bytes[..len]);
        dev.id.bustype = 0x03; // BUS_USB
        dev.id.vendor = crate::keymap::VENDOR_CORSAIR;
        dev.id.product = 0xffff; // Virtual device
        dev.id.version = 1;

        unsafe {
            let dev_ptr = &dev as *const UinputUserDev as *const libc::c_void;
            if libc::write(fd, dev_ptr, mem::size_of::<UinputUserDev>()) < 0 {
                return Err("Failed to write uinput device structure".into());
            }
            if libc::ioctl(fd, UI_DEV_CREATE) < 0 {
                return Err("Failed to create uinput device".into());
            }
        }

        info!("Created uinput virtual device: {}", name);
        Ok(injector)
    }

    fn write_event(&self, type_: u16, code: u16, value: i32) -> InjectResult {
        let mut event: InputEvent = unsafe { mem::zeroed() };
        unsafe {
            libc::gettimeofday(&mut event.time, std::ptr::null_mut());
        }
        event.type_ = type_;
        event.code = code;
        event.value = value;

        let written = unsafe {
            libc::write(
                self.fd,
                &event as *const InputEvent as *const libc::c_void,
                mem::size_of::<InputEvent>(),
            )
        };
        if written < 0 {
            return Err(format!("Failed to write event: {}", std::io::Error::last_os_error()).into());
        }
        Ok(())
    }

    fn sync(&self) -> InjectResult {
        self.write_event(EV_SYN, SYN_REPORT, 0)
    }
}

impl Injector for UinputInjector {
    fn key_event(&self, keycode: u16, down: bool) -> InjectResult {
        debug!("Key {}: {}", if down { "press" } else { "release" }, keycode);
        self.write_event(EV_KEY, keycode, down as i32)?;
        self.sync()
    }

    fn mouse_move(&self, dx: i32, dy: i32) -> InjectResult {
        if dx != 0 {
            self.write_event(EV_REL, REL_X, dx)?;
        }
        if dy != 0 {
            self.write_event(EV_REL, REL_Y, dy)?;
        }
        self.sync()
    }

    fn mouse_scroll(&self, amount: i32) -> InjectResult {
        self.write_event(EV_REL, REL_WHEEL, amount)?;
        self.sync()
    }

    fn read_leds(&self) -> u8 {
        let mut leds = self.leds.lock();
        loop {
            let mut event: InputEvent = unsafe { mem::zeroed() };
            let n = unsafe {
                libc::read(
                    self.fd,
                    &mut event as *mut InputEvent as *mut libc::c_void,
                    mem::size_of::<InputEvent>(),
                )
            };
            if n != mem::size_of::<InputEvent>() as isize {
                break;
            }
            if event.type_ != EV_LED {
                continue;
            }
            let bit = match event.code {
                LED_NUML => indicator::NUM,
                LED_CAPSL => indicator::CAPS,
                LED_SCROLLL => indicator::SCROLL,
                _ => continue,
            };
            if event.value != 0 {
                *leds |= bit;
            } else {
                *leds &= !bit;
            }
        }
        *leds
    }
}

impl Drop for UinputInjector {
    fn drop(&mut self) {
        info!("Destroying uinput virtual device");
        unsafe {
            libc::ioctl(self.fd, UI_DEV_DESTROY);
            libc::close(self.fd);
        }
    }
}

/// Injector used when /dev/uinput is unavailable; input is dropped
#[derive(Debug, Default)]
pub struct NullInjector;

impl Injector for NullInjector {
    fn key_event(&self, _keycode: u16, _down: bool) -> InjectResult {
        Ok(())
    }

    fn mouse_move(&self, _dx: i32, _dy: i32) -> InjectResult {
        Ok(())
    }

    fn mouse_scroll(&self, _amount: i32) -> InjectResult {
        Ok(())
    }

    fn read_leds(&self) -> u8 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_layout() {
        // struct input_event on 64-bit Linux
        assert_eq!(mem::size_of::<InputEvent>(), mem::size_of::<libc::timeval>() + 8);
        assert_eq!(mem::size_of::<UinputUserDev>(), 80 + 8 + 4 + 4 * 64 * 4);
    }

    #[test]
    fn test_null_injector() {
        let injector = NullInjector;
        assert!(injector.key_event(30, true).is_ok());
        assert!(injector.mouse_move(1, 1).is_ok());
        assert_eq!(injector.read_leds(), 0);
    }

    // Actual injection needs /dev/uinput access and is left to manual runs
}
