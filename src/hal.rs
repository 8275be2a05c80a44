use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::wire::REPORT_SIZE;

/// Bidirectional 64-byte report stream exposed by the USB-HID gadget stack.
///
/// Reads block until a full report arrives. `reopen` is the recovery hook for
/// a torn-down endpoint (host reboot, gadget re-bind); callers retry with
/// back-off.
pub trait HidEndpoint: Send + Sync {
    fn read_report(&self) -> Result<[u8; REPORT_SIZE]>;
    fn write_report(&self, report: &[u8; REPORT_SIZE]) -> Result<()>;
    fn reopen(&self) -> Result<()>;
}

/// Sampled user-presence button. Active state means "pressed".
pub trait PresenceButton: Send + Sync {
    fn is_pressed(&self) -> bool;
}

/// Activity LED.
pub trait StatusLed: Send + Sync {
    fn set(&self, on: bool);

    /// Short visible blink, used for WINK.
    fn pulse(&self) {
        self.set(true);
        std::thread::sleep(Duration::from_millis(100));
        self.set(false);
    }
}

/// HID gadget character device (`/dev/hidg0` by default).
pub struct GadgetEndpoint {
    path: PathBuf,
    file: RwLock<File>,
}

impl GadgetEndpoint {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open HID gadget device {}", path.display()))?;
        log::info!("opened HID gadget device {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
        })
    }

    /// Open the gadget device, retrying once per second until it exists and
    /// is accessible. The gadget configfs setup races with daemon startup on
    /// boot, so this loops the same way the deployment has always done.
    pub fn open_blocking(path: &Path) -> Self {
        loop {
            match Self::open(path) {
                Ok(endpoint) => return endpoint,
                Err(e) => {
                    log::warn!("waiting for HID gadget device: {:#}", e);
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
    }
}

impl HidEndpoint for GadgetEndpoint {
    fn read_report(&self) -> Result<[u8; REPORT_SIZE]> {
        let mut report = [0u8; REPORT_SIZE];
        let guard = self.file.read().unwrap();
        (&*guard)
            .read_exact(&mut report)
            .context("failed to read HID report")?;
        log::trace!("read HID report: {:02X?}", report);
        Ok(report)
    }

    fn write_report(&self, report: &[u8; REPORT_SIZE]) -> Result<()> {
        let guard = self.file.read().unwrap();
        (&*guard)
            .write_all(report)
            .context("failed to write HID report")?;
        (&*guard).flush().context("failed to flush HID report")?;
        log::trace!("wrote HID report: {:02X?}", report);
        Ok(())
    }

    fn reopen(&self) -> Result<()> {
        // Keep trying until the gadget comes back; the daemon's state is
        // worth more than a fast failure here.
        loop {
            match OpenOptions::new().read(true).write(true).open(&self.path) {
                Ok(file) => {
                    *self.file.write().unwrap() = file;
                    log::info!("reopened HID gadget device {}", self.path.display());
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("waiting to reopen {}: {}", self.path.display(), e);
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
    }
}

/// One exported sysfs GPIO line.
struct SysfsGpio {
    value_path: PathBuf,
}

impl SysfsGpio {
    fn export(pin: u32, direction: &str) -> Result<Self> {
        let base = PathBuf::from("/sys/class/gpio");
        let pin_dir = base.join(format!("gpio{}", pin));
        if !pin_dir.exists() {
            std::fs::write(base.join("export"), pin.to_string())
                .with_context(|| format!("failed to export GPIO {}", pin))?;
        }
        std::fs::write(pin_dir.join("direction"), direction)
            .with_context(|| format!("failed to set GPIO {} direction", pin))?;
        Ok(Self {
            value_path: pin_dir.join("value"),
        })
    }

    fn read(&self) -> Result<bool> {
        let mut raw = String::new();
        File::open(&self.value_path)
            .and_then(|mut f| f.read_to_string(&mut raw))
            .with_context(|| format!("failed to read {}", self.value_path.display()))?;
        Ok(raw.trim() == "1")
    }

    fn write(&self, high: bool) -> Result<()> {
        std::fs::write(&self.value_path, if high { "1" } else { "0" })
            .with_context(|| format!("failed to write {}", self.value_path.display()))
    }
}

/// Active-low push button on a sysfs GPIO input line (pull-up assumed wired
/// or configured by the device tree).
pub struct SysfsButton {
    line: SysfsGpio,
}

impl SysfsButton {
    pub fn new(pin: u32) -> Result<Self> {
        Ok(Self {
            line: SysfsGpio::export(pin, "in")?,
        })
    }
}

impl PresenceButton for SysfsButton {
    fn is_pressed(&self) -> bool {
        match self.line.read() {
            Ok(high) => !high,
            Err(e) => {
                log::error!("button read failed, treating as released: {:#}", e);
                false
            }
        }
    }
}

/// Activity LED on a sysfs GPIO output line.
pub struct SysfsLed {
    line: SysfsGpio,
}

impl SysfsLed {
    pub fn new(pin: u32) -> Result<Self> {
        Ok(Self {
            line: SysfsGpio::export(pin, "out")?,
        })
    }
}

impl StatusLed for SysfsLed {
    fn set(&self, on: bool) {
        if let Err(e) = self.line.write(on) {
            log::error!("LED write failed: {:#}", e);
        }
    }
}

/// LED that goes nowhere, for headless setups and tests.
pub struct NullLed;

impl StatusLed for NullLed {
    fn set(&self, _on: bool) {}

    fn pulse(&self) {}
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::{Arc, Mutex};

    /// In-memory endpoint: the test feeds reports through `host_tx` and
    /// observes responses on `host_rx`.
    pub struct MockEndpoint {
        rx: Mutex<Receiver<[u8; REPORT_SIZE]>>,
        tx: Mutex<Sender<[u8; REPORT_SIZE]>>,
    }

    impl MockEndpoint {
        pub fn pair() -> (
            Self,
            Sender<[u8; REPORT_SIZE]>,
            Receiver<[u8; REPORT_SIZE]>,
        ) {
            let (host_tx, device_rx) = mpsc::channel();
            let (device_tx, host_rx) = mpsc::channel();
            (
                Self {
                    rx: Mutex::new(device_rx),
                    tx: Mutex::new(device_tx),
                },
                host_tx,
                host_rx,
            )
        }
    }

    impl HidEndpoint for MockEndpoint {
        fn read_report(&self) -> Result<[u8; REPORT_SIZE]> {
            self.rx
                .lock()
                .unwrap()
                .recv()
                .map_err(|_| anyhow::anyhow!("mock endpoint closed"))
        }

        fn write_report(&self, report: &[u8; REPORT_SIZE]) -> Result<()> {
            self.tx
                .lock()
                .unwrap()
                .send(*report)
                .map_err(|_| anyhow::anyhow!("mock endpoint closed"))
        }

        fn reopen(&self) -> Result<()> {
            Err(anyhow::anyhow!("mock endpoint cannot be reopened"))
        }
    }

    pub struct MockButton {
        pub pressed: Arc<AtomicBool>,
    }

    impl MockButton {
        pub fn released() -> (Self, Arc<AtomicBool>) {
            let pressed = Arc::new(AtomicBool::new(false));
            (
                Self {
                    pressed: pressed.clone(),
                },
                pressed,
            )
        }

        pub fn held() -> Self {
            Self {
                pressed: Arc::new(AtomicBool::new(true)),
            }
        }
    }

    impl PresenceButton for MockButton {
        fn is_pressed(&self) -> bool {
            self.pressed.load(Ordering::SeqCst)
        }
    }
}
