//! Hook switch pin via the Linux sysfs GPIO interface
//!
//! The switch pulls the pin low while the handset is lifted; a high level
//! means the phone is on hook.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::listener::HookError;

/// udev may take a moment to hand over a freshly exported pin
const DIRECTION_ATTEMPTS: u32 = 5;
const DIRECTION_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct GpioPin {
    number: u32,
    dir: PathBuf,
    root: PathBuf,
    exported: bool,
}

impl GpioPin {
    /// Export `number` if needed and configure it as an input
    pub fn acquire(root: &Path, number: u32) -> Result<Self, HookError> {
        let dir = root.join(format!("gpio{number}"));
        let mut exported = false;

        if !dir.exists() {
            fs::write(root.join("export"), number.to_string())
                .map_err(|source| HookError::Export { pin: number, source })?;
            exported = true;
            debug!(pin = number, "gpio exported");
        }

        let pin = Self {
            number,
            dir,
            root: root.to_owned(),
            exported,
        };

        let mut attempt = 1;
        loop {
            match fs::write(pin.dir.join("direction"), "in") {
                Ok(()) => break,
                Err(e) if attempt < DIRECTION_ATTEMPTS => {
                    debug!(pin = number, attempt, error = %e, "gpio direction not writable yet");
                    attempt += 1;
                    thread::sleep(DIRECTION_RETRY);
                }
                Err(source) => {
                    pin.release();
                    return Err(HookError::Direction { pin: number, source });
                }
            }
        }

        if let Err(e) = pin.read() {
            pin.release();
            return Err(e);
        }
        Ok(pin)
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    /// Read the level; `true` means high (on hook)
    pub fn read(&self) -> Result<bool, HookError> {
        let raw = fs::read_to_string(self.dir.join("value")).map_err(|source| HookError::Read {
            pin: self.number,
            source,
        })?;
        match raw.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(HookError::BadLevel(other.to_string())),
        }
    }

    /// Unexport the pin if this process exported it
    pub fn release(&self) {
        if !self.exported {
            return;
        }
        match fs::write(self.root.join("unexport"), self.number.to_string()) {
            Ok(()) => debug!(pin = self.number, "gpio unexported"),
            Err(e) => warn!(pin = self.number, error = %e, "failed to unexport gpio"),
        }
    }
}
