//! Hook switch listener
//!
//! Polls the hook pin on a dedicated thread, debounces it and forwards
//! level changes to the state machine.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::gpio::GpioPin;
use super::line::{Debouncer, HookEvent, HookLine};
use crate::config::{HookConfig, Timings};

/// Polls the hook pin and reports debounced level changes
pub struct HookListener {
    pin: Arc<GpioPin>,
    line: HookLine,
    event_tx: mpsc::Sender<HookEvent>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
    debounce: Duration,
}

impl HookListener {
    /// Acquire the hook pin and read its initial level
    pub fn open(
        config: &HookConfig,
        timings: &Timings,
        event_tx: mpsc::Sender<HookEvent>,
    ) -> Result<Self, HookError> {
        let pin = GpioPin::acquire(&config.gpio_root, config.pin)?;
        let on_hook = pin.read()?;
        info!(pin = config.pin, on_hook, "hook pin acquired");

        Ok(Self {
            pin: Arc::new(pin),
            line: HookLine::new(on_hook),
            event_tx,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            poll_interval: timings.poll_interval,
            debounce: timings.debounce,
        })
    }

    /// [`HookListener::open`] on the blocking pool
    ///
    /// Acquiring a freshly exported pin sleeps between direction retries.
    pub async fn open_blocking(
        config: HookConfig,
        timings: Timings,
        event_tx: mpsc::Sender<HookEvent>,
    ) -> Result<Self, HookError> {
        tokio::task::spawn_blocking(move || Self::open(&config, &timings, event_tx))
            .await
            .map_err(|e| HookError::Setup(e.to_string()))?
    }

    /// Shared view of the debounced level
    pub fn line(&self) -> HookLine {
        self.line.clone()
    }

    /// Start polling on a dedicated thread
    pub fn start(&self) -> Result<(), HookError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(HookError::AlreadyRunning);
        }

        let poller = Poller {
            pin: Arc::clone(&self.pin),
            line: self.line.clone(),
            event_tx: self.event_tx.clone(),
            running: Arc::clone(&self.running),
            poll_interval: self.poll_interval,
            debounce: self.debounce,
        };

        let handle = thread::Builder::new()
            .name("hook-listener".to_string())
            .spawn(move || {
                info!("hook listener thread started");
                poller.run();
                poller.running.store(false, Ordering::SeqCst);
                info!("hook listener thread stopped");
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                HookError::ThreadSpawn(e.to_string())
            })?;

        if let Ok(mut slot) = self.thread.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Stop polling and release the pin
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.thread.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("hook listener thread panicked");
            }
        }
        self.pin.release();
    }

    /// Check if the listener is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Errors that can occur while acquiring or reading the hook pin
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook listener is already running")]
    AlreadyRunning,

    #[error("failed to export gpio {pin}: {source}")]
    Export {
        pin: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to configure gpio {pin} as input: {source}")]
    Direction {
        pin: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to read gpio {pin}: {source}")]
    Read {
        pin: u32,
        #[source]
        source: io::Error,
    },

    #[error("unexpected gpio level {0:?}")]
    BadLevel(String),

    #[error("failed to spawn listener thread: {0}")]
    ThreadSpawn(String),

    #[error("hook pin setup task failed: {0}")]
    Setup(String),
}

struct Poller {
    pin: Arc<GpioPin>,
    line: HookLine,
    event_tx: mpsc::Sender<HookEvent>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    debounce: Duration,
}

impl Poller {
    fn run(&self) {
        let mut debouncer = Debouncer::new(self.line.is_on_hook(), self.debounce);
        let mut readable = true;

        while self.running.load(Ordering::SeqCst) {
            match self.pin.read() {
                Ok(raw) => {
                    if !readable {
                        info!(pin = self.pin.number(), "hook pin readable again");
                        readable = true;
                    }
                    if let Some(on_hook) = debouncer.sample(raw, Instant::now()) {
                        debug!(on_hook, "hook level changed");
                        self.line.set(on_hook);
                        // Not in an async context, so block on the channel.
                        if self
                            .event_tx
                            .blocking_send(HookEvent::Changed { hook_down: on_hook })
                            .is_err()
                        {
                            warn!("failed to send hook event - channel closed?");
                            break;
                        }
                    }
                }
                Err(e) if readable => {
                    error!(error = %e, "hook pin read failed");
                    readable = false;
                    if self.event_tx.blocking_send(HookEvent::LineLost).is_err() {
                        break;
                    }
                }
                Err(_) => {}
            }
            thread::sleep(self.poll_interval);
        }
    }
}
