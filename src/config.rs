//! Configuration loading and management
//!
//! Everything is read from `ANSWERING_MACHINE_*` environment variables with
//! defaults matching the Raspberry Pi phone build (BCM pin 16, `aplay` and
//! `arecord` on the USB sound card, backup stick on `sda1`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::AudioCommand;

/// Prefix shared by every configuration environment variable
pub const ENV_PREFIX: &str = "ANSWERING_MACHINE_";

/// Errors raised while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("HOME is not set and {ENV_PREFIX}DATA_DIR was not given")]
    NoDataDir,

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: &'static str,
    },

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for status queries
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// Hook switch wiring
    pub hook: HookConfig,

    /// Audio tools, sound files and recording targets
    pub audio: AudioConfig,

    /// Fixed delays used by the state machine and listener
    pub timings: Timings,
}

/// Where the hook switch is wired
#[derive(Debug, Clone)]
pub struct HookConfig {
    /// BCM GPIO number of the hook switch
    pub pin: u32,
    /// Root of the sysfs GPIO interface
    pub gpio_root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Player invoked as `<player> <file>`
    pub player: AudioCommand,
    /// Recorder invoked with device, format, duration cap and output path appended
    pub recorder: AudioCommand,
    /// ALSA capture device passed to the recorder
    pub capture_device: String,
    /// Directory holding greetings, the beep and the boot sound
    pub sounds_dir: PathBuf,
    /// Directory new recordings are written to
    pub recordings_dir: PathBuf,
    /// Block device whose mount point receives backup copies
    pub backup_device: String,
    /// Longest message a caller may leave
    pub max_recording: Duration,
}

impl AudioConfig {
    pub const BEEP: &'static str = "beep.wav";
    pub const BOOT_SOUND: &'static str = "sample-3s.wav";

    /// Resolve a sound file name against the sounds directory
    pub fn sound(&self, name: &str) -> PathBuf {
        self.sounds_dir.join(name)
    }

    /// Command that plays `file` once
    pub fn play_command(&self, file: &Path) -> AudioCommand {
        self.player.clone().arg(file)
    }

    pub fn beep_command(&self) -> AudioCommand {
        self.play_command(&self.sound(Self::BEEP))
    }
}

#[derive(Debug, Clone)]
pub struct Timings {
    /// Pause between the handset lifting and the greeting starting
    pub playback_delay: Duration,
    /// Interval between beeps while the handset is stuck off hook
    pub stuck_retry: Duration,
    /// Edge lock-out applied to the hook pin
    pub debounce: Duration,
    /// How often the hook pin is sampled
    pub poll_interval: Duration,
    /// Slack given to the recorder's own duration cap before it is killed
    pub limit_grace: Duration,
    /// How long shutdown waits for each audio task to wind down
    pub shutdown_grace: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            playback_delay: Duration::from_millis(250),
            stuck_retry: Duration::from_secs(1),
            debounce: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            limit_grace: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    ///
    /// Keys are looked up with [`ENV_PREFIX`] prepended.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        let data_dir = match get("DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let home = lookup("HOME").ok_or(ConfigError::NoDataDir)?;
                PathBuf::from(home)
                    .join(".local")
                    .join("share")
                    .join("answering-machine")
            }
        };

        let socket_path = get("SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("daemon.sock"));

        let pin = match get("HOOK_PIN") {
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: format!("{ENV_PREFIX}HOOK_PIN"),
                value: raw.clone(),
                reason: "expected a GPIO number",
            })?,
            None => 16,
        };

        let max_recording = match get("MAX_RECORDING_SECS") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    return Err(ConfigError::Invalid {
                        key: format!("{ENV_PREFIX}MAX_RECORDING_SECS"),
                        value: raw,
                        reason: "expected a positive number of seconds",
                    })
                }
            },
            None => Duration::from_secs(180),
        };

        let command = |name: &str, default: &str| -> Result<AudioCommand, ConfigError> {
            let raw = get(name).unwrap_or_else(|| default.to_string());
            AudioCommand::parse(&raw).ok_or_else(|| ConfigError::Invalid {
                key: format!("{ENV_PREFIX}{name}"),
                value: raw.clone(),
                reason: "command is empty",
            })
        };

        Ok(Self {
            socket_path,
            hook: HookConfig {
                pin,
                gpio_root: get("GPIO_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/sys/class/gpio")),
            },
            audio: AudioConfig {
                player: command("PLAYER", "aplay")?,
                recorder: command("RECORDER", "arecord")?,
                capture_device: get("CAPTURE_DEVICE").unwrap_or_else(|| "hw:1,0".to_string()),
                sounds_dir: get("SOUNDS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(".")),
                recordings_dir: get("RECORDINGS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("recordings")),
                backup_device: get("BACKUP_DEVICE").unwrap_or_else(|| "sda1".to_string()),
                max_recording,
            },
            timings: Timings::default(),
            data_dir,
        })
    }

    /// Ensure data and recordings directories exist
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [&self.data_dir, &self.audio.recordings_dir] {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
