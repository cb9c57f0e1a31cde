//! Recording targets, backup mirroring and the duration cap

use std::fmt::Display;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use tracing::{debug, info, warn};

use super::process::{AudioCommand, ExitOutcome, StopSignal};

/// Sub-directory of the backup mount that mirrors the recordings directory
pub const BACKUP_SUBDIR: &str = "recordings";

const TIMESTAMP_FORMAT: &str = "%d-%b-%Y_%H-%M-%S";
const FILE_SUFFIX: &str = "_recording.wav";

const SAMPLE_FORMAT: &str = "S16_LE";
const SAMPLE_RATE: u32 = 44_100;
const CHANNELS: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("no backup storage mounted")]
    NoBackup,

    #[error("failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// File name for a recording started at `at`
pub fn file_name_at<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!("{}{}", at.format(TIMESTAMP_FORMAT), FILE_SUFFIX)
}

/// One message being recorded
#[derive(Debug, Clone)]
pub struct RecordingSession {
    path: PathBuf,
    backup_path: Option<PathBuf>,
    limit: Duration,
    grace: Duration,
}

impl RecordingSession {
    pub fn new(
        recordings_dir: &Path,
        backup_root: Option<&Path>,
        file_name: &str,
        limit: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            path: recordings_dir.join(file_name),
            backup_path: backup_root.map(|root| root.join(BACKUP_SUBDIR).join(file_name)),
            limit,
            grace,
        }
    }

    /// Session named after the current local time
    pub fn starting_now(
        recordings_dir: &Path,
        backup_root: Option<&Path>,
        limit: Duration,
        grace: Duration,
    ) -> Self {
        Self::new(
            recordings_dir,
            backup_root,
            &file_name_at(&Local::now()),
            limit,
            grace,
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> Option<&Path> {
        self.backup_path.as_deref()
    }

    /// Recorder invocation: 16-bit LE mono at 44.1 kHz, capped at the limit
    pub fn recorder_command(&self, recorder: &AudioCommand, device: &str) -> AudioCommand {
        recorder
            .clone()
            .arg(format!("--device={device}"))
            .args(["--format", SAMPLE_FORMAT])
            .arg("-d")
            .arg(self.limit.as_secs().max(1).to_string())
            .arg("--rate")
            .arg(SAMPLE_RATE.to_string())
            .arg(format!("-c{CHANNELS}"))
            .arg(&self.path)
    }

    /// Run the recorder
    ///
    /// The recorder enforces the cap itself; the timer here fires `grace`
    /// later and kills it in case it does not.
    pub async fn capture(&self, stop: &mut StopSignal, command: &AudioCommand) -> ExitOutcome {
        stop.run_with_limit(command, Some(self.limit + self.grace))
            .await
    }

    /// Copy the finished recording to backup storage
    pub async fn mirror(&self) -> Result<PathBuf, RecordingError> {
        let backup = self.backup_path.as_ref().ok_or(RecordingError::NoBackup)?;
        let copy_err = |source| RecordingError::Copy {
            from: self.path.clone(),
            to: backup.clone(),
            source,
        };

        if let Some(parent) = backup.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(copy_err)?;
        }
        tokio::fs::copy(&self.path, backup).await.map_err(copy_err)?;
        Ok(backup.clone())
    }

    /// [`mirror`](Self::mirror), logging instead of failing
    pub async fn mirror_best_effort(&self) {
        match self.mirror().await {
            Ok(backup) => info!(backup = %backup.display(), "recording mirrored"),
            Err(RecordingError::NoBackup) => debug!("no backup storage, recording not mirrored"),
            Err(e) => warn!(error = %e, "failed to mirror recording"),
        }
    }
}

/// Mount point of `device` according to `/proc/mounts`
///
/// Returns `None` when the device is not mounted or the table is unreadable.
pub fn resolve_backup_root(device: &str) -> Option<PathBuf> {
    match std::fs::read_to_string("/proc/mounts") {
        Ok(mounts) => mount_point_for(&mounts, device),
        Err(e) => {
            warn!(error = %e, "failed to read mount table");
            None
        }
    }
}

/// Find the mount point of the first entry whose source mentions `device`
pub fn mount_point_for(mounts: &str, device: &str) -> Option<PathBuf> {
    mounts.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let source = fields.next()?;
        let target = fields.next()?;
        source
            .contains(device)
            .then(|| PathBuf::from(unescape_mount_field(target)))
    })
}

/// Undo the octal escaping the kernel applies to spaces and friends
fn unescape_mount_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let escape = rest.get(pos + 1..pos + 4);
        match escape.and_then(|oct| u8::from_str_radix(oct, 8).ok()) {
            Some(byte) => {
                out.push(char::from(byte));
                rest = &rest[pos + 4..];
            }
            None => {
                out.push('\\');
                rest = &rest[pos + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}
