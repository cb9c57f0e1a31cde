//! answering-machine: hook-driven answering machine daemon
//!
//! Runs on a Raspberry Pi wired into an old telephone and provides:
//! - Hook switch monitoring via sysfs GPIO
//! - Explicit state machine for greeting, recording and stuck-handset recovery
//! - Playback and recording through external tools (`aplay`, `arecord`)
//! - Best-effort mirroring of recordings to a USB stick
//! - IPC server for status queries and state notifications
//!
//! No audio processing happens here; the external tools own the sound.

mod audio;
mod config;
mod events;
mod hook;
mod ipc;
mod lifecycle;
mod state;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{AudioConfig, Config};
use crate::events::StateEvent;
use crate::hook::HookListener;
use crate::ipc::Server;
use crate::lifecycle::ShutdownSignal;
use crate::state::StateMachine;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "answering-machine starting"
    );

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(
        ?config.socket_path,
        recordings = %config.audio.recordings_dir.display(),
        "configuration loaded"
    );

    // Resolved once; a stick plugged in later is not picked up
    let backup_root = audio::recording::resolve_backup_root(&config.audio.backup_device);
    match &backup_root {
        Some(root) => info!(root = %root.display(), "backup storage found"),
        None => warn!(
            device = %config.audio.backup_device,
            "no backup storage mounted, recordings stay local"
        ),
    }

    let mut shutdown = ShutdownSignal::install().context("failed to register signal handlers")?;

    // Hook listener -> State machine
    let (hook_tx, hook_rx) = mpsc::channel(32);
    // State machine -> logging and IPC subscribers
    let (event_tx, _event_rx) = broadcast::channel::<StateEvent>(64);

    // Without the hook pin there is nothing to do
    let hook_listener =
        HookListener::open_blocking(config.hook.clone(), config.timings.clone(), hook_tx)
            .await
            .context("failed to acquire hook pin")?;

    let boot_sound = config
        .audio
        .play_command(&config.audio.sound(AudioConfig::BOOT_SOUND));
    if audio::play_to_completion(&boot_sound).await.completed_normally() {
        debug!("boot sound played");
    }

    let mut state_machine = StateMachine::new(
        config.audio.clone(),
        config.timings.clone(),
        backup_root.clone(),
        hook_listener.line(),
        event_tx.clone(),
    );

    hook_listener
        .start()
        .context("failed to start hook listener")?;

    let server = Server::with_events(&config.socket_path, event_tx.clone())?;
    server.set_backup_available(backup_root.is_some()).await;

    let mut state_event_rx = event_tx.subscribe();

    info!("daemon initialized, entering main loop");

    tokio::select! {
        // Run the state machine (hook events and audio completions)
        _ = state_machine.run(hook_rx) => {
            info!("state machine exited");
        }

        // Run the IPC server (accepts client connections)
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        // Keep the IPC status snapshot in sync with the state machine
        _ = async {
            loop {
                match state_event_rx.recv().await {
                    Ok(event) => {
                        debug!(%event, "state event received");
                        server.apply_event(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "state event receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        } => {
            info!("state event handler exited");
        }

        // Wait for shutdown signal
        signal = shutdown.wait() => {
            info!(signal, "shutdown signal received");
        }
    }

    // Cleanup
    info!("shutting down...");

    if !hook_listener.is_running() {
        warn!("hook listener had already stopped");
    }

    hook_listener.stop();
    state_machine.shutdown().await;
    server.shutdown().await;

    info!(
        calls = state_machine.session().message_count,
        "answering-machine stopped"
    );

    Ok(())
}
