//! Unix domain socket server for status queries
//!
//! Provides request-response communication and push notifications of state
//! machine events to subscribed clients. Nothing here can drive the state
//! machine; it is read-only.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::events::StateEvent;

use super::protocol::{DaemonStatus, Notification, Request, Response, MAX_FRAME_LEN};

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    state: Arc<RwLock<ServerState>>,
    shutdown_tx: broadcast::Sender<()>,
    /// Source of state events for subscribed clients
    event_tx: broadcast::Sender<StateEvent>,
}

/// Shared server state
struct ServerState {
    status: DaemonStatus,
    start_time: Instant,
}

/// A request frame as read off the socket
type Incoming = std::result::Result<Request, String>;

impl Server {
    /// Bind the socket; subscribers receive events sent on `event_tx`
    pub fn with_events(
        socket_path: &Path,
        event_tx: broadcast::Sender<StateEvent>,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Owner-only; status includes recording paths
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(RwLock::new(ServerState {
            status: DaemonStatus::default(),
            start_time: Instant::now(),
        }));

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            state,
            shutdown_tx,
            event_tx,
        })
    }

    pub async fn set_backup_available(&self, available: bool) {
        self.state.write().await.status.backup_available = available;
    }

    /// Fold a state event into the status snapshot
    pub async fn apply_event(&self, event: &StateEvent) {
        let mut server_state = self.state.write().await;
        let old_state = server_state.status.state;
        server_state.status.apply(event);

        let new_state = server_state.status.state;
        if old_state != new_state {
            debug!(from = %old_state, to = %new_state, "IPC server: state updated");
        }
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("server not initialized")?;

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let state = Arc::clone(&self.state);
                    let event_tx = self.event_tx.clone();
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, state, event_tx) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    async fn handle_client(
        stream: UnixStream,
        state: Arc<RwLock<ServerState>>,
        event_tx: broadcast::Sender<StateEvent>,
    ) -> Result<()> {
        let (reader, mut writer) = stream.into_split();

        // Frames are read on their own task so a push never lands mid-read.
        let (request_tx, mut request_rx) = mpsc::channel::<Incoming>(8);
        let reader_task = tokio::spawn(Self::read_requests(reader, request_tx));

        let mut subscription: Option<broadcast::Receiver<StateEvent>> = None;

        let result = loop {
            tokio::select! {
                incoming = request_rx.recv() => {
                    let Some(incoming) = incoming else {
                        debug!("client disconnected");
                        break Ok(());
                    };

                    let response = match incoming {
                        Ok(request) => {
                            debug!(?request, "received request");
                            let (response, subscribe) =
                                Self::process_request(request, &state).await;
                            if subscribe && subscription.is_none() {
                                subscription = Some(event_tx.subscribe());
                                debug!("client subscribed to notifications");
                            }
                            response
                        }
                        Err(message) => Response::Error {
                            code: "bad_request".to_string(),
                            message,
                        },
                    };

                    if let Err(e) = Self::send_message(&mut writer, &response).await {
                        break Err(e);
                    }
                }

                event = next_event(&mut subscription) => match event {
                    Ok(event) => {
                        let notification = Notification::StateEvent { event };
                        if let Err(e) = Self::send_message(&mut writer, &notification).await {
                            break Err(e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "subscriber lagged behind state events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        subscription = None;
                    }
                },
            }
        };

        reader_task.abort();
        result
    }

    /// Read length-prefixed request frames until EOF or a fatal error
    async fn read_requests(mut reader: OwnedReadHalf, request_tx: mpsc::Sender<Incoming>) {
        let mut len_buf = [0u8; 4];

        loop {
            // Read message length (4-byte little-endian)
            match reader.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return,
                Err(e) => {
                    debug!(?e, "client read error");
                    return;
                }
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_FRAME_LEN {
                warn!(len, "message too large, disconnecting");
                let _ = request_tx
                    .send(Err(format!("frame of {len} bytes exceeds {MAX_FRAME_LEN}")))
                    .await;
                return;
            }

            let mut msg_buf = vec![0u8; len];
            if let Err(e) = reader.read_exact(&mut msg_buf).await {
                debug!(?e, "client closed mid-frame");
                return;
            }

            let incoming = serde_json::from_slice::<Request>(&msg_buf).map_err(|e| e.to_string());
            if request_tx.send(incoming).await.is_err() {
                return;
            }
        }
    }

    /// Send a length-prefixed JSON message
    async fn send_message<T: serde::Serialize>(writer: &mut OwnedWriteHalf, msg: &T) -> Result<()> {
        let msg_bytes = serde_json::to_vec(msg)?;
        let msg_len = (msg_bytes.len() as u32).to_le_bytes();

        writer.write_all(&msg_len).await?;
        writer.write_all(&msg_bytes).await?;

        Ok(())
    }

    /// Process a request and return a response
    /// Returns (Response, should_subscribe)
    async fn process_request(
        request: Request,
        state: &Arc<RwLock<ServerState>>,
    ) -> (Response, bool) {
        match request {
            Request::Ping => (Response::Pong, false),

            Request::GetStatus => {
                let mut state = state.write().await;
                state.status.uptime_secs = state.start_time.elapsed().as_secs();
                (Response::Status(state.status.clone()), false)
            }

            Request::Subscribe => (Response::Subscribed, true),
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

async fn next_event(
    subscription: &mut Option<broadcast::Receiver<StateEvent>>,
) -> std::result::Result<StateEvent, broadcast::error::RecvError> {
    match subscription {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
