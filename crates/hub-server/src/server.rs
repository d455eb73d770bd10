//! Hub WebSocket server.
//!
//! Listens on a TCP port, upgrades requests for the configured path to
//! WebSocket, runs the AUTH handshake and hands each authenticated
//! connection to its own session worker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use l4d2_bridge_data_channel::FileStore;
use l4d2_bridge_protocol::ids::{new_long_id, sanitize_server_id, unix_now};
use l4d2_bridge_protocol::{
    AuthAck, AuthError, Body, Envelope, ErrorCode, MessageType, ReplayFilter,
};
use l4d2_bridge_protocol::constants::DEFAULT_DEDUP_CAPACITY;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{HubConfig, LargePush};
use crate::connection::{Outbox, SEND_BUFFER_SIZE, write_pump};
use crate::events::{BridgeEvent, EventReceiver, EventSender, emit};
use crate::push::{self, Content, FileSource, PushJob, Route};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::session::{Session, SessionCommand, SessionState};
use crate::tasks::{TaskKind, TaskTracker};
use crate::{PushError, ServerError};

/// Command queue depth per session.
const COMMAND_BUFFER_SIZE: usize = 256;

/// Period of the server-wide housekeeping sweep.
const SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// State shared by the server and every session worker.
pub(crate) struct Shared {
    pub config: HubConfig,
    pub secret: Arc<[u8]>,
    pub replay: ReplayFilter,
    pub registry: SessionRegistry,
    pub tasks: TaskTracker,
    pub events: EventSender,
    pub store: Arc<FileStore>,
}

/// The hub side of the bridge.
pub struct BridgeServer {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    live: Arc<AtomicUsize>,
    next_conn_id: AtomicU64,
}

/// Decrements the live connection count when the connection task ends.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(live: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let prev = live.fetch_add(1, Ordering::SeqCst);
        if prev >= max {
            live.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Self(Arc::clone(live)))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BridgeServer {
    /// Creates a server and the receiving end of its event channel.
    ///
    /// Verified inbound files are moved into `store`.
    pub fn new(config: HubConfig, store: Arc<FileStore>) -> (Arc<Self>, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            secret: Arc::from(config.token.as_bytes()),
            replay: ReplayFilter::with_capacity(config.dedup_window, DEFAULT_DEDUP_CAPACITY),
            registry: SessionRegistry::new(),
            tasks: TaskTracker::new(
                events.clone(),
                config.delivery_timeout,
                config.completed_retention,
            ),
            events,
            store,
            config,
        };
        let server = Arc::new(Self {
            shared: Arc::new(shared),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            live: Arc::new(AtomicUsize::new(0)),
            next_conn_id: AtomicU64::new(1),
        });
        (server, rx)
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    pub fn is_connected(&self, server_id: &str) -> bool {
        self.shared.registry.is_connected(server_id)
    }

    pub fn connected_servers(&self) -> Vec<String> {
        self.shared.registry.server_ids()
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.shared.tasks
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.shared.registry
    }

    /// Closes the session of `server_id`. Returns `false` if none exists.
    pub async fn disconnect(&self, server_id: &str) -> bool {
        let Some(handle) = self.shared.registry.get(server_id) else {
            return false;
        };
        handle
            .close(ErrorCode::Disconnected, "disconnected by hub")
            .await;
        true
    }

    /// Gracefully shuts down the server and every session.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.shared.config.bind).await?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener until shutdown.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        info!(
            "bridge hub listening on ws://{local_addr}{}",
            self.shared.config.ws_path
        );

        let sweeper = tokio::spawn(sweep_loop(Arc::clone(&self.shared), self.cancel.clone()));

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("server shutting down");
                    break Ok(());
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let Some(slot) = ConnectionSlot::acquire(
                                &self.live,
                                self.shared.config.max_sessions,
                            ) else {
                                warn!(%peer_addr, "connection limit reached, dropping");
                                continue;
                            };
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    debug!(%peer_addr, "connection ended with error: {e}");
                                }
                                drop(slot);
                            });
                        }
                        Err(e) => error!("accept error: {e}"),
                    }
                }
            }
        };

        let _ = sweeper.await;
        result
    }

    /// Upgrades, authenticates and runs one connection.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let config = &self.shared.config;
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.max_message_size);
        ws_config.max_frame_size = Some(config.max_message_size);

        let ws_path = config.ws_path.clone();
        let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if req.uri().path() == ws_path {
                Ok(resp)
            } else {
                let mut err = ErrorResponse::new(Some("not found".to_string()));
                *err.status_mut() = tungstenite::http::StatusCode::NOT_FOUND;
                Err(err)
            }
        };
        let ws_stream = accept_hdr_async_with_config(stream, check_path, Some(ws_config)).await?;
        debug!(%peer_addr, state = ?SessionState::Connecting, "WebSocket upgraded");

        let (write, mut read) = ws_stream.split();
        let (write_tx, write_rx) = mpsc::channel(SEND_BUFFER_SIZE);
        let session_cancel = self.cancel.child_token();
        let pump = tokio::spawn(write_pump(write, write_rx, session_cancel.clone()));
        let outbox = Outbox::new(write_tx, Arc::clone(&self.shared.secret));

        debug!(%peer_addr, state = ?SessionState::Authenticating, "awaiting AUTH");
        let auth = tokio::time::timeout(config.auth_timeout, self.authenticate(&mut read)).await;
        let server_id = match auth {
            Ok(Ok(id)) => id,
            Ok(Err((code, reason))) => {
                warn!(%peer_addr, code = %code, "authentication failed: {reason}");
                return self.reject(outbox, session_cancel, pump, code).await;
            }
            Err(_) => {
                warn!(%peer_addr, "authentication timed out");
                return self
                    .reject(outbox, session_cancel, pump, ErrorCode::AuthTimeout)
                    .await;
            }
        };

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let closed = CancellationToken::new();
        let handle = SessionHandle {
            server_id: server_id.clone(),
            conn_id,
            commands: commands_tx.clone(),
            closed: closed.clone(),
        };

        // Close any live session for the same id before registering.
        while let Err(existing) = self.shared.registry.insert_if_absent(handle.clone()) {
            info!(server_id = %server_id, %peer_addr, "superseding existing session");
            existing
                .close(ErrorCode::Superseded, "superseded by a new connection")
                .await;
            // The old worker unregisters itself during teardown; make sure
            // a worker that died without doing so does not block us.
            self.shared
                .registry
                .remove_if(&existing.server_id, existing.conn_id);
        }

        let ack = Body::AuthAck(AuthAck {
            accepted_server: server_id.clone(),
            heartbeat_interval: config.heartbeat_interval.as_secs(),
        });
        if let Err(e) = outbox.send(&ack, "").await {
            warn!(server_id = %server_id, "failed to send AUTH_ACK: {e}");
        }

        info!(server_id = %server_id, %peer_addr, conn_id, "agent connected");
        emit(
            &self.shared.events,
            BridgeEvent::Connected {
                server_id: server_id.clone(),
                display_name: config.display_name(&server_id),
            },
        );

        let session = Session::new(
            server_id,
            conn_id,
            Arc::clone(&self.shared),
            outbox,
            session_cancel.clone(),
            closed,
            commands_tx,
        );
        session
            .run(read, commands_rx, self.cancel.child_token())
            .await;
        let _ = pump.await;
        Ok(())
    }

    /// Reads the first envelope and checks it is a valid AUTH.
    ///
    /// Failures never reveal whether the claimed server id is known.
    async fn authenticate<R>(&self, read: &mut R) -> Result<String, (ErrorCode, String)>
    where
        R: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        let text = loop {
            match read.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => break text,
                Some(Ok(tungstenite::Message::Close(_))) | None => {
                    return Err((ErrorCode::Disconnected, "closed before AUTH".into()));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err((ErrorCode::Disconnected, e.to_string())),
            }
        };

        let invalid = |reason: String| (ErrorCode::AuthInvalidSignature, reason);
        let env = Envelope::parse(&text).map_err(|e| invalid(format!("malformed AUTH: {e}")))?;
        if env.msg_type != MessageType::Auth {
            return Err(invalid(format!("expected AUTH, got {}", env.msg_type)));
        }

        let now = unix_now();
        let config = &self.shared.config;
        env.verify(&self.shared.secret, now, config.signature_window)
            .map_err(|e| match e {
                AuthError::TimestampOutOfWindow { .. } => {
                    (ErrorCode::AuthExpiredTimestamp, e.to_string())
                }
                other => invalid(other.to_string()),
            })?;

        let Body::Auth(request) = env.body().map_err(|e| invalid(e.to_string()))? else {
            return Err(invalid("AUTH without payload".into()));
        };
        let server_id = sanitize_server_id(&request.server_id);
        if !self.shared.replay.seen(&server_id, &env.msg_id, now) {
            return Err(invalid("replayed AUTH".into()));
        }
        debug!(
            server_id = %server_id,
            agent_version = %request.agent_version,
            "AUTH verified"
        );
        Ok(server_id)
    }

    async fn reject(
        &self,
        outbox: Outbox,
        cancel: CancellationToken,
        pump: tokio::task::JoinHandle<()>,
        code: ErrorCode,
    ) -> Result<(), ServerError> {
        // Generic message: the peer learns the failure class only.
        let _ = outbox
            .send(&Body::error(code, code.as_str(), ""), "")
            .await;
        cancel.cancel();
        let _ = pump.await;
        Err(ServerError::ConnectionRejected(code))
    }

    /// Pushes a file to one agent, or to every connected agent when
    /// `target` is `None`, and returns the id of the tracking task.
    pub async fn push_file(
        &self,
        target: Option<&str>,
        source: FileSource,
        caption: &str,
        channel: &str,
    ) -> Result<String, PushError> {
        let registry = &self.shared.registry;
        let handles = match target {
            Some(id) => vec![
                registry
                    .get(id)
                    .ok_or_else(|| PushError::ServerUnknown(id.to_string()))?,
            ],
            None => registry.handles(),
        };
        if handles.is_empty() {
            return Err(PushError::ServerUnknown("no connected servers".into()));
        }

        let config = &self.shared.config;
        let file = Arc::new(push::prepare(source, &config.policy, config.max_file_size).await?);
        let route = self.route_for(&file, handles.len()).await?;

        let targets = handles.iter().map(|h| h.server_id.clone()).collect();
        let task_id = self.shared.tasks.submit(
            TaskKind::PushFile {
                file_name: file.file_name.clone(),
            },
            targets,
        );
        info!(
            task_id = %task_id,
            file = %file.file_name,
            size = file.size,
            targets = handles.len(),
            route = ?route,
            "push submitted"
        );

        for handle in handles {
            let job = PushJob {
                task_id: task_id.clone(),
                transfer_id: new_long_id(),
                file: Arc::clone(&file),
                route: route.clone(),
                caption: caption.to_string(),
                channel: channel.to_string(),
            };
            if handle.commands.send(SessionCommand::Push(job)).await.is_err() {
                self.shared.tasks.resolve_target(
                    &task_id,
                    &handle.server_id,
                    false,
                    ErrorCode::Disconnected.as_u16(),
                    "session closed",
                );
            }
        }
        Ok(task_id)
    }

    async fn route_for(
        &self,
        file: &push::PreparedFile,
        targets: usize,
    ) -> Result<Route, PushError> {
        let config = &self.shared.config;
        if matches!(file.content, Content::Url(_)) {
            return Ok(Route::Url);
        }
        if file.size <= config.inline_threshold {
            return Ok(Route::Inline);
        }
        if config.large_push == LargePush::Chunked {
            return Ok(Route::Chunked);
        }
        let downloads = u32::try_from(targets).unwrap_or(u32::MAX);
        let meta = match &file.content {
            Content::Path(path) => {
                self.shared
                    .store
                    .put_file(&file.file_name, path, downloads)
                    .await?
            }
            Content::Bytes(data) => {
                self.shared
                    .store
                    .put_bytes(&file.file_name, data, downloads)
                    .await?
            }
            Content::Url(_) => return Ok(Route::Url),
        };
        Ok(Route::Stored {
            file_id: meta.file_id,
        })
    }
}

/// Server-wide housekeeping: delivery timeouts, task retention and the
/// replay filter.
async fn sweep_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(SWEEP_PERIOD);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let expired = shared.tasks.expire(tokio::time::Instant::now());
                if expired > 0 {
                    warn!(expired, "tasks timed out");
                }
                let dropped = shared.replay.sweep(unix_now());
                if dropped > 0 {
                    debug!(dropped, "replay entries evicted");
                }
            }
        }
    }
}
