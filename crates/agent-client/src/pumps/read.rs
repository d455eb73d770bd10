//! WebSocket read pump: verifies and dispatches hub envelopes.
//!
//! Owns everything connection-local on the agent side: the replay filter,
//! the heartbeat monitor and the transfer table reassembling hub pushes.
//! Object-store downloads run in their own tasks and report back through
//! a channel, so heartbeat acknowledgements keep flowing meanwhile.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use l4d2_bridge_data_channel::{DataChannelError, DownloadedFile, ObjectClient};
use l4d2_bridge_protocol::constants::HUB_SENDER_ID;
use l4d2_bridge_protocol::ids::unix_now;
use l4d2_bridge_protocol::{
    Body, Envelope, ErrorCode, FileNotice, HeartbeatMonitor, Liveness, ReplayFilter, TaskResult,
};
use l4d2_bridge_transfer::{
    ChunkOutcome, CompletedFile, Direction, TableConfig, TransferDeclaration, TransferError,
    TransferTable,
};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::AgentConfig;
use crate::events::{AgentEvent, AgentEventSender, ReceivedFile, emit};
use crate::link::Link;

/// Follows tokio's clock so paused-time tests drive liveness.
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

/// Object-store downloads finishing concurrently.
const FETCH_QUEUE: usize = 16;

/// Where an inbound file came from, for replies.
#[derive(Debug, Clone)]
struct Origin {
    msg_id: String,
    channel: String,
    task_id: Option<String>,
}

/// Outcome of an object-store download.
struct Fetched {
    origin: Origin,
    transfer_id: String,
    notice: FileNotice,
    dest: PathBuf,
    result: Result<DownloadedFile, DataChannelError>,
}

pub(crate) struct ReadPump {
    config: Arc<AgentConfig>,
    secret: Arc<[u8]>,
    link: Link,
    events: AgentEventSender,
    objects: Option<Arc<ObjectClient>>,
    replay: ReplayFilter,
    monitor: HeartbeatMonitor,
    table: TransferTable,
    fetching: HashSet<String>,
    fetched_tx: mpsc::Sender<Fetched>,
    fetched_rx: Option<mpsc::Receiver<Fetched>>,
    /// Set by a connection-fatal ERROR; reported when the socket closes.
    hub_reason: Option<(ErrorCode, String)>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    closed: CancellationToken,
}

/// Handles shared between the client and its pumps.
pub(crate) struct PumpContext {
    pub config: Arc<AgentConfig>,
    pub secret: Arc<[u8]>,
    pub link: Link,
    pub events: AgentEventSender,
    pub objects: Option<Arc<ObjectClient>>,
    pub connected: Arc<AtomicBool>,
    /// Ends the connection: local disconnect or a dead socket.
    pub cancel: CancellationToken,
    /// Fired once the disconnect has been reported.
    pub closed: CancellationToken,
}

impl ReadPump {
    pub fn new(ctx: PumpContext, heartbeat_interval: Duration) -> Self {
        let PumpContext {
            config,
            secret,
            link,
            events,
            objects,
            connected,
            cancel,
            closed,
        } = ctx;
        let table = TransferTable::new(TableConfig {
            policy: config.policy.clone(),
            max_file_size: config.max_file_size,
            idle_timeout: config.transfer_idle_timeout,
            retention: config.completed_retention,
            staging_dir: Some(staging_dir(&config)),
        });
        let (fetched_tx, fetched_rx) = mpsc::channel(FETCH_QUEUE);
        Self {
            replay: ReplayFilter::new(config.dedup_window),
            monitor: HeartbeatMonitor::new(heartbeat_interval, now()),
            table,
            config,
            secret,
            link,
            events,
            objects,
            fetching: HashSet::new(),
            fetched_tx,
            fetched_rx: Some(fetched_rx),
            hub_reason: None,
            connected,
            cancel,
            closed,
        }
    }

    /// Reads until the connection ends, then reports the disconnect.
    pub async fn run<S>(mut self, mut read: S)
    where
        S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        let Some(mut fetched_rx) = self.fetched_rx.take() else {
            return;
        };
        let cancel = self.cancel.clone();
        let period = (self.monitor.interval() / 2).max(Duration::from_millis(100));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        let (code, reason) = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break (ErrorCode::Disconnected, "connection closed locally".to_string());
                }

                frame = read.next() => match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => self.handle_text(&text).await,
                    Some(Ok(tungstenite::Message::Close(_))) | None => {
                        break self
                            .hub_reason
                            .take()
                            .unwrap_or((ErrorCode::Disconnected, "connection closed by hub".to_string()));
                    }
                    Some(Ok(tungstenite::Message::Binary(_))) => warn!("binary frame ignored"),
                    Some(Ok(_)) => trace!("control frame"),
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break (ErrorCode::Disconnected, format!("read error: {e}"));
                    }
                },

                Some(fetched) = fetched_rx.recv() => self.on_fetched(fetched).await,

                _ = tick.tick() => {
                    if let Some(stop) = self.on_tick().await {
                        break stop;
                    }
                }
            }
        };

        self.teardown(code, reason);
    }

    async fn handle_text(&mut self, text: &str) {
        let now_unix = unix_now();
        let env = match Envelope::parse(text) {
            Ok(env) => env,
            Err(e) => {
                warn!("malformed envelope from hub: {e}");
                return;
            }
        };
        if let Err(e) = env.verify(&self.secret, now_unix, self.config.signature_window) {
            warn!(msg_id = %env.msg_id, "rejected hub envelope: {e}");
            self.reply_error(ErrorCode::InvalidSignature, &e.to_string(), &env.msg_id, "")
                .await;
            return;
        }
        if env.server_id != HUB_SENDER_ID {
            warn!(sender = %env.server_id, "envelope not sent by the hub, dropped");
            return;
        }
        if !self.replay.seen(HUB_SENDER_ID, &env.msg_id, now_unix) {
            debug!(msg_id = %env.msg_id, "duplicate dropped");
            return;
        }
        self.monitor.record(now());

        let body = match env.body() {
            Ok(body) => body,
            Err(e) => {
                warn!(msg_id = %env.msg_id, "bad payload: {e}");
                self.reply_error(ErrorCode::InvalidPayload, &e.to_string(), &env.msg_id, &env.channel)
                    .await;
                return;
            }
        };
        self.dispatch(&env, body).await;
    }

    async fn dispatch(&mut self, env: &Envelope, body: Body) {
        match body {
            Body::HeartbeatAck => trace!("heartbeat acknowledged"),
            Body::Heartbeat => self.send(&Body::HeartbeatAck, "").await,
            Body::Ack(ack) => debug!(ref_msg_id = %ack.ref_msg_id, "hub acknowledged"),
            Body::FileChunk(chunk) => {
                let origin = origin(env, chunk.task_id.clone());
                let result = self.table.accept_chunk(&chunk, &env.channel, now());
                self.on_transfer(&origin, &chunk.transfer_id, &chunk.file_name, result)
                    .await;
            }
            Body::FileComplete(complete) => {
                let origin = origin(env, complete.task_id.clone());
                let result = self.table.accept_complete(&complete, &env.channel, now());
                self.on_transfer(&origin, &complete.transfer_id, &complete.file_name, result)
                    .await;
            }
            Body::FileNotice(notice) => self.on_file_notice(env, notice).await,
            Body::Error(err) => {
                warn!(code = %err.code, ref_msg_id = %err.ref_msg_id, "hub reported error: {}", err.message);
                if err.code.is_connection_fatal() {
                    self.hub_reason = Some((err.code, err.message.clone()));
                }
                emit(
                    &self.events,
                    AgentEvent::Error {
                        code: err.code,
                        message: err.message,
                        ref_msg_id: err.ref_msg_id,
                    },
                );
            }
            Body::TaskResult(_) | Body::Auth(_) | Body::AuthAck(_) => {
                debug!(msg_type = %env.msg_type, "unexpected envelope from hub ignored");
            }
        }
    }

    async fn on_file_notice(&mut self, env: &Envelope, notice: FileNotice) {
        let transfer_id = notice
            .transfer_id
            .clone()
            .unwrap_or_else(|| env.msg_id.clone());
        let origin = origin(env, notice.task_id.clone());
        let decl = TransferDeclaration::new(&notice.file_name, notice.size, &notice.sha256);

        if let Some(data) = &notice.data {
            let result = self.table.accept_inline(
                &transfer_id,
                decl,
                data,
                &env.channel,
                origin.task_id.as_deref(),
                now(),
            );
            self.on_transfer(&origin, &transfer_id, &notice.file_name, result)
                .await;
        } else if let Some(file_id) = notice.file_id.clone() {
            self.start_fetch(origin, transfer_id, file_id, decl, notice)
                .await;
        } else if let Some(url) = notice.url {
            info!(file = %notice.file_name, url = %url, "download link offered");
            emit(
                &self.events,
                AgentEvent::FileOffered {
                    channel: env.channel.clone(),
                    file_name: notice.file_name,
                    url,
                    caption: notice.caption,
                    task_id: notice.task_id,
                },
            );
            self.send(&Body::ack(&env.msg_id), &env.channel).await;
        } else {
            self.reply_error(
                ErrorCode::InvalidPayload,
                "notice carries no content",
                &env.msg_id,
                &env.channel,
            )
            .await;
        }
    }

    async fn start_fetch(
        &mut self,
        origin: Origin,
        transfer_id: String,
        file_id: String,
        decl: TransferDeclaration,
        notice: FileNotice,
    ) {
        if self.fetching.contains(&transfer_id) {
            debug!(transfer_id = %transfer_id, "download already running");
            return;
        }
        if self.table.get(&transfer_id).is_some() {
            // Known id: the table answers without touching the path.
            let result = self.table.accept_file(
                &transfer_id,
                decl,
                Path::new(""),
                &origin.channel,
                origin.task_id.as_deref(),
                now(),
            );
            self.on_transfer(&origin, &transfer_id, &notice.file_name, result)
                .await;
            return;
        }
        let Some(objects) = self.objects.clone() else {
            let err = TransferError::InvalidDeclaration("no data channel configured".into());
            self.inbound_failed(&origin, &transfer_id, &notice.file_name, err)
                .await;
            return;
        };
        // Fail fast before any bytes travel.
        if let Err(err) = self.table.check_declaration(&decl) {
            self.inbound_failed(&origin, &transfer_id, &notice.file_name, err)
                .await;
            return;
        }

        let dest = staging_dir(&self.config).join(format!("{transfer_id}.download"));
        info!(transfer_id = %transfer_id, file_id = %file_id, file = %notice.file_name, "fetching from data channel");
        self.fetching.insert(transfer_id.clone());
        let tx = self.fetched_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let download = async {
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                objects.download(&file_id, &dest).await
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tokio::fs::remove_file(&dest).await;
                    return;
                }
                result = download => result,
            };
            let _ = tx
                .send(Fetched {
                    origin,
                    transfer_id,
                    notice,
                    dest,
                    result,
                })
                .await;
        });
    }

    async fn on_fetched(&mut self, fetched: Fetched) {
        let Fetched {
            origin,
            transfer_id,
            notice,
            dest,
            result,
        } = fetched;
        self.fetching.remove(&transfer_id);

        let downloaded = match result {
            Ok(d) => d,
            Err(e) => {
                let _ = tokio::fs::remove_file(&dest).await;
                let err = match e {
                    DataChannelError::Rejected(t) => t,
                    DataChannelError::NotFound(id) => TransferError::NotFound(id),
                    DataChannelError::Status { status: 404, message } => {
                        TransferError::NotFound(message)
                    }
                    other => TransferError::Io(std::io::Error::other(other.to_string())),
                };
                self.inbound_failed(&origin, &transfer_id, &notice.file_name, err)
                    .await;
                return;
            }
        };
        debug!(transfer_id = %transfer_id, size = downloaded.size, "download finished");

        let decl = TransferDeclaration::new(&notice.file_name, notice.size, &notice.sha256);
        let result = self.table.accept_file(
            &transfer_id,
            decl,
            &downloaded.path,
            &origin.channel,
            origin.task_id.as_deref(),
            now(),
        );
        if result.is_err() {
            let _ = tokio::fs::remove_file(&downloaded.path).await;
        }
        self.on_transfer(&origin, &transfer_id, &notice.file_name, result)
            .await;
    }

    async fn on_transfer(
        &mut self,
        origin: &Origin,
        transfer_id: &str,
        file_name: &str,
        result: Result<ChunkOutcome, TransferError>,
    ) {
        match result {
            Ok(ChunkOutcome::Progress {
                started: true,
                total,
                ..
            }) => {
                info!(transfer_id, file = file_name, size = total, "download started");
            }
            Ok(ChunkOutcome::Progress { .. }) => {}
            Ok(ChunkOutcome::Completed(file)) => self.save_completed(origin, file).await,
            Ok(ChunkOutcome::AlreadyComplete) => {
                debug!(transfer_id, "transfer already complete");
                self.send(&Body::ack(&origin.msg_id), &origin.channel).await;
            }
            Ok(ChunkOutcome::Ignored) => {
                debug!(transfer_id, "input for failed transfer ignored");
            }
            Err(err) => self.inbound_failed(origin, transfer_id, file_name, err).await,
        }
    }

    async fn save_completed(&mut self, origin: &Origin, file: CompletedFile) {
        let CompletedFile {
            transfer_id,
            file_name,
            size,
            sha256,
            channel,
            task_id,
            content,
            ..
        } = file;
        let dest = destination(&self.config.download_dir, &file_name, &transfer_id);
        let target = dest.clone();
        let persisted = tokio::task::spawn_blocking(move || content.persist_to(&target))
            .await
            .map_err(std::io::Error::other)
            .and_then(|r| r);

        if let Err(e) = persisted {
            let err = TransferError::Io(e);
            self.inbound_failed(origin, &transfer_id, &file_name, err)
                .await;
            return;
        }

        info!(transfer_id = %transfer_id, file = %file_name, size, path = %dest.display(), "file received");
        self.send(&Body::ack(&origin.msg_id), &origin.channel).await;
        if let Some(task_id) = &task_id {
            let mut extra = serde_json::Map::new();
            extra.insert("path".into(), dest.display().to_string().into());
            extra.insert("size".into(), size.into());
            let result = TaskResult {
                task_id: task_id.clone(),
                ok: true,
                code: 0,
                message: format!("saved {file_name}"),
                extra,
            };
            self.send(&Body::TaskResult(result), &channel).await;
        }
        emit(
            &self.events,
            AgentEvent::FileReceived(ReceivedFile {
                channel,
                transfer_id,
                file_name,
                size,
                sha256,
                path: dest,
                task_id,
            }),
        );
    }

    async fn inbound_failed(
        &mut self,
        origin: &Origin,
        transfer_id: &str,
        file_name: &str,
        err: TransferError,
    ) {
        let code = err.code();
        let message = err.to_string();
        warn!(transfer_id, file = file_name, code = %code, "inbound transfer failed: {message}");
        self.reply_error(code, &message, &origin.msg_id, &origin.channel)
            .await;
        self.report_failure(origin.task_id.as_deref(), code, &message, &origin.channel)
            .await;
        emit(
            &self.events,
            AgentEvent::TransferFailed {
                channel: origin.channel.clone(),
                transfer_id: transfer_id.to_string(),
                file_name: file_name.to_string(),
                code,
                message,
            },
        );
    }

    async fn report_failure(&self, task_id: Option<&str>, code: ErrorCode, message: &str, channel: &str) {
        let Some(task_id) = task_id else { return };
        let result = TaskResult {
            task_id: task_id.to_string(),
            ok: false,
            code: code.as_u16(),
            message: message.to_string(),
            extra: serde_json::Map::new(),
        };
        self.send(&Body::TaskResult(result), channel).await;
    }

    async fn on_tick(&mut self) -> Option<(ErrorCode, String)> {
        let now = now();
        match self.monitor.check(now) {
            Liveness::Dead => {
                warn!(timeout = ?self.monitor.timeout(), "hub stopped acknowledging heartbeats");
                return Some((
                    ErrorCode::HeartbeatTimeout,
                    format!("no heartbeat acknowledgement for {:?}", self.monitor.timeout()),
                ));
            }
            Liveness::Late { missed } => debug!(missed, "heartbeat acknowledgement late"),
            Liveness::Alive => {}
        }

        for failed in self.table.sweep(now) {
            if failed.direction != Direction::Inbound {
                continue;
            }
            self.report_failure(failed.task_id.as_deref(), failed.code, &failed.message, "")
                .await;
            emit(
                &self.events,
                AgentEvent::TransferFailed {
                    channel: String::new(),
                    transfer_id: failed.transfer_id,
                    file_name: failed.file_name,
                    code: failed.code,
                    message: failed.message,
                },
            );
        }
        None
    }

    fn teardown(mut self, code: ErrorCode, reason: String) {
        self.connected.store(false, Ordering::SeqCst);
        info!(code = %code, "disconnected from hub: {reason}");

        for failed in self.table.abort_all(ErrorCode::Disconnected, now()) {
            if failed.direction == Direction::Inbound {
                emit(
                    &self.events,
                    AgentEvent::TransferFailed {
                        channel: String::new(),
                        transfer_id: failed.transfer_id,
                        file_name: failed.file_name,
                        code: failed.code,
                        message: failed.message,
                    },
                );
            }
        }

        // Stops the write and heartbeat pumps and any running download.
        self.cancel.cancel();
        emit(&self.events, AgentEvent::Disconnected { code, reason });
        self.closed.cancel();
    }

    async fn send(&self, body: &Body, channel: &str) {
        if let Err(e) = self.link.send(body, channel).await {
            debug!("failed to queue {}: {e}", body.message_type());
        }
    }

    async fn reply_error(&self, code: ErrorCode, message: &str, ref_msg_id: &str, channel: &str) {
        self.send(&Body::error(code, message, ref_msg_id), channel)
            .await;
    }
}

fn origin(env: &Envelope, task_id: Option<String>) -> Origin {
    Origin {
        msg_id: env.msg_id.clone(),
        channel: env.channel.clone(),
        task_id,
    }
}

pub(crate) fn staging_dir(config: &AgentConfig) -> PathBuf {
    config.download_dir.join(".staging")
}

/// Picks a path for a received file without replacing an existing one.
fn destination(dir: &Path, file_name: &str, transfer_id: &str) -> PathBuf {
    let plain = dir.join(file_name);
    if !plain.exists() {
        return plain;
    }
    let prefix: String = transfer_id.chars().take(8).collect();
    dir.join(format!("{prefix}_{file_name}"))
}
