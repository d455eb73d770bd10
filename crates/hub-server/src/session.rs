//! Per-agent session worker.
//!
//! One worker task owns everything session-local: the read half of the
//! socket, the transfer table and the heartbeat monitor. It processes
//! envelopes strictly in arrival order. Outbound pushes run in their own
//! tasks and report back through the command channel, so a large push
//! never stalls heartbeat handling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use l4d2_bridge_protocol::ids::{sanitize_server_id, unix_now};
use l4d2_bridge_protocol::{
    Body, Envelope, ErrorCode, FileNotice, HeartbeatMonitor, Liveness, TaskResult,
};
use l4d2_bridge_transfer::{
    ChunkOutcome, CompletedFile, Direction, FailedTransfer, TableConfig, TransferDeclaration,
    TransferError, TransferTable,
};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::DeliveryPolicy;
use crate::connection::Outbox;
use crate::events::{BridgeEvent, ReceivedFile, emit};
use crate::push::{self, PushJob};
use crate::server::Shared;

/// Lifecycle of one agent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Connected,
    /// Heartbeat threshold reached; teardown follows.
    Dead,
    Closing,
    Closed,
}

/// Messages delivered to a session worker.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Push(PushJob),
    PushProgress {
        transfer_id: String,
        bytes: u64,
    },
    PushFinished {
        transfer_id: String,
        task_id: String,
        result: Result<(), TransferError>,
    },
    Close {
        code: ErrorCode,
        reason: String,
    },
}

/// Monotonic clock reading that follows tokio's (pausable) clock.
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

pub(crate) struct Session {
    server_id: String,
    conn_id: u64,
    state: SessionState,
    shared: Arc<Shared>,
    outbox: Outbox,
    table: TransferTable,
    monitor: HeartbeatMonitor,
    auth_failures: u32,
    /// Cancels the write pump and in-flight pushes.
    cancel: CancellationToken,
    closed: CancellationToken,
    commands_tx: mpsc::Sender<SessionCommand>,
    pushes: HashMap<String, CancellationToken>,
}

impl Session {
    pub fn new(
        server_id: String,
        conn_id: u64,
        shared: Arc<Shared>,
        outbox: Outbox,
        cancel: CancellationToken,
        closed: CancellationToken,
        commands_tx: mpsc::Sender<SessionCommand>,
    ) -> Self {
        let config = &shared.config;
        let table = TransferTable::new(TableConfig {
            policy: config.policy.clone(),
            max_file_size: config.max_file_size,
            idle_timeout: config.transfer_idle_timeout,
            retention: config.completed_retention,
            staging_dir: Some(shared.store.dir().join(".staging")),
        });
        let monitor = HeartbeatMonitor::new(config.heartbeat_interval, now());
        Self {
            server_id,
            conn_id,
            state: SessionState::Connected,
            shared,
            outbox,
            table,
            monitor,
            auth_failures: 0,
            cancel,
            closed,
            commands_tx,
            pushes: HashMap::new(),
        }
    }

    /// Runs until the connection ends, then tears the session down.
    pub async fn run<R>(
        mut self,
        mut read: R,
        mut commands: mpsc::Receiver<SessionCommand>,
        shutdown: CancellationToken,
    ) where
        R: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        let period = (self.monitor.interval() / 2).max(Duration::from_millis(100));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        let (code, reason) = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    break (ErrorCode::Disconnected, "hub shutting down".to_string());
                }

                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        break (ErrorCode::Disconnected, "command channel closed".to_string());
                    };
                    if let Some(stop) = self.handle_command(cmd).await {
                        break stop;
                    }
                }

                frame = read.next() => match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if let Err(stop) = self.handle_text(&text).await {
                            break stop;
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => {
                        break (ErrorCode::Disconnected, "connection closed by agent".to_string());
                    }
                    Some(Ok(tungstenite::Message::Binary(_))) => {
                        warn!(server_id = %self.server_id, "binary frame ignored");
                    }
                    Some(Ok(_)) => trace!("control frame"),
                    Some(Err(e)) => {
                        break (ErrorCode::Disconnected, format!("read error: {e}"));
                    }
                },

                _ = tick.tick() => {
                    if let Some(stop) = self.on_tick().await {
                        break stop;
                    }
                }
            }
        };

        self.teardown(code, &reason);
    }

    // -----------------------------------------------------------------------
    // Inbound envelopes
    // -----------------------------------------------------------------------

    /// Verifies and dispatches one text frame. `Err` ends the session.
    async fn handle_text(&mut self, text: &str) -> Result<(), (ErrorCode, String)> {
        let now_unix = unix_now();
        let env = match Envelope::parse(text) {
            Ok(env) => env,
            Err(e) => {
                warn!(server_id = %self.server_id, "malformed envelope: {e}");
                self.reply_error(ErrorCode::InvalidPayload, &format!("malformed envelope: {e}"), "", "")
                    .await;
                return Ok(());
            }
        };

        let config = &self.shared.config;
        if let Err(e) = env.verify(&self.shared.secret, now_unix, config.signature_window) {
            self.auth_failures += 1;
            warn!(
                server_id = %self.server_id,
                msg_id = %env.msg_id,
                failures = self.auth_failures,
                "rejected envelope: {e}"
            );
            if self.auth_failures > config.max_auth_failures {
                return Err((
                    ErrorCode::AuthInvalidSignature,
                    format!("{} consecutive invalid envelopes", self.auth_failures),
                ));
            }
            self.reply_error(ErrorCode::InvalidSignature, &e.to_string(), &env.msg_id, "")
                .await;
            return Ok(());
        }
        self.auth_failures = 0;

        if sanitize_server_id(&env.server_id) != self.server_id {
            warn!(server_id = %self.server_id, claimed = %env.server_id, "sender id mismatch");
            self.reply_error(ErrorCode::InvalidPayload, "server id mismatch", &env.msg_id, "")
                .await;
            return Ok(());
        }

        if !self.shared.replay.seen(&self.server_id, &env.msg_id, now_unix) {
            debug!(server_id = %self.server_id, msg_id = %env.msg_id, "duplicate dropped");
            return Ok(());
        }
        self.monitor.record(now());

        let body = match env.body() {
            Ok(body) => body,
            Err(e) => {
                warn!(server_id = %self.server_id, msg_id = %env.msg_id, "bad payload: {e}");
                self.reply_error(ErrorCode::InvalidPayload, &e.to_string(), &env.msg_id, &env.channel)
                    .await;
                return Ok(());
            }
        };
        self.dispatch(&env, body).await;
        Ok(())
    }

    async fn dispatch(&mut self, env: &Envelope, body: Body) {
        match body {
            Body::Heartbeat => {
                trace!(server_id = %self.server_id, "heartbeat");
                self.send(&Body::HeartbeatAck, "").await;
            }
            Body::HeartbeatAck | Body::Ack(_) => {}
            Body::FileChunk(chunk) => {
                let result = self.table.accept_chunk(&chunk, &env.channel, now());
                self.on_transfer(env, &chunk.transfer_id, &chunk.file_name, result)
                    .await;
            }
            Body::FileComplete(complete) => {
                let result = self.table.accept_complete(&complete, &env.channel, now());
                self.on_transfer(env, &complete.transfer_id, &complete.file_name, result)
                    .await;
            }
            Body::FileNotice(notice) => self.on_file_notice(env, notice).await,
            Body::TaskResult(result) => self.on_task_result(env, result),
            Body::Error(err) => {
                warn!(
                    server_id = %self.server_id,
                    code = %err.code,
                    ref_msg_id = %err.ref_msg_id,
                    "agent reported error: {}",
                    err.message
                );
            }
            Body::Auth(_) | Body::AuthAck(_) => {
                self.reply_error(
                    ErrorCode::InvalidPayload,
                    &format!("unexpected {}", env.msg_type),
                    &env.msg_id,
                    &env.channel,
                )
                .await;
            }
        }
    }

    async fn on_transfer(
        &mut self,
        env: &Envelope,
        transfer_id: &str,
        file_name: &str,
        result: Result<ChunkOutcome, TransferError>,
    ) {
        match result {
            Ok(ChunkOutcome::Progress {
                started: true,
                total,
                ..
            }) => self.upload_started(&env.channel, transfer_id, file_name, total),
            Ok(ChunkOutcome::Progress { .. }) => {}
            Ok(ChunkOutcome::Completed(file)) => {
                if file.started {
                    self.upload_started(&env.channel, transfer_id, file_name, file.size);
                }
                self.store_completed(env, file).await
            }
            Ok(ChunkOutcome::AlreadyComplete) => {
                debug!(server_id = %self.server_id, transfer_id, "transfer already complete");
                self.send(&Body::ack(&env.msg_id), &env.channel).await;
            }
            Ok(ChunkOutcome::Ignored) => {
                debug!(server_id = %self.server_id, transfer_id, "input for failed transfer ignored");
            }
            Err(err) => self.inbound_failed(env, transfer_id, file_name, err).await,
        }
    }

    fn upload_started(&self, channel: &str, transfer_id: &str, file_name: &str, size: u64) {
        info!(server_id = %self.server_id, transfer_id, file = file_name, size, "upload started");
        emit(
            &self.shared.events,
            BridgeEvent::UploadStarted {
                server_id: self.server_id.clone(),
                channel: channel.to_string(),
                file_name: file_name.to_string(),
                size,
            },
        );
    }

    async fn store_completed(&mut self, env: &Envelope, file: CompletedFile) {
        let CompletedFile {
            transfer_id,
            file_name,
            size,
            sha256,
            channel,
            content,
            ..
        } = file;
        match self
            .shared
            .store
            .adopt(&file_name, content, size, &sha256, 1)
            .await
        {
            Ok(meta) => {
                self.file_received(&channel, meta.file_id, meta.file_name, size, sha256, meta.path);
                self.send(&Body::ack(&env.msg_id), &env.channel).await;
            }
            Err(e) => {
                warn!(server_id = %self.server_id, transfer_id = %transfer_id, "failed to store file: {e}");
                let err = TransferError::Io(std::io::Error::other(e.to_string()));
                self.inbound_failed(env, &transfer_id, &file_name, err).await;
            }
        }
    }

    fn file_received(
        &self,
        channel: &str,
        file_id: String,
        file_name: String,
        size: u64,
        sha256: String,
        path: std::path::PathBuf,
    ) {
        info!(
            server_id = %self.server_id,
            file_id = %file_id,
            file = %file_name,
            size,
            "file received"
        );
        emit(
            &self.shared.events,
            BridgeEvent::FileReceived(ReceivedFile {
                channel: channel.to_string(),
                sender: self.server_id.clone(),
                file_id,
                file_name,
                size,
                sha256,
                path,
            }),
        );
    }

    async fn inbound_failed(
        &mut self,
        env: &Envelope,
        transfer_id: &str,
        file_name: &str,
        err: TransferError,
    ) {
        let code = err.code();
        warn!(server_id = %self.server_id, transfer_id, file = file_name, code = %code, "inbound transfer failed: {err}");
        self.reply_error(code, &err.to_string(), &env.msg_id, &env.channel)
            .await;
        emit(
            &self.shared.events,
            BridgeEvent::TransferFailed {
                server_id: self.server_id.clone(),
                channel: env.channel.clone(),
                transfer_id: transfer_id.to_string(),
                file_name: file_name.to_string(),
                code,
                message: err.to_string(),
            },
        );
    }

    async fn on_file_notice(&mut self, env: &Envelope, notice: FileNotice) {
        let transfer_id = notice
            .transfer_id
            .clone()
            .unwrap_or_else(|| env.msg_id.clone());
        let decl = TransferDeclaration::new(&notice.file_name, notice.size, &notice.sha256);
        let task_id = notice.task_id.as_deref();

        if let Some(data) = &notice.data {
            let result =
                self.table
                    .accept_inline(&transfer_id, decl, data, &env.channel, task_id, now());
            self.on_transfer(env, &transfer_id, &notice.file_name, result)
                .await;
        } else if let Some(file_id) = &notice.file_id {
            let Some(meta) = self.shared.store.get(file_id) else {
                let err = TransferError::NotFound(format!("file id {file_id}"));
                self.inbound_failed(env, &transfer_id, &notice.file_name, err)
                    .await;
                return;
            };
            let result =
                self.table
                    .accept_file(&transfer_id, decl, &meta.path, &env.channel, task_id, now());
            match result {
                Ok(ChunkOutcome::Completed(file)) => {
                    self.upload_started(&env.channel, &transfer_id, &notice.file_name, file.size);
                    self.file_received(
                        &file.channel,
                        meta.file_id,
                        meta.file_name,
                        file.size,
                        file.sha256,
                        meta.path,
                    );
                    self.send(&Body::ack(&env.msg_id), &env.channel).await;
                }
                Err(err) => {
                    // Unverified content must not stay downloadable.
                    if let Some(bad) = self.shared.store.remove(file_id) {
                        let _ = tokio::fs::remove_file(&bad.path).await;
                    }
                    self.inbound_failed(env, &transfer_id, &notice.file_name, err)
                        .await;
                }
                other => {
                    self.on_transfer(env, &transfer_id, &notice.file_name, other)
                        .await
                }
            }
        } else if notice.url.is_some() {
            self.reply_error(
                ErrorCode::InvalidPayload,
                "URL notices are only sent by the hub",
                &env.msg_id,
                &env.channel,
            )
            .await;
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

    fn on_task_result(&mut self, env: &Envelope, result: TaskResult) {
        let handled = !result.task_id.is_empty()
            && self.shared.tasks.resolve_target(
                &result.task_id,
                &self.server_id,
                result.ok,
                result.code,
                &result.message,
            );
        if handled {
            debug!(server_id = %self.server_id, task_id = %result.task_id, "task result applied");
            return;
        }
        debug!(server_id = %self.server_id, task_id = %result.task_id, "forwarding agent report");
        emit(
            &self.shared.events,
            BridgeEvent::AgentReport {
                server_id: self.server_id.clone(),
                channel: env.channel.clone(),
                report: result,
            },
        );
    }

    // -----------------------------------------------------------------------
    // Commands and outbound pushes
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: SessionCommand) -> Option<(ErrorCode, String)> {
        match cmd {
            SessionCommand::Push(job) => self.start_push(job),
            SessionCommand::PushProgress { transfer_id, bytes } => {
                self.table.outbound_progress(&transfer_id, bytes, now());
            }
            SessionCommand::PushFinished {
                transfer_id,
                task_id,
                result,
            } => self.push_finished(&transfer_id, &task_id, result),
            SessionCommand::Close { code, reason } => return Some((code, reason)),
        }
        None
    }

    fn start_push(&mut self, job: PushJob) {
        let decl = TransferDeclaration::new(&job.file.file_name, job.file.size, &job.file.sha256);
        self.table
            .begin_outbound(&job.transfer_id, decl, Some(&job.task_id), now());
        info!(
            server_id = %self.server_id,
            transfer_id = %job.transfer_id,
            task_id = %job.task_id,
            file = %job.file.file_name,
            route = ?job.route,
            "push started"
        );

        let cancel = self.cancel.child_token();
        self.pushes.insert(job.transfer_id.clone(), cancel.clone());
        let outbox = self.outbox.clone();
        let commands = self.commands_tx.clone();
        let chunk_size = self.shared.config.chunk_size;
        tokio::spawn(async move {
            let progress_tx = commands.clone();
            let transfer_id = job.transfer_id.clone();
            let report = |bytes: u64| {
                let _ = progress_tx.try_send(SessionCommand::PushProgress {
                    transfer_id: transfer_id.clone(),
                    bytes,
                });
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(TransferError::Aborted(ErrorCode::Disconnected)),
                r = push::deliver(&job, &outbox, chunk_size, report) => r,
            };
            let _ = commands
                .send(SessionCommand::PushFinished {
                    transfer_id: job.transfer_id,
                    task_id: job.task_id,
                    result,
                })
                .await;
        });
    }

    fn push_finished(
        &mut self,
        transfer_id: &str,
        task_id: &str,
        result: Result<(), TransferError>,
    ) {
        self.pushes.remove(transfer_id);
        let tasks = &self.shared.tasks;
        match result {
            Ok(()) => {
                self.table.finish_outbound(transfer_id, now());
                if self.shared.config.delivery == DeliveryPolicy::FireAndForget {
                    tasks.resolve_target(task_id, &self.server_id, true, 0, "delivered");
                }
            }
            Err(err) => {
                warn!(server_id = %self.server_id, transfer_id, task_id, "push failed: {err}");
                self.table
                    .fail(transfer_id, err.code(), &err.to_string(), now());
                tasks.resolve_target(
                    task_id,
                    &self.server_id,
                    false,
                    err.code().as_u16(),
                    &err.to_string(),
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Timers and teardown
    // -----------------------------------------------------------------------

    async fn on_tick(&mut self) -> Option<(ErrorCode, String)> {
        let at = now();
        match self.monitor.check(at) {
            Liveness::Dead => {
                self.state = SessionState::Dead;
                warn!(server_id = %self.server_id, "heartbeat timeout");
                return Some((
                    ErrorCode::HeartbeatTimeout,
                    format!("no heartbeat for {}s", self.monitor.timeout().as_secs()),
                ));
            }
            Liveness::Late { missed } => {
                debug!(server_id = %self.server_id, missed, "heartbeat late");
            }
            Liveness::Alive => {}
        }

        for failed in self.table.sweep(at) {
            self.transfer_swept(failed).await;
        }
        None
    }

    async fn transfer_swept(&mut self, failed: FailedTransfer) {
        match failed.direction {
            Direction::Outbound => {
                if let Some(token) = self.pushes.remove(&failed.transfer_id) {
                    token.cancel();
                }
                if let Some(task_id) = &failed.task_id {
                    self.shared.tasks.resolve_target(
                        task_id,
                        &self.server_id,
                        false,
                        failed.code.as_u16(),
                        &failed.message,
                    );
                }
            }
            Direction::Inbound => {
                self.reply_error(failed.code, &failed.message, "", "").await;
                emit(
                    &self.shared.events,
                    BridgeEvent::TransferFailed {
                        server_id: self.server_id.clone(),
                        channel: String::new(),
                        transfer_id: failed.transfer_id,
                        file_name: failed.file_name,
                        code: failed.code,
                        message: failed.message,
                    },
                );
            }
        }
    }

    fn teardown(mut self, code: ErrorCode, reason: &str) {
        info!(server_id = %self.server_id, state = ?self.state, code = %code, reason, "closing session");
        self.state = SessionState::Closing;

        if code != ErrorCode::Disconnected {
            let _ = self.outbox.try_send(&Body::error(code, reason, ""), "");
        }

        let at = now();
        for failed in self.table.abort_all(code, at) {
            if failed.direction == Direction::Inbound {
                emit(
                    &self.shared.events,
                    BridgeEvent::TransferFailed {
                        server_id: self.server_id.clone(),
                        channel: String::new(),
                        transfer_id: failed.transfer_id,
                        file_name: failed.file_name,
                        code: failed.code,
                        message: failed.message,
                    },
                );
            }
        }
        for (_, token) in self.pushes.drain() {
            token.cancel();
        }
        let task_code = if code == ErrorCode::Superseded {
            ErrorCode::Superseded
        } else {
            ErrorCode::Disconnected
        };
        self.shared
            .tasks
            .fail_server(&self.server_id, task_code, reason);

        self.shared.registry.remove_if(&self.server_id, self.conn_id);
        self.cancel.cancel();
        self.state = SessionState::Closed;
        debug!(server_id = %self.server_id, state = ?self.state, "session closed");
        emit(
            &self.shared.events,
            BridgeEvent::Disconnected {
                server_id: self.server_id.clone(),
                code,
                reason: reason.to_string(),
            },
        );
        self.closed.cancel();
    }

    // -----------------------------------------------------------------------
    // Outbound helpers
    // -----------------------------------------------------------------------

    async fn send(&self, body: &Body, channel: &str) {
        if let Err(e) = self.outbox.send(body, channel).await {
            debug!(server_id = %self.server_id, "send failed: {e}");
        }
    }

    async fn reply_error(&self, code: ErrorCode, message: &str, ref_msg_id: &str, channel: &str) {
        self.send(&Body::error(code, message, ref_msg_id), channel)
            .await;
    }
}
