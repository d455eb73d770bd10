//! Agent connection to the hub.
//!
//! [`AgentClient::connect`] dials the hub, sends a signed AUTH and waits
//! for AUTH_ACK. After that three tasks run per connection: the write pump
//! (sole owner of the socket sink), the heartbeat pump and the read pump
//! that verifies and dispatches everything the hub sends.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use l4d2_bridge_data_channel::ObjectClient;
use l4d2_bridge_protocol::constants::HUB_SENDER_ID;
use l4d2_bridge_protocol::ids::{new_long_id, unix_now};
use l4d2_bridge_protocol::{
    AuthAck, AuthRequest, Body, Envelope, FileChunk, FileComplete, FileNotice, ProtocolError,
    TaskResult,
};
use l4d2_bridge_transfer::{ChunkReader, TransferError, calculate_file_checksum, safe_filename};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ClientError;
use crate::config::{AgentConfig, LargeUpload};
use crate::events::{AgentEvent, AgentEventReceiver, emit};
use crate::link::{Link, SEND_BUFFER_SIZE};
use crate::pumps::heartbeat::heartbeat_pump;
use crate::pumps::read::{PumpContext, ReadPump, staging_dir};
use crate::pumps::write::write_pump;

/// A file handed to the hub by [`AgentClient::send_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFile {
    pub transfer_id: String,
    pub file_name: String,
    pub size: u64,
    pub sha256: String,
    /// Set when the content went through the data channel.
    pub file_id: Option<String>,
}

/// An authenticated connection to the hub.
///
/// Dropping the client closes the connection.
pub struct AgentClient {
    config: Arc<AgentConfig>,
    link: Link,
    objects: Option<Arc<ObjectClient>>,
    server_id: String,
    heartbeat_interval: Duration,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    closed: CancellationToken,
    _read_handle: JoinHandle<()>,
    _write_handle: JoinHandle<()>,
    _heartbeat_handle: JoinHandle<()>,
}

impl AgentClient {
    /// Connects and authenticates.
    ///
    /// Fails with [`ClientError::Timeout`] when no AUTH_ACK arrives within
    /// `auth_timeout`, or [`ClientError::Rejected`] when the hub refuses.
    pub async fn connect(config: AgentConfig) -> Result<(Self, AgentEventReceiver), ClientError> {
        let config = Arc::new(config);
        let objects = match &config.http_url {
            Some(url) => Some(Arc::new(ObjectClient::new(url, &config.token)?)),
            None => None,
        };
        tokio::fs::create_dir_all(staging_dir(&config)).await?;

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.max_message_size);
        ws_config.max_frame_size = Some(config.max_message_size);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(config.ws_url.as_str(), Some(ws_config), false)
                .await?;
        let (write, mut read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel(SEND_BUFFER_SIZE);
        let cancel = CancellationToken::new();
        let write_handle = tokio::spawn(write_pump(write, write_rx, cancel.clone()));

        let secret: Arc<[u8]> = Arc::from(config.token.as_bytes());
        let link = Link::new(write_tx, Arc::clone(&secret), &config.server_id);

        let auth = Body::Auth(AuthRequest {
            server_id: config.server_id.clone(),
            agent_version: config.agent_version.clone(),
        });
        let handshake = async {
            link.send(&auth, "").await?;
            await_auth_ack(&mut read, &secret, &config).await
        };
        let ack = match tokio::time::timeout(config.auth_timeout, handshake).await {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => {
                cancel.cancel();
                let _ = write_handle.await;
                return Err(e);
            }
            Err(_) => {
                cancel.cancel();
                let _ = write_handle.await;
                return Err(ClientError::Timeout);
            }
        };

        let heartbeat_interval = if ack.heartbeat_interval > 0 {
            Duration::from_secs(ack.heartbeat_interval)
        } else {
            config.heartbeat_interval
        };
        info!(
            server_id = %ack.accepted_server,
            heartbeat = ?heartbeat_interval,
            "connected to hub"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        emit(
            &events_tx,
            AgentEvent::Connected {
                server_id: ack.accepted_server.clone(),
                heartbeat_interval,
            },
        );

        let connected = Arc::new(AtomicBool::new(true));
        let closed = CancellationToken::new();
        let heartbeat_handle = tokio::spawn(heartbeat_pump(
            link.clone(),
            heartbeat_interval,
            cancel.clone(),
        ));
        let pump = ReadPump::new(
            PumpContext {
                config: Arc::clone(&config),
                secret,
                link: link.clone(),
                events: events_tx,
                objects: objects.clone(),
                connected: Arc::clone(&connected),
                cancel: cancel.clone(),
                closed: closed.clone(),
            },
            heartbeat_interval,
        );
        let read_handle = tokio::spawn(pump.run(read));

        let client = Self {
            config,
            link,
            objects,
            server_id: ack.accepted_server,
            heartbeat_interval,
            connected,
            cancel,
            closed,
            _read_handle: read_handle,
            _write_handle: write_handle,
            _heartbeat_handle: heartbeat_handle,
        };
        Ok((client, events_rx))
    }

    /// The server id as accepted (sanitized) by the hub.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.link.is_closed()
    }

    /// Closes the connection and waits until the disconnect is reported.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        self.closed.cancelled().await;
    }

    /// Sends a file from disk to the hub.
    ///
    /// Small files travel inline in one FILE_NOTICE; larger ones as
    /// FILE_CHUNK envelopes or through the data channel, per
    /// [`LargeUpload`]. Returns once the last envelope is queued.
    pub async fn send_file(&self, path: &Path, channel: &str) -> Result<SentFile, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::Closed);
        }
        let config = &self.config;
        let raw = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name = safe_filename(&raw);
        config.policy.check(&file_name)?;
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|_| TransferError::NotFound(path.display().to_string()))?
            .len();
        if size > config.max_file_size {
            return Err(TransferError::TooLarge {
                size,
                limit: config.max_file_size,
            }
            .into());
        }
        let hash_path = path.to_path_buf();
        let sha256 = tokio::task::spawn_blocking(move || calculate_file_checksum(&hash_path))
            .await
            .map_err(std::io::Error::other)??;

        let mut sent = SentFile {
            transfer_id: new_long_id(),
            file_name,
            size,
            sha256,
            file_id: None,
        };
        let mut notice = FileNotice::named(&sent.file_name, size, &sent.sha256);
        notice.transfer_id = Some(sent.transfer_id.clone());

        if size <= config.inline_threshold {
            notice.data = Some(tokio::fs::read(path).await?);
            self.link.send(&Body::FileNotice(notice), channel).await?;
        } else {
            match config.large_upload {
                LargeUpload::ObjectStore => {
                    let objects = self.objects.as_ref().ok_or(ClientError::NoDataChannel)?;
                    let meta = objects.upload(path, &sent.file_name).await?;
                    notice.file_id = Some(meta.file_id.clone());
                    sent.file_id = Some(meta.file_id);
                    self.link.send(&Body::FileNotice(notice), channel).await?;
                }
                LargeUpload::Chunked => self.send_chunks(path, &sent, channel).await?,
            }
        }
        info!(
            transfer_id = %sent.transfer_id,
            file = %sent.file_name,
            size,
            "file sent to hub"
        );
        Ok(sent)
    }

    async fn send_chunks(
        &self,
        path: &Path,
        sent: &SentFile,
        channel: &str,
    ) -> Result<(), ClientError> {
        let mut reader = ChunkReader::new(path, self.config.chunk_size)?;
        let count = reader.chunk_count();
        loop {
            let (back, next) = tokio::task::spawn_blocking(move || {
                let next = reader.next_chunk();
                (reader, next)
            })
            .await
            .map_err(std::io::Error::other)?;
            reader = back;
            let Some(chunk) = next? else { break };
            let body = Body::FileChunk(FileChunk {
                transfer_id: sent.transfer_id.clone(),
                sequence: chunk.sequence,
                chunk_count: count,
                offset: chunk.offset,
                data: chunk.data,
                file_name: sent.file_name.clone(),
                total_size: sent.size,
                sha256: sent.sha256.clone(),
                task_id: None,
            });
            self.link.send(&body, channel).await?;
        }
        let complete = Body::FileComplete(FileComplete {
            transfer_id: sent.transfer_id.clone(),
            file_name: sent.file_name.clone(),
            total_size: sent.size,
            sha256: sent.sha256.clone(),
            task_id: None,
        });
        self.link.send(&complete, channel).await?;
        Ok(())
    }

    /// Reports the outcome of a hub task, e.g. a link offered with
    /// [`AgentEvent::FileOffered`].
    pub async fn report_result(
        &self,
        task_id: &str,
        ok: bool,
        code: u16,
        message: &str,
    ) -> Result<(), ClientError> {
        self.report(TaskResult {
            task_id: task_id.to_string(),
            ok,
            code,
            message: message.to_string(),
            extra: serde_json::Map::new(),
        })
        .await
    }

    /// Sends a full TASK_RESULT, extra fields included.
    pub async fn report(&self, result: TaskResult) -> Result<(), ClientError> {
        debug!(task_id = %result.task_id, ok = result.ok, "reporting task result");
        self.link.send(&Body::TaskResult(result), "").await?;
        Ok(())
    }

    /// Directory received files are written to.
    pub fn download_dir(&self) -> &Path {
        &self.config.download_dir
    }
}

impl Drop for AgentClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reads frames until the hub answers the AUTH.
async fn await_auth_ack<S>(
    read: &mut S,
    secret: &[u8],
    config: &AgentConfig,
) -> Result<AuthAck, ClientError>
where
    S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        let text = match read.next().await {
            Some(Ok(tungstenite::Message::Text(text))) => text,
            Some(Ok(tungstenite::Message::Close(_))) | None => return Err(ClientError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };
        let env = Envelope::parse(&text)?;
        if let Err(e) = env.verify(secret, unix_now(), config.signature_window) {
            // A refusal is signed with the hub's token, which is not ours
            // when the token itself was the problem.
            if let Ok(Body::Error(err)) = env.body() {
                return Err(ClientError::Rejected {
                    code: err.code,
                    message: err.message,
                });
            }
            return Err(ProtocolError::from(e).into());
        }
        if env.server_id != HUB_SENDER_ID {
            warn!(sender = %env.server_id, "handshake frame not from the hub, ignored");
            continue;
        }
        match env.body()? {
            Body::AuthAck(ack) => return Ok(ack),
            Body::Error(err) => {
                return Err(ClientError::Rejected {
                    code: err.code,
                    message: err.message,
                });
            }
            other => debug!(msg_type = %other.message_type(), "ignored before AUTH_ACK"),
        }
    }
}
