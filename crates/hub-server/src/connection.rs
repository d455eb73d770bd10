//! Socket plumbing shared by the handshake and the session worker.

use std::sync::Arc;

use futures_util::SinkExt;
use l4d2_bridge_protocol::constants::{HUB_SENDER_ID, WS_WRITE_WAIT};
use l4d2_bridge_protocol::{Body, Envelope, ProtocolError};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

/// Outbound queue depth per session. One queued chunk is at most one
/// encoded FILE_CHUNK, so this bounds buffered memory per session.
pub const SEND_BUFFER_SIZE: usize = 64;

/// Writes queued frames to the socket until cancelled or the queue closes.
///
/// A close frame is sent on the way out. Every send is bounded by
/// [`WS_WRITE_WAIT`]; a failed or stalled send cancels the session.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                let Some(m) = msg else { break };
                if !send_timed(&mut write, m).await {
                    cancel.cancel();
                    return;
                }
            }
        }
    }

    // Flush what the worker queued before it cancelled (final ERROR frames).
    while let Ok(m) = write_rx.try_recv() {
        if !send_timed(&mut write, m).await {
            cancel.cancel();
            return;
        }
    }
    send_timed(&mut write, tungstenite::Message::Close(None)).await;
}

async fn send_timed<S>(write: &mut S, m: tungstenite::Message) -> bool
where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    match tokio::time::timeout(WS_WRITE_WAIT, write.send(m)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("WebSocket write error: {e}");
            false
        }
        Err(_) => {
            error!("WebSocket write timed out");
            false
        }
    }
}

/// Errors when queueing an envelope.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("connection closed")]
    Closed,
}

/// Signs envelopes as the hub and queues them for the write pump.
#[derive(Debug, Clone)]
pub(crate) struct Outbox {
    tx: mpsc::Sender<tungstenite::Message>,
    secret: Arc<[u8]>,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<tungstenite::Message>, secret: Arc<[u8]>) -> Self {
        Self { tx, secret }
    }

    /// Signs and queues `body`, returning the envelope's message id.
    pub async fn send(&self, body: &Body, channel: &str) -> Result<String, SendError> {
        let env = Envelope::signed(body, HUB_SENDER_ID, channel, &self.secret)?;
        let json = env.to_json()?;
        trace!(msg_type = %env.msg_type, msg_id = %env.msg_id, "queueing envelope");
        self.tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| SendError::Closed)?;
        Ok(env.msg_id)
    }

    /// Non-blocking variant for teardown paths.
    pub fn try_send(&self, body: &Body, channel: &str) -> Result<(), SendError> {
        let env = Envelope::signed(body, HUB_SENDER_ID, channel, &self.secret)?;
        let json = env.to_json()?;
        self.tx
            .try_send(tungstenite::Message::Text(json.into()))
            .map_err(|_| SendError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
