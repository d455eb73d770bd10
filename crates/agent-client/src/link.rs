//! Signed outbound queue towards the hub.

use std::sync::Arc;

use l4d2_bridge_protocol::{Body, Envelope};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::trace;

use crate::ClientError;

/// Outbound queue depth. Bounds the chunks buffered ahead of the socket.
pub const SEND_BUFFER_SIZE: usize = 64;

/// Signs envelopes as this agent and queues them for the write pump.
#[derive(Debug, Clone)]
pub(crate) struct Link {
    tx: mpsc::Sender<tungstenite::Message>,
    secret: Arc<[u8]>,
    server_id: Arc<str>,
}

impl Link {
    pub fn new(
        tx: mpsc::Sender<tungstenite::Message>,
        secret: Arc<[u8]>,
        server_id: &str,
    ) -> Self {
        Self {
            tx,
            secret,
            server_id: Arc::from(server_id),
        }
    }

    /// Signs and queues `body`, returning the envelope's message id.
    pub async fn send(&self, body: &Body, channel: &str) -> Result<String, ClientError> {
        let env = Envelope::signed(body, &*self.server_id, channel, &self.secret)?;
        let json = env.to_json()?;
        trace!(msg_type = %env.msg_type, msg_id = %env.msg_id, "queueing envelope");
        self.tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| ClientError::Closed)?;
        Ok(env.msg_id)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
