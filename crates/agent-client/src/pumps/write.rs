//! WebSocket write pump: the only writer of the socket sink.

use futures_util::SinkExt;
use l4d2_bridge_protocol::constants::WS_WRITE_WAIT;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Writes queued frames until cancelled or every sender is gone.
///
/// Frames queued before cancellation are still flushed, so a final
/// TASK_RESULT or ERROR reaches the hub ahead of the close frame. Each
/// send, the flush and the close included, is bounded by [`WS_WRITE_WAIT`].
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

    while let Ok(m) = write_rx.try_recv() {
        if !send_timed(&mut write, m).await {
            cancel.cancel();
            return;
        }
    }
    debug!("write pump closing socket");
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
