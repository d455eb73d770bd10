//! Heartbeat pump: the agent is the probing side.

use std::time::Duration;

use l4d2_bridge_protocol::Body;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::link::Link;

/// Sends a signed HEARTBEAT every `interval` until cancelled or the
/// outbound queue closes. Liveness is judged by the read pump, which sees
/// the acknowledgements.
pub(crate) async fn heartbeat_pump(link: Link, interval: Duration, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(interval);
    tick.tick().await; // AUTH_ACK just proved liveness.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                trace!("sending heartbeat");
                if link.send(&Body::Heartbeat, "").await.is_err() {
                    debug!("heartbeat pump: queue closed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use l4d2_bridge_protocol::{Envelope, MessageType};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite;

    #[tokio::test(start_paused = true)]
    async fn sends_one_heartbeat_per_interval() {
        let (tx, mut rx) = mpsc::channel(16);
        let link = Link::new(tx, Arc::from(&b"k"[..]), "srv1");
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(heartbeat_pump(link, Duration::from_secs(15), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(46)).await;
        cancel.cancel();
        handle.await.unwrap();

        let mut beats = 0;
        while let Ok(tungstenite::Message::Text(t)) = rx.try_recv() {
            assert_eq!(Envelope::parse(&t).unwrap().msg_type, MessageType::Heartbeat);
            beats += 1;
        }
        assert_eq!(beats, 3);
    }

    #[tokio::test]
    async fn stops_on_cancel() {
        let (tx, _rx) = mpsc::channel(16);
        let link = Link::new(tx, Arc::from(&b"k"[..]), "srv1");
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(heartbeat_pump(link, Duration::from_secs(15), cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");
    }
}
