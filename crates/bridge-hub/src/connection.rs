use bridge_core::WireMessage;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::warn;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(WireMessage),
    Ping,
    Close { code: u16, reason: String },
}

/// Send/close capability for one transport connection.
///
/// Sends never wait: a full queue means a slow consumer and the message is
/// dropped, which callers treat the same as a closed connection. Closing
/// also raises a flag outside the queue, so a connection stuck behind a full
/// queue still ends.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    conn_id: String,
    sender: mpsc::Sender<Outbound>,
    close_tx: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    pub fn new(conn_id: impl Into<String>, sender: mpsc::Sender<Outbound>) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            conn_id: conn_id.into(),
            sender,
            close_tx: Arc::new(close_tx),
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn send(&self, message: WireMessage) -> bool {
        match self.sender.try_send(Outbound::Message(message)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "send_backpressure", conn_id = %self.conn_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Returns false once the writer is gone.
    pub fn ping(&self) -> bool {
        !matches!(
            self.sender.try_send(Outbound::Ping),
            Err(mpsc::error::TrySendError::Closed(_))
        )
    }

    pub fn close(&self, code: u16, reason: &str) {
        let queued = self.sender.try_send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        if let Err(mpsc::error::TrySendError::Full(_)) = queued {
            warn!(event = "close_frame_dropped", conn_id = %self.conn_id, code, reason);
        }
        self.close_tx.send_replace(true);
    }

    /// True once the writer task is gone.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// True once any holder asked for the connection to close.
    pub fn close_requested(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// Resolves once `close` has been called on any clone of this handle.
    pub async fn closed(&self) {
        let mut rx = self.close_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::protocol::PingPayload;

    #[test]
    fn send_reports_full_and_closed_queues() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new("conn-1", tx);
        assert!(handle.send(WireMessage::Ping(PingPayload { timestamp: 1 })));
        assert!(!handle.send(WireMessage::Ping(PingPayload { timestamp: 2 })));
        assert!(handle.ping(), "a full queue is not a closed connection");

        match rx.try_recv() {
            Ok(Outbound::Message(WireMessage::Ping(payload))) => assert_eq!(payload.timestamp, 1),
            other => panic!("unexpected frame: {other:?}"),
        }
        drop(rx);
        assert!(handle.is_closed());
        assert!(!handle.send(WireMessage::Ping(PingPayload::default())));
        assert!(!handle.ping());
    }

    #[tokio::test]
    async fn close_is_signalled_even_when_queue_is_full() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new("conn-1", tx);
        let reader = handle.clone();
        assert!(handle.send(WireMessage::Ping(PingPayload { timestamp: 1 })));
        assert!(!reader.close_requested());

        handle.close(CLOSE_GOING_AWAY, "dispatch_failed");
        assert!(reader.close_requested());
        assert!(!reader.is_closed(), "writer is still attached");
        tokio::time::timeout(std::time::Duration::from_secs(1), reader.closed())
            .await
            .expect("close observed");
    }
}
