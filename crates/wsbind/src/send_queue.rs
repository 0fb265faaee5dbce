use tokio::sync::{mpsc, oneshot};

use crate::connection::CloseStatus;

/// One outbound WebSocket frame.
#[derive(Debug)]
pub(crate) enum OutFrame {
    Text(String),
    Close { status: CloseStatus, reason: String },
}

pub(crate) struct QueuedSend {
    pub frame: OutFrame,
    /// Resolved by the socket pump after the physical send completes.
    pub ack: oneshot::Sender<bool>,
}

/// Per-connection FIFO send queue. The socket pump is the single
/// consumer, so no two sends ever interleave on one connection; an
/// enqueue's future resolves only once its frame left the wire.
#[derive(Clone)]
pub(crate) struct SendQueue {
    tx: mpsc::UnboundedSender<QueuedSend>,
}

impl SendQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueuedSend>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue a frame and wait for the pump to transmit it. Resolves
    /// `false` once the pump is gone: the connection is closed.
    pub async fn enqueue(&self, frame: OutFrame) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(QueuedSend { frame, ack: ack_tx }).is_err() {
            return false;
        }
        ack_rx.await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_leave_in_enqueue_order() {
        let (queue, mut rx) = SendQueue::new();

        let pump = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(item) = rx.recv().await {
                if let OutFrame::Text(text) = item.frame {
                    seen.push(text);
                }
                let _ = item.ack.send(true);
                if seen.len() == 3 {
                    break;
                }
            }
            seen
        });

        assert!(queue.enqueue(OutFrame::Text("a".into())).await);
        assert!(queue.enqueue(OutFrame::Text("b".into())).await);
        assert!(queue.enqueue(OutFrame::Text("c".into())).await);

        assert_eq!(pump.await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn enqueue_after_pump_exit_resolves_false() {
        let (queue, rx) = SendQueue::new();
        drop(rx);
        assert!(!queue.enqueue(OutFrame::Text("late".into())).await);
    }
}
