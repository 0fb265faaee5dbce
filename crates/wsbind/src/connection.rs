use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

use crate::send_queue::{OutFrame, SendQueue};
use crate::util;

/// WebSocket close codes used by the RPC layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    Normal,
    MessageTooBig,
    InternalError,
}

impl CloseStatus {
    pub fn code(self) -> u16 {
        match self {
            CloseStatus::Normal => 1000,
            CloseStatus::MessageTooBig => 1009,
            CloseStatus::InternalError => 1011,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// The peer initiated a close; our own close is still outstanding.
    CloseReceived,
    Closed,
}

/// One inbound message as delivered to `receive` subscribers.
#[derive(Debug, Clone)]
pub enum Incoming {
    Text(String),
    Binary(Vec<u8>),
}

impl Incoming {
    pub fn len(&self) -> usize {
        match self {
            Incoming::Text(text) => text.len(),
            Incoming::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Incoming::Text(_))
    }
}

type OpenHandler = Arc<dyn Fn() + Send + Sync>;
type ReceiveHandler = Arc<dyn Fn(&Incoming) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;
type CloseHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    open: Vec<OpenHandler>,
    receive: Vec<ReceiveHandler>,
    error: Vec<ErrorHandler>,
    close: Vec<CloseHandler>,
}

/// One established WebSocket link. Owns the send queue and the event
/// subscriber lists; the socket itself lives in the server or client
/// pump driving this connection.
///
/// Subscribers are invoked on snapshots, and the whole set is cleared
/// exactly once at close, so a late handler is never called.
pub struct Connection {
    id: String,
    cookies: HashMap<String, String>,
    state: Mutex<ConnectionState>,
    subscribers: Mutex<Subscribers>,
    queue: SendQueue,
    max_message_size: usize,
}

impl Connection {
    pub(crate) fn new(cookies: HashMap<String, String>, queue: SendQueue, max_message_size: usize) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            cookies,
            state: Mutex::new(ConnectionState::Open),
            subscribers: Mutex::new(Subscribers::default()),
            queue,
            max_message_size,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request cookies captured at handshake time; empty for outbound
    /// (client) connections.
    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    pub fn state(&self) -> ConnectionState {
        *util::lock(&self.state)
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    // --- subscriptions ---

    pub fn on_open(&self, handler: impl Fn() + Send + Sync + 'static) {
        if self.state() != ConnectionState::Closed {
            util::lock(&self.subscribers).open.push(Arc::new(handler));
        }
    }

    pub fn on_receive(&self, handler: impl Fn(&Incoming) + Send + Sync + 'static) {
        if self.state() != ConnectionState::Closed {
            util::lock(&self.subscribers).receive.push(Arc::new(handler));
        }
    }

    pub fn on_error(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        if self.state() != ConnectionState::Closed {
            util::lock(&self.subscribers).error.push(Arc::new(handler));
        }
    }

    pub fn on_close(&self, handler: impl Fn() + Send + Sync + 'static) {
        if self.state() != ConnectionState::Closed {
            util::lock(&self.subscribers).close.push(Arc::new(handler));
        }
    }

    // --- operations ---

    /// Queue one text frame. Returns `false` when the connection is not
    /// open or the send did not complete; a frame at or over the size
    /// limit closes the connection with [`CloseStatus::MessageTooBig`].
    pub async fn send_text(&self, data: &str) -> bool {
        if self.state() != ConnectionState::Open {
            return false;
        }
        if data.len() >= self.max_message_size {
            debug!(conn_id = %self.id, size = data.len(), "outbound frame over the message limit");
            self.close(CloseStatus::MessageTooBig, "message too big").await;
            return false;
        }
        self.queue.enqueue(OutFrame::Text(data.to_string())).await
    }

    /// Close the connection. The first caller wins: it sends the
    /// outbound close (best effort), fires the `close` notification
    /// exactly once, and clears every subscriber list. Later calls
    /// return immediately.
    pub async fn close(&self, status: CloseStatus, reason: &str) {
        {
            let mut state = util::lock(&self.state);
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }
        debug!(conn_id = %self.id, code = status.code(), reason, "closing connection");
        let _ = self
            .queue
            .enqueue(OutFrame::Close {
                status,
                reason: reason.to_string(),
            })
            .await;
        let remaining = std::mem::take(&mut *util::lock(&self.subscribers));
        for handler in &remaining.close {
            handler();
        }
    }

    // --- pump-side entry points ---

    pub(crate) fn fire_open(&self) {
        let handlers: Vec<OpenHandler> = util::lock(&self.subscribers).open.clone();
        for handler in handlers {
            handler();
        }
    }

    /// Route one inbound frame from the socket pump: enforce the size
    /// limit, then hand it to `receive` subscribers. Returns `false`
    /// when the read loop should stop.
    pub(crate) async fn accept_frame(&self, incoming: Incoming) -> bool {
        if incoming.len() >= self.max_message_size {
            debug!(conn_id = %self.id, size = incoming.len(), "inbound frame over the message limit");
            self.close(CloseStatus::MessageTooBig, "message too big").await;
            return false;
        }
        if self.state() != ConnectionState::Open {
            return false;
        }
        let handlers: Vec<ReceiveHandler> = util::lock(&self.subscribers).receive.clone();
        for handler in handlers {
            handler(&incoming);
        }
        true
    }

    /// The peer sent a Close frame.
    pub(crate) async fn handle_close_frame(&self) {
        {
            let mut state = util::lock(&self.state);
            if *state == ConnectionState::Open {
                *state = ConnectionState::CloseReceived;
            }
        }
        self.close(CloseStatus::Normal, "").await;
    }

    /// The socket read path failed; report it, then drop the link.
    pub(crate) async fn handle_socket_error(&self, message: &str) {
        debug!(conn_id = %self.id, error = %message, "socket error");
        let handlers: Vec<ErrorHandler> = util::lock(&self.subscribers).error.clone();
        for handler in handlers {
            handler(message);
        }
        self.close(CloseStatus::InternalError, message).await;
    }
}
