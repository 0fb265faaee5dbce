use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use axum::{
    Router,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, Uri, header::COOKIE},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use futures::stream::{SplitSink, SplitStream};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::connection::{CloseStatus, Connection, ConnectionState, Incoming};
use crate::registry::BinderRegistry;
use crate::send_queue::{OutFrame, QueuedSend, SendQueue};
use crate::util;

/// Handshake state captured at upgrade time and handed to the connect
/// callback, so applications can make identity or routing decisions
/// before any traffic flows.
#[derive(Debug, Clone)]
pub struct HandshakeContext {
    pub uri: String,
    pub cookies: HashMap<String, String>,
}

type BoxFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type ConnectCallback = Arc<dyn Fn(Arc<Connection>, HandshakeContext) -> BoxFut<()> + Send + Sync>;

/// WebSocket acceptor. Upgrades inbound connections, invokes the
/// application's connect callback (bindings install here, before the
/// first read), runs the socket pumps, and closes every live
/// connection on shutdown.
pub struct RpcServer {
    config: ServerConfig,
    registry: Arc<BinderRegistry>,
    on_connect: ConnectCallback,
    connections: Mutex<Vec<Arc<Connection>>>,
    shutdown: Notify,
}

impl RpcServer {
    pub fn new<F, Fut>(config: ServerConfig, registry: Arc<BinderRegistry>, on_connect: F) -> Arc<Self>
    where
        F: Fn(Arc<Connection>, HandshakeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Arc::new(Self {
            config,
            registry,
            on_connect: Arc::new(move |connection, ctx| Box::pin(on_connect(connection, ctx))),
            connections: Mutex::new(Vec::new()),
            shutdown: Notify::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BinderRegistry> {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        util::lock(&self.connections).len()
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(&self.config.path, axum::routing::get(upgrade))
            .with_state(self.clone())
    }

    /// Serve until [`shutdown`](Self::shutdown) is invoked.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, path = %self.config.path, "rpc server listening");
        let app = self.router();
        let stop = self.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.shutdown.notified().await })
            .await?;
        Ok(())
    }

    /// Close every live connection (failing their pending calls), then
    /// stop accepting.
    pub async fn shutdown(&self) {
        let live: Vec<Arc<Connection>> = util::lock(&self.connections).clone();
        info!(count = live.len(), "closing all connections");
        for connection in live {
            connection.close(CloseStatus::Normal, "server shutdown").await;
        }
        self.shutdown.notify_one();
    }

    async fn run_connection(self: Arc<Self>, socket: WebSocket, ctx: HandshakeContext) {
        let (queue, out_rx) = SendQueue::new();
        let connection = Connection::new(ctx.cookies.clone(), queue, self.config.rpc.max_message_size);
        util::lock(&self.connections).push(connection.clone());
        debug!(conn_id = %connection.id(), uri = %ctx.uri, "connection established");

        let (ws_tx, ws_rx) = socket.split();
        let pump = tokio::spawn(send_pump(ws_tx, out_rx));

        // bindings install here; no frame is read until the callback is done
        (self.on_connect)(connection.clone(), ctx).await;
        connection.fire_open();

        read_loop(&connection, ws_rx).await;

        // read side is done; make sure the close notification fired
        connection.close(CloseStatus::Normal, "").await;
        util::lock(&self.connections).retain(|c| c.id() != connection.id());
        let _ = pump.await;
        debug!(conn_id = %connection.id(), "connection finished");
    }
}

async fn upgrade(
    State(server): State<Arc<RpcServer>>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let ctx = HandshakeContext {
        uri: uri.to_string(),
        cookies: parse_cookies(&headers),
    };
    ws.on_upgrade(move |socket| server.run_connection(socket, ctx))
}

fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.split_once('=') {
                cookies.insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }
    cookies
}

/// Outgoing pump: the send queue's single consumer. Stops after a
/// failed send or after transmitting a Close frame.
async fn send_pump(mut sink: SplitSink<WebSocket, Message>, mut out_rx: UnboundedReceiver<QueuedSend>) {
    while let Some(item) = out_rx.recv().await {
        match item.frame {
            OutFrame::Text(text) => {
                let sent = sink.send(Message::Text(text.into())).await.is_ok();
                let _ = item.ack.send(sent);
                if !sent {
                    break;
                }
            }
            OutFrame::Close { status, reason } => {
                let frame = CloseFrame {
                    code: status.code(),
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                let _ = item.ack.send(true);
                break;
            }
        }
    }
}

async fn read_loop(connection: &Arc<Connection>, mut ws_rx: SplitStream<WebSocket>) {
    while let Some(next) = ws_rx.next().await {
        let message = match next {
            Ok(message) => message,
            Err(e) => {
                connection.handle_socket_error(&e.to_string()).await;
                return;
            }
        };
        match message {
            Message::Text(text) => {
                if !connection.accept_frame(Incoming::Text(text.to_string())).await {
                    return;
                }
            }
            Message::Binary(bytes) => {
                if !connection.accept_frame(Incoming::Binary(bytes.to_vec())).await {
                    return;
                }
            }
            Message::Close(_) => {
                connection.handle_close_frame().await;
                return;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
        if connection.state() == ConnectionState::Closed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_parses_into_a_map() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "session=abc123; user=bob".parse().unwrap());
        let cookies = parse_cookies(&headers);
        assert_eq!(cookies.get("session").map(String::as_str), Some("abc123"));
        assert_eq!(cookies.get("user").map(String::as_str), Some("bob"));
    }

    #[test]
    fn malformed_cookie_pairs_are_skipped() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "plain; a=1".parse().unwrap());
        let cookies = parse_cookies(&headers);
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies.get("a").map(String::as_str), Some("1"));
    }
}
