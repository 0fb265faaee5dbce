use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use crate::config::RpcConfig;
use crate::connection::{CloseStatus, Connection, ConnectionState, Incoming};
use crate::send_queue::{OutFrame, QueuedSend, SendQueue};

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dial an RPC server. The `setup` callback runs before any traffic
/// flows, so local bindings installed there observe every request the
/// peer sends. The connection closes when either side closes or the
/// socket fails; there is no reconnection.
pub async fn connect<F, Fut>(url: &str, config: &RpcConfig, setup: F) -> anyhow::Result<Arc<Connection>>
where
    F: FnOnce(Arc<Connection>) -> Fut,
    Fut: Future<Output = ()>,
{
    let (socket, _response) = connect_async(url).await?;
    debug!(url, "websocket connected");

    let (queue, out_rx) = SendQueue::new();
    let connection = Connection::new(HashMap::new(), queue, config.max_message_size);

    let (ws_tx, ws_rx) = socket.split();
    tokio::spawn(send_pump(ws_tx, out_rx));

    // bindings install here; no frame is read until the callback is done
    setup(connection.clone()).await;
    connection.fire_open();

    let conn = connection.clone();
    tokio::spawn(async move {
        read_loop(&conn, ws_rx).await;
        conn.close(CloseStatus::Normal, "").await;
        debug!(conn_id = %conn.id(), "client connection finished");
    });

    Ok(connection)
}

async fn send_pump(mut sink: SplitSink<ClientSocket, Message>, mut out_rx: UnboundedReceiver<QueuedSend>) {
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
                    code: CloseCode::from(status.code()),
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                let _ = item.ack.send(true);
                break;
            }
        }
    }
}

async fn read_loop(connection: &Arc<Connection>, mut ws_rx: SplitStream<ClientSocket>) {
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
            _ => {}
        }
        if connection.state() == ConnectionState::Closed {
            return;
        }
    }
}
