use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;

use wsbind::{
    BinderRegistry, CallError, CloseStatus, Connection, ConnectionState, HandshakeContext, Incoming, Methods,
    RpcConfig, RpcServer, ServerConfig, call_many, call_many_unit, client, proto,
};

async fn start_server<F, Fut>(
    registry: Arc<BinderRegistry>,
    rpc: RpcConfig,
    on_connect: F,
) -> (Arc<RpcServer>, String, JoinHandle<anyhow::Result<()>>)
where
    F: Fn(Arc<Connection>, HandshakeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let config = ServerConfig {
        rpc,
        ..ServerConfig::default()
    };
    let server = RpcServer::new(config, registry, on_connect);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(server.clone().serve(listener));
    (server, format!("ws://{addr}/rpc"), handle)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 5s");
}

struct EchoService;

fn echo_methods() -> Methods {
    Methods::new()
        .unary("echo", |s: String| async move { Ok(s) })
        .binary("add", |a: i64, b: i64| async move { Ok(a + b) })
        .nullary("fail", || async { Err::<(), String>("intentional failure".into()) })
        .unary("slow", |ms: u64| async move {
            sleep(Duration::from_millis(ms)).await;
            Ok("done".to_string())
        })
}

async fn bind_echo(registry: Arc<BinderRegistry>, conn: Arc<Connection>) {
    registry.bind_local(&conn, Arc::new(EchoService), echo_methods()).unwrap();
}

async fn start_echo_server(registry: &Arc<BinderRegistry>) -> (Arc<RpcServer>, String, JoinHandle<anyhow::Result<()>>) {
    let reg = registry.clone();
    start_server(registry.clone(), RpcConfig::default(), move |conn, _ctx| bind_echo(reg.clone(), conn)).await
}

#[tokio::test]
async fn echo_round_trip() {
    let registry = BinderRegistry::new();
    let (_server, url, _serve) = start_echo_server(&registry).await;

    let conn = client::connect(&url, &RpcConfig::default(), |_conn| async {}).await.unwrap();
    let client_registry = BinderRegistry::new();
    let remote = client_registry.bind_remote(&conn, "Echo", Duration::from_secs(5)).unwrap();

    let echoed: String = remote.call_as("echo", vec![json!("hello")]).await.unwrap();
    assert_eq!(echoed, "hello");

    let sum: i64 = remote.call_as("add", vec![json!(2), json!(3)]).await.unwrap();
    assert_eq!(sum, 5);
}

#[tokio::test]
async fn wire_frames_match_the_envelope_contract() {
    let registry = BinderRegistry::new();
    let (_server, url, _serve) = start_echo_server(&registry).await;

    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();
    socket
        .send(Message::Text(r#"{"functionName":"echo","arguments":["hello"],"callId":"1"}"#.into()))
        .await
        .unwrap();

    let reply = loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => break text.to_string(),
            Some(Ok(_)) => continue,
            other => panic!("socket ended early: {other:?}"),
        }
    };
    assert_eq!(reply, r#"{"callId":"1","returnValue":"hello"}"#);
}

#[tokio::test]
async fn dispatch_failures_surface_as_remote_errors() {
    let registry = BinderRegistry::new();
    let (_server, url, _serve) = start_echo_server(&registry).await;

    let conn = client::connect(&url, &RpcConfig::default(), |_conn| async {}).await.unwrap();
    let remote = BinderRegistry::new().bind_remote(&conn, "Echo", Duration::from_secs(5)).unwrap();

    match remote.call("missing", vec![]).await.unwrap_err() {
        CallError::Remote(message) => assert!(message.contains("method not found: missing"), "{message}"),
        other => panic!("unexpected error: {other:?}"),
    }

    match remote.call("fail", vec![]).await.unwrap_err() {
        CallError::Remote(message) => assert!(message.contains("intentional failure"), "{message}"),
        other => panic!("unexpected error: {other:?}"),
    }

    // a string method invoked with an integer argument
    match remote.call("echo", vec![json!(42)]).await.unwrap_err() {
        CallError::Remote(message) => assert!(message.contains("argument 0"), "{message}"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn termination_delay_cancels_and_the_late_reply_is_dropped() {
    let registry = BinderRegistry::new();
    let (_server, url, _serve) = start_echo_server(&registry).await;

    let conn = client::connect(&url, &RpcConfig::default(), |_conn| async {}).await.unwrap();
    let remote = BinderRegistry::new().bind_remote(&conn, "Echo", Duration::from_millis(100)).unwrap();

    let started = Instant::now();
    let err = remote.call("slow", vec![json!(500u64)]).await.unwrap_err();
    assert!(matches!(err, CallError::Cancelled), "{err:?}");
    assert!(started.elapsed() < Duration::from_millis(450));
    assert_eq!(remote.pending_calls(), 0);

    // the eventual reply finds no waiter and the link stays usable
    sleep(Duration::from_millis(600)).await;
    assert_eq!(conn.state(), ConnectionState::Open);
    let echoed: String = remote.call_as("echo", vec![json!("still alive")]).await.unwrap();
    assert_eq!(echoed, "still alive");
}

#[tokio::test]
async fn close_fails_pending_calls() {
    let registry = BinderRegistry::new();
    let (_server, url, _serve) = start_echo_server(&registry).await;

    let conn = client::connect(&url, &RpcConfig::default(), |_conn| async {}).await.unwrap();
    let remote = BinderRegistry::new().bind_remote(&conn, "Echo", Duration::ZERO).unwrap();

    let in_flight = {
        let remote = remote.clone();
        tokio::spawn(async move { remote.call("slow", vec![json!(5_000u64)]).await })
    };
    sleep(Duration::from_millis(100)).await;
    assert_eq!(remote.pending_calls(), 1);

    conn.close(CloseStatus::Normal, "test over").await;
    let outcome = in_flight.await.unwrap();
    assert!(matches!(outcome, Err(CallError::ConnectionClosed)), "{outcome:?}");
    assert_eq!(remote.pending_calls(), 0);
}

#[tokio::test]
async fn non_rpc_frames_pass_through_to_the_application() {
    let registry = BinderRegistry::new();
    let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));

    let reg = registry.clone();
    let seen_in = seen.clone();
    let (_server, url, _serve) = start_server(registry.clone(), RpcConfig::default(), move |conn, _ctx| {
        let registry = reg.clone();
        let seen = seen_in.clone();
        async move {
            registry.bind_local(&conn, Arc::new(EchoService), echo_methods()).unwrap();
            conn.on_receive(move |incoming| {
                if let Incoming::Text(text) = incoming
                    && !proto::is_rpc_message(text)
                {
                    seen.lock().unwrap().push(text.clone());
                }
            });
        }
    })
    .await;

    let conn = client::connect(&url, &RpcConfig::default(), |_conn| async {}).await.unwrap();
    assert!(conn.send_text("hello, opaque world").await);

    // rpc keeps working on the same connection, and by the time the
    // reply is back the earlier frame has been delivered in order
    let remote = BinderRegistry::new().bind_remote(&conn, "Echo", Duration::from_secs(5)).unwrap();
    let _: String = remote.call_as("echo", vec![json!("x")]).await.unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), ["hello, opaque world"]);
}

#[tokio::test]
async fn oversize_outbound_frame_is_refused_and_closes() {
    let registry = BinderRegistry::new();
    let (_server, url, _serve) = start_server(registry.clone(), RpcConfig::default(), |_conn, _ctx| async {}).await;

    let conn = client::connect(&url, &RpcConfig::default(), |_conn| async {}).await.unwrap();
    let big = "z".repeat(64 * 1024);
    assert!(!conn.send_text(&big).await);
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn oversize_inbound_frame_closes_with_message_too_big() {
    let registry = BinderRegistry::new();
    let received = Arc::new(AtomicUsize::new(0));

    let received_in = received.clone();
    let (_server, url, _serve) = start_server(registry, RpcConfig::default(), move |conn, _ctx| {
        let received = received_in.clone();
        async move {
            conn.on_receive(move |_| {
                received.fetch_add(1, Ordering::SeqCst);
            });
        }
    })
    .await;

    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();
    socket.send(Message::Text("z".repeat(64 * 1024).into())).await.unwrap();

    let mut close_code = None;
    while let Some(Ok(message)) = socket.next().await {
        if let Message::Close(frame) = message {
            close_code = frame.map(|f| u16::from(f.code));
            break;
        }
    }
    assert_eq!(close_code, Some(1009));
    assert_eq!(received.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn handshake_cookies_reach_the_connect_callback() {
    let registry = BinderRegistry::new();
    let captured = Arc::new(std::sync::Mutex::new(None::<HashMap<String, String>>));

    let captured_in = captured.clone();
    let (_server, url, _serve) = start_server(registry, RpcConfig::default(), move |conn, ctx| {
        let captured = captured_in.clone();
        async move {
            assert_eq!(conn.cookies(), &ctx.cookies);
            *captured.lock().unwrap() = Some(ctx.cookies);
        }
    })
    .await;

    let mut request = url.as_str().into_client_request().unwrap();
    request.headers_mut().insert(COOKIE, "session=s1; theme=dark".parse().unwrap());
    let (_socket, _) = connect_async(request).await.unwrap();

    wait_until(|| captured.lock().unwrap().is_some()).await;
    let cookies = captured.lock().unwrap().take().unwrap();
    assert_eq!(cookies.get("session").map(String::as_str), Some("s1"));
    assert_eq!(cookies.get("theme").map(String::as_str), Some("dark"));
}

struct SharedDoc;
struct OtherDoc;

#[tokio::test]
async fn broadcast_reaches_only_peers_observing_the_target() {
    let registry = BinderRegistry::new();
    let shared = Arc::new(SharedDoc);
    let other = Arc::new(OtherDoc);

    let reg = registry.clone();
    let shared_in = shared.clone();
    let other_in = other.clone();
    let (_server, url, _serve) = start_server(registry.clone(), RpcConfig::default(), move |conn, ctx| {
        let registry = reg.clone();
        let shared = shared_in.clone();
        let other = other_in.clone();
        async move {
            let methods = Methods::new().nullary("touch", || async { Ok(()) });
            if ctx.uri.contains("doc=shared") {
                registry.bind_local(&conn, shared, methods).unwrap();
            } else {
                registry.bind_local(&conn, other, methods).unwrap();
            }
            registry.bind_remote(&conn, "Peer", Duration::from_secs(5)).unwrap();
        }
    })
    .await;

    let pings = Arc::new(AtomicUsize::new(0));
    let mut peers = Vec::new();
    for (name, doc) in [("alpha", "shared"), ("beta", "shared"), ("gamma", "other")] {
        let peer_registry = BinderRegistry::new();
        let reg = peer_registry.clone();
        let pings_in = pings.clone();
        let conn = client::connect(&format!("{url}?doc={doc}"), &RpcConfig::default(), move |conn| {
            let registry = reg.clone();
            let pings = pings_in.clone();
            async move {
                let methods = Methods::new()
                    .nullary("name", move || async move { Ok(name.to_string()) })
                    .nullary("ping", move || {
                        let pings = pings.clone();
                        async move {
                            pings.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    });
                registry.bind_local(&conn, Arc::new(EchoService), methods).unwrap();
            }
        })
        .await
        .unwrap();
        peers.push((conn, peer_registry));
    }

    // three connections, each with one local and one remote binder
    wait_until(|| registry.len() == 6).await;

    let observers = registry.remotes_observing("Peer", &shared);
    assert_eq!(observers.len(), 2);

    let results = call_many(&observers, "name", vec![]).await;
    let names: Vec<String> = results.into_iter().map(|v| serde_json::from_value(v).unwrap()).collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"alpha".to_string()));
    assert!(names.contains(&"beta".to_string()));
    assert!(!names.contains(&"gamma".to_string()));

    // the unit broadcast awaits every call, so all three peers have
    // run their handler by the time it returns
    call_many_unit(&registry.remotes_of("Peer"), "ping", vec![]).await;
    assert_eq!(pings.load(Ordering::SeqCst), 3);

    // dropping one shared peer shrinks the observer set
    peers[0].0.close(CloseStatus::Normal, "done").await;
    wait_until(|| registry.remotes_observing("Peer", &shared).len() == 1).await;
}

#[tokio::test]
async fn shutdown_closes_live_connections_and_stops_serving() {
    let registry = BinderRegistry::new();
    let (server, url, serve) = start_echo_server(&registry).await;

    let conn = client::connect(&url, &RpcConfig::default(), |_conn| async {}).await.unwrap();
    let remote = BinderRegistry::new().bind_remote(&conn, "Echo", Duration::ZERO).unwrap();

    let in_flight = {
        let remote = remote.clone();
        tokio::spawn(async move { remote.call("slow", vec![json!(10_000u64)]).await })
    };

    {
        let server = server.clone();
        wait_until(move || server.connection_count() == 1).await;
    }
    sleep(Duration::from_millis(100)).await;
    server.shutdown().await;

    let outcome = in_flight.await.unwrap();
    assert!(matches!(outcome, Err(CallError::ConnectionClosed)), "{outcome:?}");

    {
        let conn = conn.clone();
        wait_until(move || conn.state() == ConnectionState::Closed).await;
    }
    let serve_outcome = tokio::time::timeout(Duration::from_secs(5), serve).await.unwrap().unwrap();
    assert!(serve_outcome.is_ok());
}
