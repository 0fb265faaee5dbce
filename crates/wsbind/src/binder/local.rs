use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use wsbind_proto::{Request, Response, parse_request};

use crate::connection::{CloseStatus, Connection, Incoming};

type BoxFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type MethodFn = Arc<dyn Fn(Vec<Value>) -> BoxFut<Result<Value, String>> + Send + Sync>;

fn decode_arg<T: DeserializeOwned>(arguments: &[Value], index: usize) -> Result<T, String> {
    let value = arguments.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| format!("argument {index}: {e}"))
}

fn encode_result<T: Serialize>(value: T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

/// Method table under construction. Each registration maps one wire
/// name to an invoker; positional JSON arguments are decoded with
/// serde and the result encoded back. Duplicate names fail the bind,
/// overloads are unsupported.
#[derive(Default)]
pub struct Methods {
    entries: Vec<(String, MethodFn)>,
}

impl Methods {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler taking the raw positional arguments.
    pub fn raw(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(Vec<Value>) -> BoxFut<Result<Value, String>> + Send + Sync + 'static,
    ) -> Self {
        self.entries.push((name.into(), Arc::new(handler)));
        self
    }

    pub fn nullary<R, Fut>(self, name: impl Into<String>, f: impl Fn() -> Fut + Send + Sync + 'static) -> Self
    where
        R: Serialize,
        Fut: Future<Output = Result<R, String>> + Send + 'static,
    {
        self.raw(name, move |_arguments| {
            let fut = f();
            Box::pin(async move { encode_result(fut.await?) })
        })
    }

    pub fn unary<A, R, Fut>(self, name: impl Into<String>, f: impl Fn(A) -> Fut + Send + Sync + 'static) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        Fut: Future<Output = Result<R, String>> + Send + 'static,
    {
        self.raw(name, move |arguments| -> BoxFut<Result<Value, String>> {
            match decode_arg::<A>(&arguments, 0) {
                Ok(a) => {
                    let fut = f(a);
                    Box::pin(async move { encode_result(fut.await?) })
                }
                Err(e) => Box::pin(std::future::ready(Err(e))),
            }
        })
    }

    pub fn binary<A, B, R, Fut>(self, name: impl Into<String>, f: impl Fn(A, B) -> Fut + Send + Sync + 'static) -> Self
    where
        A: DeserializeOwned,
        B: DeserializeOwned,
        R: Serialize,
        Fut: Future<Output = Result<R, String>> + Send + 'static,
    {
        self.raw(name, move |arguments| -> BoxFut<Result<Value, String>> {
            match (decode_arg::<A>(&arguments, 0), decode_arg::<B>(&arguments, 1)) {
                (Ok(a), Ok(b)) => {
                    let fut = f(a, b);
                    Box::pin(async move { encode_result(fut.await?) })
                }
                (Err(e), _) | (_, Err(e)) => Box::pin(std::future::ready(Err(e))),
            }
        })
    }

    pub fn ternary<A, B, C, R, Fut>(
        self,
        name: impl Into<String>,
        f: impl Fn(A, B, C) -> Fut + Send + Sync + 'static,
    ) -> Self
    where
        A: DeserializeOwned,
        B: DeserializeOwned,
        C: DeserializeOwned,
        R: Serialize,
        Fut: Future<Output = Result<R, String>> + Send + 'static,
    {
        self.raw(name, move |arguments| -> BoxFut<Result<Value, String>> {
            let decoded = (
                decode_arg::<A>(&arguments, 0),
                decode_arg::<B>(&arguments, 1),
                decode_arg::<C>(&arguments, 2),
            );
            match decoded {
                (Ok(a), Ok(b), Ok(c)) => {
                    let fut = f(a, b, c);
                    Box::pin(async move { encode_result(fut.await?) })
                }
                (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => Box::pin(std::future::ready(Err(e))),
            }
        })
    }
}

/// Dispatches request envelopes received on one connection to the
/// methods of a bound target object. Method-name lookup is exact and
/// case-sensitive; every dispatch outcome, including "method not
/// found" and argument decode failures, becomes a response envelope
/// through the connection's send queue.
pub struct LocalBinder {
    connection: Arc<Connection>,
    target: Arc<dyn Any + Send + Sync>,
    methods: HashMap<String, MethodFn>,
}

impl LocalBinder {
    pub(crate) fn build(
        connection: Arc<Connection>,
        target: Arc<dyn Any + Send + Sync>,
        methods: Methods,
    ) -> anyhow::Result<Arc<Self>> {
        let mut table = HashMap::new();
        for (name, f) in methods.entries {
            if table.insert(name.clone(), f).is_some() {
                anyhow::bail!("duplicate method name: {name}");
            }
        }

        let binder = Arc::new(Self {
            connection,
            target,
            methods: table,
        });

        let subscriber = binder.clone();
        binder.connection.on_receive(move |incoming| {
            let Incoming::Text(text) = incoming else { return };
            let Some(request) = parse_request(text) else { return };
            let binder = subscriber.clone();
            tokio::spawn(async move { binder.dispatch(request).await });
        });

        Ok(binder)
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(|s| s.as_str()).collect()
    }

    /// Target identity, by `Arc` data pointer.
    pub(crate) fn shares_target(&self, other: &Arc<dyn Any + Send + Sync>) -> bool {
        Arc::as_ptr(&self.target) as *const () == Arc::as_ptr(other) as *const ()
    }

    async fn dispatch(&self, request: Request) {
        let Some(call_id) = request.call_id.clone() else {
            // nothing to correlate a reply with; run for effect only
            if let Some(method) = self.methods.get(&request.function_name) {
                let _ = method(request.arguments).await;
            }
            return;
        };

        let Some(method) = self.methods.get(&request.function_name) else {
            debug!(conn_id = %self.connection.id(), method = %request.function_name, "unknown method");
            let message = format!("method not found: {}", request.function_name);
            self.respond(Response::failure(call_id, message)).await;
            return;
        };

        let response = match method(request.arguments).await {
            Ok(value) => Response::success(call_id, value),
            Err(message) => Response::failure(call_id, message),
        };
        self.respond(response).await;
    }

    async fn respond(&self, response: Response) {
        let json = match serde_json::to_string(&response) {
            Ok(json) => json,
            Err(e) => {
                warn!(conn_id = %self.connection.id(), error = %e, "response not serializable");
                return;
            }
        };
        if !self.connection.send_text(&json).await {
            // a reply the peer will never see; drop the link
            self.connection
                .close(CloseStatus::InternalError, "failed to transmit response")
                .await;
        }
    }
}
