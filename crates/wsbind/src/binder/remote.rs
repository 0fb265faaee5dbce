use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time;
use tracing::debug;
use uuid::Uuid;

use wsbind_proto::{CallId, Request, parse_response};

use crate::connection::{Connection, Incoming};
use crate::error::CallError;
use crate::util;

type Waiter = oneshot::Sender<Result<Value, CallError>>;

/// Invokes methods executing on the remote peer of one connection.
///
/// Every call allocates a fresh correlation id, parks a waiter in the
/// pending map, and resolves exactly once: by the matching response,
/// by termination-delay expiry, or by connection close. Late replies
/// find no waiter and are dropped silently.
pub struct RemoteBinder {
    connection: Arc<Connection>,
    interface: String,
    termination_delay: Duration,
    pending: Mutex<HashMap<CallId, Waiter>>,
}

impl RemoteBinder {
    pub(crate) fn build(
        connection: Arc<Connection>,
        interface: impl Into<String>,
        termination_delay: Duration,
    ) -> Arc<Self> {
        let binder = Arc::new(Self {
            connection: connection.clone(),
            interface: interface.into(),
            termination_delay,
            pending: Mutex::new(HashMap::new()),
        });

        let subscriber = binder.clone();
        connection.on_receive(move |incoming| {
            let Incoming::Text(text) = incoming else { return };
            let Some(response) = parse_response(text) else { return };
            subscriber.settle(response);
        });

        let closer = binder.clone();
        connection.on_close(move || closer.fail_pending());

        binder
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn pending_calls(&self) -> usize {
        util::lock(&self.pending).len()
    }

    /// Invoke `method` on the peer and wait for its reply, the
    /// termination delay, or connection close, whichever comes first.
    pub async fn call(&self, method: &str, arguments: Vec<Value>) -> Result<Value, CallError> {
        let call_id = CallId::Text(Uuid::new_v4().to_string());
        let (tx, rx) = oneshot::channel();
        util::lock(&self.pending).insert(call_id.clone(), tx);

        let request = Request {
            function_name: method.to_string(),
            arguments,
            call_id: Some(call_id.clone()),
        };
        let Ok(json) = serde_json::to_string(&request) else {
            util::lock(&self.pending).remove(&call_id);
            return Err(CallError::SendFailed);
        };
        if !self.connection.send_text(&json).await {
            util::lock(&self.pending).remove(&call_id);
            return Err(CallError::SendFailed);
        }

        let outcome = if self.termination_delay.is_zero() {
            rx.await
        } else {
            match time::timeout(self.termination_delay, rx).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => {
                    // first completion wins: a response racing in here
                    // has already removed the entry and this is a no-op
                    util::lock(&self.pending).remove(&call_id);
                    debug!(conn_id = %self.connection.id(), %call_id, method, "call timed out");
                    return Err(CallError::Cancelled);
                }
            }
        };
        match outcome {
            Ok(result) => result,
            Err(_closed) => Err(CallError::ConnectionClosed),
        }
    }

    /// [`call`](Self::call), with the reply decoded into `T`.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, arguments: Vec<Value>) -> Result<T, CallError> {
        let value = self.call(method, arguments).await?;
        serde_json::from_value(value).map_err(|e| CallError::Decode(e.to_string()))
    }

    fn settle(&self, response: wsbind_proto::Response) {
        let waiter = util::lock(&self.pending).remove(&response.call_id);
        let Some(waiter) = waiter else {
            // late reply after timeout or close
            debug!(conn_id = %self.connection.id(), call_id = %response.call_id, "dropping unmatched response");
            return;
        };
        let outcome = match response.result() {
            Ok(value) => Ok(value.clone()),
            Err(message) => Err(CallError::Remote(message.to_string())),
        };
        let _ = waiter.send(outcome);
    }

    /// Connection closed: every still-pending waiter resolves with
    /// [`CallError::ConnectionClosed`] before the close notification
    /// finishes.
    fn fail_pending(&self) {
        let drained: Vec<Waiter> = util::lock(&self.pending).drain().map(|(_, waiter)| waiter).collect();
        if !drained.is_empty() {
            debug!(conn_id = %self.connection.id(), count = drained.len(), "failing pending calls");
        }
        for waiter in drained {
            let _ = waiter.send(Err(CallError::ConnectionClosed));
        }
    }
}
