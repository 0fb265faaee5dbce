use std::any::Any;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;

use crate::binder::{Binder, LocalBinder, Methods, RemoteBinder};
use crate::connection::Connection;
use crate::util;

/// All binders of one server (or client, or test fixture). Scoped and
/// passed explicitly rather than process-global; every enumeration
/// works on a snapshot, so concurrent binds and connection teardown
/// never invalidate an iteration.
pub struct BinderRegistry {
    binders: RwLock<Vec<Binder>>,
}

impl BinderRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            binders: RwLock::new(Vec::new()),
        })
    }

    /// Expose `target`'s methods to the peer of `connection`. At most
    /// one local binder per (connection, target); duplicate method
    /// names also fail the bind.
    pub fn bind_local<T: Any + Send + Sync>(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        target: Arc<T>,
        methods: Methods,
    ) -> anyhow::Result<Arc<LocalBinder>> {
        let erased: Arc<dyn Any + Send + Sync> = target.clone();
        {
            let binders = util::read(&self.binders);
            let duplicate = binders.iter().any(|binder| match binder {
                Binder::Local(local) => local.connection().id() == connection.id() && local.shares_target(&erased),
                Binder::Remote(_) => false,
            });
            if duplicate {
                anyhow::bail!("target already bound on connection {}", connection.id());
            }
        }
        let binder = LocalBinder::build(connection.clone(), target, methods)?;
        self.insert(Binder::Local(binder.clone()), connection);
        Ok(binder)
    }

    /// Bind a remote interface on `connection`, at most once per
    /// (connection, interface). Calls time out after
    /// `termination_delay`; `Duration::ZERO` waits indefinitely.
    pub fn bind_remote(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        interface: &str,
        termination_delay: Duration,
    ) -> anyhow::Result<Arc<RemoteBinder>> {
        {
            let binders = util::read(&self.binders);
            let duplicate = binders.iter().any(|binder| match binder {
                Binder::Remote(remote) => {
                    remote.connection().id() == connection.id() && remote.interface() == interface
                }
                Binder::Local(_) => false,
            });
            if duplicate {
                anyhow::bail!("interface {interface} already bound on connection {}", connection.id());
            }
        }
        let binder = RemoteBinder::build(connection.clone(), interface, termination_delay);
        self.insert(Binder::Remote(binder.clone()), connection);
        Ok(binder)
    }

    fn insert(self: &Arc<Self>, binder: Binder, connection: &Arc<Connection>) {
        util::write(&self.binders).push(binder);
        let registry = self.clone();
        let conn_id = connection.id().to_string();
        connection.on_close(move || registry.unbind_connection(&conn_id));
    }

    /// Drop every binder attached to a connection.
    pub fn unbind_connection(&self, conn_id: &str) {
        util::write(&self.binders).retain(|binder| binder.connection().id() != conn_id);
    }

    pub fn len(&self) -> usize {
        util::read(&self.binders).len()
    }

    pub fn is_empty(&self) -> bool {
        util::read(&self.binders).is_empty()
    }

    fn snapshot(&self) -> Vec<Binder> {
        util::read(&self.binders).clone()
    }

    /// Every binder whose connection is `conn_id`.
    pub fn all_for_connection(&self, conn_id: &str) -> Vec<Binder> {
        self.snapshot()
            .into_iter()
            .filter(|binder| binder.connection().id() == conn_id)
            .collect()
    }

    /// Every remote binder over `interface`.
    pub fn remotes_of(&self, interface: &str) -> Vec<Arc<RemoteBinder>> {
        self.snapshot()
            .into_iter()
            .filter_map(|binder| match binder {
                Binder::Remote(remote) if remote.interface() == interface => Some(remote),
                _ => None,
            })
            .collect()
    }

    /// Every remote binder over `interface` whose connection also
    /// carries a local binder for exactly `target` (pointer identity).
    /// This is the "broadcast to every peer that has observed my
    /// object" query.
    pub fn remotes_observing<T: Any + Send + Sync>(
        &self,
        interface: &str,
        target: &Arc<T>,
    ) -> Vec<Arc<RemoteBinder>> {
        let erased: Arc<dyn Any + Send + Sync> = target.clone();
        let snapshot = self.snapshot();
        let observers: Vec<&str> = snapshot
            .iter()
            .filter_map(|binder| match binder {
                Binder::Local(local) if local.shares_target(&erased) => Some(local.connection().id()),
                _ => None,
            })
            .collect();
        snapshot
            .iter()
            .filter_map(|binder| match binder {
                Binder::Remote(remote)
                    if remote.interface() == interface && observers.contains(&remote.connection().id()) =>
                {
                    Some(remote.clone())
                }
                _ => None,
            })
            .collect()
    }
}

/// Invoke `method` across a set of remote binders and keep the results
/// of the successful calls; failed or cancelled calls are dropped, not
/// re-raised.
pub async fn call_many(binders: &[Arc<RemoteBinder>], method: &str, arguments: Vec<Value>) -> Vec<Value> {
    let calls = binders.iter().map(|binder| binder.call(method, arguments.clone()));
    join_all(calls).await.into_iter().filter_map(Result::ok).collect()
}

/// Invoke `method` across a set of remote binders and wait for every
/// call to finish, ignoring individual outcomes.
pub async fn call_many_unit(binders: &[Arc<RemoteBinder>], method: &str, arguments: Vec<Value>) {
    let calls = binders.iter().map(|binder| binder.call(method, arguments.clone()));
    let _ = join_all(calls).await;
}
