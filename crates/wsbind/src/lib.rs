//! Bidirectional RPC over WebSocket connections.
//!
//! A [`server::RpcServer`] accepts inbound upgrades; [`client::connect`]
//! dials one. Either way the result is a [`connection::Connection`], on
//! which application code binds a local object (exposing its methods to
//! the peer) and/or a remote interface (invoking methods on the peer)
//! through a [`registry::BinderRegistry`]. Envelopes are JSON text
//! frames; non-RPC frames pass through to the application untouched.

pub mod binder;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod server;

mod send_queue;
mod util;

pub use binder::{Binder, LocalBinder, Methods, RemoteBinder};
pub use config::{RpcConfig, ServerConfig};
pub use connection::{CloseStatus, Connection, ConnectionState, Incoming};
pub use error::CallError;
pub use registry::{BinderRegistry, call_many, call_many_unit};
pub use server::{HandshakeContext, RpcServer};

pub use wsbind_proto as proto;
