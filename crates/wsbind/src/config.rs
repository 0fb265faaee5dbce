use std::time::Duration;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;
pub const DEFAULT_TERMINATION_DELAY: Duration = Duration::from_secs(30);

/// Per-connection RPC settings.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Hard frame limit in UTF-8 bytes, enforced symmetrically on send
    /// and receive. A frame at or over the limit closes the connection
    /// with the "message too big" status.
    pub max_message_size: usize,
    /// Maximum wait for a response before a remote call fails with
    /// [`crate::CallError::Cancelled`]. `Duration::ZERO` waits
    /// indefinitely.
    pub termination_delay: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            termination_delay: DEFAULT_TERMINATION_DELAY,
        }
    }
}

/// Listener settings for [`crate::RpcServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_host: String,
    pub listen_port: u16,
    /// Route the WebSocket upgrade is served on.
    pub path: String,
    pub rpc: RpcConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8800,
            path: "/rpc".to_string(),
            rpc: RpcConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}
