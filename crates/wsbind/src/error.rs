/// Failure kinds surfaced to the caller of a remote method.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The peer's dispatcher reported an error; the message is
    /// preserved verbatim (this includes "method not found: ..." and
    /// argument decode messages produced on the remote side).
    #[error("remote call failed: {0}")]
    Remote(String),

    /// The reply arrived but its return value could not be decoded
    /// into the expected type.
    #[error("failed to decode return value: {0}")]
    Decode(String),

    /// The termination delay elapsed before a response arrived.
    #[error("call cancelled after the termination delay")]
    Cancelled,

    /// The connection closed with the call still pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// The request envelope could not be handed to the socket.
    #[error("send failed")]
    SendFailed,
}
