use thiserror::Error;

/// Caller-facing send failures.
///
/// Reader/writer errors never surface here; they flow into the peer state
/// machine and the dial thread reconnects. An asynchronous send reports only
/// whether the frame was enqueued, so `QueueFull` is the one backpressure
/// signal.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Target hostname is not in the peer table.
    #[error("unknown peer")]
    InvalidNode,
    /// Target is this node. Sending to self is always an error.
    #[error("send addressed to this node")]
    SendToMe,
    /// No live socket, or the peer has not completed the hello exchange.
    #[error("no usable connection to peer")]
    NoSock,
    /// Peer is decommissioned or the mesh is shutting down.
    #[error("peer is closed")]
    Closed,
    /// The connection died while the caller was blocked on it.
    #[error("socket write failed")]
    WriteFail,
    /// Send queue hit its count or byte cap.
    #[error("send queue full")]
    QueueFull,
    /// Frame buffer allocation failed.
    #[error("allocation failed")]
    MallocFail,
    /// No ack arrived within the caller's wait budget.
    #[error("timed out waiting for ack")]
    Timeout,
    /// The remote handler acked with a negative code.
    #[error("handler returned an invalid ack code")]
    InvalidAckRc,
    #[error("internal error")]
    Internal,
}

/// Failures registering a handler.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    #[error("user type {0} is outside the configured range")]
    UsertypeOutOfRange(u32),
    #[error("user type {0} already has a handler")]
    Duplicate(u32),
}
