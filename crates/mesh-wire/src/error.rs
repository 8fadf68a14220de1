use std::io;

use thiserror::Error;

/// Decode failures. Any of these on a live socket means the stream is
/// unrecoverable and the connection must be torn down.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("unknown frame type {0}")]
    BadFrameType(i32),
    #[error("malformed hostname field")]
    BadHostField,
    #[error("hostname length {0} out of range")]
    BadHostnameLen(usize),
    #[error("hello frame lists {0} peers")]
    TooManyPeers(usize),
    #[error("decom hostname length {0} out of range")]
    BadDecomLen(i32),
    #[error("ack payload length {0} out of range")]
    BadAckPayloadLen(i32),
    #[error("negative body length {0}")]
    BadBodyLen(i32),
    #[error("hello payload size {got} does not match contents ({want})")]
    HelloSizeMismatch { got: i32, want: i32 },
}
