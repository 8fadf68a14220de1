//! Fixed-layout framing for the cluster transport.
//!
//! One TCP stream carries a single one-shot connect record followed by a
//! sequence of frames, each introduced by a fixed 76-byte envelope. All
//! multi-byte integers are big-endian. Hostname fields are 16 bytes with a
//! `'.'`-escape for names that don't fit; see [`hostname`].
//!
//! Encoders append to a `Vec<u8>`; decoders either parse a byte slice or
//! pull from a blocking `io::Read` (the reader thread's view of the socket).

mod connect;
mod envelope;
mod error;
mod hostname;
mod payload;

pub use connect::{ConnectFlags, ConnectMsg, CONNECT_RECORD_LEN, CONNECT_TAG};
pub use envelope::{rewrite_from, Envelope, ENVELOPE_LEN};
pub use error::WireError;
pub use hostname::{HOSTNAME_LEN, MAX_HOSTNAME_LEN};
pub use payload::{
    encode_decom_name, encode_hello, read_decom_name, read_hello, AckMsg, HelloPeer, UserMsgHeader,
    MAX_ACK_PAYLOAD, MAX_DECOM_NAME, MAX_HELLO_PEERS, USER_MSG_HEADER_LEN,
};

/// Frame discriminant carried in the envelope's `type` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum FrameType {
    Heartbeat = 1,
    Hello = 2,
    HelloReply = 3,
    DecomName = 4,
    UserMsg = 5,
    Ack = 6,
    AckPayload = 7,
}

impl FrameType {
    pub fn from_wire(v: i32) -> Result<Self, WireError> {
        Ok(match v {
            1 => Self::Heartbeat,
            2 => Self::Hello,
            3 => Self::HelloReply,
            4 => Self::DecomName,
            5 => Self::UserMsg,
            6 => Self::Ack,
            7 => Self::AckPayload,
            other => return Err(WireError::BadFrameType(other)),
        })
    }
}
