use std::io::Read;

use bitflags::bitflags;
use bytes::BufMut;

use crate::{
    hostname::{self, HOSTNAME_LEN},
    WireError,
};

/// Tag byte written before the connect record. Distinguishes a mesh
/// connection from an appsock on accept (appsock first bytes are nonzero).
pub const CONNECT_TAG: u8 = 0x00;

/// `to_host[16] to_port:i32 flags:i32 from_host[16] from_port:i32 from_node:i32`
pub const CONNECT_RECORD_LEN: usize = 2 * HOSTNAME_LEN + 4 * 4;

bitflags! {
    /// Connect record `flags` bits. The low 16 bits are reserved (they
    /// carried a node number historically) and must stay clear.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ConnectFlags: u32 {
        /// Initiator requires TLS on this connection.
        const TLS = 0x8000_0000;
    }
}

/// One-shot handshake record, first thing on the wire in each direction
/// after TCP establishment.
///
/// The port fields pack a child-net index into bits 16..20; the low 16 bits
/// are the TCP port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectMsg {
    pub to_host: String,
    pub to_port: u16,
    pub to_netnum: u8,
    pub flags: ConnectFlags,
    pub from_host: String,
    pub from_port: u16,
    pub from_netnum: u8,
}

fn pack_port(port: u16, netnum: u8) -> i32 {
    (i32::from(netnum & 0x0f) << 16) | i32::from(port)
}

fn unpack_port(v: i32) -> (u16, u8) {
    ((v & 0xffff) as u16, ((v >> 16) & 0x0f) as u8)
}

impl ConnectMsg {
    /// Append the tag byte, the fixed record and any long-name tails.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        let (to_field, to_long) = hostname::encode_field(&self.to_host)?;
        let (from_field, from_long) = hostname::encode_field(&self.from_host)?;

        buf.put_u8(CONNECT_TAG);
        buf.put_slice(&to_field);
        buf.put_i32(pack_port(self.to_port, self.to_netnum));
        buf.put_u32(self.flags.bits());
        buf.put_slice(&from_field);
        buf.put_i32(pack_port(self.from_port, self.from_netnum));
        buf.put_i32(0); // from_node, wire compatibility only

        if to_long {
            buf.put_slice(self.to_host.as_bytes());
        }
        if from_long {
            buf.put_slice(self.from_host.as_bytes());
        }
        Ok(())
    }

    /// Read the fixed record and tails. The caller has already consumed the
    /// tag byte.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, WireError> {
        let mut rec = [0u8; CONNECT_RECORD_LEN];
        r.read_exact(&mut rec)?;

        let to_field = hostname::parse_field(&rec[..HOSTNAME_LEN])?;
        let mut cur = &rec[HOSTNAME_LEN..];
        let (to_port, to_netnum) = unpack_port(get_i32(&mut cur));
        let flags = ConnectFlags::from_bits_truncate(get_i32(&mut cur) as u32);
        let from_field = hostname::parse_field(&cur[..HOSTNAME_LEN])?;
        cur = &cur[HOSTNAME_LEN..];
        let (from_port, from_netnum) = unpack_port(get_i32(&mut cur));
        let _from_node = get_i32(&mut cur);

        let to_host = to_field.finish(r)?;
        let from_host = from_field.finish(r)?;

        Ok(Self { to_host, to_port, to_netnum, flags, from_host, from_port, from_netnum })
    }
}

pub(crate) fn get_i32(cur: &mut &[u8]) -> i32 {
    use bytes::Buf;
    cur.get_i32()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_roundtrip() {
        let msg = ConnectMsg {
            to_host: "nodeB".into(),
            to_port: 7000,
            to_netnum: 0,
            flags: ConnectFlags::empty(),
            from_host: "nodeA".into(),
            from_port: 7000,
            from_netnum: 0,
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 1 + CONNECT_RECORD_LEN);
        assert_eq!(buf[0], CONNECT_TAG);

        let got = ConnectMsg::read_from(&mut &buf[1..]).unwrap();
        assert_eq!(got, msg);
    }

    #[test]
    fn child_net_index_rides_the_port_high_bits() {
        let msg = ConnectMsg {
            to_host: "nodeB".into(),
            to_port: 7000,
            to_netnum: 3,
            flags: ConnectFlags::TLS,
            from_host: "a-very-long-replica-hostname.example.com".into(),
            from_port: 7000,
            from_netnum: 3,
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();
        // long from_host rides after the fixed record
        assert_eq!(buf.len(), 1 + CONNECT_RECORD_LEN + msg.from_host.len());

        let got = ConnectMsg::read_from(&mut &buf[1..]).unwrap();
        assert_eq!(got.to_netnum, 3);
        assert_eq!(got.to_port, 7000);
        assert!(got.flags.contains(ConnectFlags::TLS));
        assert_eq!(got.from_host, msg.from_host);
    }
}
