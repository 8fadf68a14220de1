use std::io::Read;

use bytes::BufMut;

use crate::{
    connect::get_i32,
    hostname::{self, HOSTNAME_LEN},
    FrameType, WireError,
};

/// `from_host[16] from_port:i32 from_node:i32 to_host[16] to_port:i32
/// to_node:i32 type:i32`
pub const ENVELOPE_LEN: usize = 2 * (HOSTNAME_LEN + 4 + 4) + 4;

/// Fixed header prepended to every frame after the connect record.
///
/// Node-number fields are retained for wire compatibility; they are always
/// transmitted as zero and ignored on read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub from_host: String,
    pub from_port: u16,
    pub to_host: String,
    pub to_port: u16,
    pub typ: FrameType,
}

impl Envelope {
    /// Append the fixed header and any long-name tails.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        let (from_field, from_long) = hostname::encode_field(&self.from_host)?;
        let (to_field, to_long) = hostname::encode_field(&self.to_host)?;

        buf.put_slice(&from_field);
        buf.put_i32(i32::from(self.from_port));
        buf.put_i32(0);
        buf.put_slice(&to_field);
        buf.put_i32(i32::from(self.to_port));
        buf.put_i32(0);
        buf.put_i32(self.typ as i32);

        if from_long {
            buf.put_slice(self.from_host.as_bytes());
        }
        if to_long {
            buf.put_slice(self.to_host.as_bytes());
        }
        Ok(())
    }

    /// Read one envelope, blocking until the header and tails arrive.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, WireError> {
        let mut head = [0u8; ENVELOPE_LEN];
        r.read_exact(&mut head)?;

        let from_field = hostname::parse_field(&head[..HOSTNAME_LEN])?;
        let mut cur = &head[HOSTNAME_LEN..];
        let from_port = get_i32(&mut cur) as u16;
        let _from_node = get_i32(&mut cur);
        let to_field = hostname::parse_field(&cur[..HOSTNAME_LEN])?;
        cur = &cur[HOSTNAME_LEN..];
        let to_port = get_i32(&mut cur) as u16;
        let _to_node = get_i32(&mut cur);
        let typ = FrameType::from_wire(get_i32(&mut cur))?;

        let from_host = from_field.finish(r)?;
        let to_host = to_field.finish(r)?;

        Ok(Self { from_host, from_port, to_host, to_port, typ })
    }
}

/// Rewrite the `from_*` fields of an already-encoded frame in place.
///
/// The writer thread calls this immediately before transmit so every frame
/// leaves with the current local identity, however long it sat queued. The
/// hostname must be the one the frame was encoded with (a mesh never renames
/// itself), so the field bytes and any escape tail keep their length.
pub fn rewrite_from(frame: &mut [u8], host: &str, port: u16) -> Result<(), WireError> {
    debug_assert!(frame.len() >= ENVELOPE_LEN);
    let (field, _long) = hostname::encode_field(host)?;
    frame[..HOSTNAME_LEN].copy_from_slice(&field);
    frame[HOSTNAME_LEN..HOSTNAME_LEN + 4].copy_from_slice(&i32::from(port).to_be_bytes());
    frame[HOSTNAME_LEN + 4..HOSTNAME_LEN + 8].copy_from_slice(&0i32.to_be_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(typ: FrameType) -> Envelope {
        Envelope {
            from_host: "nodeA".into(),
            from_port: 7000,
            to_host: "nodeB".into(),
            to_port: 7000,
            typ,
        }
    }

    #[test]
    fn envelope_is_76_bytes() {
        let mut buf = Vec::new();
        envelope(FrameType::Heartbeat).encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 76);
        assert_eq!(ENVELOPE_LEN, 76);
    }

    #[test]
    fn envelope_roundtrip() {
        for typ in [FrameType::Heartbeat, FrameType::Hello, FrameType::UserMsg] {
            let env = envelope(typ);
            let mut buf = Vec::new();
            env.encode(&mut buf).unwrap();
            assert_eq!(Envelope::read_from(&mut &buf[..]).unwrap(), env);
        }
    }

    #[test]
    fn long_names_tail_in_field_order() {
        let env = Envelope {
            from_host: "replica-zero.cluster.internal".into(),
            from_port: 19000,
            to_host: "replica-one.cluster.internal".into(),
            to_port: 19000,
            typ: FrameType::Hello,
        };
        let mut buf = Vec::new();
        env.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), ENVELOPE_LEN + env.from_host.len() + env.to_host.len());
        assert_eq!(Envelope::read_from(&mut &buf[..]).unwrap(), env);
    }

    #[test]
    fn rewrite_updates_identity_in_place() {
        let mut buf = Vec::new();
        envelope(FrameType::UserMsg).encode(&mut buf).unwrap();
        rewrite_from(&mut buf, "nodeA", 7123).unwrap();
        let got = Envelope::read_from(&mut &buf[..]).unwrap();
        assert_eq!(got.from_port, 7123);
        assert_eq!(got.from_host, "nodeA");
        assert_eq!(got.to_host, "nodeB");
    }
}
