use std::io::Read;

use bytes::BufMut;

use crate::{
    connect::get_i32,
    hostname::{self, HostField, HOSTNAME_LEN, MAX_HOSTNAME_LEN},
    WireError,
};

/// Hard cap on the peer count carried by a single hello frame.
pub const MAX_HELLO_PEERS: usize = 4096;

/// `usertype:i32 seqnum:i32 waitforack:i32 datalen:i32`
pub const USER_MSG_HEADER_LEN: usize = 16;

/// Ack payloads are bounded so a handler can't turn the ack path into a bulk
/// channel.
pub const MAX_ACK_PAYLOAD: usize = 1024;

/// Decom-by-name carries a counted hostname, capped well below the hello
/// hostname bound.
pub const MAX_DECOM_NAME: usize = 256;

/// One entry of a hello / hello-reply peer list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelloPeer {
    pub host: String,
    pub port: u16,
}

/// Encode a hello payload: `datasz:i32 n:i32`, `n` hostname fields, `n`
/// ports, `n` node numbers (zero), then the long-name bodies in order.
///
/// `datasz` counts every payload byte after the `datasz` field itself.
pub fn encode_hello(buf: &mut Vec<u8>, peers: &[HelloPeer]) -> Result<(), WireError> {
    if peers.len() > MAX_HELLO_PEERS {
        return Err(WireError::TooManyPeers(peers.len()));
    }

    let mut fields = Vec::with_capacity(peers.len());
    let mut tail_len = 0usize;
    for p in peers {
        let (field, long) = hostname::encode_field(&p.host)?;
        if long {
            tail_len += p.host.len();
        }
        fields.push((field, long));
    }

    let datasz = 4 + peers.len() * (HOSTNAME_LEN + 4 + 4) + tail_len;
    buf.put_i32(datasz as i32);
    buf.put_i32(peers.len() as i32);
    for (field, _) in &fields {
        buf.put_slice(field);
    }
    for p in peers {
        buf.put_i32(i32::from(p.port));
    }
    for _ in peers {
        buf.put_i32(0);
    }
    for (p, (_, long)) in peers.iter().zip(&fields) {
        if *long {
            buf.put_slice(p.host.as_bytes());
        }
    }
    Ok(())
}

/// Read a hello payload (everything after the envelope).
pub fn read_hello<R: Read>(r: &mut R) -> Result<Vec<HelloPeer>, WireError> {
    let mut head = [0u8; 8];
    r.read_exact(&mut head)?;
    let mut cur = &head[..];
    let datasz = get_i32(&mut cur);
    let n = get_i32(&mut cur);
    if n < 0 || n as usize > MAX_HELLO_PEERS {
        return Err(WireError::TooManyPeers(n.max(0) as usize));
    }
    let n = n as usize;

    let mut rec = vec![0u8; n * (HOSTNAME_LEN + 4 + 4)];
    r.read_exact(&mut rec)?;

    let mut fields = Vec::with_capacity(n);
    let mut tail_len = 0usize;
    for i in 0..n {
        let field = hostname::parse_field(&rec[i * HOSTNAME_LEN..(i + 1) * HOSTNAME_LEN])?;
        tail_len += field.tail_len();
        fields.push(field);
    }

    let want = (4 + rec.len() + tail_len) as i32;
    if datasz != want {
        return Err(WireError::HelloSizeMismatch { got: datasz, want });
    }

    let ports_at = n * HOSTNAME_LEN;
    let mut peers = Vec::with_capacity(n);
    for (i, field) in fields.into_iter().enumerate() {
        let mut port_cur = &rec[ports_at + i * 4..ports_at + (i + 1) * 4];
        let port = get_i32(&mut port_cur) as u16;
        let host = match field {
            HostField::Inline(name) => name,
            long => long.finish(r)?,
        };
        peers.push(HelloPeer { host, port });
    }
    Ok(peers)
}

/// Parsed `usertype:i32 seqnum:i32 waitforack:i32 datalen:i32` header of a
/// user message. The opaque body follows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserMsgHeader {
    pub usertype: u32,
    pub seqnum: u32,
    pub waitforack: bool,
    pub datalen: u32,
}

impl UserMsgHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_i32(self.usertype as i32);
        buf.put_i32(self.seqnum as i32);
        buf.put_i32(i32::from(self.waitforack));
        buf.put_i32(self.datalen as i32);
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, WireError> {
        let mut head = [0u8; USER_MSG_HEADER_LEN];
        r.read_exact(&mut head)?;
        let mut cur = &head[..];
        let usertype = get_i32(&mut cur) as u32;
        let seqnum = get_i32(&mut cur) as u32;
        let waitforack = get_i32(&mut cur) != 0;
        let datalen = get_i32(&mut cur);
        if datalen < 0 {
            return Err(WireError::BadBodyLen(datalen));
        }
        Ok(Self { usertype, seqnum, waitforack, datalen: datalen as u32 })
    }
}

/// Ack or ack-with-payload body. On the wire the two are distinct frame
/// types; `payload` selects which one `encode` emits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckMsg {
    pub seqnum: u32,
    pub outrc: i32,
    pub payload: Option<Vec<u8>>,
}

impl AckMsg {
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        buf.put_i32(self.seqnum as i32);
        buf.put_i32(self.outrc);
        if let Some(payload) = &self.payload {
            if payload.is_empty() || payload.len() > MAX_ACK_PAYLOAD {
                return Err(WireError::BadAckPayloadLen(payload.len() as i32));
            }
            buf.put_i32(payload.len() as i32);
            buf.put_slice(payload);
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R, with_payload: bool) -> Result<Self, WireError> {
        let mut head = [0u8; 8];
        r.read_exact(&mut head)?;
        let mut cur = &head[..];
        let seqnum = get_i32(&mut cur) as u32;
        let outrc = get_i32(&mut cur);

        let payload = if with_payload {
            let mut len_buf = [0u8; 4];
            r.read_exact(&mut len_buf)?;
            let len = i32::from_be_bytes(len_buf);
            if len < 1 || len as usize > MAX_ACK_PAYLOAD {
                return Err(WireError::BadAckPayloadLen(len));
            }
            let mut payload = vec![0u8; len as usize];
            r.read_exact(&mut payload)?;
            Some(payload)
        } else {
            None
        };
        Ok(Self { seqnum, outrc, payload })
    }
}

/// Encode a decom-by-name payload: `hostlen:i32 host[hostlen]`.
pub fn encode_decom_name(buf: &mut Vec<u8>, host: &str) -> Result<(), WireError> {
    if host.is_empty() || host.len() > MAX_DECOM_NAME {
        return Err(WireError::BadDecomLen(host.len() as i32));
    }
    buf.put_i32(host.len() as i32);
    buf.put_slice(host.as_bytes());
    Ok(())
}

/// Read a decom-by-name payload.
pub fn read_decom_name<R: Read>(r: &mut R) -> Result<String, WireError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = i32::from_be_bytes(len_buf);
    if len < 1 || len as usize > MAX_DECOM_NAME {
        return Err(WireError::BadDecomLen(len));
    }
    let mut raw = vec![0u8; len as usize];
    r.read_exact(&mut raw)?;
    let host = String::from_utf8(raw).map_err(|_| WireError::BadHostField)?;
    if host.len() > MAX_HOSTNAME_LEN || !host.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(WireError::BadHostField);
    }
    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_roundtrip_mixed_name_lengths() {
        let peers = vec![
            HelloPeer { host: "a".into(), port: 7000 },
            HelloPeer { host: "db-replica-2.region-west.example.com".into(), port: 7001 },
            HelloPeer { host: "nodeC".into(), port: 7002 },
        ];
        let mut buf = Vec::new();
        encode_hello(&mut buf, &peers).unwrap();
        assert_eq!(read_hello(&mut &buf[..]).unwrap(), peers);
    }

    #[test]
    fn hello_datasz_counts_trailing_bytes() {
        let peers = vec![HelloPeer { host: "nodeA".into(), port: 7000 }];
        let mut buf = Vec::new();
        encode_hello(&mut buf, &peers).unwrap();
        let datasz = i32::from_be_bytes(buf[..4].try_into().unwrap());
        assert_eq!(datasz as usize, buf.len() - 4);

        // corrupt the size and the reader must refuse it
        buf[3] ^= 1;
        assert!(matches!(
            read_hello(&mut &buf[..]),
            Err(WireError::HelloSizeMismatch { .. })
        ));
    }

    #[test]
    fn user_msg_header_roundtrip() {
        let hdr = UserMsgHeader { usertype: 9, seqnum: 1234, waitforack: true, datalen: 17 };
        let mut buf = Vec::new();
        hdr.encode(&mut buf);
        assert_eq!(buf.len(), USER_MSG_HEADER_LEN);
        assert_eq!(UserMsgHeader::read_from(&mut &buf[..]).unwrap(), hdr);
    }

    #[test]
    fn ack_payload_bounds() {
        let ack = AckMsg { seqnum: 7, outrc: 42, payload: Some(vec![1; MAX_ACK_PAYLOAD]) };
        let mut buf = Vec::new();
        ack.encode(&mut buf).unwrap();
        assert_eq!(AckMsg::read_from(&mut &buf[..], true).unwrap(), ack);

        let too_big = AckMsg { seqnum: 7, outrc: 42, payload: Some(vec![1; MAX_ACK_PAYLOAD + 1]) };
        assert!(too_big.encode(&mut Vec::new()).is_err());

        let plain = AckMsg { seqnum: 8, outrc: -3, payload: None };
        let mut buf = Vec::new();
        plain.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(AckMsg::read_from(&mut &buf[..], false).unwrap(), plain);
    }

    #[test]
    fn decom_name_bounds() {
        let mut buf = Vec::new();
        encode_decom_name(&mut buf, "nodeB").unwrap();
        assert_eq!(read_decom_name(&mut &buf[..]).unwrap(), "nodeB");

        let long = "x".repeat(MAX_DECOM_NAME + 1);
        assert!(encode_decom_name(&mut Vec::new(), &long).is_err());

        let mut bad = Vec::new();
        bad.extend_from_slice(&300i32.to_be_bytes());
        bad.extend_from_slice(&[b'x'; 300]);
        assert!(matches!(read_decom_name(&mut &bad[..]), Err(WireError::BadDecomLen(300))));
    }
}
