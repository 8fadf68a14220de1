use std::io::Read;

use crate::WireError;

/// Size of the fixed hostname field in the connect record and the envelope.
pub const HOSTNAME_LEN: usize = 16;

/// Upper bound accepted for escaped (long) hostnames.
pub const MAX_HOSTNAME_LEN: usize = 4096;

/// A parsed 16-byte hostname field.
///
/// Names of up to 15 bytes are carried inline, null-terminated. Longer names
/// use the escape form: first byte `'.'`, then the ASCII decimal length; the
/// name itself follows the fixed record as a tail, in field order.
pub(crate) enum HostField {
    Inline(String),
    Long(usize),
}

impl HostField {
    /// Bytes this field contributes to the record tail.
    pub(crate) fn tail_len(&self) -> usize {
        match self {
            Self::Inline(_) => 0,
            Self::Long(n) => *n,
        }
    }

    /// Resolve to the hostname, consuming the tail from `r` if escaped.
    pub(crate) fn finish<R: Read>(self, r: &mut R) -> Result<String, WireError> {
        match self {
            Self::Inline(name) => Ok(name),
            Self::Long(n) => {
                let mut tail = vec![0u8; n];
                r.read_exact(&mut tail)?;
                bytes_to_name(&tail)
            }
        }
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() &&
        name.len() <= MAX_HOSTNAME_LEN &&
        name.bytes().all(|b| b.is_ascii_graphic())
}

fn bytes_to_name(raw: &[u8]) -> Result<String, WireError> {
    let name = str::from_utf8(raw).map_err(|_| WireError::BadHostField)?;
    if !valid_name(name) {
        return Err(WireError::BadHostField);
    }
    Ok(name.to_owned())
}

/// Encode `name` into a fixed field. Returns the field bytes and whether the
/// name must additionally be appended to the record tail.
pub(crate) fn encode_field(name: &str) -> Result<([u8; HOSTNAME_LEN], bool), WireError> {
    if !valid_name(name) {
        return Err(WireError::BadHostnameLen(name.len()));
    }
    let mut field = [0u8; HOSTNAME_LEN];
    if name.len() < HOSTNAME_LEN {
        field[..name.len()].copy_from_slice(name.as_bytes());
        Ok((field, false))
    } else {
        field[0] = b'.';
        let digits = name.len().to_string();
        field[1..=digits.len()].copy_from_slice(digits.as_bytes());
        Ok((field, true))
    }
}

/// Parse a fixed field without consuming any tail.
pub(crate) fn parse_field(field: &[u8]) -> Result<HostField, WireError> {
    debug_assert_eq!(field.len(), HOSTNAME_LEN);
    if field[0] == b'.' {
        let digits = &field[1..];
        let end = digits.iter().position(|&b| b == 0).unwrap_or(digits.len());
        let digits = &digits[..end];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(WireError::BadHostField);
        }
        // end < 15 so this can't overflow usize
        let len: usize =
            str::from_utf8(digits).unwrap().parse().map_err(|_| WireError::BadHostField)?;
        if len == 0 || len > MAX_HOSTNAME_LEN {
            return Err(WireError::BadHostnameLen(len));
        }
        Ok(HostField::Long(len))
    } else {
        let end = field.iter().position(|&b| b == 0).ok_or(WireError::BadHostField)?;
        bytes_to_name(&field[..end]).map(HostField::Inline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_roundtrip() {
        let (field, long) = encode_field("nodeA").unwrap();
        assert!(!long);
        assert_eq!(&field[..5], b"nodeA");
        assert_eq!(field[5], 0);
        let parsed = parse_field(&field).unwrap();
        let name = parsed.finish(&mut std::io::empty()).unwrap();
        assert_eq!(name, "nodeA");
    }

    #[test]
    fn fifteen_bytes_is_still_inline() {
        let name = "abcdefghijklmno";
        let (field, long) = encode_field(name).unwrap();
        assert!(!long);
        assert_eq!(&field[..15], name.as_bytes());
    }

    #[test]
    fn long_name_escapes() {
        let name = "db-replica-3.region-east.example.com";
        let (field, long) = encode_field(name).unwrap();
        assert!(long);
        assert_eq!(field[0], b'.');
        assert_eq!(&field[1..3], b"36");

        let parsed = parse_field(&field).unwrap();
        assert_eq!(parsed.tail_len(), 36);
        let mut tail = name.as_bytes();
        assert_eq!(parsed.finish(&mut tail).unwrap(), name);
    }

    #[test]
    fn rejects_garbage() {
        assert!(encode_field("").is_err());
        assert!(encode_field("has space").is_err());
        // no terminator and no escape
        assert!(parse_field(b"0123456789abcdef").is_err());
        // escape with non-digit length
        assert!(parse_field(b".x7\0\0\0\0\0\0\0\0\0\0\0\0\0").is_err());
    }
}
