//! TLV wire codec.
//!
//! Every packet and content block in the protocol is a tree of
//! type-length-value elements. Type and length are both variable-size
//! numbers: values below 253 occupy one byte, larger values are prefixed
//! with 253/254/255 and carried big-endian in 2/4/8 bytes.
//!
//! Evolvability rule: while scanning the children of a block, an element
//! with an unrecognized type is skipped if the type is even (non-critical)
//! and rejected if it is odd or below 32 (critical).

use bytes::{BufMut, Bytes, BytesMut};

/// Registry of TLV type numbers used on the wire.
pub mod tag {
    // Packet-level elements.
    pub const PARAMS_DIGEST_COMPONENT: u64 = 2;
    pub const INTEREST: u64 = 5;
    pub const DATA: u64 = 6;
    pub const NAME: u64 = 7;
    pub const GENERIC_COMPONENT: u64 = 8;
    pub const META_INFO: u64 = 20;
    pub const CONTENT: u64 = 21;
    pub const SIGNATURE_INFO: u64 = 22;
    pub const SIGNATURE_VALUE: u64 = 23;
    pub const FRESHNESS_PERIOD: u64 = 25;
    pub const SIGNATURE_TYPE: u64 = 27;
    pub const KEY_LOCATOR: u64 = 28;
    pub const APP_PARAMETERS: u64 = 36;
    pub const INTEREST_SIGNATURE_INFO: u64 = 44;
    pub const INTEREST_SIGNATURE_VALUE: u64 = 46;
    pub const VALIDITY_PERIOD: u64 = 253;
    pub const NOT_BEFORE: u64 = 254;
    pub const NOT_AFTER: u64 = 255;

    // CA profile and probe elements.
    pub const CA_PREFIX: u64 = 129;
    pub const CA_INFO: u64 = 131;
    pub const CA_CERTIFICATE: u64 = 137;
    pub const MAX_VALIDITY_PERIOD: u64 = 139;
    pub const PROBE_RESPONSE: u64 = 141;
    pub const MAX_SUFFIX_LENGTH: u64 = 143;

    // Request lifecycle elements.
    pub const ECDH_PUB: u64 = 145;
    pub const SALT: u64 = 149;
    pub const REQUEST_ID: u64 = 151;
    pub const CHALLENGE: u64 = 153;
    pub const STATUS: u64 = 155;
    pub const INITIALIZATION_VECTOR: u64 = 156;
    pub const ENCRYPTED_PAYLOAD: u64 = 157;
    pub const SELECTED_CHALLENGE: u64 = 161;
    pub const CHALLENGE_STATUS: u64 = 163;
    pub const REMAINING_TRIES: u64 = 165;
    pub const REMAINING_TIME: u64 = 167;
    pub const ISSUED_CERT_NAME: u64 = 169;
    pub const ERROR_CODE: u64 = 171;
    pub const ERROR_INFO: u64 = 173;
    pub const PARAMETER_KEY: u64 = 175;
    pub const PARAMETER_VALUE: u64 = 177;
    pub const CERT_REQUEST: u64 = 179;
    pub const CERT_TO_REVOKE: u64 = 181;
    /// Carried inside an encrypted block, where it cannot collide with
    /// [`PARAMETER_KEY`].
    pub const AUTHENTICATION_TAG: u64 = 175;
}

/// Decode failure for a TLV stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TlvError {
    #[error("truncated TLV element")]
    Truncated,

    #[error("expected TLV type {expected}, found {found}")]
    UnexpectedType { expected: u64, found: u64 },

    #[error("missing TLV element of type {0}")]
    MissingElement(u64),

    #[error("unrecognized critical TLV type {0}")]
    UnknownCritical(u64),

    #[error("invalid value for TLV type {typ}: {reason}")]
    BadValue { typ: u64, reason: &'static str },
}

/// An element type that receivers may skip when unrecognized.
///
/// Critical types are those below 32 or with the least significant bit set.
pub fn is_critical(typ: u64) -> bool {
    typ < 32 || typ & 1 == 1
}

/// Append a variable-size number.
pub fn write_var_number(buf: &mut BytesMut, n: u64) {
    if n < 253 {
        buf.put_u8(n as u8);
    } else if n <= u64::from(u16::MAX) {
        buf.put_u8(253);
        buf.put_u16(n as u16);
    } else if n <= u64::from(u32::MAX) {
        buf.put_u8(254);
        buf.put_u32(n as u32);
    } else {
        buf.put_u8(255);
        buf.put_u64(n);
    }
}

/// Append one TLV element.
pub fn write_tlv(buf: &mut BytesMut, typ: u64, value: &[u8]) {
    write_var_number(buf, typ);
    write_var_number(buf, value.len() as u64);
    buf.put_slice(value);
}

/// Build a single TLV element as an owned buffer.
pub fn element(typ: u64, value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(value.len() + 10);
    write_tlv(&mut buf, typ, value);
    buf.freeze()
}

/// Encode a non-negative integer into its shortest 1/2/4/8-byte form.
pub fn encode_nonneg(n: u64) -> Vec<u8> {
    if n <= u64::from(u8::MAX) {
        vec![n as u8]
    } else if n <= u64::from(u16::MAX) {
        (n as u16).to_be_bytes().to_vec()
    } else if n <= u64::from(u32::MAX) {
        (n as u32).to_be_bytes().to_vec()
    } else {
        n.to_be_bytes().to_vec()
    }
}

/// Decode a non-negative integer from a 1/2/4/8-byte value.
pub fn decode_nonneg(typ: u64, value: &[u8]) -> Result<u64, TlvError> {
    match value.len() {
        1 => Ok(u64::from(value[0])),
        2 => Ok(u64::from(u16::from_be_bytes([value[0], value[1]]))),
        4 => Ok(u64::from(u32::from_be_bytes([
            value[0], value[1], value[2], value[3],
        ]))),
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(value);
            Ok(u64::from_be_bytes(raw))
        }
        _ => Err(TlvError::BadValue {
            typ,
            reason: "non-negative integer must be 1, 2, 4 or 8 bytes",
        }),
    }
}

/// Sequential reader over the children of a TLV block.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    input: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    fn read_var_number(&mut self) -> Result<u64, TlvError> {
        let (&first, rest) = self.input.split_first().ok_or(TlvError::Truncated)?;
        let (width, rest) = match first {
            0..=252 => {
                self.input = rest;
                return Ok(u64::from(first));
            }
            253 => (2, rest),
            254 => (4, rest),
            255 => (8, rest),
        };
        if rest.len() < width {
            return Err(TlvError::Truncated);
        }
        let mut n = 0u64;
        for &b in &rest[..width] {
            n = n << 8 | u64::from(b);
        }
        self.input = &rest[width..];
        Ok(n)
    }

    /// Read the next element, whatever its type.
    pub fn read_element(&mut self) -> Result<(u64, &'a [u8]), TlvError> {
        let typ = self.read_var_number()?;
        let len = self.read_var_number()? as usize;
        if self.input.len() < len {
            return Err(TlvError::Truncated);
        }
        let (value, rest) = self.input.split_at(len);
        self.input = rest;
        Ok((typ, value))
    }

    /// Type of the next element without consuming it.
    pub fn peek_type(&self) -> Option<u64> {
        let mut probe = *self;
        probe.read_var_number().ok()
    }

    /// Read the next element, requiring the given type. Unrecognized
    /// non-critical elements in front of it are skipped.
    pub fn expect(&mut self, typ: u64) -> Result<&'a [u8], TlvError> {
        loop {
            if self.is_empty() {
                return Err(TlvError::MissingElement(typ));
            }
            let (found, value) = self.read_element()?;
            if found == typ {
                return Ok(value);
            }
            if is_critical(found) {
                return Err(TlvError::UnexpectedType {
                    expected: typ,
                    found,
                });
            }
        }
    }

    /// Read the next element of the given type if one is up next.
    pub fn expect_optional(&mut self, typ: u64) -> Result<Option<&'a [u8]>, TlvError> {
        match self.peek_type() {
            Some(t) if t == typ => Ok(Some(self.read_element()?.1)),
            _ => Ok(None),
        }
    }

    /// Consume the remainder, rejecting unknown critical elements.
    pub fn finish(&mut self) -> Result<(), TlvError> {
        while !self.is_empty() {
            let (typ, _) = self.read_element()?;
            if is_critical(typ) {
                return Err(TlvError::UnknownCritical(typ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_number_widths() {
        for (n, width) in [(0u64, 1usize), (252, 1), (253, 3), (65535, 3), (65536, 5)] {
            let mut buf = BytesMut::new();
            write_var_number(&mut buf, n);
            assert_eq!(buf.len(), width, "width of {n}");
            let mut reader = Reader::new(&buf);
            assert_eq!(reader.read_var_number().unwrap(), n);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn element_roundtrip() {
        let block = element(tag::SALT, &[7u8; 32]);
        let mut reader = Reader::new(&block);
        let (typ, value) = reader.read_element().unwrap();
        assert_eq!(typ, tag::SALT);
        assert_eq!(value, &[7u8; 32]);
        assert!(reader.is_empty());
    }

    #[test]
    fn expect_skips_unknown_noncritical() {
        let mut buf = BytesMut::new();
        write_tlv(&mut buf, 200, b"ignored");
        write_tlv(&mut buf, tag::REQUEST_ID, &[1; 8]);
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.expect(tag::REQUEST_ID).unwrap(), &[1; 8]);
    }

    #[test]
    fn expect_rejects_unknown_critical() {
        let mut buf = BytesMut::new();
        write_tlv(&mut buf, 201, b"odd type");
        write_tlv(&mut buf, tag::REQUEST_ID, &[1; 8]);
        let mut reader = Reader::new(&buf);
        assert!(matches!(
            reader.expect(tag::REQUEST_ID),
            Err(TlvError::UnexpectedType { .. })
        ));
    }

    #[test]
    fn finish_rejects_critical_trailer() {
        let mut buf = BytesMut::new();
        write_tlv(&mut buf, 202, b"fine");
        write_tlv(&mut buf, 203, b"not fine");
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.finish(), Err(TlvError::UnknownCritical(203)));
    }

    #[test]
    fn truncated_value() {
        let mut buf = BytesMut::new();
        write_var_number(&mut buf, tag::SALT);
        write_var_number(&mut buf, 32);
        buf.put_slice(&[0u8; 4]);
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read_element(), Err(TlvError::Truncated));
    }

    #[test]
    fn nonneg_roundtrip() {
        for n in [0u64, 1, 255, 256, 65535, 65536, u64::from(u32::MAX), u64::MAX] {
            let raw = encode_nonneg(n);
            assert_eq!(decode_nonneg(0, &raw).unwrap(), n);
        }
        assert!(decode_nonneg(0, &[0; 3]).is_err());
    }
}
