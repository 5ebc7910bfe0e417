//! Hierarchical packet names.
//!
//! A name is an ordered list of components. Components are opaque byte
//! strings; the URI form renders unprintable bytes as `%XX` escapes, the
//! same convention the rest of the ecosystem uses for these names.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::tlv::{self, tag, TlvError};

/// One name component.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Component {
    typ: u64,
    value: Bytes,
}

impl Component {
    pub fn generic(value: impl Into<Bytes>) -> Self {
        Self {
            typ: tag::GENERIC_COMPONENT,
            value: value.into(),
        }
    }

    pub fn from_str(s: &str) -> Self {
        Self::generic(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// The digest component binding an interest to its parameters.
    pub fn params_digest(digest: [u8; 32]) -> Self {
        Self {
            typ: tag::PARAMS_DIGEST_COMPONENT,
            value: Bytes::copy_from_slice(&digest),
        }
    }

    pub fn typ(&self) -> u64 {
        self.typ
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn is_params_digest(&self) -> bool {
        self.typ == tag::PARAMS_DIGEST_COMPONENT
    }

    /// Value interpreted as UTF-8, if it is.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.typ != tag::GENERIC_COMPONENT {
            write!(f, "{}=", self.typ)?;
        }
        for &b in self.value.iter() {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~' | b'=') {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "%{b:02X}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A hierarchical name.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name {
    components: Vec<Component>,
}

impl Name {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `/a/b/c` URI. Only generic components and `%XX` escapes are
    /// understood; this covers every name the configuration files carry.
    pub fn parse(uri: &str) -> Result<Self, TlvError> {
        let mut name = Name::new();
        for part in uri.split('/') {
            if part.is_empty() {
                continue;
            }
            let mut value = Vec::with_capacity(part.len());
            let mut chars = part.bytes();
            while let Some(b) = chars.next() {
                if b == b'%' {
                    let hi = chars.next().ok_or(TlvError::BadValue {
                        typ: tag::NAME,
                        reason: "dangling percent escape",
                    })?;
                    let lo = chars.next().ok_or(TlvError::BadValue {
                        typ: tag::NAME,
                        reason: "dangling percent escape",
                    })?;
                    let byte = u8::from_str_radix(
                        std::str::from_utf8(&[hi, lo]).map_err(|_| TlvError::BadValue {
                            typ: tag::NAME,
                            reason: "invalid percent escape",
                        })?,
                        16,
                    )
                    .map_err(|_| TlvError::BadValue {
                        typ: tag::NAME,
                        reason: "invalid percent escape",
                    })?;
                    value.push(byte);
                } else {
                    value.push(b);
                }
            }
            name.push(Component::generic(value));
        }
        Ok(name)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Component> {
        self.components.get(index)
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn push(&mut self, component: Component) {
        self.components.push(component);
    }

    pub fn pop(&mut self) -> Option<Component> {
        self.components.pop()
    }

    /// Builder-style append of a UTF-8 component.
    #[must_use]
    pub fn child(&self, s: &str) -> Name {
        let mut name = self.clone();
        name.push(Component::from_str(s));
        name
    }

    /// Builder-style append of an arbitrary component.
    #[must_use]
    pub fn child_component(&self, component: Component) -> Name {
        let mut name = self.clone();
        name.push(component);
        name
    }

    /// Concatenate another name's components onto this one.
    #[must_use]
    pub fn join(&self, suffix: &Name) -> Name {
        let mut name = self.clone();
        name.components.extend_from_slice(&suffix.components);
        name
    }

    /// The first `n` components as a new name.
    #[must_use]
    pub fn prefix(&self, n: usize) -> Name {
        Name {
            components: self.components[..n.min(self.components.len())].to_vec(),
        }
    }

    pub fn is_prefix_of(&self, other: &Name) -> bool {
        other.components.len() >= self.components.len()
            && other.components[..self.components.len()] == self.components[..]
    }

    /// Encoded component sequence, without the outer NAME element.
    pub fn encode_value(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for component in &self.components {
            tlv::write_tlv(&mut buf, component.typ, &component.value);
        }
        buf.freeze()
    }

    /// Full NAME element.
    pub fn encode(&self) -> Bytes {
        tlv::element(tag::NAME, &self.encode_value())
    }

    /// Append this name as a NAME element to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        let value = self.encode_value();
        tlv::write_var_number(buf, tag::NAME);
        tlv::write_var_number(buf, value.len() as u64);
        buf.put_slice(&value);
    }

    /// Decode from the value of a NAME element.
    pub fn decode_value(value: &[u8]) -> Result<Self, TlvError> {
        let mut reader = tlv::Reader::new(value);
        let mut name = Name::new();
        while !reader.is_empty() {
            let (typ, value) = reader.read_element()?;
            name.push(Component {
                typ,
                value: Bytes::copy_from_slice(value),
            });
        }
        Ok(name)
    }

    /// Decode a full NAME element.
    pub fn decode(input: &[u8]) -> Result<Self, TlvError> {
        let mut reader = tlv::Reader::new(input);
        let value = reader.expect(tag::NAME)?;
        Self::decode_value(value)
    }

    /// SHA-256 over the encoded component sequence.
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.encode_value()).into()
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return write!(f, "/");
        }
        for component in &self.components {
            write!(f, "/{component}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
