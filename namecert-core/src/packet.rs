//! Interest and Data packets.
//!
//! Only the packet surface this protocol exchanges is modeled: names,
//! application parameters, content, signature info with an optional
//! validity period, and the parameters digest that binds an interest to
//! its payload. The face that moves packets is someone else's problem.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};

use crate::keys::{verify_signature, KeyPair};
use crate::name::{Component, Name};
use crate::tlv::{self, tag, TlvError};

/// Signature algorithm identifiers.
pub mod sig_type {
    pub const ECDSA_SHA256: u64 = 3;
    #[cfg(feature = "bls")]
    pub const BLS: u64 = 64;
}

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Inclusive time window during which a certificate is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityPeriod {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl ValidityPeriod {
    pub fn new(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        Self {
            not_before,
            not_after,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }

    fn encode_value(&self) -> Bytes {
        let mut buf = BytesMut::new();
        let not_before = self.not_before.format(TIMESTAMP_FORMAT).to_string();
        let not_after = self.not_after.format(TIMESTAMP_FORMAT).to_string();
        tlv::write_tlv(&mut buf, tag::NOT_BEFORE, not_before.as_bytes());
        tlv::write_tlv(&mut buf, tag::NOT_AFTER, not_after.as_bytes());
        buf.freeze()
    }

    fn decode_value(value: &[u8]) -> Result<Self, TlvError> {
        let mut reader = tlv::Reader::new(value);
        let not_before = parse_timestamp(reader.expect(tag::NOT_BEFORE)?)?;
        let not_after = parse_timestamp(reader.expect(tag::NOT_AFTER)?)?;
        Ok(Self {
            not_before,
            not_after,
        })
    }
}

fn parse_timestamp(raw: &[u8]) -> Result<DateTime<Utc>, TlvError> {
    let text = std::str::from_utf8(raw).map_err(|_| TlvError::BadValue {
        typ: tag::NOT_BEFORE,
        reason: "timestamp is not UTF-8",
    })?;
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| TlvError::BadValue {
            typ: tag::NOT_BEFORE,
            reason: "malformed timestamp",
        })
}

/// Signature metadata carried by packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureInfo {
    pub sig_type: u64,
    pub key_locator: Option<Name>,
    pub validity: Option<ValidityPeriod>,
}

impl SignatureInfo {
    pub fn ecdsa(key_locator: Name) -> Self {
        Self {
            sig_type: sig_type::ECDSA_SHA256,
            key_locator: Some(key_locator),
            validity: None,
        }
    }

    pub fn with_validity(mut self, validity: ValidityPeriod) -> Self {
        self.validity = Some(validity);
        self
    }

    fn encode(&self, outer: u64) -> Bytes {
        let mut value = BytesMut::new();
        tlv::write_tlv(&mut value, tag::SIGNATURE_TYPE, &tlv::encode_nonneg(self.sig_type));
        if let Some(locator) = &self.key_locator {
            tlv::write_tlv(&mut value, tag::KEY_LOCATOR, &locator.encode());
        }
        if let Some(validity) = &self.validity {
            tlv::write_tlv(&mut value, tag::VALIDITY_PERIOD, &validity.encode_value());
        }
        tlv::element(outer, &value)
    }

    fn decode_value(value: &[u8]) -> Result<Self, TlvError> {
        let mut reader = tlv::Reader::new(value);
        let sig_type = tlv::decode_nonneg(tag::SIGNATURE_TYPE, reader.expect(tag::SIGNATURE_TYPE)?)?;
        let key_locator = match reader.expect_optional(tag::KEY_LOCATOR)? {
            Some(raw) => Some(Name::decode(raw)?),
            None => None,
        };
        let validity = match reader.expect_optional(tag::VALIDITY_PERIOD)? {
            Some(raw) => Some(ValidityPeriod::decode_value(raw)?),
            None => None,
        };
        reader.finish()?;
        Ok(Self {
            sig_type,
            key_locator,
            validity,
        })
    }
}

/// A request packet addressed by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    pub name: Name,
    pub app_parameters: Option<Bytes>,
    pub sig_info: Option<SignatureInfo>,
    pub sig_value: Option<Bytes>,
}

impl Interest {
    pub fn new(name: Name) -> Self {
        Self {
            name,
            app_parameters: None,
            sig_info: None,
            sig_value: None,
        }
    }

    pub fn with_parameters(mut self, parameters: impl Into<Bytes>) -> Self {
        self.app_parameters = Some(parameters.into());
        self
    }

    /// Name components without the trailing parameters digest.
    pub fn name_without_digest(&self) -> Name {
        match self.name.components().last() {
            Some(last) if last.is_params_digest() => self.name.prefix(self.name.len() - 1),
            _ => self.name.clone(),
        }
    }

    fn parameters_portion(&self) -> Bytes {
        let mut buf = BytesMut::new();
        if let Some(parameters) = &self.app_parameters {
            tlv::write_tlv(&mut buf, tag::APP_PARAMETERS, parameters);
        }
        if let Some(info) = &self.sig_info {
            buf.put_slice(&info.encode(tag::INTEREST_SIGNATURE_INFO));
        }
        if let Some(value) = &self.sig_value {
            tlv::write_tlv(&mut buf, tag::INTEREST_SIGNATURE_VALUE, value);
        }
        buf.freeze()
    }

    /// Bytes covered by the interest signature: the name prefix, the
    /// application parameters and the signature info.
    fn signed_portion(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(&self.name_without_digest().encode_value());
        if let Some(parameters) = &self.app_parameters {
            tlv::write_tlv(&mut buf, tag::APP_PARAMETERS, parameters);
        }
        if let Some(info) = &self.sig_info {
            buf.put_slice(&info.encode(tag::INTEREST_SIGNATURE_INFO));
        }
        buf.freeze()
    }

    /// Append (or refresh) the parameters digest component.
    pub fn finalize(&mut self) {
        if self.app_parameters.is_none() {
            return;
        }
        let digest: [u8; 32] = Sha256::digest(self.parameters_portion()).into();
        if matches!(self.name.components().last(), Some(c) if c.is_params_digest()) {
            self.name.pop();
        }
        self.name.push(Component::params_digest(digest));
    }

    /// Sign with the requester's key and finalize the digest component.
    pub fn sign(&mut self, key: &KeyPair, key_locator: Name) {
        self.sig_info = Some(SignatureInfo::ecdsa(key_locator));
        self.sig_value = Some(Bytes::from(key.sign(&self.signed_portion())));
        self.finalize();
    }

    /// Verify the interest signature under a raw public key.
    #[must_use]
    pub fn verify(&self, public_key_bits: &[u8]) -> bool {
        match &self.sig_value {
            Some(sig_value) => verify_signature(public_key_bits, &self.signed_portion(), sig_value),
            None => false,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut value = BytesMut::new();
        self.name.write_to(&mut value);
        value.put_slice(&self.parameters_portion());
        tlv::element(tag::INTEREST, &value)
    }

    pub fn decode(input: &[u8]) -> Result<Self, TlvError> {
        let mut outer = tlv::Reader::new(input);
        let value = outer.expect(tag::INTEREST)?;
        let mut reader = tlv::Reader::new(value);
        let name = Name::decode_value(reader.expect(tag::NAME)?)?;
        let app_parameters = reader
            .expect_optional(tag::APP_PARAMETERS)?
            .map(Bytes::copy_from_slice);
        let sig_info = match reader.expect_optional(tag::INTEREST_SIGNATURE_INFO)? {
            Some(raw) => Some(SignatureInfo::decode_value(raw)?),
            None => None,
        };
        let sig_value = reader
            .expect_optional(tag::INTEREST_SIGNATURE_VALUE)?
            .map(Bytes::copy_from_slice);
        reader.finish()?;

        let interest = Self {
            name,
            app_parameters,
            sig_info,
            sig_value,
        };
        // A present digest component must match the parameters portion.
        if let Some(last) = interest.name.components().last() {
            if last.is_params_digest() {
                let digest: [u8; 32] = Sha256::digest(interest.parameters_portion()).into();
                if last.value() != digest {
                    return Err(TlvError::BadValue {
                        typ: tag::PARAMS_DIGEST_COMPONENT,
                        reason: "parameters digest mismatch",
                    });
                }
            }
        }
        Ok(interest)
    }
}

/// A response packet addressed by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub name: Name,
    pub freshness_ms: Option<u64>,
    pub content: Bytes,
    pub sig_info: SignatureInfo,
    pub sig_value: Bytes,
}

impl Data {
    /// An unsigned packet; call [`Data::sign`] before shipping it.
    pub fn unsigned(name: Name, content: impl Into<Bytes>) -> Self {
        Self {
            name,
            freshness_ms: None,
            content: content.into(),
            sig_info: SignatureInfo {
                sig_type: sig_type::ECDSA_SHA256,
                key_locator: None,
                validity: None,
            },
            sig_value: Bytes::new(),
        }
    }

    pub fn with_freshness_ms(mut self, freshness_ms: u64) -> Self {
        self.freshness_ms = Some(freshness_ms);
        self
    }

    fn meta_info(&self) -> Bytes {
        let mut value = BytesMut::new();
        if let Some(freshness) = self.freshness_ms {
            tlv::write_tlv(&mut value, tag::FRESHNESS_PERIOD, &tlv::encode_nonneg(freshness));
        }
        tlv::element(tag::META_INFO, &value)
    }

    /// Bytes covered by the signature: name, meta info, content and
    /// signature info elements.
    pub fn signed_portion(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.name.write_to(&mut buf);
        buf.put_slice(&self.meta_info());
        tlv::write_tlv(&mut buf, tag::CONTENT, &self.content);
        buf.put_slice(&self.sig_info.encode(tag::SIGNATURE_INFO));
        buf.freeze()
    }

    /// Sign in place with the given signature info.
    pub fn sign(&mut self, key: &KeyPair, sig_info: SignatureInfo) {
        self.sig_info = sig_info;
        self.sig_value = Bytes::from(key.sign(&self.signed_portion()));
    }

    /// Verify the signature under a raw public key.
    #[must_use]
    pub fn verify(&self, public_key_bits: &[u8]) -> bool {
        verify_signature(public_key_bits, &self.signed_portion(), &self.sig_value)
    }

    pub fn encode(&self) -> Bytes {
        let mut value = BytesMut::new();
        value.put_slice(&self.signed_portion());
        tlv::write_tlv(&mut value, tag::SIGNATURE_VALUE, &self.sig_value);
        tlv::element(tag::DATA, &value)
    }

    pub fn decode(input: &[u8]) -> Result<Self, TlvError> {
        let mut outer = tlv::Reader::new(input);
        let value = outer.expect(tag::DATA)?;
        let mut reader = tlv::Reader::new(value);
        let name = Name::decode_value(reader.expect(tag::NAME)?)?;
        let mut freshness_ms = None;
        if let Some(meta) = reader.expect_optional(tag::META_INFO)? {
            let mut meta_reader = tlv::Reader::new(meta);
            if let Some(raw) = meta_reader.expect_optional(tag::FRESHNESS_PERIOD)? {
                freshness_ms = Some(tlv::decode_nonneg(tag::FRESHNESS_PERIOD, raw)?);
            }
            meta_reader.finish()?;
        }
        let content = Bytes::copy_from_slice(reader.expect(tag::CONTENT)?);
        let sig_info = SignatureInfo::decode_value(reader.expect(tag::SIGNATURE_INFO)?)?;
        let sig_value = Bytes::copy_from_slice(reader.expect(tag::SIGNATURE_VALUE)?);
        reader.finish()?;
        Ok(Self {
            name,
            freshness_ms,
            content,
            sig_info,
            sig_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_name() -> Name {
        Name::parse("/edu/site/KEY/abcd1234").unwrap()
    }

    #[test]
    fn data_roundtrip_and_verify() {
        let key = KeyPair::generate();
        let mut data = Data::unsigned(Name::parse("/edu/site/CA/INFO").unwrap(), b"payload".as_slice())
            .with_freshness_ms(1_000);
        data.sign(&key, SignatureInfo::ecdsa(key_name()));

        let wire = data.encode();
        let decoded = Data::decode(&wire).unwrap();
        assert_eq!(decoded, data);
        assert!(decoded.verify(&key.public_key_bits()));
        assert!(!decoded.verify(&KeyPair::generate().public_key_bits()));
    }

    #[test]
    fn tampered_data_fails_verification() {
        let key = KeyPair::generate();
        let mut data = Data::unsigned(Name::parse("/edu/site/CA/INFO").unwrap(), b"payload".as_slice());
        data.sign(&key, SignatureInfo::ecdsa(key_name()));
        data.content = Bytes::from_static(b"tampered");
        assert!(!data.verify(&key.public_key_bits()));
    }

    #[test]
    fn interest_digest_appended_and_checked() {
        let key = KeyPair::generate();
        let mut interest = Interest::new(Name::parse("/edu/site/CA/NEW").unwrap())
            .with_parameters(b"parameters".as_slice());
        interest.sign(&key, key_name());

        assert!(interest.name.components().last().unwrap().is_params_digest());

        let wire = interest.encode();
        let decoded = Interest::decode(&wire).unwrap();
        assert_eq!(decoded, interest);
        assert!(decoded.verify(&key.public_key_bits()));
    }

    #[test]
    fn interest_digest_mismatch_rejected() {
        let key = KeyPair::generate();
        let mut interest = Interest::new(Name::parse("/edu/site/CA/NEW").unwrap())
            .with_parameters(b"parameters".as_slice());
        interest.sign(&key, key_name());
        interest.app_parameters = Some(Bytes::from_static(b"swapped"));

        let wire = interest.encode();
        assert!(Interest::decode(&wire).is_err());
    }

    #[test]
    fn unsigned_interest_roundtrip() {
        let interest = Interest::new(Name::parse("/edu/site/CA/INFO").unwrap());
        let decoded = Interest::decode(&interest.encode()).unwrap();
        assert_eq!(decoded, interest);
        assert!(!decoded.verify(&KeyPair::generate().public_key_bits()));
    }

    #[test]
    fn validity_period_roundtrip() {
        let period = ValidityPeriod::new(
            "2026-01-01T00:00:00Z".parse().unwrap(),
            "2027-01-01T00:00:00Z".parse().unwrap(),
        );
        let decoded = ValidityPeriod::decode_value(&period.encode_value()).unwrap();
        assert_eq!(decoded, period);
        assert!(period.contains("2026-06-01T00:00:00Z".parse().unwrap()));
        assert!(!period.contains("2027-06-01T00:00:00Z".parse().unwrap()));
    }
}
