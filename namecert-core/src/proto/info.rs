//! CA profile content, served under `/<ca>/CA/INFO`.

use bytes::{Bytes, BytesMut};
use chrono::Duration;

use crate::cert::Certificate;
use crate::name::Name;
use crate::tlv::{self, tag, TlvError};

/// Everything a requester needs to know about an authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaProfile {
    pub ca_prefix: Name,
    pub ca_info: String,
    pub max_validity_period: Duration,
    pub max_suffix_length: Option<u64>,
    pub probe_parameter_keys: Vec<String>,
    pub supported_challenges: Vec<String>,
    pub certificate: Certificate,
}

impl CaProfile {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        tlv::write_tlv(&mut buf, tag::CA_PREFIX, &self.ca_prefix.encode());
        tlv::write_tlv(&mut buf, tag::CA_INFO, self.ca_info.as_bytes());
        for key in &self.probe_parameter_keys {
            tlv::write_tlv(&mut buf, tag::PARAMETER_KEY, key.as_bytes());
        }
        tlv::write_tlv(
            &mut buf,
            tag::MAX_VALIDITY_PERIOD,
            &tlv::encode_nonneg(self.max_validity_period.num_seconds().max(0) as u64),
        );
        if let Some(max_suffix) = self.max_suffix_length {
            tlv::write_tlv(&mut buf, tag::MAX_SUFFIX_LENGTH, &tlv::encode_nonneg(max_suffix));
        }
        for challenge in &self.supported_challenges {
            tlv::write_tlv(&mut buf, tag::CHALLENGE, challenge.as_bytes());
        }
        tlv::write_tlv(&mut buf, tag::CA_CERTIFICATE, &self.certificate.encode());
        buf.freeze()
    }

    pub fn decode(value: &[u8]) -> Result<Self, TlvError> {
        let mut reader = tlv::Reader::new(value);
        let ca_prefix = Name::decode(reader.expect(tag::CA_PREFIX)?)?;
        let ca_info = utf8(tag::CA_INFO, reader.expect(tag::CA_INFO)?)?;

        let mut probe_parameter_keys = Vec::new();
        while let Some(raw) = reader.expect_optional(tag::PARAMETER_KEY)? {
            probe_parameter_keys.push(utf8(tag::PARAMETER_KEY, raw)?);
        }

        let max_validity_period = Duration::seconds(
            tlv::decode_nonneg(
                tag::MAX_VALIDITY_PERIOD,
                reader.expect(tag::MAX_VALIDITY_PERIOD)?,
            )?
            .min(i64::MAX as u64) as i64,
        );
        let max_suffix_length = reader
            .expect_optional(tag::MAX_SUFFIX_LENGTH)?
            .map(|raw| tlv::decode_nonneg(tag::MAX_SUFFIX_LENGTH, raw))
            .transpose()?;

        let mut supported_challenges = Vec::new();
        while let Some(raw) = reader.expect_optional(tag::CHALLENGE)? {
            supported_challenges.push(utf8(tag::CHALLENGE, raw)?);
        }

        let certificate = Certificate::decode(reader.expect(tag::CA_CERTIFICATE)?)
            .map_err(|_| TlvError::BadValue {
                typ: tag::CA_CERTIFICATE,
                reason: "embedded certificate does not decode",
            })?;
        reader.finish()?;

        Ok(Self {
            ca_prefix,
            ca_info,
            max_validity_period,
            max_suffix_length,
            probe_parameter_keys,
            supported_challenges,
            certificate,
        })
    }
}

pub(super) fn utf8(typ: u64, raw: &[u8]) -> Result<String, TlvError> {
    String::from_utf8(raw.to_vec()).map_err(|_| TlvError::BadValue {
        typ,
        reason: "value is not UTF-8",
    })
}
