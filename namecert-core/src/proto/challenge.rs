//! Challenge-round payloads, exchanged sealed under the session key.

use bytes::{Bytes, BytesMut};

use crate::name::Name;
use crate::state::Status;
use crate::tlv::{self, tag, TlvError};

use super::info::utf8;

/// Ordered challenge parameters; values may be binary (certificates,
/// signatures) so they stay raw bytes.
pub type ParameterMap = Vec<(String, Vec<u8>)>;

/// `{SelectedChallenge, (ParameterKey, ParameterValue)*}` from requester
/// to authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRequest {
    pub selected_challenge: String,
    pub parameters: ParameterMap,
}

impl ChallengeRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        tlv::write_tlv(
            &mut buf,
            tag::SELECTED_CHALLENGE,
            self.selected_challenge.as_bytes(),
        );
        for (key, value) in &self.parameters {
            tlv::write_tlv(&mut buf, tag::PARAMETER_KEY, key.as_bytes());
            tlv::write_tlv(&mut buf, tag::PARAMETER_VALUE, value);
        }
        buf.freeze()
    }

    pub fn decode(value: &[u8]) -> Result<Self, TlvError> {
        let mut reader = tlv::Reader::new(value);
        let selected_challenge = utf8(
            tag::SELECTED_CHALLENGE,
            reader.expect(tag::SELECTED_CHALLENGE)?,
        )?;
        let mut parameters = Vec::new();
        while let Some(raw) = reader.expect_optional(tag::PARAMETER_KEY)? {
            let key = utf8(tag::PARAMETER_KEY, raw)?;
            let value = reader.expect(tag::PARAMETER_VALUE)?.to_vec();
            parameters.push((key, value));
        }
        reader.finish()?;
        Ok(Self {
            selected_challenge,
            parameters,
        })
    }
}

/// Authority's round reply: the new status plus whatever the selected
/// module needs the requester to see (step marker, budget, public
/// parameters such as a possession nonce, the issued certificate name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeResponse {
    pub status: Status,
    pub challenge_status: Option<String>,
    pub remaining_tries: Option<u64>,
    pub remaining_time_secs: Option<u64>,
    pub parameters: ParameterMap,
    pub issued_cert_name: Option<Name>,
}

impl ChallengeResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        tlv::write_tlv(&mut buf, tag::STATUS, &[self.status.to_wire()]);
        if let Some(challenge_status) = &self.challenge_status {
            tlv::write_tlv(&mut buf, tag::CHALLENGE_STATUS, challenge_status.as_bytes());
        }
        if let Some(remaining_tries) = self.remaining_tries {
            tlv::write_tlv(&mut buf, tag::REMAINING_TRIES, &tlv::encode_nonneg(remaining_tries));
        }
        if let Some(remaining_time) = self.remaining_time_secs {
            tlv::write_tlv(&mut buf, tag::REMAINING_TIME, &tlv::encode_nonneg(remaining_time));
        }
        for (key, value) in &self.parameters {
            tlv::write_tlv(&mut buf, tag::PARAMETER_KEY, key.as_bytes());
            tlv::write_tlv(&mut buf, tag::PARAMETER_VALUE, value);
        }
        if let Some(name) = &self.issued_cert_name {
            tlv::write_tlv(&mut buf, tag::ISSUED_CERT_NAME, &name.encode());
        }
        buf.freeze()
    }

    pub fn decode(value: &[u8]) -> Result<Self, TlvError> {
        let mut reader = tlv::Reader::new(value);
        let status_raw = reader.expect(tag::STATUS)?;
        if status_raw.len() != 1 {
            return Err(TlvError::BadValue {
                typ: tag::STATUS,
                reason: "status must be one byte",
            });
        }
        let status = Status::from_wire(status_raw[0])?;
        let challenge_status = reader
            .expect_optional(tag::CHALLENGE_STATUS)?
            .map(|raw| utf8(tag::CHALLENGE_STATUS, raw))
            .transpose()?;
        let remaining_tries = reader
            .expect_optional(tag::REMAINING_TRIES)?
            .map(|raw| tlv::decode_nonneg(tag::REMAINING_TRIES, raw))
            .transpose()?;
        let remaining_time_secs = reader
            .expect_optional(tag::REMAINING_TIME)?
            .map(|raw| tlv::decode_nonneg(tag::REMAINING_TIME, raw))
            .transpose()?;
        let mut parameters = Vec::new();
        while let Some(raw) = reader.expect_optional(tag::PARAMETER_KEY)? {
            let key = utf8(tag::PARAMETER_KEY, raw)?;
            let value = reader.expect(tag::PARAMETER_VALUE)?.to_vec();
            parameters.push((key, value));
        }
        let issued_cert_name = reader
            .expect_optional(tag::ISSUED_CERT_NAME)?
            .map(Name::decode)
            .transpose()?;
        reader.finish()?;
        Ok(Self {
            status,
            challenge_status,
            remaining_tries,
            remaining_time_secs,
            parameters,
            issued_cert_name,
        })
    }
}
