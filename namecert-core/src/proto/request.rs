//! Session handshake: NEW/RENEW/REVOKE application parameters and the
//! authority's reply.

use bytes::{Bytes, BytesMut};

use crate::cert::Certificate;
use crate::crypto::SALT_LEN;
use crate::state::{RequestId, RequestType};
use crate::tlv::{self, tag, TlvError};

use super::info::utf8;

/// `{ecdhPub, certRequest | certToRevoke}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub ecdh_pub: Vec<u8>,
    pub cert: Certificate,
}

impl SessionRequest {
    fn cert_tag(request_type: RequestType) -> u64 {
        match request_type {
            RequestType::New | RequestType::Renew => tag::CERT_REQUEST,
            RequestType::Revoke => tag::CERT_TO_REVOKE,
        }
    }

    pub fn encode(&self, request_type: RequestType) -> Bytes {
        let mut buf = BytesMut::new();
        tlv::write_tlv(&mut buf, tag::ECDH_PUB, &self.ecdh_pub);
        tlv::write_tlv(&mut buf, Self::cert_tag(request_type), &self.cert.encode());
        buf.freeze()
    }

    pub fn decode(request_type: RequestType, value: &[u8]) -> Result<Self, TlvError> {
        let mut reader = tlv::Reader::new(value);
        let ecdh_pub = reader.expect(tag::ECDH_PUB)?.to_vec();
        if ecdh_pub.is_empty() {
            return Err(TlvError::BadValue {
                typ: tag::ECDH_PUB,
                reason: "empty key agreement point",
            });
        }
        let cert_raw = reader.expect(Self::cert_tag(request_type))?;
        let cert = Certificate::decode(cert_raw).map_err(|_| TlvError::BadValue {
            typ: Self::cert_tag(request_type),
            reason: "embedded certificate does not decode",
        })?;
        reader.finish()?;
        Ok(Self { ecdh_pub, cert })
    }
}

/// `{ecdhPubServer, salt, requestId, supportedChallenges[]}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResponse {
    pub ecdh_pub: Vec<u8>,
    pub salt: [u8; SALT_LEN],
    pub request_id: RequestId,
    pub challenges: Vec<String>,
}

impl SessionResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        tlv::write_tlv(&mut buf, tag::ECDH_PUB, &self.ecdh_pub);
        tlv::write_tlv(&mut buf, tag::SALT, &self.salt);
        tlv::write_tlv(&mut buf, tag::REQUEST_ID, self.request_id.as_bytes());
        for challenge in &self.challenges {
            tlv::write_tlv(&mut buf, tag::CHALLENGE, challenge.as_bytes());
        }
        buf.freeze()
    }

    pub fn decode(value: &[u8]) -> Result<Self, TlvError> {
        let mut reader = tlv::Reader::new(value);
        let ecdh_pub = reader.expect(tag::ECDH_PUB)?.to_vec();
        let salt: [u8; SALT_LEN] =
            reader
                .expect(tag::SALT)?
                .try_into()
                .map_err(|_| TlvError::BadValue {
                    typ: tag::SALT,
                    reason: "salt must be 32 bytes",
                })?;
        let request_id = RequestId::from_slice(reader.expect(tag::REQUEST_ID)?).ok_or(
            TlvError::BadValue {
                typ: tag::REQUEST_ID,
                reason: "request id must be 8 bytes",
            },
        )?;
        let mut challenges = Vec::new();
        while let Some(raw) = reader.expect_optional(tag::CHALLENGE)? {
            challenges.push(utf8(tag::CHALLENGE, raw)?);
        }
        reader.finish()?;
        Ok(Self {
            ecdh_pub,
            salt,
            request_id,
            challenges,
        })
    }
}
