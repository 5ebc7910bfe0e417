//! Error content blocks.

use bytes::{Bytes, BytesMut};

use crate::error::ErrorCode;
use crate::tlv::{self, tag, TlvError};

/// `{ErrorCode, ErrorInfo}`, carried plain in a signed error data packet
/// or sealed under the request's session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContent {
    pub code: ErrorCode,
    pub info: String,
}

impl ErrorContent {
    pub fn new(code: ErrorCode, info: impl Into<String>) -> Self {
        Self {
            code,
            info: info.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        tlv::write_tlv(&mut buf, tag::ERROR_CODE, &tlv::encode_nonneg(self.code.to_wire()));
        tlv::write_tlv(&mut buf, tag::ERROR_INFO, self.info.as_bytes());
        buf.freeze()
    }

    pub fn decode(value: &[u8]) -> Result<Self, TlvError> {
        let mut reader = tlv::Reader::new(value);
        let code = ErrorCode::from_wire(tlv::decode_nonneg(
            tag::ERROR_CODE,
            reader.expect(tag::ERROR_CODE)?,
        )?)?;
        let info = String::from_utf8(reader.expect(tag::ERROR_INFO)?.to_vec()).map_err(|_| {
            TlvError::BadValue {
                typ: tag::ERROR_INFO,
                reason: "error info is not UTF-8",
            }
        })?;
        reader.finish()?;
        Ok(Self { code, info })
    }

    /// Whether a content block leads with an error code, distinguishing
    /// error payloads from regular responses on the same channel.
    pub fn peek(value: &[u8]) -> bool {
        tlv::Reader::new(value).peek_type() == Some(tag::ERROR_CODE)
    }
}
