//! Probe exchange: requester hints in, candidate names out.

use bytes::{Bytes, BytesMut};

use crate::name::Name;
use crate::tlv::{self, tag, TlvError};

use super::info::utf8;

/// Encode probe hints as ordered key/value pairs.
pub fn encode_probe_parameters(parameters: &[(String, String)]) -> Bytes {
    let mut buf = BytesMut::new();
    for (key, value) in parameters {
        tlv::write_tlv(&mut buf, tag::PARAMETER_KEY, key.as_bytes());
        tlv::write_tlv(&mut buf, tag::PARAMETER_VALUE, value.as_bytes());
    }
    buf.freeze()
}

pub fn decode_probe_parameters(value: &[u8]) -> Result<Vec<(String, String)>, TlvError> {
    let mut reader = tlv::Reader::new(value);
    let mut parameters = Vec::new();
    while !reader.is_empty() {
        let key = match reader.expect_optional(tag::PARAMETER_KEY)? {
            Some(raw) => utf8(tag::PARAMETER_KEY, raw)?,
            None => {
                reader.finish()?;
                break;
            }
        };
        let value = utf8(tag::PARAMETER_VALUE, reader.expect(tag::PARAMETER_VALUE)?)?;
        parameters.push((key, value));
    }
    Ok(parameters)
}

/// Candidate identity names for the requester, with the authority's
/// suffix budget echoed when configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub names: Vec<Name>,
    pub max_suffix_length: Option<u64>,
}

impl ProbeResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for name in &self.names {
            tlv::write_tlv(&mut buf, tag::PROBE_RESPONSE, &name.encode());
        }
        if let Some(max_suffix) = self.max_suffix_length {
            tlv::write_tlv(&mut buf, tag::MAX_SUFFIX_LENGTH, &tlv::encode_nonneg(max_suffix));
        }
        buf.freeze()
    }

    pub fn decode(value: &[u8]) -> Result<Self, TlvError> {
        let mut reader = tlv::Reader::new(value);
        let mut names = Vec::new();
        while let Some(raw) = reader.expect_optional(tag::PROBE_RESPONSE)? {
            names.push(Name::decode(raw)?);
        }
        let max_suffix_length = reader
            .expect_optional(tag::MAX_SUFFIX_LENGTH)?
            .map(|raw| tlv::decode_nonneg(tag::MAX_SUFFIX_LENGTH, raw))
            .transpose()?;
        reader.finish()?;
        Ok(Self {
            names,
            max_suffix_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_roundtrip() {
        let parameters = vec![
            ("email".to_owned(), "alice@example.net".to_owned()),
            ("site".to_owned(), "library".to_owned()),
        ];
        let decoded = decode_probe_parameters(&encode_probe_parameters(&parameters)).unwrap();
        assert_eq!(decoded, parameters);
    }

    #[test]
    fn response_roundtrip() {
        let response = ProbeResponse {
            names: vec![
                Name::parse("/edu/site/alice").unwrap(),
                Name::parse("/edu/site/alice-2").unwrap(),
            ],
            max_suffix_length: Some(2),
        };
        let decoded = ProbeResponse::decode(&response.encode()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn empty_response() {
        let response = ProbeResponse {
            names: vec![],
            max_suffix_length: None,
        };
        let decoded = ProbeResponse::decode(&response.encode()).unwrap();
        assert_eq!(decoded, response);
    }
}
