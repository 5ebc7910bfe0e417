//! Wire-level error taxonomy.
//!
//! Every failure the authority reports to a requester is one of these
//! codes; internal errors never cross the wire.

use std::fmt;

use crate::tlv::TlvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    /// Malformed TLV, missing required field, undecodable key.
    BadInterestFormat,
    /// Parameter block that decodes but is structurally wrong.
    BadParameterFormat,
    /// A packet or interest signature does not verify.
    BadSignature,
    /// Semantically wrong parameters, signature mismatch, unknown anchor.
    InvalidParameter,
    /// Requested certificate name violates the assignment policy.
    NameNotAllowed,
    /// Requested validity outside authority policy.
    BadValidityPeriod,
    /// Challenge attempts exhausted.
    OutOfTries,
    /// Challenge secret lifetime elapsed.
    ChallengeExpired,
    /// No candidate names could be assigned.
    NoAvailableNames,
    /// Reentrant or counter-reusing interest for an in-flight request.
    OutOfOrder,
}

impl ErrorCode {
    pub fn to_wire(self) -> u64 {
        match self {
            Self::NoError => 0,
            Self::BadInterestFormat => 1,
            Self::BadParameterFormat => 2,
            Self::BadSignature => 3,
            Self::InvalidParameter => 4,
            Self::NameNotAllowed => 5,
            Self::BadValidityPeriod => 6,
            Self::OutOfTries => 7,
            Self::ChallengeExpired => 8,
            Self::NoAvailableNames => 9,
            Self::OutOfOrder => 10,
        }
    }

    pub fn from_wire(value: u64) -> Result<Self, TlvError> {
        match value {
            0 => Ok(Self::NoError),
            1 => Ok(Self::BadInterestFormat),
            2 => Ok(Self::BadParameterFormat),
            3 => Ok(Self::BadSignature),
            4 => Ok(Self::InvalidParameter),
            5 => Ok(Self::NameNotAllowed),
            6 => Ok(Self::BadValidityPeriod),
            7 => Ok(Self::OutOfTries),
            8 => Ok(Self::ChallengeExpired),
            9 => Ok(Self::NoAvailableNames),
            10 => Ok(Self::OutOfOrder),
            _ => Err(TlvError::BadValue {
                typ: crate::tlv::tag::ERROR_CODE,
                reason: "unknown error code",
            }),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoError => "NO_ERROR",
            Self::BadInterestFormat => "BAD_INTEREST_FORMAT",
            Self::BadParameterFormat => "BAD_PARAMETER_FORMAT",
            Self::BadSignature => "BAD_SIGNATURE",
            Self::InvalidParameter => "INVALID_PARAMETER",
            Self::NameNotAllowed => "NAME_NOT_ALLOWED",
            Self::BadValidityPeriod => "BAD_VALIDITY_PERIOD",
            Self::OutOfTries => "OUT_OF_TRIES",
            Self::ChallengeExpired => "CHALLENGE_EXPIRED",
            Self::NoAvailableNames => "NO_AVAILABLE_NAMES",
            Self::OutOfOrder => "OUT_OF_ORDER",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        for value in 0..=10 {
            let code = ErrorCode::from_wire(value).unwrap();
            assert_eq!(code.to_wire(), value);
        }
        assert!(ErrorCode::from_wire(99).is_err());
    }
}
