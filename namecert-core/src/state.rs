//! Request lifecycle state.
//!
//! One [`RequestState`] exists per live request on the authority side,
//! keyed by the 8-byte [`RequestId`]. The record is mutated only by the
//! handler owning that id for the duration of one interest.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};

use crate::cert::Certificate;
use crate::crypto::SessionKey;
use crate::name::Name;
use crate::tlv::TlvError;

/// Opaque 8-byte handle binding a client/authority session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId([u8; 8]);

impl RequestId {
    pub const LEN: usize = 8;

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    pub fn from_hex(text: &str) -> Option<Self> {
        let raw = hex::decode(text).ok()?;
        Self::from_slice(&raw)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.to_hex())
    }
}

/// What the requester is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    New,
    Renew,
    Revoke,
}

impl RequestType {
    pub fn to_wire(self) -> u64 {
        match self {
            Self::New => 1,
            Self::Renew => 2,
            Self::Revoke => 3,
        }
    }

    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::New),
            2 => Some(Self::Renew),
            3 => Some(Self::Revoke),
            _ => None,
        }
    }

    /// The operation component in interest names.
    pub fn op_name(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Renew => "RENEW",
            Self::Revoke => "REVOKE",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op_name())
    }
}

/// Where a request stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    BeforeChallenge,
    Challenge,
    Pending,
    Success,
    Failure,
}

impl Status {
    pub fn to_wire(self) -> u8 {
        match self {
            Self::BeforeChallenge => 0,
            Self::Challenge => 1,
            Self::Pending => 2,
            Self::Success => 3,
            Self::Failure => 4,
        }
    }

    pub fn from_wire(value: u8) -> Result<Self, TlvError> {
        match value {
            0 => Ok(Self::BeforeChallenge),
            1 => Ok(Self::Challenge),
            2 => Ok(Self::Pending),
            3 => Ok(Self::Success),
            4 => Ok(Self::Failure),
            _ => Err(TlvError::BadValue {
                typ: crate::tlv::tag::STATUS,
                reason: "unknown status value",
            }),
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::BeforeChallenge => "before-challenge",
            Self::Challenge => "challenge",
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
        };
        f.write_str(text)
    }
}

/// Challenge bookkeeping, present exactly while `status == Challenge`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeState {
    /// Module-defined step marker, e.g. `need-code` or `need-proof`.
    pub challenge_status: String,
    /// Module secrets, values hex-encoded where binary.
    pub secrets: BTreeMap<String, String>,
    pub remaining_attempts: u32,
    pub secret_lifetime: Duration,
    pub challenge_begin: DateTime<Utc>,
}

impl ChallengeState {
    pub fn new(
        challenge_status: impl Into<String>,
        secrets: BTreeMap<String, String>,
        remaining_attempts: u32,
        secret_lifetime: Duration,
        challenge_begin: DateTime<Utc>,
    ) -> Self {
        Self {
            challenge_status: challenge_status.into(),
            secrets,
            remaining_attempts,
            secret_lifetime,
            challenge_begin,
        }
    }

    /// `max(0, secretLifetime − (now − challengeBegin))`.
    pub fn remaining_time(&self, now: DateTime<Utc>) -> Duration {
        (self.secret_lifetime - (now - self.challenge_begin)).max(Duration::zero())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.challenge_begin > self.secret_lifetime
    }
}

/// Authority-side record of one certificate request.
#[derive(Debug, Clone)]
pub struct RequestState {
    pub request_id: RequestId,
    pub ca_prefix: Name,
    pub request_type: RequestType,
    pub status: Status,
    /// Certificate being requested (NEW/RENEW) or revoked (REVOKE).
    pub cert: Certificate,
    pub encryption_key: SessionKey,
    /// Next counter for payloads this authority seals.
    pub aes_block_counter: u32,
    /// Highest counter seen from the requester.
    pub peer_counter: Option<u32>,
    pub challenge_type: Option<String>,
    pub challenge_state: Option<ChallengeState>,
    /// Encoded reply to the requester's last counter, replayed on
    /// retransmission of the same `(requestId, counter)`.
    pub last_reply: Option<(u32, Bytes)>,
    pub created_at: DateTime<Utc>,
    /// Set when the request reaches a terminal status; drives the grace
    /// window before the record is purged.
    pub terminal_at: Option<DateTime<Utc>>,
}

impl RequestState {
    pub fn new(
        request_id: RequestId,
        ca_prefix: Name,
        request_type: RequestType,
        cert: Certificate,
        encryption_key: SessionKey,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            ca_prefix,
            request_type,
            status: Status::BeforeChallenge,
            cert,
            encryption_key,
            aes_block_counter: crate::crypto::AUTHORITY_COUNTER_BASE,
            peer_counter: None,
            challenge_type: None,
            challenge_state: None,
            last_reply: None,
            created_at,
            terminal_at: None,
        }
    }

    /// Claim the next counter for an outgoing sealed payload.
    pub fn next_block_counter(&mut self) -> u32 {
        let counter = self.aes_block_counter;
        self.aes_block_counter = self.aes_block_counter.wrapping_add(1);
        counter
    }

    pub fn mark_terminal(&mut self, now: DateTime<Utc>) {
        debug_assert!(self.status.is_terminal());
        self.challenge_state = None;
        if self.terminal_at.is_none() {
            self.terminal_at = Some(now);
        }
    }

    /// True once the record may be purged: the challenge lifetime elapsed
    /// on a live request, or the grace window elapsed on a terminal one.
    pub fn is_reapable(&self, now: DateTime<Utc>, terminal_grace: Duration) -> bool {
        match self.terminal_at {
            Some(at) => now - at > terminal_grace,
            None => self
                .challenge_state
                .as_ref()
                .is_some_and(|challenge| challenge.is_expired(now)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_hex_roundtrip() {
        let id = RequestId::from_bytes([0xAB, 1, 2, 3, 4, 5, 6, 0xCD]);
        assert_eq!(id.to_hex(), "ab010203040506cd");
        assert_eq!(RequestId::from_hex(&id.to_hex()), Some(id));
        assert_eq!(RequestId::from_hex("zz"), None);
        assert_eq!(RequestId::from_hex("ab01"), None);
    }

    #[test]
    fn status_wire_roundtrip() {
        for status in [
            Status::BeforeChallenge,
            Status::Challenge,
            Status::Pending,
            Status::Success,
            Status::Failure,
        ] {
            assert_eq!(Status::from_wire(status.to_wire()).unwrap(), status);
        }
        assert!(Status::from_wire(9).is_err());
        assert!(Status::Success.is_terminal());
        assert!(Status::Failure.is_terminal());
        assert!(!Status::Challenge.is_terminal());
    }

    #[test]
    fn remaining_time_clamps_to_zero() {
        let begin: DateTime<Utc> = "2026-01-01T00:00:00Z".parse().unwrap();
        let state = ChallengeState::new(
            "need-code",
            BTreeMap::new(),
            3,
            Duration::seconds(60),
            begin,
        );

        let halfway = begin + Duration::seconds(20);
        assert_eq!(state.remaining_time(halfway), Duration::seconds(40));
        assert!(!state.is_expired(halfway));

        let late = begin + Duration::seconds(61);
        assert_eq!(state.remaining_time(late), Duration::zero());
        assert!(state.is_expired(late));
    }
}
