//! Challenge contract and registry.
//!
//! A challenge module gates issuance: the authority routes each
//! CHALLENGE round into the module named by the request, and the module
//! mutates the request state to reflect progress or failure. Modules are
//! registered once at startup; the registry is immutable afterwards.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};

use crate::cert::Certificate;
use crate::error::ErrorCode;
use crate::keys::KeyPair;
use crate::proto::ChallengeRequest;
use crate::state::{ChallengeState, RequestState, Status};

pub mod email;
pub mod possession;

pub use crate::proto::ParameterMap;

/// `(ErrorCode, message)` from a server-side challenge step.
/// [`ErrorCode::NoError`] means the mutated request state stands.
pub type ChallengeResult = (ErrorCode, String);

/// Failures on the client side of the challenge contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChallengeError {
    #[error("challenge cannot proceed from {status}/{challenge_status}")]
    UnexpectedState {
        status: Status,
        challenge_status: String,
    },

    #[error("parameters do not match the requested set")]
    ParameterMismatch,

    #[error("missing client context: {0}")]
    MissingContext(&'static str),
}

/// Local material a requester draws on to fulfill challenge parameters.
#[derive(Default)]
pub struct ClientContext<'a> {
    /// Email address to present to the email challenge.
    pub email: Option<String>,
    /// PIN the user read out of their inbox.
    pub pin: Option<String>,
    /// Existing credential certificate for the possession challenge.
    pub credential: Option<&'a Certificate>,
    /// Private key matching the credential.
    pub credential_key: Option<&'a KeyPair>,
    /// Server nonce to prove possession over.
    pub nonce: Option<[u8; 16]>,
    /// BLS private key matching a BLS credential.
    #[cfg(feature = "bls")]
    pub bls_credential_key: Option<&'a crate::keys::bls::BlsKeyPair>,
}

/// The behavioral contract every challenge module satisfies.
#[async_trait]
pub trait ChallengeModule: Send + Sync {
    fn challenge_type(&self) -> &'static str;

    /// How many failed parameter checks a request survives.
    fn max_attempt_times(&self) -> u32;

    /// How long challenge secrets stay usable.
    fn secret_lifetime(&self) -> Duration;

    /// Parameters the requester must provide next, as `(name, prompt)`.
    fn requested_parameters(
        &self,
        status: Status,
        challenge_status: &str,
    ) -> Result<Vec<(String, String)>, ChallengeError>;

    /// Server-side step. Mutates `request` and reports the outcome. Apart
    /// from injected collaborators this is deterministic in its inputs
    /// and performs no I/O of its own.
    async fn handle_challenge_request(
        &self,
        parameters: &ParameterMap,
        request: &mut RequestState,
        now: DateTime<Utc>,
    ) -> ChallengeResult;

    /// Parameters the authority discloses to the requester with the next
    /// round's response (e.g. a fresh possession nonce).
    fn response_parameters(&self, _request: &RequestState) -> ParameterMap {
        Vec::new()
    }

    /// Client-side step: fill in parameter values from local material.
    fn fulfill_parameters(
        &self,
        parameters: &mut ParameterMap,
        context: &ClientContext<'_>,
    ) -> Result<(), ChallengeError>;

    /// Client-side encoder for the round's plaintext payload. The
    /// provided parameters must match [`Self::requested_parameters`] for
    /// the given step.
    fn gen_challenge_request(
        &self,
        status: Status,
        challenge_status: &str,
        parameters: &ParameterMap,
    ) -> Result<Bytes, ChallengeError> {
        let expected = self.requested_parameters(status, challenge_status)?;
        let matches = parameters.len() == expected.len()
            && parameters
                .iter()
                .zip(&expected)
                .all(|((key, _), (expected_key, _))| key == expected_key);
        if !matches {
            return Err(ChallengeError::ParameterMismatch);
        }
        Ok(ChallengeRequest {
            selected_challenge: self.challenge_type().to_owned(),
            parameters: parameters.clone(),
        }
        .encode())
    }
}

/// Terminate the request with a failure.
pub fn fail(request: &mut RequestState, code: ErrorCode, info: &str) -> ChallengeResult {
    request.status = Status::Failure;
    request.challenge_state = None;
    (code, info.to_owned())
}

/// Enter (or re-enter) the challenge with fresh bookkeeping.
pub fn start(
    request: &mut RequestState,
    challenge_status: &str,
    secrets: BTreeMap<String, String>,
    max_attempts: u32,
    secret_lifetime: Duration,
    now: DateTime<Utc>,
) -> ChallengeResult {
    request.status = Status::Challenge;
    request.challenge_state = Some(ChallengeState::new(
        challenge_status,
        secrets,
        max_attempts,
        secret_lifetime,
        now,
    ));
    (ErrorCode::NoError, String::new())
}

/// Mark the challenge passed; the authority takes it from PENDING.
pub fn succeed(request: &mut RequestState) -> ChallengeResult {
    request.status = Status::Pending;
    request.challenge_state = None;
    (ErrorCode::NoError, String::new())
}

/// Burn one attempt. While attempts remain the request stays in
/// CHALLENGE and the round is answered normally; on exhaustion the
/// request fails with the given code.
pub fn failed_attempt(
    request: &mut RequestState,
    code: ErrorCode,
    info: &str,
) -> ChallengeResult {
    let Some(challenge) = request.challenge_state.as_mut() else {
        return fail(request, code, info);
    };
    challenge.remaining_attempts = challenge.remaining_attempts.saturating_sub(1);
    if challenge.remaining_attempts == 0 {
        fail(request, code, info)
    } else {
        (ErrorCode::NoError, String::new())
    }
}

/// Immutable name-to-module table, populated once at startup.
pub struct ChallengeRegistry {
    modules: HashMap<String, Arc<dyn ChallengeModule>>,
}

impl ChallengeRegistry {
    pub fn builder() -> ChallengeRegistryBuilder {
        ChallengeRegistryBuilder {
            modules: HashMap::new(),
        }
    }

    pub fn get(&self, challenge_type: &str) -> Option<Arc<dyn ChallengeModule>> {
        self.modules.get(challenge_type).cloned()
    }

    pub fn contains(&self, challenge_type: &str) -> bool {
        self.modules.contains_key(challenge_type)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }
}

pub struct ChallengeRegistryBuilder {
    modules: HashMap<String, Arc<dyn ChallengeModule>>,
}

impl ChallengeRegistryBuilder {
    #[must_use]
    pub fn register(mut self, module: Arc<dyn ChallengeModule>) -> Self {
        self.modules
            .insert(module.challenge_type().to_owned(), module);
        self
    }

    pub fn build(self) -> ChallengeRegistry {
        ChallengeRegistry {
            modules: self.modules,
        }
    }
}
