//! Proof-of-possession challenge.
//!
//! Phase one takes exactly the requester's existing credential
//! certificate, checks it against the configured trust anchors and hands
//! back a fresh nonce. Phase two takes exactly a signature over that
//! nonce under the credential's key. One failed proof is terminal.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;

use crate::cert::Certificate;
use crate::error::ErrorCode;
use crate::keys::{classify_key, verify_signature};
use crate::state::{RequestState, Status};

use super::{
    fail, failed_attempt, start, succeed, ChallengeError, ChallengeModule, ChallengeResult,
    ClientContext, ParameterMap,
};

pub const CHALLENGE_TYPE: &str = "possession";

const PARAMETER_KEY_CREDENTIAL: &str = "issued-cert";
const PARAMETER_KEY_PROOF: &str = "proof";
const PARAMETER_KEY_NONCE: &str = "nonce";
const SECRET_NONCE: &str = "nonce";
const SECRET_CREDENTIAL: &str = "issued-cert";
const NEED_PROOF: &str = "need-proof";

const MAX_ATTEMPT_TIMES: u32 = 1;
const SECRET_LIFETIME_SECS: i64 = 60;

pub struct PossessionChallenge {
    trust_anchors: Vec<Certificate>,
}

impl PossessionChallenge {
    pub fn new(trust_anchors: Vec<Certificate>) -> Self {
        Self { trust_anchors }
    }

    /// Any anchor whose key name matches the credential's key locator and
    /// whose key verifies the credential suffices.
    fn credential_trusted(&self, credential: &Certificate) -> bool {
        self.trust_anchors
            .iter()
            .any(|anchor| credential.verify_signed_by(anchor))
    }
}

#[async_trait]
impl ChallengeModule for PossessionChallenge {
    fn challenge_type(&self) -> &'static str {
        CHALLENGE_TYPE
    }

    fn max_attempt_times(&self) -> u32 {
        MAX_ATTEMPT_TIMES
    }

    fn secret_lifetime(&self) -> Duration {
        Duration::seconds(SECRET_LIFETIME_SECS)
    }

    fn requested_parameters(
        &self,
        status: Status,
        challenge_status: &str,
    ) -> Result<Vec<(String, String)>, ChallengeError> {
        match (status, challenge_status) {
            (Status::BeforeChallenge, _) => Ok(vec![(
                PARAMETER_KEY_CREDENTIAL.to_owned(),
                "The certificate issued to you by a trusted authority".to_owned(),
            )]),
            (Status::Challenge, NEED_PROOF) => Ok(vec![(
                PARAMETER_KEY_PROOF.to_owned(),
                "A signature over the server nonce under the credential key".to_owned(),
            )]),
            _ => Err(ChallengeError::UnexpectedState {
                status,
                challenge_status: challenge_status.to_owned(),
            }),
        }
    }

    async fn handle_challenge_request(
        &self,
        parameters: &ParameterMap,
        request: &mut RequestState,
        now: DateTime<Utc>,
    ) -> ChallengeResult {
        match request.status {
            Status::BeforeChallenge => {
                // Phase one accepts exactly the credential, nothing else.
                let [(key, raw_credential)] = parameters.as_slice() else {
                    return fail(
                        request,
                        ErrorCode::BadInterestFormat,
                        "expected exactly one parameter: issued-cert",
                    );
                };
                if key != PARAMETER_KEY_CREDENTIAL {
                    return fail(
                        request,
                        ErrorCode::BadInterestFormat,
                        "expected exactly one parameter: issued-cert",
                    );
                }
                let Ok(credential) = Certificate::decode(raw_credential) else {
                    return fail(
                        request,
                        ErrorCode::BadInterestFormat,
                        "credential certificate does not decode",
                    );
                };
                if classify_key(credential.public_key_bits()).is_err() {
                    return fail(request, ErrorCode::BadInterestFormat, "bad public key");
                }
                if !self.credential_trusted(&credential) {
                    return fail(
                        request,
                        ErrorCode::InvalidParameter,
                        "certificate cannot be verified",
                    );
                }

                let mut nonce = [0u8; 16];
                rand::rngs::OsRng.fill_bytes(&mut nonce);
                let mut secrets = BTreeMap::new();
                secrets.insert(SECRET_NONCE.to_owned(), hex::encode(nonce));
                secrets.insert(
                    SECRET_CREDENTIAL.to_owned(),
                    hex::encode(credential.encode()),
                );
                tracing::debug!(request_id = %request.request_id, "possession nonce issued");

                start(
                    request,
                    NEED_PROOF,
                    secrets,
                    self.max_attempt_times(),
                    self.secret_lifetime(),
                    now,
                )
            }
            Status::Challenge
                if request
                    .challenge_state
                    .as_ref()
                    .is_some_and(|c| c.challenge_status == NEED_PROOF) =>
            {
                // Phase two accepts exactly the proof; the credential must
                // not be resubmitted.
                let [(key, proof)] = parameters.as_slice() else {
                    return fail(
                        request,
                        ErrorCode::BadInterestFormat,
                        "expected exactly one parameter: proof",
                    );
                };
                if key != PARAMETER_KEY_PROOF {
                    return fail(
                        request,
                        ErrorCode::BadInterestFormat,
                        "expected exactly one parameter: proof",
                    );
                }

                let secrets = &request
                    .challenge_state
                    .as_ref()
                    .expect("challenge state present in CHALLENGE status")
                    .secrets;
                let credential = secrets
                    .get(SECRET_CREDENTIAL)
                    .and_then(|stored| hex::decode(stored).ok())
                    .and_then(|wire| Certificate::decode(&wire).ok());
                let nonce = secrets
                    .get(SECRET_NONCE)
                    .and_then(|stored| hex::decode(stored).ok());
                let (Some(credential), Some(nonce)) = (credential, nonce) else {
                    return fail(
                        request,
                        ErrorCode::InvalidParameter,
                        "challenge secrets unreadable",
                    );
                };

                if verify_signature(credential.public_key_bits(), &nonce, proof) {
                    succeed(request)
                } else {
                    failed_attempt(
                        request,
                        ErrorCode::InvalidParameter,
                        "cannot verify the proof of private key against the credential",
                    )
                }
            }
            _ => fail(
                request,
                ErrorCode::InvalidParameter,
                "unrecognized challenge step",
            ),
        }
    }

    fn response_parameters(&self, request: &RequestState) -> ParameterMap {
        // The fresh nonce travels back to the requester with the
        // need-proof round.
        match &request.challenge_state {
            Some(challenge) if challenge.challenge_status == NEED_PROOF => challenge
                .secrets
                .get(SECRET_NONCE)
                .and_then(|stored| hex::decode(stored).ok())
                .map(|nonce| vec![(PARAMETER_KEY_NONCE.to_owned(), nonce)])
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    fn fulfill_parameters(
        &self,
        parameters: &mut ParameterMap,
        context: &ClientContext<'_>,
    ) -> Result<(), ChallengeError> {
        for (key, value) in parameters.iter_mut() {
            match key.as_str() {
                PARAMETER_KEY_CREDENTIAL => {
                    let credential = context
                        .credential
                        .ok_or(ChallengeError::MissingContext("credential certificate"))?;
                    *value = credential.encode().to_vec();
                }
                PARAMETER_KEY_PROOF => {
                    let nonce = context
                        .nonce
                        .ok_or(ChallengeError::MissingContext("server nonce"))?;
                    #[cfg(feature = "bls")]
                    if let Some(bls_key) = context.bls_credential_key {
                        *value = bls_key.sign(&nonce);
                        continue;
                    }
                    let credential_key = context
                        .credential_key
                        .ok_or(ChallengeError::MissingContext("credential key"))?;
                    *value = credential_key.sign(&nonce);
                }
                _ => return Err(ChallengeError::ParameterMismatch),
            }
        }
        Ok(())
    }
}
