//! Email-PIN challenge.
//!
//! Round one takes the requester's email address, checks it against the
//! configured whitelist, and hands a 6-digit PIN to the injected mail
//! collaborator. Round two compares the submitted PIN against the stored
//! one in constant time. A wrong PIN burns an attempt; any parameter set
//! other than exactly `{code}` during `need-code` is rejected outright.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use regex::Regex;
use subtle::ConstantTimeEq;

use crate::error::ErrorCode;
use crate::name::Name;
use crate::state::{RequestState, Status};

use super::{
    fail, failed_attempt, start, succeed, ChallengeError, ChallengeModule, ChallengeResult,
    ClientContext, ParameterMap,
};

pub const CHALLENGE_TYPE: &str = "email";

const PARAMETER_KEY_EMAIL: &str = "email";
const PARAMETER_KEY_CODE: &str = "code";
const SECRET_CODE: &str = "code";
const SECRET_EMAIL: &str = "email";
const NEED_CODE: &str = "need-code";

const MAX_ATTEMPT_TIMES: u32 = 3;
const SECRET_LIFETIME_SECS: i64 = 300;

/// Delivery failure reported by an [`EmailSender`].
#[derive(Debug, thiserror::Error)]
#[error("email delivery failed: {0}")]
pub struct EmailSendError(pub String);

/// Collaborator that actually delivers the PIN. Injected so the module
/// itself stays free of network I/O.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_code(
        &self,
        email: &str,
        code: &str,
        ca_prefix: &Name,
        cert_name: &Name,
    ) -> Result<(), EmailSendError>;
}

pub struct EmailChallenge {
    whitelist: Vec<Regex>,
    sender: Arc<dyn EmailSender>,
}

impl EmailChallenge {
    /// An empty whitelist admits every address.
    pub fn new(whitelist: Vec<Regex>, sender: Arc<dyn EmailSender>) -> Self {
        Self { whitelist, sender }
    }

    fn email_allowed(&self, email: &str) -> bool {
        self.whitelist.is_empty() || self.whitelist.iter().any(|re| re.is_match(email))
    }

    fn generate_pin() -> String {
        format!("{:06}", rand::rngs::OsRng.gen_range(0..1_000_000u32))
    }
}

#[async_trait]
impl ChallengeModule for EmailChallenge {
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
                PARAMETER_KEY_EMAIL.to_owned(),
                "Your email address".to_owned(),
            )]),
            (Status::Challenge, NEED_CODE) => Ok(vec![(
                PARAMETER_KEY_CODE.to_owned(),
                "The PIN code delivered to your inbox".to_owned(),
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
                let [(key, value)] = parameters.as_slice() else {
                    return fail(
                        request,
                        ErrorCode::InvalidParameter,
                        "expected exactly one parameter: email",
                    );
                };
                if key != PARAMETER_KEY_EMAIL {
                    return fail(
                        request,
                        ErrorCode::InvalidParameter,
                        "expected exactly one parameter: email",
                    );
                }
                let Ok(email) = std::str::from_utf8(value) else {
                    return fail(
                        request,
                        ErrorCode::InvalidParameter,
                        "email address is not UTF-8",
                    );
                };
                if !self.email_allowed(email) {
                    return fail(
                        request,
                        ErrorCode::InvalidParameter,
                        "email address rejected by policy",
                    );
                }

                let pin = Self::generate_pin();
                let mut secrets = BTreeMap::new();
                secrets.insert(SECRET_CODE.to_owned(), pin.clone());
                secrets.insert(SECRET_EMAIL.to_owned(), email.to_owned());

                if let Err(error) = self
                    .sender
                    .send_code(email, &pin, &request.ca_prefix, request.cert.name())
                    .await
                {
                    tracing::warn!(request_id = %request.request_id, %error, "PIN delivery failed");
                }

                start(
                    request,
                    NEED_CODE,
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
                    .is_some_and(|c| c.challenge_status == NEED_CODE) =>
            {
                let [(key, submitted)] = parameters.as_slice() else {
                    return fail(
                        request,
                        ErrorCode::InvalidParameter,
                        "expected exactly one parameter: code",
                    );
                };
                if key != PARAMETER_KEY_CODE {
                    return fail(
                        request,
                        ErrorCode::InvalidParameter,
                        "expected exactly one parameter: code",
                    );
                }
                let expected = request
                    .challenge_state
                    .as_ref()
                    .and_then(|c| c.secrets.get(SECRET_CODE))
                    .cloned()
                    .unwrap_or_default();
                let matches = submitted.len() == expected.len()
                    && bool::from(submitted.as_slice().ct_eq(expected.as_bytes()));
                if matches {
                    succeed(request)
                } else {
                    failed_attempt(request, ErrorCode::OutOfTries, "PIN attempts exhausted")
                }
            }
            _ => fail(
                request,
                ErrorCode::InvalidParameter,
                "unrecognized challenge step",
            ),
        }
    }

    fn fulfill_parameters(
        &self,
        parameters: &mut ParameterMap,
        context: &ClientContext<'_>,
    ) -> Result<(), ChallengeError> {
        for (key, value) in parameters.iter_mut() {
            match key.as_str() {
                PARAMETER_KEY_EMAIL => {
                    let email = context
                        .email
                        .as_ref()
                        .ok_or(ChallengeError::MissingContext("email address"))?;
                    *value = email.clone().into_bytes();
                }
                PARAMETER_KEY_CODE => {
                    let pin = context
                        .pin
                        .as_ref()
                        .ok_or(ChallengeError::MissingContext("PIN code"))?;
                    *value = pin.clone().into_bytes();
                }
                _ => return Err(ChallengeError::ParameterMismatch),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert;
    use crate::crypto::SessionKey;
    use crate::keys::KeyPair;
    use crate::packet::ValidityPeriod;
    use crate::state::{RequestId, RequestType};
    use std::sync::Mutex;

    struct RecordingSender {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl EmailSender for RecordingSender {
        async fn send_code(
            &self,
            email: &str,
            code: &str,
            _ca_prefix: &Name,
            _cert_name: &Name,
        ) -> Result<(), EmailSendError> {
            self.sent
                .lock()
                .unwrap()
                .push((email.to_owned(), code.to_owned()));
            Ok(())
        }
    }

    fn challenge() -> (EmailChallenge, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender {
            sent: Mutex::new(Vec::new()),
        });
        let whitelist = vec![Regex::new(r"^[^@]+@example\.net$").unwrap()];
        (EmailChallenge::new(whitelist, sender.clone()), sender)
    }

    fn request_state() -> RequestState {
        let key = KeyPair::generate();
        let cert = cert::self_signed(
            &key,
            &Name::parse("/edu/site/alice").unwrap(),
            ValidityPeriod::new(
                "2026-01-01T00:00:00Z".parse().unwrap(),
                "2026-02-01T00:00:00Z".parse().unwrap(),
            ),
        );
        RequestState::new(
            RequestId::from_bytes([1; 8]),
            Name::parse("/edu/site").unwrap(),
            RequestType::New,
            cert,
            SessionKey::from_bytes([0; 16]),
            "2026-01-01T00:00:00Z".parse().unwrap(),
        )
    }

    fn now() -> DateTime<Utc> {
        "2026-01-01T00:00:00Z".parse().unwrap()
    }

    fn email_param(address: &str) -> ParameterMap {
        vec![(PARAMETER_KEY_EMAIL.to_owned(), address.as_bytes().to_vec())]
    }

    fn code_param(code: &str) -> ParameterMap {
        vec![(PARAMETER_KEY_CODE.to_owned(), code.as_bytes().to_vec())]
    }

    #[tokio::test]
    async fn happy_path_sends_pin_then_accepts_it() {
        let (challenge, sender) = challenge();
        let mut request = request_state();

        let (code, _) = challenge
            .handle_challenge_request(&email_param("alice@example.net"), &mut request, now())
            .await;
        assert_eq!(code, ErrorCode::NoError);
        assert_eq!(request.status, Status::Challenge);
        let state = request.challenge_state.as_ref().unwrap();
        assert_eq!(state.challenge_status, NEED_CODE);
        assert_eq!(state.remaining_attempts, MAX_ATTEMPT_TIMES);

        let pin = sender.sent.lock().unwrap()[0].1.clone();
        assert_eq!(pin.len(), 6);

        let (code, _) = challenge
            .handle_challenge_request(&code_param(&pin), &mut request, now())
            .await;
        assert_eq!(code, ErrorCode::NoError);
        assert_eq!(request.status, Status::Pending);
    }

    #[tokio::test]
    async fn rejected_address_fails_terminally() {
        let (challenge, _) = challenge();
        let mut request = request_state();

        let (code, _) = challenge
            .handle_challenge_request(&email_param("mallory@evil.example"), &mut request, now())
            .await;
        assert_eq!(code, ErrorCode::InvalidParameter);
        assert_eq!(request.status, Status::Failure);
    }

    #[tokio::test]
    async fn wrong_pin_decrements_then_right_pin_succeeds() {
        let (challenge, sender) = challenge();
        let mut request = request_state();
        challenge
            .handle_challenge_request(&email_param("alice@example.net"), &mut request, now())
            .await;

        let (code, _) = challenge
            .handle_challenge_request(&code_param("000000"), &mut request, now())
            .await;
        assert_eq!(code, ErrorCode::NoError);
        assert_eq!(request.status, Status::Challenge);
        assert_eq!(
            request.challenge_state.as_ref().unwrap().remaining_attempts,
            MAX_ATTEMPT_TIMES - 1
        );

        let pin = sender.sent.lock().unwrap()[0].1.clone();
        let (code, _) = challenge
            .handle_challenge_request(&code_param(&pin), &mut request, now())
            .await;
        assert_eq!(code, ErrorCode::NoError);
        assert_eq!(request.status, Status::Pending);
    }

    #[tokio::test]
    async fn attempts_exhaust_to_out_of_tries() {
        let (challenge, _) = challenge();
        let mut request = request_state();
        challenge
            .handle_challenge_request(&email_param("alice@example.net"), &mut request, now())
            .await;

        for round in 0..MAX_ATTEMPT_TIMES {
            let (code, _) = challenge
                .handle_challenge_request(&code_param("999999x"), &mut request, now())
                .await;
            if round + 1 < MAX_ATTEMPT_TIMES {
                assert_eq!(code, ErrorCode::NoError);
                assert_eq!(request.status, Status::Challenge);
            } else {
                assert_eq!(code, ErrorCode::OutOfTries);
                assert_eq!(request.status, Status::Failure);
            }
        }
    }

    #[tokio::test]
    async fn unexpected_parameter_during_need_code_is_terminal() {
        let (challenge, _) = challenge();
        let mut request = request_state();
        challenge
            .handle_challenge_request(&email_param("alice@example.net"), &mut request, now())
            .await;

        let params = vec![("wrong-code".to_owned(), b"resend".to_vec())];
        let (code, _) = challenge
            .handle_challenge_request(&params, &mut request, now())
            .await;
        assert_eq!(code, ErrorCode::InvalidParameter);
        assert_eq!(request.status, Status::Failure);
    }

    #[test]
    fn requested_parameters_per_step() {
        let (challenge, _) = challenge();
        let before = challenge
            .requested_parameters(Status::BeforeChallenge, "")
            .unwrap();
        assert_eq!(before[0].0, PARAMETER_KEY_EMAIL);

        let during = challenge
            .requested_parameters(Status::Challenge, NEED_CODE)
            .unwrap();
        assert_eq!(during[0].0, PARAMETER_KEY_CODE);

        assert!(challenge
            .requested_parameters(Status::Success, "")
            .is_err());
    }

    #[test]
    fn fulfill_fills_from_context() {
        let (challenge, _) = challenge();
        let mut params = vec![(PARAMETER_KEY_CODE.to_owned(), Vec::new())];
        let context = ClientContext {
            pin: Some("123456".to_owned()),
            ..ClientContext::default()
        };
        challenge.fulfill_parameters(&mut params, &context).unwrap();
        assert_eq!(params[0].1, b"123456");

        let missing = ClientContext::default();
        let mut params = vec![(PARAMETER_KEY_EMAIL.to_owned(), Vec::new())];
        assert!(challenge.fulfill_parameters(&mut params, &missing).is_err());
    }
}
