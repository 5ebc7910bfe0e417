//! End-to-end issuance scenarios, driving the authority state machine
//! with the requester-side driver in process (no sockets).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use namecert_core::challenge::email::{EmailChallenge, EmailSendError, EmailSender};
use namecert_core::challenge::possession::PossessionChallenge;
use namecert_core::challenge::{ChallengeRegistry, ClientContext};
use namecert_core::clock::ManualClock;
use namecert_core::packet::ValidityPeriod;
use namecert_core::proto::CaProfile;
use namecert_core::{cert, Certificate, Data, ErrorCode, Interest, KeyPair, Name, Status};

use namecert_authority::assignment::ParamAssignment;
use namecert_authority::service::CaService;
use namecert_authority::store::{MemoryCertStore, MemoryRequestStore, RequestStore};

use namecert_client::request::{
    on_cert_fetch_response, on_probe_response, probe_interest, ClientError, Request,
};
use namecert_core::RequestType;

const TERMINAL_GRACE_SECS: i64 = 60;

fn t0() -> DateTime<Utc> {
    "2026-01-01T00:00:00Z".parse().unwrap()
}

fn validity(days: i64) -> ValidityPeriod {
    ValidityPeriod::new(t0(), t0() + Duration::days(days))
}

struct RecordingSender {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingSender {
    fn last_pin(&self) -> String {
        self.sent.lock().unwrap().last().expect("a PIN was sent").1.clone()
    }
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

struct Harness {
    service: Arc<CaService>,
    clock: Arc<ManualClock>,
    requests: Arc<MemoryRequestStore>,
    registry: Arc<ChallengeRegistry>,
    sender: Arc<RecordingSender>,
    anchor_key: KeyPair,
    anchor: Certificate,
    ca_cert: Certificate,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(t0()));

        let ca_key = KeyPair::generate();
        let ca_cert = cert::self_signed(&ca_key, &Name::parse("/edu/site").unwrap(), validity(3650));

        let anchor_key = KeyPair::generate();
        let anchor = cert::self_signed(&anchor_key, &Name::parse("/trust").unwrap(), validity(3650));

        let sender = Arc::new(RecordingSender {
            sent: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(
            ChallengeRegistry::builder()
                .register(Arc::new(PossessionChallenge::new(vec![anchor.clone()])))
                .register(Arc::new(EmailChallenge::new(
                    vec![regex::Regex::new(r"^[^@]+@example\.net$").unwrap()],
                    sender.clone(),
                )))
                .build(),
        );

        let profile = CaProfile {
            ca_prefix: Name::parse("/edu/site").unwrap(),
            ca_info: "test authority".to_owned(),
            max_validity_period: Duration::days(365),
            max_suffix_length: Some(2),
            probe_parameter_keys: vec!["email".to_owned()],
            supported_challenges: vec!["possession".to_owned(), "email".to_owned()],
            certificate: ca_cert.clone(),
        };

        let requests = Arc::new(MemoryRequestStore::new(Duration::seconds(
            TERMINAL_GRACE_SECS,
        )));
        let service = Arc::new(
            CaService::new(
                profile,
                ca_key,
                Box::new(ParamAssignment::new(vec!["email".to_owned()])),
                registry.clone(),
                requests.clone(),
                Arc::new(MemoryCertStore::new()),
                clock.clone(),
            )
            .unwrap(),
        );

        Self {
            service,
            clock,
            requests,
            registry,
            sender,
            anchor_key,
            anchor,
            ca_cert,
        }
    }

    /// A credential for `key`, signed by the trust anchor.
    fn credential_for(&self, key: &KeyPair) -> Certificate {
        cert::CertificateBuilder::new(
            cert::new_key_name(&Name::parse("/trust/device").unwrap()),
            key.public_key_bits(),
            validity(30),
        )
        .issuer_id("Credential")
        .sign(&self.anchor_key, &self.anchor.key_name())
    }

    async fn express(&self, interest: &Interest) -> Data {
        self.service
            .handle_interest(interest)
            .await
            .expect("authority replied")
    }

    fn client(&self, request_type: RequestType, key: KeyPair) -> Request {
        Request::new(
            self.service.profile().clone(),
            self.registry.clone(),
            request_type,
            key,
        )
    }

    /// Run the handshake and return the offered challenge names.
    async fn open_session(&self, request: &mut Request, identity: &str) -> Vec<String> {
        let interest = request
            .new_interest(
                &Name::parse(identity).unwrap(),
                t0(),
                t0() + Duration::days(30),
            )
            .unwrap();
        let reply = self.express(&interest).await;
        request.on_session_response(&reply).unwrap()
    }

    /// One challenge round through the driver.
    async fn round(
        &self,
        request: &mut Request,
        challenge: &str,
        context: &ClientContext<'_>,
    ) -> Result<(), ClientError> {
        let mut parameters: Vec<(String, Vec<u8>)> = request
            .select_or_continue_challenge(challenge)?
            .into_iter()
            .map(|(name, _)| (name, Vec::new()))
            .collect();
        request.fulfill_parameters(&mut parameters, context)?;
        let interest = request.challenge_interest(&parameters)?;
        let reply = self.express(&interest).await;
        request.on_challenge_response(&reply)
    }
}

#[tokio::test]
async fn possession_happy_path_issues_a_certificate() {
    let harness = Harness::new();
    let device_key = KeyPair::generate();
    let credential = harness.credential_for(&device_key);

    let mut request = harness.client(RequestType::New, KeyPair::generate());
    let offered = harness.open_session(&mut request, "/edu/site/device").await;
    assert!(offered.contains(&"possession".to_owned()));

    // Phase one: present the credential, get the nonce.
    let context = ClientContext {
        credential: Some(&credential),
        ..ClientContext::default()
    };
    harness.round(&mut request, "possession", &context).await.unwrap();
    assert_eq!(request.status, Status::Challenge);
    assert_eq!(request.challenge_status.as_deref(), Some("need-proof"));
    let nonce = request.nonce.expect("server disclosed a nonce");

    // Phase two: sign the nonce with the credential key.
    let context = ClientContext {
        credential: Some(&credential),
        credential_key: Some(&device_key),
        nonce: Some(nonce),
        ..ClientContext::default()
    };
    harness.round(&mut request, "possession", &context).await.unwrap();
    assert_eq!(request.status, Status::Success);

    // The issued certificate is fetchable and chains to the CA.
    let fetch = request.cert_fetch_interest().unwrap();
    let issued = on_cert_fetch_response(&harness.express(&fetch).await).unwrap();
    assert_eq!(issued.identity(), Name::parse("/edu/site/device").unwrap());
    assert!(issued.verify_signed_by(&harness.ca_cert));
}

#[tokio::test]
async fn possession_bad_proof_fails_without_issuing() {
    let harness = Harness::new();
    let device_key = KeyPair::generate();
    let credential = harness.credential_for(&device_key);

    let mut request = harness.client(RequestType::New, KeyPair::generate());
    harness.open_session(&mut request, "/edu/site/device").await;

    let context = ClientContext {
        credential: Some(&credential),
        ..ClientContext::default()
    };
    harness.round(&mut request, "possession", &context).await.unwrap();

    // Sign a zero nonce instead of the real one.
    let context = ClientContext {
        credential: Some(&credential),
        credential_key: Some(&device_key),
        nonce: Some([0u8; 16]),
        ..ClientContext::default()
    };
    let error = harness
        .round(&mut request, "possession", &context)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        ClientError::Authority {
            code: ErrorCode::InvalidParameter,
            ..
        }
    ));

    let state = harness
        .requests
        .get(&request.request_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, Status::Failure);
    assert!(request.issued_cert_name.is_none());
}

#[tokio::test]
async fn possession_untrusted_credential_fails_immediately() {
    let harness = Harness::new();
    let device_key = KeyPair::generate();

    // Credential signed by a key outside the anchor list.
    let rogue_key = KeyPair::generate();
    let rogue_anchor = cert::self_signed(&rogue_key, &Name::parse("/rogue").unwrap(), validity(30));
    let untrusted = cert::CertificateBuilder::new(
        cert::new_key_name(&Name::parse("/rogue/device").unwrap()),
        device_key.public_key_bits(),
        validity(30),
    )
    .issuer_id("Credential")
    .sign(&rogue_key, &rogue_anchor.key_name());

    let mut request = harness.client(RequestType::New, KeyPair::generate());
    harness.open_session(&mut request, "/edu/site/device").await;

    let context = ClientContext {
        credential: Some(&untrusted),
        ..ClientContext::default()
    };
    let error = harness
        .round(&mut request, "possession", &context)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        ClientError::Authority {
            code: ErrorCode::InvalidParameter,
            ..
        }
    ));

    let state = harness
        .requests
        .get(&request.request_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, Status::Failure);
}

#[tokio::test]
async fn email_wrong_pin_then_right_pin_succeeds() {
    let harness = Harness::new();
    let mut request = harness.client(RequestType::New, KeyPair::generate());
    harness.open_session(&mut request, "/edu/site/alice").await;

    let context = ClientContext {
        email: Some("alice@example.net".to_owned()),
        ..ClientContext::default()
    };
    harness.round(&mut request, "email", &context).await.unwrap();
    assert_eq!(request.status, Status::Challenge);
    assert_eq!(request.challenge_status.as_deref(), Some("need-code"));
    assert_eq!(request.remaining_tries, 3);

    let pin = harness.sender.last_pin();
    let wrong = if pin == "000000" { "111111" } else { "000000" };

    let context = ClientContext {
        pin: Some(wrong.to_owned()),
        ..ClientContext::default()
    };
    harness.round(&mut request, "email", &context).await.unwrap();
    assert_eq!(request.status, Status::Challenge);
    assert_eq!(request.remaining_tries, 2);

    let context = ClientContext {
        pin: Some(pin),
        ..ClientContext::default()
    };
    harness.round(&mut request, "email", &context).await.unwrap();
    assert_eq!(request.status, Status::Success);
    assert!(request.issued_cert_name.is_some());
}

#[tokio::test]
async fn retransmitted_handshake_replays_byte_identically() {
    let harness = Harness::new();
    let mut request = harness.client(RequestType::New, KeyPair::generate());

    let interest = request
        .new_interest(
            &Name::parse("/edu/site/device").unwrap(),
            t0(),
            t0() + Duration::days(30),
        )
        .unwrap();

    let first = harness.express(&interest).await;
    let second = harness.express(&interest).await;
    assert_eq!(first.encode(), second.encode());

    // Still exactly one live request, untouched.
    request.on_session_response(&first).unwrap();
    let state = harness
        .requests
        .get(&request.request_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, Status::BeforeChallenge);
    assert_eq!(harness.requests.len().await, 1);
}

#[tokio::test]
async fn expired_challenge_fails_even_with_a_valid_proof() {
    let harness = Harness::new();
    let device_key = KeyPair::generate();
    let credential = harness.credential_for(&device_key);

    let mut request = harness.client(RequestType::New, KeyPair::generate());
    harness.open_session(&mut request, "/edu/site/device").await;

    let context = ClientContext {
        credential: Some(&credential),
        ..ClientContext::default()
    };
    harness.round(&mut request, "possession", &context).await.unwrap();
    let nonce = request.nonce.unwrap();

    // The authority stalls past the 60-second secret lifetime.
    harness.clock.advance(Duration::seconds(61));

    let context = ClientContext {
        credential: Some(&credential),
        credential_key: Some(&device_key),
        nonce: Some(nonce),
        ..ClientContext::default()
    };
    let error = harness
        .round(&mut request, "possession", &context)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        ClientError::Authority {
            code: ErrorCode::ChallengeExpired,
            ..
        }
    ));

    let state = harness
        .requests
        .get(&request.request_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, Status::Failure);
}

#[tokio::test]
async fn retransmitted_challenge_round_replays_byte_identically() {
    let harness = Harness::new();
    let device_key = KeyPair::generate();
    let credential = harness.credential_for(&device_key);

    let mut request = harness.client(RequestType::New, KeyPair::generate());
    harness.open_session(&mut request, "/edu/site/device").await;

    let mut parameters: Vec<(String, Vec<u8>)> = request
        .select_or_continue_challenge("possession")
        .unwrap()
        .into_iter()
        .map(|(name, _)| (name, Vec::new()))
        .collect();
    let context = ClientContext {
        credential: Some(&credential),
        ..ClientContext::default()
    };
    request.fulfill_parameters(&mut parameters, &context).unwrap();
    let interest = request.challenge_interest(&parameters).unwrap();

    let first = harness.express(&interest).await;
    let second = harness.express(&interest).await;
    assert_eq!(first.encode(), second.encode());
}

#[tokio::test]
async fn probe_assigns_names_or_reports_none() {
    let harness = Harness::new();
    let profile = harness.service.profile().clone();

    let parameters = vec![("email".to_owned(), "alice".to_owned())];
    let reply = harness.express(&probe_interest(&profile, &parameters)).await;
    let names = on_probe_response(&profile, &reply).unwrap();
    assert_eq!(names, vec![Name::parse("/edu/site/alice").unwrap()]);

    // Missing the configured key: no candidates.
    let reply = harness.express(&probe_interest(&profile, &[])).await;
    let error = on_probe_response(&profile, &reply).unwrap_err();
    assert!(matches!(
        error,
        ClientError::Authority {
            code: ErrorCode::NoAvailableNames,
            ..
        }
    ));
}

#[tokio::test]
async fn revocation_marks_the_certificate_revoked() {
    let harness = Harness::new();
    let device_key = KeyPair::generate();
    let credential = harness.credential_for(&device_key);

    // Issue first.
    let request_key = KeyPair::generate();
    let revoke_key = KeyPair::from_bytes(&request_key.to_bytes()).unwrap();
    let mut request = harness.client(RequestType::New, request_key);
    harness.open_session(&mut request, "/edu/site/device").await;
    let context = ClientContext {
        credential: Some(&credential),
        ..ClientContext::default()
    };
    harness.round(&mut request, "possession", &context).await.unwrap();
    let context = ClientContext {
        credential: Some(&credential),
        credential_key: Some(&device_key),
        nonce: request.nonce,
        ..ClientContext::default()
    };
    harness.round(&mut request, "possession", &context).await.unwrap();
    let issued =
        on_cert_fetch_response(&harness.express(&request.cert_fetch_interest().unwrap()).await)
            .unwrap();

    // Revoke with the issued certificate's own key: challenge rounds are
    // signed with it and verified against the certificate under revocation.
    let mut revoke = harness.client(RequestType::Revoke, revoke_key);
    let interest = revoke.revoke_interest(&issued).unwrap();
    let reply = harness.express(&interest).await;
    revoke.on_session_response(&reply).unwrap();

    let context = ClientContext {
        credential: Some(&credential),
        ..ClientContext::default()
    };
    harness.round(&mut revoke, "possession", &context).await.unwrap();
    let context = ClientContext {
        credential: Some(&credential),
        credential_key: Some(&device_key),
        nonce: revoke.nonce,
        ..ClientContext::default()
    };
    harness.round(&mut revoke, "possession", &context).await.unwrap();
    assert_eq!(revoke.status, Status::Success);
}

#[tokio::test]
async fn sweep_fails_timed_out_requests_and_purges_terminal_ones() {
    let harness = Harness::new();
    let device_key = KeyPair::generate();
    let credential = harness.credential_for(&device_key);

    let mut request = harness.client(RequestType::New, KeyPair::generate());
    harness.open_session(&mut request, "/edu/site/device").await;
    let context = ClientContext {
        credential: Some(&credential),
        ..ClientContext::default()
    };
    harness.round(&mut request, "possession", &context).await.unwrap();
    let id = request.request_id().unwrap();

    // Past the secret lifetime: the sweep fails the request.
    harness.clock.advance(Duration::seconds(61));
    assert_eq!(harness.service.sweep_expired().await, 1);
    let state = harness.requests.get(&id).await.unwrap().unwrap();
    assert_eq!(state.status, Status::Failure);

    // Past the terminal grace window: the record is purged.
    harness.clock.advance(Duration::seconds(TERMINAL_GRACE_SECS + 1));
    assert_eq!(harness.service.sweep_expired().await, 1);
    assert!(harness.requests.get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn requested_name_outside_prefix_is_rejected() {
    let harness = Harness::new();
    let mut request = harness.client(RequestType::New, KeyPair::generate());

    let interest = request
        .new_interest(
            &Name::parse("/other/site/device").unwrap(),
            t0(),
            t0() + Duration::days(30),
        )
        .unwrap();
    let reply = harness.express(&interest).await;
    let error = request.on_session_response(&reply).unwrap_err();
    assert!(matches!(
        error,
        ClientError::Authority {
            code: ErrorCode::NameNotAllowed,
            ..
        }
    ));
}

#[tokio::test]
async fn oversized_validity_is_rejected() {
    let harness = Harness::new();
    let mut request = harness.client(RequestType::New, KeyPair::generate());

    let interest = request
        .new_interest(
            &Name::parse("/edu/site/device").unwrap(),
            t0(),
            t0() + Duration::days(4000),
        )
        .unwrap();
    let reply = harness.express(&interest).await;
    let error = request.on_session_response(&reply).unwrap_err();
    assert!(matches!(
        error,
        ClientError::Authority {
            code: ErrorCode::BadValidityPeriod,
            ..
        }
    ));
}
