//! The issuance state machine.
//!
//! Four interest surfaces under `/<ca-prefix>/CA`: INFO (signed
//! profile), PROBE (name assignment), NEW/RENEW/REVOKE (session
//! handshake) and CHALLENGE/<requestId-hex> (sealed challenge rounds).
//! Issued certificates are additionally served by their own names.
//!
//! Handlers are atomic per request id: an in-flight marker rejects
//! reentrant CHALLENGE interests across the handler's suspension points,
//! and every state mutation is committed through the store before the
//! reply leaves.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;

use namecert_core::cert::CertificateBuilder;
use namecert_core::challenge::ChallengeRegistry;
use namecert_core::clock::Clock;
use namecert_core::crypto::{self, CryptoError, EcdhSession, SealedPayload};
use namecert_core::proto::{
    decode_probe_parameters, CaProfile, ChallengeRequest, ChallengeResponse, ErrorContent,
    ProbeResponse, SessionRequest, SessionResponse,
};
use namecert_core::{
    Certificate, Data, ErrorCode, Interest, KeyPair, Name, RequestId, RequestState, RequestType,
    SignatureInfo, Status,
};

use crate::assignment::NameAssignment;
use crate::store::{CertStore, RequestStore, StoreError};

const DATA_FRESHNESS_MS: u64 = 1_000;

/// A requested notBefore may precede now by this much.
fn not_before_grace() -> Duration {
    Duration::seconds(120)
}

/// How long cached session replies stay replayable after creation.
fn session_reply_ttl() -> Duration {
    Duration::seconds(3_600)
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("challenge {0:?} is not registered")]
    UnknownChallenge(String),

    #[error("CA certificate carries no validity period")]
    BadCaCertificate,
}

/// A failure inside a handler, either wire-visible or internal.
enum HandlerError {
    Wire(ErrorCode, String),
    Internal(String),
}

impl From<StoreError> for HandlerError {
    fn from(error: StoreError) -> Self {
        HandlerError::Internal(error.to_string())
    }
}

impl From<CryptoError> for HandlerError {
    fn from(error: CryptoError) -> Self {
        HandlerError::Internal(error.to_string())
    }
}

fn wire(code: ErrorCode, info: impl Into<String>) -> HandlerError {
    HandlerError::Wire(code, info.into())
}

pub struct CaService {
    profile: CaProfile,
    cert: Certificate,
    key: KeyPair,
    assignment: Box<dyn NameAssignment>,
    registry: Arc<ChallengeRegistry>,
    requests: Arc<dyn RequestStore>,
    certs: Arc<dyn CertStore>,
    clock: Arc<dyn Clock>,
    /// Process-scoped request-id HMAC key, regenerated at startup so
    /// request ids from earlier lives are invalid on purpose.
    process_key: [u8; 32],
    in_flight: Mutex<HashSet<RequestId>>,
    /// NEW/RENEW/REVOKE replies keyed by full interest name; a
    /// retransmitted handshake replays byte-identically.
    session_replies: DashMap<Name, (Data, DateTime<Utc>)>,
    profile_data: OnceLock<Data>,
}

impl CaService {
    pub fn new(
        profile: CaProfile,
        key: KeyPair,
        assignment: Box<dyn NameAssignment>,
        registry: Arc<ChallengeRegistry>,
        requests: Arc<dyn RequestStore>,
        certs: Arc<dyn CertStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ServiceError> {
        for challenge in &profile.supported_challenges {
            if !registry.contains(challenge) {
                return Err(ServiceError::UnknownChallenge(challenge.clone()));
            }
        }
        if profile.certificate.validity().is_none() {
            return Err(ServiceError::BadCaCertificate);
        }

        let mut process_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut process_key);

        Ok(Self {
            cert: profile.certificate.clone(),
            profile,
            key,
            assignment,
            registry,
            requests,
            certs,
            clock,
            process_key,
            in_flight: Mutex::new(HashSet::new()),
            session_replies: DashMap::new(),
            profile_data: OnceLock::new(),
        })
    }

    pub fn profile(&self) -> &CaProfile {
        &self.profile
    }

    pub fn certificate(&self) -> &Certificate {
        &self.cert
    }

    /// Route one interest. `None` means the name is not ours.
    pub async fn handle_interest(&self, interest: &Interest) -> Option<Data> {
        let prefix = &self.profile.ca_prefix;
        if !prefix.is_prefix_of(&interest.name) {
            return None;
        }
        if interest.name.get(prefix.len()).and_then(|c| c.as_str()) != Some("CA") {
            return self.serve_certificate(interest).await;
        }

        let operation = interest.name.get(prefix.len() + 1).and_then(|c| c.as_str());
        let reply = match operation {
            Some("INFO") => Ok(self.on_info(interest)),
            Some("PROBE") => self.on_probe(interest),
            Some("NEW") => self.on_session(interest, RequestType::New).await,
            Some("RENEW") => self.on_session(interest, RequestType::Renew).await,
            Some("REVOKE") => self.on_session(interest, RequestType::Revoke).await,
            Some("CHALLENGE") => self.on_challenge(interest).await,
            _ => return None,
        };

        Some(match reply {
            Ok(data) => data,
            Err(HandlerError::Wire(code, info)) => {
                tracing::debug!(name = %interest.name, %code, info, "request rejected");
                self.error_data(interest.name.clone(), code, &info)
            }
            Err(HandlerError::Internal(reason)) => {
                tracing::error!(name = %interest.name, reason, "internal handler failure");
                self.error_data(
                    interest.name.clone(),
                    ErrorCode::InvalidParameter,
                    "internal error",
                )
            }
        })
    }

    /// Serve an issued certificate by its name.
    async fn serve_certificate(&self, interest: &Interest) -> Option<Data> {
        let cert = self
            .certs
            .get(&interest.name_without_digest())
            .await
            .ok()
            .flatten()?;
        Some(cert.data().clone())
    }

    fn on_info(&self, _interest: &Interest) -> Data {
        self.profile_data
            .get_or_init(|| {
                let name = self.profile.ca_prefix.child("CA").child("INFO");
                let mut data = Data::unsigned(name, self.profile.encode())
                    .with_freshness_ms(DATA_FRESHNESS_MS);
                data.sign(&self.key, SignatureInfo::ecdsa(self.cert.key_name()));
                data
            })
            .clone()
    }

    fn on_probe(&self, interest: &Interest) -> Result<Data, HandlerError> {
        let parameters = interest
            .app_parameters
            .as_ref()
            .ok_or_else(|| wire(ErrorCode::BadInterestFormat, "probe carries no parameters"))?;
        let parameters = decode_probe_parameters(parameters)
            .map_err(|_| wire(ErrorCode::BadInterestFormat, "malformed probe parameters"))?;

        let suffixes = self.assignment.assign(&parameters);
        if suffixes.is_empty() {
            return Err(wire(
                ErrorCode::NoAvailableNames,
                "cannot assign a name from the provided parameters",
            ));
        }
        let names = suffixes
            .iter()
            .map(|suffix| self.profile.ca_prefix.join(suffix))
            .collect();

        let content = ProbeResponse {
            names,
            max_suffix_length: self.profile.max_suffix_length,
        }
        .encode();
        Ok(self.signed_reply(interest.name.clone(), content))
    }

    async fn on_session(
        &self,
        interest: &Interest,
        request_type: RequestType,
    ) -> Result<Data, HandlerError> {
        // Retransmission of the same handshake replays the same bytes.
        if let Some(cached) = self.session_replies.get(&interest.name) {
            return Ok(cached.value().0.clone());
        }

        let now = self.clock.now();
        let parameters = interest
            .app_parameters
            .as_ref()
            .ok_or_else(|| wire(ErrorCode::BadInterestFormat, "missing parameters"))?;
        let request = SessionRequest::decode(request_type, parameters)
            .map_err(|_| wire(ErrorCode::BadInterestFormat, "malformed session request"))?;

        self.check_requested_name(&request.cert)?;
        match request_type {
            RequestType::New | RequestType::Renew => {
                self.check_validity_period(&request.cert, now)?;
                if !request.cert.verify_self_signed() {
                    return Err(wire(
                        ErrorCode::BadSignature,
                        "invalid signature in the request certificate",
                    ));
                }
                if !interest.verify(request.cert.public_key_bits()) {
                    return Err(wire(
                        ErrorCode::BadSignature,
                        "invalid signature in the interest",
                    ));
                }
            }
            RequestType::Revoke => {
                if !request.cert.verify_signed_by(&self.cert) {
                    return Err(wire(
                        ErrorCode::BadSignature,
                        "certificate to revoke was not issued by this authority",
                    ));
                }
            }
        }

        // Key agreement and request id allocation.
        let ecdh = EcdhSession::new();
        let salt = crypto::generate_salt();
        let session_key = ecdh
            .derive(&request.ecdh_pub, &salt)
            .map_err(|_| wire(ErrorCode::InvalidParameter, "cannot derive a shared secret"))?;
        let request_id = crypto::derive_request_id(&self.process_key, &request.ecdh_pub, &salt);

        let state = RequestState::new(
            request_id,
            self.profile.ca_prefix.clone(),
            request_type,
            request.cert,
            session_key,
            now,
        );
        match self.requests.create(state).await {
            Ok(()) => {}
            Err(StoreError::Duplicate) => {
                return Err(wire(
                    ErrorCode::InvalidParameter,
                    "duplicate request id: the same request has been seen before",
                ));
            }
            Err(error) => return Err(error.into()),
        }

        tracing::info!(
            request_id = %request_id,
            request_type = %request_type,
            "request session created"
        );

        let content = SessionResponse {
            ecdh_pub: ecdh.public_key_bits(),
            salt,
            request_id,
            challenges: self.profile.supported_challenges.clone(),
        }
        .encode();
        let reply = self.signed_reply(interest.name.clone(), content);
        self.session_replies
            .insert(interest.name.clone(), (reply.clone(), now));
        Ok(reply)
    }

    async fn on_challenge(&self, interest: &Interest) -> Result<Data, HandlerError> {
        let prefix_len = self.profile.ca_prefix.len();
        let request_id = interest
            .name
            .get(prefix_len + 2)
            .and_then(|c| c.as_str())
            .and_then(RequestId::from_hex)
            .ok_or_else(|| wire(ErrorCode::BadInterestFormat, "unreadable request id"))?;

        // Reentrancy guard: one handler per request id at a time.
        let _guard = self
            .claim_in_flight(request_id)
            .ok_or_else(|| wire(ErrorCode::OutOfOrder, "request is being handled"))?;

        let mut state = self
            .requests
            .get(&request_id)
            .await?
            .ok_or_else(|| wire(ErrorCode::InvalidParameter, "no request state found"))?;
        let now = self.clock.now();
        // Sealed payloads bind to the challenge name sans digest component.
        let aad = interest.name_without_digest().encode();

        if !interest.verify(state.cert.public_key_bits()) {
            return Err(wire(
                ErrorCode::BadSignature,
                "invalid signature in the interest",
            ));
        }

        let parameters = interest
            .app_parameters
            .as_ref()
            .ok_or_else(|| wire(ErrorCode::BadInterestFormat, "missing parameters"))?;
        let sealed = SealedPayload::decode_value(parameters)
            .map_err(|_| wire(ErrorCode::BadInterestFormat, "malformed sealed block"))?;

        // Duplicate suppression by (requestId, counter): replay the
        // previous reply rather than re-executing the handler.
        let counter = sealed.counter();
        if let Some((last_counter, reply)) = &state.last_reply {
            if counter == *last_counter {
                let reply = Data::decode(reply)
                    .map_err(|_| HandlerError::Internal("cached reply corrupt".into()))?;
                return Ok(reply);
            }
        }

        if state.status.is_terminal() {
            // A terminal request stays inert: nothing is written back, and
            // the sealed error reuses the stored counter with a fixed
            // payload so the repeated nonce never covers two plaintexts.
            let payload =
                ErrorContent::new(ErrorCode::InvalidParameter, "request is closed").encode();
            let sealed = crypto::seal(
                &state.encryption_key,
                &request_id,
                state.aes_block_counter,
                &aad,
                &payload,
            )?;
            return Ok(self.signed_reply(interest.name.clone(), sealed.encode_value()));
        }

        // Counter reuse (other than the replayed last one) is rejected.
        if state.peer_counter.is_some_and(|highest| counter <= highest) {
            return self
                .commit_sealed_error(
                    &mut state,
                    interest,
                    &aad,
                    ErrorCode::OutOfOrder,
                    "block counter reused",
                    counter,
                )
                .await;
        }

        let plaintext = match crypto::open(&state.encryption_key, &request_id, &aad, &sealed) {
            Ok((plaintext, _)) => plaintext,
            Err(_) => {
                // An authenticated requester sent undecryptable bytes;
                // the session key is unusable from here on.
                state.status = Status::Failure;
                state.mark_terminal(now);
                self.requests.update(state).await?;
                return Err(wire(
                    ErrorCode::InvalidParameter,
                    "interest parameter decryption failed",
                ));
            }
        };
        state.peer_counter = Some(counter);

        // Lifetime gate comes before the module sees anything.
        if state
            .challenge_state
            .as_ref()
            .is_some_and(|challenge| challenge.is_expired(now))
        {
            state.status = Status::Failure;
            return self
                .commit_sealed_error(
                    &mut state,
                    interest,
                    &aad,
                    ErrorCode::ChallengeExpired,
                    "challenge secret lifetime elapsed",
                    counter,
                )
                .await;
        }

        let request = match ChallengeRequest::decode(&plaintext) {
            Ok(request) => request,
            Err(_) => {
                state.status = Status::Failure;
                return self
                    .commit_sealed_error(
                        &mut state,
                        interest,
                        &aad,
                        ErrorCode::BadInterestFormat,
                        "malformed challenge parameters",
                        counter,
                    )
                    .await;
            }
        };

        // The challenge selected first sticks for the request's lifetime.
        match &state.challenge_type {
            Some(selected) if *selected != request.selected_challenge => {
                state.status = Status::Failure;
                return self
                    .commit_sealed_error(
                        &mut state,
                        interest,
                        &aad,
                        ErrorCode::InvalidParameter,
                        "challenge type changed mid-request",
                        counter,
                    )
                    .await;
            }
            Some(_) => {}
            None => state.challenge_type = Some(request.selected_challenge.clone()),
        }

        let Some(module) = self.registry.get(&request.selected_challenge) else {
            state.status = Status::Failure;
            return self
                .commit_sealed_error(
                    &mut state,
                    interest,
                    &aad,
                    ErrorCode::InvalidParameter,
                    "unrecognized challenge type",
                    counter,
                )
                .await;
        };

        tracing::debug!(
            request_id = %request_id,
            challenge = %request.selected_challenge,
            "dispatching challenge round"
        );
        let (code, info) = module
            .handle_challenge_request(&request.parameters, &mut state, now)
            .await;
        if code != ErrorCode::NoError {
            return self
                .commit_sealed_error(&mut state, interest, &aad, code, &info, counter)
                .await;
        }

        let response = if state.status == Status::Pending {
            // One-tick PENDING: finish issuance (or revocation) and land
            // on SUCCESS inside the same handler invocation.
            let issued_cert_name = match state.request_type {
                RequestType::New | RequestType::Renew => {
                    let issued = self.issue_certificate(&state)?;
                    self.certs.insert(issued.clone()).await?;
                    tracing::info!(
                        request_id = %request_id,
                        cert = %issued.name(),
                        "certificate issued"
                    );
                    Some(issued.name().clone())
                }
                RequestType::Revoke => {
                    self.certs.mark_revoked(state.cert.name()).await?;
                    tracing::info!(
                        request_id = %request_id,
                        cert = %state.cert.name(),
                        "certificate revoked"
                    );
                    None
                }
            };
            state.status = Status::Success;
            state.mark_terminal(now);
            ChallengeResponse {
                status: Status::Success,
                challenge_status: None,
                remaining_tries: None,
                remaining_time_secs: None,
                parameters: Vec::new(),
                issued_cert_name,
            }
        } else {
            let challenge = state.challenge_state.as_ref();
            ChallengeResponse {
                status: state.status,
                challenge_status: challenge.map(|c| c.challenge_status.clone()),
                remaining_tries: challenge.map(|c| u64::from(c.remaining_attempts)),
                remaining_time_secs: challenge
                    .map(|c| c.remaining_time(now).num_seconds().max(0) as u64),
                parameters: module.response_parameters(&state),
                issued_cert_name: None,
            }
        };

        self.commit_sealed_reply(&mut state, interest, &aad, &response.encode(), counter)
            .await
    }

    /// Build, remember and commit a sealed regular reply.
    async fn commit_sealed_reply(
        &self,
        state: &mut RequestState,
        interest: &Interest,
        aad: &[u8],
        payload: &[u8],
        peer_counter: u32,
    ) -> Result<Data, HandlerError> {
        let block_counter = state.next_block_counter();
        let sealed = crypto::seal(
            &state.encryption_key,
            &state.request_id,
            block_counter,
            aad,
            payload,
        )?;
        let reply = self.signed_reply(interest.name.clone(), sealed.encode_value());
        state.last_reply = Some((peer_counter, reply.encode()));
        self.requests.update(state.clone()).await?;
        Ok(reply)
    }

    /// Same, for sealed error contents.
    async fn commit_sealed_error(
        &self,
        state: &mut RequestState,
        interest: &Interest,
        aad: &[u8],
        code: ErrorCode,
        info: &str,
        peer_counter: u32,
    ) -> Result<Data, HandlerError> {
        if state.status.is_terminal() {
            state.mark_terminal(self.clock.now());
        }
        tracing::debug!(request_id = %state.request_id, %code, info, "challenge round failed");
        let payload = ErrorContent::new(code, info).encode();
        self.commit_sealed_reply(state, interest, aad, &payload, peer_counter)
            .await
    }

    fn issue_certificate(&self, state: &RequestState) -> Result<Certificate, HandlerError> {
        let validity = state
            .cert
            .validity()
            .ok_or_else(|| HandlerError::Internal("request certificate lost validity".into()))?;
        Ok(CertificateBuilder::new(
            state.cert.key_name(),
            state.cert.public_key_bits().to_vec(),
            validity,
        )
        .issuer_id("NDNCERT")
        .sign(&self.key, &self.cert.key_name()))
    }

    fn check_requested_name(&self, cert: &Certificate) -> Result<(), HandlerError> {
        let prefix = &self.profile.ca_prefix;
        let identity = cert.identity();
        if !Certificate::is_valid_name(cert.name())
            || !prefix.is_prefix_of(&identity)
            || identity.len() <= prefix.len()
        {
            return Err(wire(
                ErrorCode::NameNotAllowed,
                "an invalid certificate name is being requested",
            ));
        }
        if let Some(max_suffix) = self.profile.max_suffix_length {
            if identity.len() > prefix.len() + max_suffix as usize {
                return Err(wire(
                    ErrorCode::NameNotAllowed,
                    "an invalid certificate name is being requested",
                ));
            }
        }
        Ok(())
    }

    fn check_validity_period(
        &self,
        cert: &Certificate,
        now: DateTime<Utc>,
    ) -> Result<(), HandlerError> {
        let Some(validity) = cert.validity() else {
            return Err(wire(
                ErrorCode::BadValidityPeriod,
                "request certificate carries no validity period",
            ));
        };
        if validity.not_before < now - not_before_grace()
            || validity.not_after > now + self.profile.max_validity_period
            || validity.not_after <= validity.not_before
        {
            return Err(wire(
                ErrorCode::BadValidityPeriod,
                "an invalid validity period is being requested",
            ));
        }
        Ok(())
    }

    /// Reaper tick: fail timed-out challenges, purge records past their
    /// grace window, drop stale cached handshakes. Returns how many
    /// records changed.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut swept = 0;

        let expired = match self.requests.list_expired(now).await {
            Ok(ids) => ids,
            Err(error) => {
                tracing::error!(%error, "expiry scan failed");
                return 0;
            }
        };
        for id in expired {
            // Skip anything currently owned by a handler.
            let Some(_guard) = self.claim_in_flight(id) else {
                continue;
            };
            let Ok(Some(mut state)) = self.requests.get(&id).await else {
                continue;
            };
            let result = if state.terminal_at.is_some() {
                self.requests.delete(&id).await
            } else {
                tracing::info!(request_id = %id, "challenge timed out");
                state.status = Status::Failure;
                state.mark_terminal(now);
                self.requests.update(state).await
            };
            match result {
                Ok(()) => swept += 1,
                Err(error) => tracing::error!(request_id = %id, %error, "sweep failed"),
            }
        }

        self.session_replies
            .retain(|_, value| now - value.1 <= session_reply_ttl());
        swept
    }

    fn claim_in_flight(&self, id: RequestId) -> Option<InFlightGuard<'_>> {
        let mut in_flight = self.in_flight.lock().expect("in-flight mutex poisoned");
        if in_flight.insert(id) {
            Some(InFlightGuard { service: self, id })
        } else {
            None
        }
    }

    fn signed_reply(&self, name: Name, content: Bytes) -> Data {
        let mut data = Data::unsigned(name, content).with_freshness_ms(DATA_FRESHNESS_MS);
        data.sign(&self.key, SignatureInfo::ecdsa(self.cert.key_name()));
        data
    }

    /// Plain signed error data, for failures before any session key
    /// exists (or when the key is unusable).
    fn error_data(&self, name: Name, code: ErrorCode, info: &str) -> Data {
        self.signed_reply(name, ErrorContent::new(code, info).encode())
    }
}

struct InFlightGuard<'a> {
    service: &'a CaService,
    id: RequestId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.service
            .in_flight
            .lock()
            .expect("in-flight mutex poisoned")
            .remove(&self.id);
    }
}
