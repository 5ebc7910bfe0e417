//! Requester-side protocol driver.
//!
//! A [`Request`] walks one certificate request through the protocol:
//! INFO → NEW/RENEW/REVOKE → CHALLENGE rounds → certificate fetch. It
//! mirrors the authority's status/challengeStatus view and asks the
//! selected challenge module what to send next.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use namecert_core::cert::CertError;
use namecert_core::challenge::{ChallengeError, ChallengeModule, ChallengeRegistry, ClientContext};
use namecert_core::crypto::{
    self, CryptoError, EcdhSession, SealedPayload, SessionKey, CLIENT_COUNTER_BASE,
};
use namecert_core::packet::ValidityPeriod;
use namecert_core::proto::{
    encode_probe_parameters, CaProfile, ChallengeResponse, ErrorContent, ParameterMap,
    ProbeResponse, SessionRequest, SessionResponse,
};
use namecert_core::tlv::TlvError;
use namecert_core::{
    cert, Certificate, Data, ErrorCode, Interest, KeyPair, Name, RequestId, RequestType, Status,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Codec(#[from] TlvError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Cert(#[from] CertError),

    #[error(transparent)]
    Challenge(#[from] ChallengeError),

    #[error("authority reported {code}: {info}")]
    Authority { code: ErrorCode, info: String },

    #[error("data packet signature does not verify")]
    BadDataSignature,

    #[error("response counter did not advance")]
    StaleCounter,

    #[error("challenge {0:?} is not offered by the authority")]
    UnsupportedChallenge(String),

    #[error("protocol step out of order: {0}")]
    StepOutOfOrder(&'static str),

    #[error("transport returned no data")]
    NoData,
}

fn authority_error(content: ErrorContent) -> ClientError {
    ClientError::Authority {
        code: content.code,
        info: content.info,
    }
}

/// Fetch interest for the signed CA profile.
pub fn ca_profile_interest(ca_prefix: &Name) -> Interest {
    Interest::new(ca_prefix.child("CA").child("INFO"))
}

/// Decode and verify the CA profile reply. Trust in the embedded
/// certificate itself is the caller's decision.
pub fn on_ca_profile_response(data: &Data) -> Result<CaProfile, ClientError> {
    if ErrorContent::peek(&data.content) {
        return Err(authority_error(ErrorContent::decode(&data.content)?));
    }
    let profile = CaProfile::decode(&data.content)?;
    if !profile.certificate.verify_self_signed()
        || !data.verify(profile.certificate.public_key_bits())
    {
        return Err(ClientError::BadDataSignature);
    }
    Ok(profile)
}

/// Probe interest carrying the requester's hints.
pub fn probe_interest(profile: &CaProfile, parameters: &[(String, String)]) -> Interest {
    let mut interest = Interest::new(profile.ca_prefix.child("CA").child("PROBE"))
        .with_parameters(encode_probe_parameters(parameters));
    interest.finalize();
    interest
}

/// Candidate names out of the probe reply.
pub fn on_probe_response(profile: &CaProfile, data: &Data) -> Result<Vec<Name>, ClientError> {
    if ErrorContent::peek(&data.content) {
        return Err(authority_error(ErrorContent::decode(&data.content)?));
    }
    if !data.verify(profile.certificate.public_key_bits()) {
        return Err(ClientError::BadDataSignature);
    }
    Ok(ProbeResponse::decode(&data.content)?.names)
}

/// Parse a fetched certificate.
pub fn on_cert_fetch_response(data: &Data) -> Result<Certificate, ClientError> {
    Ok(Certificate::from_data(data.clone())?)
}

/// One in-progress certificate request.
pub struct Request {
    pub profile: CaProfile,
    pub request_type: RequestType,
    pub status: Status,
    pub challenge_type: Option<String>,
    pub challenge_status: Option<String>,
    pub remaining_tries: u64,
    pub remaining_time_secs: u64,
    pub issued_cert_name: Option<Name>,
    /// Server-disclosed possession nonce, once the challenge sends one.
    pub nonce: Option<[u8; 16]>,

    registry: Arc<ChallengeRegistry>,
    key: KeyPair,
    cert_request: Option<Certificate>,
    ecdh: Option<EcdhSession>,
    session_key: Option<SessionKey>,
    request_id: Option<RequestId>,
    block_counter: u32,
    peer_counter: Option<u32>,
}

impl Request {
    pub fn new(
        profile: CaProfile,
        registry: Arc<ChallengeRegistry>,
        request_type: RequestType,
        key: KeyPair,
    ) -> Self {
        Self {
            profile,
            request_type,
            status: Status::BeforeChallenge,
            challenge_type: None,
            challenge_status: None,
            remaining_tries: 0,
            remaining_time_secs: 0,
            issued_cert_name: None,
            nonce: None,
            registry,
            key,
            cert_request: None,
            ecdh: None,
            session_key: None,
            request_id: None,
            block_counter: CLIENT_COUNTER_BASE,
            peer_counter: None,
        }
    }

    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    /// The self-signed certificate this request is asking to have issued.
    pub fn cert_request(&self) -> Option<&Certificate> {
        self.cert_request.as_ref()
    }

    /// Build the NEW (or RENEW) interest: a fresh self-signed request
    /// certificate over `identity` plus our key-agreement point.
    pub fn new_interest(
        &mut self,
        identity: &Name,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Result<Interest, ClientError> {
        if self.request_type == RequestType::Revoke {
            return Err(ClientError::StepOutOfOrder(
                "revocation uses revoke_interest",
            ));
        }
        let cert_request = cert::self_signed(
            &self.key,
            identity,
            ValidityPeriod::new(not_before, not_after),
        );
        let ecdh = EcdhSession::new();

        let parameters = SessionRequest {
            ecdh_pub: ecdh.public_key_bits(),
            cert: cert_request.clone(),
        }
        .encode(self.request_type);

        let name = self
            .profile
            .ca_prefix
            .child("CA")
            .child(self.request_type.op_name());
        let mut interest = Interest::new(name).with_parameters(parameters);
        interest.sign(&self.key, cert_request.key_name());

        self.cert_request = Some(cert_request);
        self.ecdh = Some(ecdh);
        Ok(interest)
    }

    /// Build the REVOKE interest for a certificate this authority issued.
    pub fn revoke_interest(&mut self, cert: &Certificate) -> Result<Interest, ClientError> {
        if self.request_type != RequestType::Revoke {
            return Err(ClientError::StepOutOfOrder("not a revocation request"));
        }
        let ecdh = EcdhSession::new();
        let parameters = SessionRequest {
            ecdh_pub: ecdh.public_key_bits(),
            cert: cert.clone(),
        }
        .encode(self.request_type);

        let name = self.profile.ca_prefix.child("CA").child("REVOKE");
        let mut interest = Interest::new(name).with_parameters(parameters);
        interest.finalize();

        self.cert_request = Some(cert.clone());
        self.ecdh = Some(ecdh);
        Ok(interest)
    }

    /// Digest the handshake reply: derive the session key, adopt the
    /// request id, and learn which challenges the authority offers.
    pub fn on_session_response(&mut self, data: &Data) -> Result<Vec<String>, ClientError> {
        if ErrorContent::peek(&data.content) {
            return Err(authority_error(ErrorContent::decode(&data.content)?));
        }
        if !data.verify(self.profile.certificate.public_key_bits()) {
            return Err(ClientError::BadDataSignature);
        }
        let ecdh = self
            .ecdh
            .take()
            .ok_or(ClientError::StepOutOfOrder("no handshake in progress"))?;

        let response = SessionResponse::decode(&data.content)?;
        let session_key = ecdh.derive(&response.ecdh_pub, &response.salt)?;
        self.session_key = Some(session_key);
        self.request_id = Some(response.request_id);
        tracing::debug!(request_id = %response.request_id, "session established");
        Ok(response.challenges)
    }

    /// Pick (or stick with) a challenge and learn which parameters to
    /// provide for the current step.
    pub fn select_or_continue_challenge(
        &mut self,
        challenge: &str,
    ) -> Result<Vec<(String, String)>, ClientError> {
        match &self.challenge_type {
            Some(current) if current != challenge => {
                return Err(ClientError::StepOutOfOrder("challenge already selected"))
            }
            Some(_) => {}
            None => {
                if !self
                    .profile
                    .supported_challenges
                    .iter()
                    .any(|offered| offered == challenge)
                {
                    return Err(ClientError::UnsupportedChallenge(challenge.to_owned()));
                }
                self.challenge_type = Some(challenge.to_owned());
            }
        }
        let module = self.module()?;
        Ok(module.requested_parameters(
            self.status,
            self.challenge_status.as_deref().unwrap_or(""),
        )?)
    }

    /// Fill parameter values from local material via the module.
    pub fn fulfill_parameters(
        &self,
        parameters: &mut ParameterMap,
        context: &ClientContext<'_>,
    ) -> Result<(), ClientError> {
        Ok(self.module()?.fulfill_parameters(parameters, context)?)
    }

    /// Seal the round's parameters into the CHALLENGE interest.
    pub fn challenge_interest(
        &mut self,
        parameters: &ParameterMap,
    ) -> Result<Interest, ClientError> {
        let module = self.module()?;
        let request_id = self
            .request_id
            .ok_or(ClientError::StepOutOfOrder("no session established"))?;
        let session_key = self
            .session_key
            .clone()
            .ok_or(ClientError::StepOutOfOrder("no session key"))?;

        let plaintext = module.gen_challenge_request(
            self.status,
            self.challenge_status.as_deref().unwrap_or(""),
            parameters,
        )?;

        let name = self.challenge_name(&request_id);
        let counter = self.next_block_counter();
        let sealed = crypto::seal(
            &session_key,
            &request_id,
            counter,
            &name.encode(),
            &plaintext,
        )?;

        let mut interest = Interest::new(name).with_parameters(sealed.encode_value());
        let key_locator = self
            .cert_request
            .as_ref()
            .map(Certificate::key_name)
            .ok_or(ClientError::StepOutOfOrder("no request certificate"))?;
        interest.sign(&self.key, key_locator);
        Ok(interest)
    }

    /// Digest a sealed round reply and update the mirrored state.
    pub fn on_challenge_response(&mut self, data: &Data) -> Result<(), ClientError> {
        if ErrorContent::peek(&data.content) {
            return Err(authority_error(ErrorContent::decode(&data.content)?));
        }
        if !data.verify(self.profile.certificate.public_key_bits()) {
            return Err(ClientError::BadDataSignature);
        }
        let request_id = self
            .request_id
            .ok_or(ClientError::StepOutOfOrder("no session established"))?;
        let session_key = self
            .session_key
            .clone()
            .ok_or(ClientError::StepOutOfOrder("no session key"))?;

        let sealed = SealedPayload::decode_value(&data.content)?;
        // The authority's counters must advance too.
        if self
            .peer_counter
            .is_some_and(|highest| sealed.counter() <= highest)
        {
            return Err(ClientError::StaleCounter);
        }
        let aad = self.challenge_name(&request_id).encode();
        let (plaintext, counter) = crypto::open(&session_key, &request_id, &aad, &sealed)?;
        self.peer_counter = Some(counter);

        if ErrorContent::peek(&plaintext) {
            let error = ErrorContent::decode(&plaintext)?;
            self.status = Status::Failure;
            return Err(authority_error(error));
        }

        let response = ChallengeResponse::decode(&plaintext)?;
        self.status = response.status;
        self.challenge_status = response.challenge_status;
        self.remaining_tries = response.remaining_tries.unwrap_or(0);
        self.remaining_time_secs = response.remaining_time_secs.unwrap_or(0);
        if let Some((_, nonce)) = response
            .parameters
            .iter()
            .find(|(key, _)| key == "nonce")
        {
            self.nonce = nonce.as_slice().try_into().ok();
        }
        if let Some(name) = response.issued_cert_name {
            self.issued_cert_name = Some(name);
        }
        Ok(())
    }

    /// Fetch interest for the issued certificate.
    pub fn cert_fetch_interest(&self) -> Result<Interest, ClientError> {
        let name = self
            .issued_cert_name
            .clone()
            .ok_or(ClientError::StepOutOfOrder("no certificate issued yet"))?;
        Ok(Interest::new(name))
    }

    fn module(&self) -> Result<Arc<dyn ChallengeModule>, ClientError> {
        let challenge_type = self
            .challenge_type
            .clone()
            .ok_or(ClientError::StepOutOfOrder("no challenge selected"))?;
        self.registry
            .get(&challenge_type)
            .ok_or(ClientError::UnsupportedChallenge(challenge_type))
    }

    fn challenge_name(&self, request_id: &RequestId) -> Name {
        self.profile
            .ca_prefix
            .child("CA")
            .child("CHALLENGE")
            .child(&request_id.to_hex())
    }

    fn next_block_counter(&mut self) -> u32 {
        let counter = self.block_counter;
        self.block_counter = self.block_counter.wrapping_add(1);
        counter
    }
}
