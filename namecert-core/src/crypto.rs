//! Session cryptography.
//!
//! Each request negotiates an ephemeral P-256 key agreement; the shared
//! x-coordinate is stretched through HKDF-SHA256 into a 16-byte
//! AES-128-GCM key. Payloads are sealed with a 12-byte nonce of
//! `requestId (8) || counter (4, big-endian)`; the counter space is split
//! by its top bit so the two senders sharing the key can never collide:
//! the client counts up from zero, the authority from [`AUTHORITY_COUNTER_BASE`].

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use bytes::{Bytes, BytesMut};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::state::RequestId;
use crate::tlv::{self, tag, TlvError};

/// HKDF info string binding derived keys to this protocol stage.
const HKDF_INFO: &[u8] = b"content-enc";

/// Length of the HKDF salt chosen by the authority.
pub const SALT_LEN: usize = 32;

/// First counter value used by the requester.
pub const CLIENT_COUNTER_BASE: u32 = 0;

/// First counter value used by the authority.
pub const AUTHORITY_COUNTER_BASE: u32 = 0x8000_0000;

/// Errors from key agreement and sealed-payload handling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CryptoError {
    #[error("peer public key is not a valid P-256 point")]
    BadPeerKey,

    #[error("AEAD open failed")]
    OpenFailed,

    #[error("AEAD seal failed")]
    SealFailed,

    #[error("nonce does not belong to this request")]
    ForeignNonce,

    #[error(transparent)]
    Codec(#[from] TlvError),
}

/// The 16-byte AEAD key shared by one request's two endpoints.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 16]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([redacted])")
    }
}

/// One side's ephemeral key-agreement state.
pub struct EcdhSession {
    secret: EphemeralSecret,
}

impl EcdhSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            secret: EphemeralSecret::random(&mut OsRng),
        }
    }

    /// Own public key as an uncompressed SEC1 point.
    #[must_use]
    pub fn public_key_bits(&self) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// Derive the session key from the peer's public point and the salt.
    pub fn derive(&self, peer_bits: &[u8], salt: &[u8; SALT_LEN]) -> Result<SessionKey, CryptoError> {
        let peer = PublicKey::from_sec1_bytes(peer_bits).map_err(|_| CryptoError::BadPeerKey)?;
        let shared = self.secret.diffie_hellman(&peer);
        let hkdf = Hkdf::<Sha256>::new(Some(salt), shared.raw_secret_bytes().as_slice());
        let mut okm = [0u8; 16];
        hkdf.expand(HKDF_INFO, &mut okm)
            .expect("okm length is valid for HKDF-SHA256");
        let key = SessionKey(okm);
        okm.zeroize();
        Ok(key)
    }
}

impl Default for EcdhSession {
    fn default() -> Self {
        Self::new()
    }
}

/// A fresh random HKDF salt.
#[must_use]
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a request id: `HMAC-SHA256(processKey, ecdhPubClient || salt)[0..8]`.
#[must_use]
pub fn derive_request_id(
    process_key: &[u8; 32],
    client_ecdh_pub: &[u8],
    salt: &[u8; SALT_LEN],
) -> RequestId {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(process_key).expect("HMAC accepts any key length");
    mac.update(client_ecdh_pub);
    mac.update(salt);
    let digest = mac.finalize().into_bytes();
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    RequestId::from_bytes(id)
}

/// A sealed payload block: `{InitializationVector, AuthenticationTag, EncryptedPayload}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    pub iv: [u8; 12],
    pub tag: [u8; 16],
    pub ciphertext: Vec<u8>,
}

impl SealedPayload {
    /// The sender counter embedded in the nonce.
    pub fn counter(&self) -> u32 {
        u32::from_be_bytes([self.iv[8], self.iv[9], self.iv[10], self.iv[11]])
    }

    /// Encode as a child sequence, to be wrapped by the caller's outer
    /// element (application parameters or data content).
    pub fn encode_value(&self) -> Bytes {
        let mut buf = BytesMut::new();
        tlv::write_tlv(&mut buf, tag::INITIALIZATION_VECTOR, &self.iv);
        tlv::write_tlv(&mut buf, tag::AUTHENTICATION_TAG, &self.tag);
        tlv::write_tlv(&mut buf, tag::ENCRYPTED_PAYLOAD, &self.ciphertext);
        buf.freeze()
    }

    pub fn decode_value(value: &[u8]) -> Result<Self, TlvError> {
        let mut reader = tlv::Reader::new(value);
        let iv_raw = reader.expect(tag::INITIALIZATION_VECTOR)?;
        let iv: [u8; 12] = iv_raw.try_into().map_err(|_| TlvError::BadValue {
            typ: tag::INITIALIZATION_VECTOR,
            reason: "IV must be 12 bytes",
        })?;
        let tag_raw = reader.expect(tag::AUTHENTICATION_TAG)?;
        let tag: [u8; 16] = tag_raw.try_into().map_err(|_| TlvError::BadValue {
            typ: tag::AUTHENTICATION_TAG,
            reason: "tag must be 16 bytes",
        })?;
        let ciphertext = reader.expect(tag::ENCRYPTED_PAYLOAD)?.to_vec();
        reader.finish()?;
        Ok(Self {
            iv,
            tag,
            ciphertext,
        })
    }
}

/// Seal `plaintext` for the given request under the sender's counter.
pub fn seal(
    key: &SessionKey,
    request_id: &RequestId,
    counter: u32,
    associated_data: &[u8],
    plaintext: &[u8],
) -> Result<SealedPayload, CryptoError> {
    let mut iv = [0u8; 12];
    iv[..8].copy_from_slice(request_id.as_bytes());
    iv[8..].copy_from_slice(&counter.to_be_bytes());

    let cipher =
        Aes128Gcm::new_from_slice(key.as_bytes()).expect("session key is 16 bytes");
    let mut sealed = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::SealFailed)?;

    // aes-gcm appends the 16-byte tag to the ciphertext.
    let tag_offset = sealed.len() - 16;
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&sealed[tag_offset..]);
    sealed.truncate(tag_offset);

    Ok(SealedPayload {
        iv,
        tag,
        ciphertext: sealed,
    })
}

/// Open a sealed payload, returning the plaintext and the sender counter.
///
/// The caller is responsible for checking that the counter advances; this
/// only checks that the nonce belongs to the request.
pub fn open(
    key: &SessionKey,
    request_id: &RequestId,
    associated_data: &[u8],
    sealed: &SealedPayload,
) -> Result<(Vec<u8>, u32), CryptoError> {
    if &sealed.iv[..8] != request_id.as_bytes() {
        return Err(CryptoError::ForeignNonce);
    }

    let cipher =
        Aes128Gcm::new_from_slice(key.as_bytes()).expect("session key is 16 bytes");
    let mut message = Vec::with_capacity(sealed.ciphertext.len() + 16);
    message.extend_from_slice(&sealed.ciphertext);
    message.extend_from_slice(&sealed.tag);

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&sealed.iv),
            Payload {
                msg: &message,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::OpenFailed)?;

    Ok((plaintext, sealed.counter()))
}
