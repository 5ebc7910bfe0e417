//! Signing keys and signature verification.
//!
//! Certificates carry their public key as raw encoded bytes. The encoding
//! itself selects the verifier: a 65-byte uncompressed SEC1 point is an
//! ECDSA P-256 key; with the `bls` feature, a 96-byte compressed G2 point
//! is a BLS key. Dispatch inspects the encoding up front rather than
//! trying one verifier and falling back on failure.
//!
//! Private keys are zeroized on drop and expose no `Debug`.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

/// Errors from key decoding and signing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum KeyError {
    #[error("invalid private key bytes")]
    InvalidPrivateKey,

    #[error("unrecognized public key encoding ({0} bytes)")]
    UnrecognizedEncoding(usize),
}

/// Recognized public key encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    /// Uncompressed SEC1 point on P-256.
    EcdsaP256,
    /// Compressed BLS12-381 G2 point.
    #[cfg(feature = "bls")]
    Bls,
}

/// Classify a public key by its encoding.
pub fn classify_key(bits: &[u8]) -> Result<KeyEncoding, KeyError> {
    if bits.len() == 65 && bits[0] == 0x04 {
        return Ok(KeyEncoding::EcdsaP256);
    }
    #[cfg(feature = "bls")]
    if bits.len() == 96 && bits[0] & 0x80 != 0 {
        return Ok(KeyEncoding::Bls);
    }
    Err(KeyError::UnrecognizedEncoding(bits.len()))
}

/// An ECDSA P-256 signing key.
pub struct KeyPair(SigningKey);

impl KeyPair {
    /// Generate a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        Self(SigningKey::random(&mut OsRng))
    }

    /// Load a key from its 32-byte scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        SigningKey::from_slice(bytes)
            .map(Self)
            .map_err(|_| KeyError::InvalidPrivateKey)
    }

    /// Export the 32-byte scalar. Handle with care; the caller owns the
    /// copy and should zeroize it when done.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes().into()
    }

    /// Sign a message; the signature is the 64-byte `r || s` form.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.0.sign(message);
        signature.to_vec()
    }

    /// Public key as an uncompressed SEC1 point (65 bytes).
    #[must_use]
    pub fn public_key_bits(&self) -> Vec<u8> {
        self.0
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }
}

// No Debug for KeyPair; the scalar must not leak into logs.

/// Verify `signature` over `message` under a raw public key, dispatching
/// on the key encoding.
#[must_use]
pub fn verify_signature(public_key_bits: &[u8], message: &[u8], signature: &[u8]) -> bool {
    match classify_key(public_key_bits) {
        Ok(KeyEncoding::EcdsaP256) => {
            let Ok(key) = VerifyingKey::from_sec1_bytes(public_key_bits) else {
                return false;
            };
            let Ok(signature) = Signature::from_slice(signature) else {
                return false;
            };
            key.verify(message, &signature).is_ok()
        }
        #[cfg(feature = "bls")]
        Ok(KeyEncoding::Bls) => bls::verify(public_key_bits, message, signature),
        Err(_) => false,
    }
}

/// BLS12-381 verifier, signatures in G1 and public keys in G2.
#[cfg(feature = "bls")]
pub mod bls {
    use blstrs::{G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
    use group::prime::PrimeCurveAffine;
    use group::{Curve, Group};

    /// Domain separation for certificate-possession proofs.
    pub const SIGNATURE_DST: &[u8] = b"NAMECERT-BLS-SIG-V1";

    fn hash_to_g1(message: &[u8]) -> G1Projective {
        G1Projective::hash_to_curve(message, SIGNATURE_DST, &[])
    }

    /// Pairing check: e(sig, g2) == e(H(msg), pk).
    #[must_use]
    pub fn verify(public_key_bits: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(pk_raw) = <[u8; 96]>::try_from(public_key_bits) else {
            return false;
        };
        let Ok(sig_raw) = <[u8; 48]>::try_from(signature) else {
            return false;
        };
        let pk = match Option::<G2Affine>::from(G2Affine::from_compressed(&pk_raw)) {
            Some(pk) => pk,
            None => return false,
        };
        let sig = match Option::<G1Affine>::from(G1Affine::from_compressed(&sig_raw)) {
            Some(sig) => sig,
            None => return false,
        };
        let h = hash_to_g1(message);
        blstrs::pairing(&sig, &G2Affine::generator())
            == blstrs::pairing(&h.to_affine(), &pk)
    }

    /// A BLS signing key, used by requesters whose credential carries a
    /// BLS public key.
    pub struct BlsKeyPair {
        secret: Scalar,
    }

    impl BlsKeyPair {
        #[must_use]
        pub fn generate() -> Self {
            use group::ff::Field;
            Self {
                secret: Scalar::random(&mut rand::rngs::OsRng),
            }
        }

        #[must_use]
        pub fn public_key_bits(&self) -> Vec<u8> {
            (G2Projective::generator() * self.secret)
                .to_affine()
                .to_compressed()
                .to_vec()
        }

        #[must_use]
        pub fn sign(&self, message: &[u8]) -> Vec<u8> {
            (hash_to_g1(message) * self.secret)
                .to_affine()
                .to_compressed()
                .to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let key = KeyPair::generate();
        let signature = key.sign(b"proof payload");
        assert!(verify_signature(&key.public_key_bits(), b"proof payload", &signature));
    }

    #[test]
    fn wrong_key_rejected() {
        let key = KeyPair::generate();
        let other = KeyPair::generate();
        let signature = key.sign(b"proof payload");
        assert!(!verify_signature(&other.public_key_bits(), b"proof payload", &signature));
    }

    #[test]
    fn mangled_signature_rejected() {
        let key = KeyPair::generate();
        let mut signature = key.sign(b"proof payload");
        signature[10] ^= 0xFF;
        assert!(!verify_signature(&key.public_key_bits(), b"proof payload", &signature));
    }

    #[test]
    fn scalar_roundtrip() {
        let key = KeyPair::generate();
        let restored = KeyPair::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(key.public_key_bits(), restored.public_key_bits());
    }

    #[test]
    fn classification() {
        let key = KeyPair::generate();
        assert_eq!(classify_key(&key.public_key_bits()), Ok(KeyEncoding::EcdsaP256));
        assert!(classify_key(&[0u8; 12]).is_err());
        assert!(!verify_signature(&[0u8; 12], b"m", b"s"));
    }
}
