//! Certificates.
//!
//! A certificate is a Data packet whose name follows
//! `/<identity>/KEY/<key-id>/<issuer>/<version>`, whose content is the
//! subject's raw public key, and whose signature info carries the signer's
//! key locator plus a validity period.

use bytes::Bytes;
use rand::RngCore;

use crate::keys::KeyPair;
use crate::name::{Component, Name};
use crate::packet::{Data, SignatureInfo, ValidityPeriod};
use crate::tlv::TlvError;

const KEY_COMPONENT: &str = "KEY";
const PEM_HEADER: &str = "-----BEGIN NAMECERT CERTIFICATE-----";
const PEM_FOOTER: &str = "-----END NAMECERT CERTIFICATE-----";

/// Errors from certificate decoding and validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CertError {
    #[error("malformed certificate name")]
    BadName,

    #[error("certificate is missing a validity period")]
    NoValidity,

    #[error("invalid certificate armor")]
    BadArmor,

    #[error(transparent)]
    Codec(#[from] TlvError),
}

/// A parsed certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    data: Data,
}

impl Certificate {
    /// Wrap a Data packet, validating the name shape.
    pub fn from_data(data: Data) -> Result<Self, CertError> {
        if !Self::is_valid_name(&data.name) {
            return Err(CertError::BadName);
        }
        Ok(Self { data })
    }

    /// `/<identity>/KEY/<key-id>/<issuer>/<version>` with a non-empty
    /// identity.
    pub fn is_valid_name(name: &Name) -> bool {
        name.len() >= 5
            && name
                .get(name.len() - 4)
                .and_then(Component::as_str)
                .map_or(false, |c| c == KEY_COMPONENT)
    }

    pub fn name(&self) -> &Name {
        &self.data.name
    }

    /// The subject identity: everything before the `KEY` component.
    pub fn identity(&self) -> Name {
        self.data.name.prefix(self.data.name.len() - 4)
    }

    /// `/<identity>/KEY/<key-id>`.
    pub fn key_name(&self) -> Name {
        self.data.name.prefix(self.data.name.len() - 2)
    }

    pub fn issuer_id(&self) -> Option<&str> {
        self.data
            .name
            .get(self.data.name.len() - 2)
            .and_then(Component::as_str)
    }

    /// The subject's raw public key.
    pub fn public_key_bits(&self) -> &[u8] {
        &self.data.content
    }

    pub fn validity(&self) -> Option<ValidityPeriod> {
        self.data.sig_info.validity
    }

    /// Name of the key that signed this certificate.
    pub fn key_locator(&self) -> Option<&Name> {
        self.data.sig_info.key_locator.as_ref()
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    pub fn encode(&self) -> Bytes {
        self.data.encode()
    }

    pub fn decode(input: &[u8]) -> Result<Self, CertError> {
        Self::from_data(Data::decode(input)?)
    }

    /// True when the signature verifies under the certificate's own key.
    #[must_use]
    pub fn verify_self_signed(&self) -> bool {
        self.data.verify(self.public_key_bits())
    }

    /// True when the key locator names the issuer's key and the signature
    /// verifies under the issuer's public key.
    #[must_use]
    pub fn verify_signed_by(&self, issuer: &Certificate) -> bool {
        match self.key_locator() {
            Some(locator) if *locator == issuer.key_name() => {
                self.data.verify(issuer.public_key_bits())
            }
            _ => false,
        }
    }

    /// Base64 armor for configuration files.
    pub fn to_pem(&self) -> String {
        use base64::prelude::*;
        let body = BASE64_STANDARD.encode(self.encode());
        let mut out = String::with_capacity(body.len() + 80);
        out.push_str(PEM_HEADER);
        out.push('\n');
        for chunk in body.as_bytes().chunks(64) {
            out.push_str(std::str::from_utf8(chunk).expect("base64 is ASCII"));
            out.push('\n');
        }
        out.push_str(PEM_FOOTER);
        out.push('\n');
        out
    }

    pub fn from_pem(text: &str) -> Result<Self, CertError> {
        use base64::prelude::*;
        let body: String = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("-----"))
            .collect();
        let wire = BASE64_STANDARD
            .decode(body.as_bytes())
            .map_err(|_| CertError::BadArmor)?;
        Self::decode(&wire)
    }
}

/// A fresh `KEY` name under the given identity, with a random key id.
pub fn new_key_name(identity: &Name) -> Name {
    let mut id = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut id);
    identity.child(KEY_COMPONENT).child(&hex::encode(id))
}

/// The version component appended to issued certificate names.
pub fn version_component(version: u64) -> Component {
    Component::from_str(&format!("v={version}"))
}

/// Builds and signs certificates.
pub struct CertificateBuilder {
    key_name: Name,
    public_key: Vec<u8>,
    issuer_id: String,
    validity: ValidityPeriod,
}

impl CertificateBuilder {
    pub fn new(key_name: Name, public_key: Vec<u8>, validity: ValidityPeriod) -> Self {
        Self {
            key_name,
            public_key,
            issuer_id: "NDNCERT".to_owned(),
            validity,
        }
    }

    pub fn issuer_id(mut self, issuer_id: impl Into<String>) -> Self {
        self.issuer_id = issuer_id.into();
        self
    }

    /// Sign with the issuer's key. `signer_key_name` becomes the key
    /// locator; pass the subject's own key name for a self-signed
    /// certificate.
    pub fn sign(self, key: &KeyPair, signer_key_name: &Name) -> Certificate {
        let mut version = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut version);
        let name = self
            .key_name
            .child(&self.issuer_id)
            .child_component(version_component(u64::from_be_bytes(version)));

        let mut data = Data::unsigned(name, self.public_key);
        let sig_info =
            SignatureInfo::ecdsa(signer_key_name.clone()).with_validity(self.validity);
        data.sign(key, sig_info);
        Certificate { data }
    }
}

/// A self-signed certificate over a fresh key name under `identity`.
pub fn self_signed(key: &KeyPair, identity: &Name, validity: ValidityPeriod) -> Certificate {
    let key_name = new_key_name(identity);
    CertificateBuilder::new(key_name.clone(), key.public_key_bits(), validity)
        .issuer_id("self")
        .sign(key, &key_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validity() -> ValidityPeriod {
        ValidityPeriod::new(
            "2026-01-01T00:00:00Z".parse().unwrap(),
            "2027-01-01T00:00:00Z".parse().unwrap(),
        )
    }

    #[test]
    fn self_signed_shape_and_signature() {
        let key = KeyPair::generate();
        let identity = Name::parse("/edu/site/alice").unwrap();
        let cert = self_signed(&key, &identity, validity());

        assert_eq!(cert.identity(), identity);
        assert_eq!(cert.issuer_id(), Some("self"));
        assert!(cert.verify_self_signed());
        assert_eq!(cert.key_locator(), Some(&cert.key_name()));
    }

    #[test]
    fn issued_certificate_chains_to_issuer() {
        let anchor_key = KeyPair::generate();
        let anchor = self_signed(&anchor_key, &Name::parse("/edu/site").unwrap(), validity());

        let subject_key = KeyPair::generate();
        let subject_key_name = new_key_name(&Name::parse("/edu/site/device").unwrap());
        let credential = CertificateBuilder::new(
            subject_key_name,
            subject_key.public_key_bits(),
            validity(),
        )
        .issuer_id("Credential")
        .sign(&anchor_key, &anchor.key_name());

        assert!(credential.verify_signed_by(&anchor));
        assert!(!credential.verify_self_signed());

        let other = self_signed(&KeyPair::generate(), &Name::parse("/other").unwrap(), validity());
        assert!(!credential.verify_signed_by(&other));
    }

    #[test]
    fn wire_roundtrip() {
        let key = KeyPair::generate();
        let cert = self_signed(&key, &Name::parse("/edu/site/alice").unwrap(), validity());
        let decoded = Certificate::decode(&cert.encode()).unwrap();
        assert_eq!(decoded, cert);
        assert!(decoded.verify_self_signed());
    }

    #[test]
    fn pem_roundtrip() {
        let key = KeyPair::generate();
        let cert = self_signed(&key, &Name::parse("/edu/site/alice").unwrap(), validity());
        let pem = cert.to_pem();
        assert!(pem.starts_with(PEM_HEADER));
        let decoded = Certificate::from_pem(&pem).unwrap();
        assert_eq!(decoded, cert);
    }

    #[test]
    fn bad_names_rejected() {
        for uri in ["/too/short", "/edu/site/NOTKEY/id/self/v=1"] {
            let name = Name::parse(uri).unwrap();
            assert!(!Certificate::is_valid_name(&name), "{uri}");
        }
        assert!(Certificate::is_valid_name(
            &Name::parse("/edu/site/alice/KEY/0011/self/v=1").unwrap()
        ));
    }
}
