//! # namecert-core
//!
//! Protocol types and logic for namecert, a certificate-management
//! protocol for named-data networks. A requester asks an authority to
//! issue, renew or revoke a certificate; the authority runs a pluggable
//! challenge before signing and publishing the result.
//!
//! This crate holds everything both sides share:
//!
//! - [`tlv`], [`name`], [`packet`]: the wire model
//! - [`keys`], [`cert`], [`crypto`]: signatures, certificates and the
//!   per-request encrypted session
//! - [`state`]: the request lifecycle record
//! - [`proto`]: content codecs for each exchange
//! - [`challenge`]: the challenge contract, registry and the two
//!   reference modules (email PIN, proof of possession)
//!
//! Side effects are injected: mail delivery and clocks are traits, and
//! the network face moving packets lives with the callers. The authority
//! state machine is in `namecert-authority`, the requester driver in
//! `namecert-client`.

pub mod cert;
pub mod challenge;
pub mod clock;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod keys;
pub mod name;
pub mod packet;
pub mod proto;
pub mod state;
pub mod tlv;

pub use cert::Certificate;
pub use error::ErrorCode;
pub use keys::KeyPair;
pub use name::{Component, Name};
pub use packet::{Data, Interest, SignatureInfo, ValidityPeriod};
pub use state::{RequestId, RequestState, RequestType, Status};
