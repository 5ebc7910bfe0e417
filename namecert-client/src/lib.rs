//! # namecert-client
//!
//! Requester side of the namecert protocol: the [`request::Request`]
//! driver walks INFO → NEW/RENEW/REVOKE → CHALLENGE rounds → fetch, and
//! [`ipc::Transport`] moves packets to a local authority daemon.

pub mod ipc;
pub mod request;
