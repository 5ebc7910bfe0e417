//! # namecert-authority
//!
//! The authority side of the namecert protocol: configuration loading,
//! name-assignment policy, request/certificate stores, the issuance
//! state machine and a framed Unix-socket daemon.
//!
//! [`service::CaService`] is the protocol engine; the binary in
//! `main.rs` wires it to configuration files and the socket front end.

pub mod assignment;
pub mod config;
pub mod ipc;
pub mod sender;
pub mod service;
pub mod store;
