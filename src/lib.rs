//! # hoptun
//!
//! A port-hopping tunnel. Server and client share a secret and derive the
//! same listening port from the wall clock, so the open port moves every
//! step and a scanner sees nothing stable to aim at.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Client: local listener ──► dial window (curr,prev,next) │
//! ├─────────────────────────────────────────────────────────┤
//! │  Handshake: be64(step) ‖ nonce ‖ HMAC-SHA256 token       │
//! ├─────────────────────────────────────────────────────────┤
//! │  Server: rotation engine, admission, relay to target     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Hopping: HMAC-SHA1 dynamic truncation over step index   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **Agreement**: both ends compute the same port for the same step
//! 2. **Skew tolerance**: the server keeps the neighbouring steps open
//! 3. **Silence**: a rejected peer never receives a byte

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod hopping;
pub mod relay;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, Result};

/// Identity used when a configuration does not name one
pub const DEFAULT_CLIENT_ID: &str = "client";

/// Deadline for a peer to deliver the full handshake header (seconds)
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Per-candidate dial timeout on the client (seconds)
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 3;

/// Deadline for reaching the relay destination (seconds)
pub const TARGET_DIAL_TIMEOUT_SECS: u64 = 90;

/// Largest datagram the relays will carry
pub const MAX_DATAGRAM_SIZE: usize = 65_535;
