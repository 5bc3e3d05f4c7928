//! # Shroud
//!
//! A packet-obfuscating proxy transport: a UDP-based secure datagram
//! underlay that multiplexes many logical sessions over a single socket,
//! encrypts every datagram (metadata included) with an authenticated
//! cipher, resists replay attacks, and feeds a reliable-segment
//! abstraction to the layers above.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Client façade (dial / lifecycle)           │
//! ├─────────────────────────────────────────────────────────┤
//! │  Sessions (ordered streams, windowed reliability loops) │
//! ├─────────────────────────────────────────────────────────┤
//! │  UDP underlay (demux, session table, packet pump)       │
//! ├─────────────────────────────────────────────────────────┤
//! │  Wire codec (fixed-size metadata, padding, replay)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  Crypto layer (ChaCha20-Poly1305, HKDF credentials)     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Unobservability**: every byte after the nonce is ciphertext or
//!    random padding; packet lengths are decorrelated from payload lengths
//! 2. **Statelessness on the wire**: any datagram decrypts on its own, so
//!    loss and reordering never desynchronize the peers
//! 3. **Multi-user servers**: trial decryption binds each peer to the
//!    matching pre-shared credential without any plaintext identifier
//! 4. **Replay resistance**: duplicate datagrams are rejected within a
//!    bounded time window

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod crypto;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod replay;
pub mod session;
pub mod signal;
pub mod underlay;

pub use client::{Client, ClientConfig};
pub use error::{Error, Result};
pub use session::Session;
pub use underlay::{UdpUnderlay, Underlay};
