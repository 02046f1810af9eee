//! # RelayGate Crypto
//!
//! Cryptographic primitives for RelayGate tunnels.
//!
//! This crate provides:
//! - Gateway identities (X25519 exchange key + Ed25519 signing key)
//! - `XChaCha20-Poly1305` AEAD encryption
//! - Ed25519 signatures
//! - Sealed envelopes: per-message hybrid encrypt-then-sign
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Agreement | X25519 (ephemeral-static) | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | KDF | BLAKE3 `derive_key` | 128-bit |
//! | Signatures | Ed25519 | 128-bit |
//!
//! Every relay message is sealed on its own. There is no negotiated
//! session key, so a lost message never desynchronizes a stream cipher.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod random;
pub mod signatures;
pub mod x25519;

pub use envelope::{ENVELOPE_OVERHEAD, ENVELOPE_VERSION, open, seal};
pub use error::CryptoError;
pub use identity::{Identity, PeerPublicKey};

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// Encoded peer public key size (X25519 public || Ed25519 verifying)
pub const PEER_PUBLIC_KEY_SIZE: usize = X25519_PUBLIC_KEY_SIZE + ED25519_PUBLIC_KEY_SIZE;
