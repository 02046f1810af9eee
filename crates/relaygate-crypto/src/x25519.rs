//! X25519 key agreement (RFC 7748).
//!
//! Sealed envelopes agree on one key per message: the sender uses a
//! single-use [`EphemeralKey`], the receiver answers with its long-lived
//! [`ExchangeSecret`]. Neither side ever accepts a non-contributory result.

use crate::{CryptoError, X25519_PUBLIC_KEY_SIZE};
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Long-lived X25519 secret of a gateway.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ExchangeSecret(x25519_dalek::StaticSecret);

/// Single-use X25519 secret, consumed by its one agreement.
pub struct EphemeralKey {
    secret: x25519_dalek::EphemeralSecret,
    public: ExchangePublic,
}

/// X25519 public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExchangePublic(x25519_dalek::PublicKey);

/// Result of one agreement, only ever fed to the key derivation.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(x25519_dalek::SharedSecret);

fn contributory(shared: x25519_dalek::SharedSecret) -> Result<SharedSecret, CryptoError> {
    if shared.was_contributory() {
        Ok(SharedSecret(shared))
    } else {
        Err(CryptoError::LowOrderPoint)
    }
}

impl ExchangeSecret {
    /// Fresh random secret
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Restore from the identity file form
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }

    /// Raw secret bytes, for the identity file only
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Public half peers seal to
    #[must_use]
    pub fn public(&self) -> ExchangePublic {
        ExchangePublic(x25519_dalek::PublicKey::from(&self.0))
    }

    /// Agree with the ephemeral key found in an envelope header.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::LowOrderPoint`] for a degenerate peer key.
    pub fn agree(&self, ephemeral: &ExchangePublic) -> Result<SharedSecret, CryptoError> {
        contributory(self.0.diffie_hellman(&ephemeral.0))
    }
}

impl EphemeralKey {
    /// Fresh key for one message
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = x25519_dalek::EphemeralSecret::random_from_rng(rng);
        let public = ExchangePublic(x25519_dalek::PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Public half, written into the envelope header
    #[must_use]
    pub fn public(&self) -> ExchangePublic {
        self.public
    }

    /// Agree with the recipient's exchange key, consuming this key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::LowOrderPoint`] for a degenerate recipient key.
    pub fn agree(self, recipient: &ExchangePublic) -> Result<SharedSecret, CryptoError> {
        contributory(self.secret.diffie_hellman(&recipient.0))
    }
}

impl ExchangePublic {
    /// Wrap raw bytes. Every 32-byte string is accepted; degenerate points
    /// are caught at agreement time.
    #[must_use]
    pub fn from_bytes(bytes: [u8; X25519_PUBLIC_KEY_SIZE]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// Read from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] unless the slice is 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; X25519_PUBLIC_KEY_SIZE] =
            slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: X25519_PUBLIC_KEY_SIZE,
                actual: slice.len(),
            })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; X25519_PUBLIC_KEY_SIZE] {
        self.0.as_bytes()
    }
}

impl SharedSecret {
    /// Raw agreement output
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}
