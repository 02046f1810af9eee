//! Ed25519 envelope signatures.
//!
//! The signed bytes are the envelope body followed by the recipient's
//! exchange key. A signature made for one gateway therefore never verifies
//! at another, even when the body is replayed byte for byte.

use crate::x25519::ExchangePublic;
use crate::{CryptoError, ED25519_PUBLIC_KEY_SIZE, ED25519_SIGNATURE_SIZE};
use ed25519_dalek::Signer;
use rand_core::{CryptoRng, RngCore};
use zeroize::ZeroizeOnDrop;

fn signed_message(body: &[u8], recipient: &ExchangePublic) -> Vec<u8> {
    let mut message = Vec::with_capacity(body.len() + recipient.as_bytes().len());
    message.extend_from_slice(body);
    message.extend_from_slice(recipient.as_bytes());
    message
}

/// Ed25519 key a gateway signs its envelopes with, zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl SigningKey {
    /// Fresh random key
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(rng),
        }
    }

    /// Restore from the 32-byte seed stored in an identity file
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    /// The 32-byte seed, for the identity file only
    #[must_use]
    pub fn seed(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Key peers verify with
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }

    /// Sign an envelope body addressed to `recipient`
    #[must_use]
    pub fn sign_envelope(
        &self,
        body: &[u8],
        recipient: &ExchangePublic,
    ) -> [u8; ED25519_SIGNATURE_SIZE] {
        self.inner
            .sign(&signed_message(body, recipient))
            .to_bytes()
    }
}

/// Ed25519 key of a remote gateway
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyingKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl VerifyingKey {
    /// Parse a 32-byte public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes are not a
    /// valid Ed25519 point.
    pub fn from_bytes(bytes: &[u8; ED25519_PUBLIC_KEY_SIZE]) -> Result<Self, CryptoError> {
        ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map(|inner| Self { inner })
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// Raw public key bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; ED25519_PUBLIC_KEY_SIZE] {
        self.inner.to_bytes()
    }

    /// Check `signature` over an envelope body received by `recipient`.
    ///
    /// Strict verification: non-canonical and small-order signatures are
    /// refused.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] for a wrong-length or
    /// non-verifying signature.
    pub fn verify_envelope(
        &self,
        body: &[u8],
        recipient: &ExchangePublic,
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let signature = ed25519_dalek::Signature::from_slice(signature)
            .map_err(|_| CryptoError::InvalidSignature)?;
        self.inner
            .verify_strict(&signed_message(body, recipient), &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x25519::ExchangeSecret;
    use rand_core::OsRng;

    fn recipient() -> ExchangePublic {
        ExchangeSecret::generate(&mut OsRng).public()
    }

    #[test]
    fn test_envelope_signature_verifies() {
        let key = SigningKey::generate(&mut OsRng);
        let to = recipient();
        let signature = key.sign_envelope(b"body", &to);

        assert!(key.verifying_key().verify_envelope(b"body", &to, &signature).is_ok());
    }

    #[test]
    fn test_signature_bound_to_recipient() {
        let key = SigningKey::generate(&mut OsRng);
        let signature = key.sign_envelope(b"body", &recipient());

        assert!(matches!(
            key.verifying_key().verify_envelope(b"body", &recipient(), &signature),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_signer_and_short_signature() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let to = recipient();
        let signature = key.sign_envelope(b"body", &to);

        assert!(other.verifying_key().verify_envelope(b"body", &to, &signature).is_err());
        assert!(key.verifying_key().verify_envelope(b"body", &to, &signature[..63]).is_err());
    }

    #[test]
    fn test_seed_restores_key() {
        let key = SigningKey::generate(&mut OsRng);
        let restored = SigningKey::from_seed(&key.seed());

        assert_eq!(key.verifying_key(), restored.verifying_key());
        assert!(VerifyingKey::from_bytes(&key.verifying_key().to_bytes()).is_ok());
    }
}
