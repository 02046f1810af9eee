//! `XChaCha20-Poly1305` under a per-message key.
//!
//! Each envelope derives its own [`MessageKey`] from a fresh agreement and
//! draws a random 192-bit nonce, so no counter has to stay in step between
//! the two gateways and a lost message costs nothing.

use crate::CryptoError;
use crate::x25519::{ExchangePublic, SharedSecret};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = crate::XCHACHA_NONCE_SIZE;

const KDF_CONTEXT: &str = "relaygate sealed envelope v1 key";

/// Random envelope nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Draw a nonce from `rng`
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Read the nonce field of an envelope header
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        slice.try_into().ok().map(Self)
    }

    /// Raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// Cipher key of exactly one envelope, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MessageKey([u8; 32]);

impl MessageKey {
    /// Derive the key for one envelope.
    ///
    /// Binds the agreement output to both public keys involved, so the
    /// same shared secret under a swapped key yields an unrelated cipher key.
    #[must_use]
    pub fn derive(
        shared: &SharedSecret,
        ephemeral: &ExchangePublic,
        recipient: &ExchangePublic,
    ) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT);
        hasher.update(shared.as_bytes());
        hasher.update(ephemeral.as_bytes());
        hasher.update(recipient.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new((&self.0).into())
    }

    /// Encrypt `plaintext`, authenticating `header` alongside it.
    ///
    /// Output is the ciphertext followed by the 16-byte tag.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the cipher refuses the input.
    pub fn encrypt(
        &self,
        nonce: &Nonce,
        plaintext: &[u8],
        header: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher()
            .encrypt(
                XNonce::from_slice(nonce.as_bytes()),
                Payload {
                    msg: plaintext,
                    aad: header,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt and authenticate.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if the tag does not verify.
    pub fn decrypt(
        &self,
        nonce: &Nonce,
        sealed: &[u8],
        header: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        self.cipher()
            .decrypt(
                XNonce::from_slice(nonce.as_bytes()),
                Payload {
                    msg: sealed,
                    aad: header,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
