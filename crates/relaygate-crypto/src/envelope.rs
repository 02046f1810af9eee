//! Sealed envelopes: per-message hybrid encrypt-then-sign.
//!
//! ## Wire Format
//!
//! ```text
//! +---------+------------------+-----------+------------------+-----------+
//! | version | ephemeral X25519 | nonce     | ciphertext + tag | Ed25519   |
//! | 1 byte  | 32 bytes         | 24 bytes  | n + 16 bytes     | 64 bytes  |
//! +---------+------------------+-----------+------------------+-----------+
//! ```
//!
//! - The cipher key is `BLAKE3-derive_key(ctx, dh(eph, recipient) || eph_pub || recipient_pub)`.
//! - The header (version, ephemeral key, nonce) is the AEAD associated data.
//! - The signature covers everything before it plus the recipient's
//!   X25519 key, so an envelope cannot be replayed towards another gateway
//!   under the same signature.
//!
//! Opening verifies the signature before touching the ciphertext. Any
//! failure is an authentication failure; callers never see partial or
//! altered plaintext.

use crate::aead::{MessageKey, NONCE_SIZE, Nonce, TAG_SIZE};
use crate::identity::{Identity, PeerPublicKey};
use crate::x25519::{EphemeralKey, ExchangePublic};
use crate::{CryptoError, ED25519_SIGNATURE_SIZE, X25519_PUBLIC_KEY_SIZE};
use rand_core::OsRng;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

const HEADER_SIZE: usize = 1 + X25519_PUBLIC_KEY_SIZE + NONCE_SIZE;

/// Bytes an envelope adds on top of the plaintext.
pub const ENVELOPE_OVERHEAD: usize = HEADER_SIZE + TAG_SIZE + ED25519_SIGNATURE_SIZE;

/// Seal `plaintext` from `sender` to `recipient`.
///
/// # Errors
///
/// Returns [`CryptoError::LowOrderPoint`] if the recipient key is degenerate,
/// or [`CryptoError::EncryptionFailed`] if the AEAD fails.
pub fn seal(
    sender: &Identity,
    recipient: &PeerPublicKey,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = EphemeralKey::generate(&mut OsRng);
    let ephemeral_public = ephemeral.public();
    let key = MessageKey::derive(
        &ephemeral.agree(&recipient.exchange)?,
        &ephemeral_public,
        &recipient.exchange,
    );
    let nonce = Nonce::random(&mut OsRng);

    let mut envelope = Vec::with_capacity(plaintext.len() + ENVELOPE_OVERHEAD);
    envelope.push(ENVELOPE_VERSION);
    envelope.extend_from_slice(ephemeral_public.as_bytes());
    envelope.extend_from_slice(nonce.as_bytes());

    let ciphertext = key.encrypt(&nonce, plaintext, &envelope)?;
    envelope.extend_from_slice(&ciphertext);

    let signature = sender
        .signing_key()
        .sign_envelope(&envelope, &recipient.exchange);
    envelope.extend_from_slice(&signature);

    Ok(envelope)
}

/// Open an envelope addressed to `recipient` and signed by `sender`.
///
/// # Errors
///
/// Returns an error for which [`CryptoError::is_authentication_failure`]
/// holds when the envelope is truncated, of an unknown version, not signed
/// by `sender`, not sealed to `recipient`, or tampered with.
pub fn open(
    recipient: &Identity,
    sender: &PeerPublicKey,
    envelope: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if envelope.len() < ENVELOPE_OVERHEAD {
        return Err(CryptoError::MalformedEnvelope("envelope too short"));
    }
    if envelope[0] != ENVELOPE_VERSION {
        return Err(CryptoError::UnsupportedVersion(envelope[0]));
    }

    let local = recipient.exchange_key().public();
    let (body, signature) = envelope.split_at(envelope.len() - ED25519_SIGNATURE_SIZE);
    sender.verifying.verify_envelope(body, &local, signature)?;

    let (header, ciphertext) = body.split_at(HEADER_SIZE);
    let ephemeral_public = ExchangePublic::from_slice(&header[1..1 + X25519_PUBLIC_KEY_SIZE])?;
    let nonce = Nonce::from_slice(&header[1 + X25519_PUBLIC_KEY_SIZE..])
        .ok_or(CryptoError::MalformedEnvelope("bad nonce"))?;

    let key = MessageKey::derive(
        &recipient.exchange_key().agree(&ephemeral_public)?,
        &ephemeral_public,
        &local,
    );
    key.decrypt(&nonce, ciphertext, header)
}
