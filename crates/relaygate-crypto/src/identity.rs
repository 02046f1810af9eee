//! Gateway identities.
//!
//! A gateway holds two secrets: an X25519 key that peers seal messages to,
//! and an Ed25519 key that signs every message it sends. The matching
//! public halves travel together as a [`PeerPublicKey`], exchanged out of
//! band through orchestration as 128 hex characters.

use crate::signatures::{SigningKey, VerifyingKey};
use crate::x25519::{ExchangePublic, ExchangeSecret};
use crate::{CryptoError, PEER_PUBLIC_KEY_SIZE};
use rand_core::{CryptoRng, RngCore};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Size of a serialized identity (X25519 secret || Ed25519 seed).
pub const IDENTITY_FILE_SIZE: usize = 64;

/// Local gateway identity (private keys).
pub struct Identity {
    exchange: ExchangeSecret,
    signing: SigningKey,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            exchange: ExchangeSecret::generate(rng),
            signing: SigningKey::generate(rng),
        }
    }

    /// Restore from the 64-byte serialized form.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; IDENTITY_FILE_SIZE]) -> Self {
        let mut exchange = [0u8; 32];
        let mut seed = [0u8; 32];
        exchange.copy_from_slice(&bytes[..32]);
        seed.copy_from_slice(&bytes[32..]);
        let identity = Self {
            exchange: ExchangeSecret::from_bytes(exchange),
            signing: SigningKey::from_seed(&seed),
        };
        zeroize::Zeroize::zeroize(&mut exchange);
        zeroize::Zeroize::zeroize(&mut seed);
        identity
    }

    /// Serialize both secrets.
    ///
    /// # Security
    ///
    /// The returned bytes are the raw private keys.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; IDENTITY_FILE_SIZE] {
        let mut out = [0u8; IDENTITY_FILE_SIZE];
        out[..32].copy_from_slice(&self.exchange.to_bytes());
        out[32..].copy_from_slice(&self.signing.seed());
        out
    }

    /// Load an identity file written by [`Identity::save`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::IdentityFile`] if the file cannot be read or
    /// has the wrong size.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CryptoError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| CryptoError::IdentityFile(format!("{}: {e}", path.display())))?;
        let bytes: [u8; IDENTITY_FILE_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::IdentityFile(format!(
                "{}: expected {IDENTITY_FILE_SIZE} bytes, found {}",
                path.display(),
                bytes.len()
            ))
        })?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Write the identity to `path`, owner-readable only on Unix.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::IdentityFile`] if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CryptoError> {
        use std::io::Write;

        let path = path.as_ref();
        let io_err = |e: std::io::Error| CryptoError::IdentityFile(format!("{}: {e}", path.display()));

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path).map_err(io_err)?;
        file.write_all(&self.to_bytes()).map_err(io_err)?;
        Ok(())
    }

    /// Public half of this identity.
    #[must_use]
    pub fn public_key(&self) -> PeerPublicKey {
        PeerPublicKey {
            exchange: self.exchange.public(),
            verifying: self.signing.verifying_key(),
        }
    }

    pub(crate) fn exchange_key(&self) -> &ExchangeSecret {
        &self.exchange
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key().to_hex())
            .finish_non_exhaustive()
    }
}

/// Public keys of a remote gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerPublicKey {
    /// Key messages to this peer are sealed to
    pub exchange: ExchangePublic,
    /// Key this peer signs its messages with
    pub verifying: VerifyingKey,
}

impl PeerPublicKey {
    /// Serialize as `exchange || verifying`.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PEER_PUBLIC_KEY_SIZE] {
        let mut out = [0u8; PEER_PUBLIC_KEY_SIZE];
        out[..32].copy_from_slice(self.exchange.as_bytes());
        out[32..].copy_from_slice(&self.verifying.to_bytes());
        out
    }

    /// Parse the 64-byte form.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] on a wrong size, or
    /// [`CryptoError::InvalidPublicKey`] if the Ed25519 half is not a valid point.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PEER_PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: PEER_PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let exchange = ExchangePublic::from_slice(&bytes[..32])?;
        let mut verifying = [0u8; 32];
        verifying.copy_from_slice(&bytes[32..]);
        Ok(Self {
            exchange,
            verifying: VerifyingKey::from_bytes(&verifying)?,
        })
    }

    /// Lowercase hex encoding (128 characters).
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Short fingerprint for log lines.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.to_bytes()[..8])
    }
}

impl FromStr for PeerPublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for PeerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_identity_bytes_roundtrip() {
        let identity = Identity::generate(&mut OsRng);
        let restored = Identity::from_bytes(&identity.to_bytes());

        assert_eq!(identity.public_key(), restored.public_key());
    }

    #[test]
    fn test_peer_key_hex_roundtrip() {
        let key = Identity::generate(&mut OsRng).public_key();
        let hex = key.to_hex();

        assert_eq!(hex.len(), 128);
        assert_eq!(hex.parse::<PeerPublicKey>().unwrap(), key);
    }

    #[test]
    fn test_peer_key_rejects_bad_text() {
        assert!(matches!(
            "zz".parse::<PeerPublicKey>(),
            Err(CryptoError::InvalidEncoding(_))
        ));
        assert!(matches!(
            "abcd".parse::<PeerPublicKey>(),
            Err(CryptoError::InvalidKeyLength { .. })
        ));
    }

    #[test]
    fn test_identity_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/identity");

        let identity = Identity::generate(&mut OsRng);
        identity.save(&path).unwrap();
        let loaded = Identity::load(&path).unwrap();

        assert_eq!(identity.public_key(), loaded.public_key());
    }

    #[test]
    fn test_identity_file_wrong_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity");
        std::fs::write(&path, [1u8; 10]).unwrap();

        assert!(matches!(
            Identity::load(&path),
            Err(CryptoError::IdentityFile(_))
        ));
    }

    #[test]
    fn test_debug_does_not_leak_secrets() {
        let identity = Identity::generate(&mut OsRng);
        let rendered = format!("{identity:?}");
        let secret = hex::encode(identity.to_bytes());

        assert!(!rendered.contains(&secret[..64]));
        assert!(rendered.contains(&identity.public_key().to_hex()));
    }
}
