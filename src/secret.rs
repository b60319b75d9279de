use std::fmt;
use std::fs;
use std::path::Path;

use secrecy::{ExposeSecret, ExposeSecretMut, SecretBox};
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::InputError;
use crate::proto::MAX_CHALLENGE_LEN;

/// Length of a user supplied secret.
pub const USS_LEN: usize = 32;
/// Length of the key the device derives.
pub const DERIVED_KEY_LEN: usize = 64;

/// A "User Supplied Secret", mixed into the device's key derivation when
/// the application is loaded.
///
/// Either stretched from a password (see [`crate::uss::derive`]) or read
/// verbatim from a file. Never persisted by this crate.
pub struct Uss {
    secret: SecretBox<[u8; USS_LEN]>,
}

impl Uss {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, InputError> {
        if bytes.len() != USS_LEN {
            return Err(InputError::UssLength {
                expected: USS_LEN,
                actual: bytes.len(),
            });
        }
        let mut secret = SecretBox::new(Box::new([0u8; USS_LEN]));
        secret.expose_secret_mut().copy_from_slice(bytes);
        Ok(Self { secret })
    }

    /// Loads a raw 32 byte USS from `path`.
    ///
    /// Kept for setups that predate password derivation; a USS file lying
    /// around on disk is exactly what derivation avoids.
    pub fn from_file(path: &Path) -> Result<Self, InputError> {
        warn!("Loading the USS from a file is deprecated, prefer password derivation");
        let bytes = Zeroizing::new(fs::read(path).map_err(|source| InputError::Unreadable {
            path: path.display().to_string(),
            source,
        })?);
        Self::from_slice(&bytes)
    }
}

impl ExposeSecret<[u8; USS_LEN]> for Uss {
    fn expose_secret(&self) -> &[u8; USS_LEN] {
        self.secret.expose_secret()
    }
}

impl fmt::Debug for Uss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Uss([REDACTED])")
    }
}

impl Zeroize for Uss {
    fn zeroize(&mut self) {
        self.secret.zeroize();
    }
}

impl ZeroizeOnDrop for Uss {}

/// The 64 byte key returned by a successful derive-key exchange.
///
/// Only a [`crate::session::DeviceSession`] that verified the app, set
/// the challenge size and loaded the whole challenge hands one out.
pub struct DerivedKey {
    key: SecretBox<[u8; DERIVED_KEY_LEN]>,
}

impl DerivedKey {
    /// Callers must pass exactly [`DERIVED_KEY_LEN`] bytes.
    pub(crate) fn from_slice(bytes: &[u8]) -> Self {
        let mut key = SecretBox::new(Box::new([0u8; DERIVED_KEY_LEN]));
        key.expose_secret_mut().copy_from_slice(bytes);
        Self { key }
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; DERIVED_KEY_LEN]) -> Self {
        Self::from_slice(&bytes)
    }
}

impl ExposeSecret<[u8; DERIVED_KEY_LEN]> for DerivedKey {
    fn expose_secret(&self) -> &[u8; DERIVED_KEY_LEN] {
        self.key.expose_secret()
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey([REDACTED])")
    }
}

impl Zeroize for DerivedKey {
    fn zeroize(&mut self) {
        self.key.zeroize();
    }
}

impl ZeroizeOnDrop for DerivedKey {}

/// Application supplied context for the derivation, 1..=256 bytes.
///
/// Often a passphrase in practice, so it is wiped on drop as well.
pub struct Challenge {
    bytes: Zeroizing<Vec<u8>>,
}

impl Challenge {
    pub fn new(bytes: Vec<u8>) -> Result<Self, InputError> {
        let bytes = Zeroizing::new(bytes);
        if bytes.is_empty() || bytes.len() > MAX_CHALLENGE_LEN {
            return Err(InputError::ChallengeLength {
                max: MAX_CHALLENGE_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Never true for a constructed challenge.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Challenge")
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uss_requires_exact_length() {
        assert!(Uss::from_slice(&[1u8; USS_LEN]).is_ok());
        assert!(matches!(
            Uss::from_slice(&[1u8; 31]).unwrap_err(),
            InputError::UssLength {
                expected: 32,
                actual: 31
            }
        ));
    }

    #[test]
    fn test_uss_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uss.bin");
        std::fs::write(&path, [9u8; USS_LEN]).unwrap();
        let uss = Uss::from_file(&path).unwrap();
        assert_eq!(uss.expose_secret(), &[9u8; USS_LEN]);

        std::fs::write(&path, b"too short").unwrap();
        assert!(matches!(
            Uss::from_file(&path),
            Err(InputError::UssLength { actual: 9, .. })
        ));
    }

    #[test]
    fn test_uss_from_missing_file_keeps_io_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = Uss::from_file(&dir.path().join("missing")).unwrap_err();
        match &err {
            InputError::Unreadable { path, source } => {
                assert!(path.ends_with("missing"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.downcast_ref::<std::io::Error>().is_some());
    }

    #[test]
    fn test_debug_output_is_redacted() {
        let uss = Uss::from_slice(&[0xabu8; USS_LEN]).unwrap();
        let key = DerivedKey::from_bytes([0xcdu8; DERIVED_KEY_LEN]);
        assert_eq!(format!("{uss:?}"), "Uss([REDACTED])");
        assert!(!format!("{key:?}").contains("205"));
    }

    #[test]
    fn test_zeroize_clears_key() {
        let mut key = DerivedKey::from_bytes([0xffu8; DERIVED_KEY_LEN]);
        key.zeroize();
        assert!(key.expose_secret().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_challenge_bounds() {
        assert!(Challenge::new(vec![1]).is_ok());
        assert!(Challenge::new(vec![1; MAX_CHALLENGE_LEN]).is_ok());
        for len in [0, MAX_CHALLENGE_LEN + 1, 4096] {
            assert!(matches!(
                Challenge::new(vec![0; len]).unwrap_err(),
                InputError::ChallengeLength {
                    max: MAX_CHALLENGE_LEN,
                    actual
                } if actual == len
            ));
        }
    }
}
